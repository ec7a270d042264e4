//! Unit tests for the driver, including a scripted real subprocess.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

use super::*;

#[test]
fn severity_tags_map_to_levels() {
    assert_eq!(split_severity("[DEBUG] detail"), (Severity::Debug, "detail"));
    assert_eq!(split_severity("[WARN] careful"), (Severity::Warn, "careful"));
    assert_eq!(
        split_severity("[WARNING] careful"),
        (Severity::Warn, "careful")
    );
    assert_eq!(split_severity("[ERROR] bad"), (Severity::Error, "bad"));
    assert_eq!(split_severity("untagged"), (Severity::Info, "untagged"));
}

#[test]
fn driver_config_inherits_helper_settings() {
    let mut config = Config::default();
    config.oftr_path = PathBuf::from("/opt/oftr");
    config.oftr_args = vec!["--loglevel=info".to_string()];
    let driver_config = DriverConfig::from_config(&config);
    assert_eq!(driver_config.path, PathBuf::from("/opt/oftr"));
    assert!(driver_config
        .args
        .contains(&"--loglevel=info".to_string()));
}

#[tokio::test]
async fn channel_driver_round_trips_messages() {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let mut driver = Driver::from_channel(out_tx, in_rx);

    driver.send(json!({"method": "OFP.SEND"})).expect("send");
    assert_eq!(
        out_rx.recv().await.expect("outgoing message"),
        json!({"method": "OFP.SEND"})
    );

    in_tx.send(json!({"id": 1, "result": {}})).expect("inject");
    assert_eq!(
        driver.recv().await.expect("incoming message"),
        json!({"id": 1, "result": {}})
    );

    drop(in_tx);
    assert!(matches!(driver.recv().await, Err(DriverError::Closed)));
}

/// Writes an executable shell script standing in for the helper.
fn fake_helper(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("fake-oftr");
    let mut file = std::fs::File::create(&path).expect("create helper script");
    writeln!(file, "#!/bin/sh\n{body}").expect("write helper script");
    let mut permissions = file.metadata().expect("metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod helper script");
    path
}

#[tokio::test]
async fn spawns_and_stops_a_scripted_helper() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Emits one reply and an error-tagged stderr line, then waits for EOF.
    let path = fake_helper(
        &dir,
        r#"echo '{"id":1,"result":{"sw_desc":"fake"}}'
echo '[ERROR] simulated fault' >&2
cat >/dev/null"#,
    );

    LocalSet::new()
        .run_until(async move {
            let config = DriverConfig {
                path,
                args: Vec::new(),
                framing: Framing::LineDelimited,
            };
            let mut driver = Driver::spawn(&config).expect("helper should spawn");
            let first = driver.recv().await.expect("first object");
            assert_eq!(first["id"], json!(1));
            let code = driver.stop(Duration::from_secs(5)).await;
            assert_eq!(code, Some(0));
        })
        .await;
}

#[tokio::test]
async fn helper_eof_is_terminal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_helper(&dir, "exit 0");

    LocalSet::new()
        .run_until(async move {
            let config = DriverConfig {
                path,
                args: Vec::new(),
                framing: Framing::LineDelimited,
            };
            let mut driver = Driver::spawn(&config).expect("helper should spawn");
            assert!(matches!(driver.recv().await, Err(DriverError::Closed)));
            assert!(matches!(driver.recv().await, Err(DriverError::Closed)));
            driver.stop(Duration::from_secs(5)).await;
        })
        .await;
}

#[tokio::test]
async fn malformed_output_is_a_protocol_fault() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = fake_helper(
        &dir,
        r#"echo 'this is not json'
cat >/dev/null"#,
    );

    LocalSet::new()
        .run_until(async move {
            let config = DriverConfig {
                path,
                args: Vec::new(),
                framing: Framing::LineDelimited,
            };
            let mut driver = Driver::spawn(&config).expect("helper should spawn");
            assert!(matches!(
                driver.recv().await,
                Err(DriverError::Protocol(ProtocolError::InvalidJson { .. }))
            ));
            driver.stop(Duration::from_secs(5)).await;
        })
        .await;
}

#[test]
fn missing_binary_fails_startup() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(LocalSet::new().run_until(async {
        let config = DriverConfig {
            path: PathBuf::from("/nonexistent/oftr-binary"),
            args: Vec::new(),
            framing: Framing::LineDelimited,
        };
        let error = Driver::spawn(&config).expect_err("spawn should fail");
        assert!(matches!(error, StartupError::Spawn { .. }));
    }));
}
