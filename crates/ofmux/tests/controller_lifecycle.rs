//! Controller lifecycle behaviour: startup, listeners, signals, shutdown.

mod support;

use std::cell::Cell;
use std::rc::Rc;

use serde_json::json;
use tokio::task::LocalSet;

use ofmux::{
    ControllerApp, ControllerCtx, ControllerError, Datapath, Event, HandlerResult, StartupError,
};
use ofmux_config::ExitSignal;
use support::*;

struct LifecycleProbe {
    log: Log,
    ctx: CtxSlot,
}

impl LifecycleProbe {
    fn new(log: &Log, ctx: &CtxSlot) -> Self {
        Self {
            log: Rc::clone(log),
            ctx: Rc::clone(ctx),
        }
    }
}

impl ControllerApp for LifecycleProbe {
    fn on_start(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        *self.ctx.borrow_mut() = Some(ctx.clone());
        record(&self.log, "START");
        Ok(())
    }

    fn on_stop(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        record(
            &self.log,
            format!("STOP:registry_empty={}", ctx.registry().is_empty()),
        );
        Ok(())
    }

    fn on_channel_up(
        &mut self,
        _ctx: &ControllerCtx,
        dp: &Rc<Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        // Every connection gets a task that runs until it is cancelled.
        dp.create_task(async move {
            std::future::pending::<()>().await;
            Ok(())
        });
        record(&self.log, format!("UP:{}", dp.conn_id()));
        Ok(())
    }

    fn on_channel_down(
        &mut self,
        _ctx: &ControllerCtx,
        dp: &Rc<Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        assert!(dp.tasks().is_empty());
        record(&self.log, format!("DOWN:{}", dp.conn_id()));
        Ok(())
    }
}

#[tokio::test]
async fn graceful_shutdown_under_load_closes_every_datapath() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let run = spawn_controller(
                LifecycleProbe::new(&log, &ctx),
                test_config(),
                driver,
            );
            helper.complete_startup().await;

            const DATAPATHS: u64 = 50;
            for conn_id in 1..=DATAPATHS {
                let dpid = format!("00:00:00:00:00:00:{:02x}:{:02x}", conn_id / 256, conn_id % 256);
                helper.bring_up(conn_id, &dpid).await;
            }
            wait_for(&log, &format!("UP:{DATAPATHS}")).await;

            stored_ctx(&ctx).shutdown();
            let (result, _app) = run.await.expect("controller task");
            result.expect("clean shutdown");

            let observed = entries(&log);
            let ups = observed.iter().filter(|entry| entry.starts_with("UP:")).count();
            let downs = observed.iter().filter(|entry| entry.starts_with("DOWN:")).count();
            assert_eq!(ups, DATAPATHS as usize);
            assert_eq!(downs, DATAPATHS as usize);
            // on_stop runs last, after the registry has emptied.
            assert_eq!(observed.last().map(String::as_str), Some("STOP:registry_empty=true"));
            let stop_at = position(&log, "STOP:");
            for conn_id in 1..=DATAPATHS {
                assert!(position(&log, &format!("DOWN:{conn_id}")) < stop_at);
            }
        })
        .await;
}

#[tokio::test]
async fn listeners_open_with_configured_versions() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let mut config = test_config();
            config.listen_endpoints = vec![":6653".parse().expect("endpoint")];
            let run = spawn_controller(LifecycleProbe::new(&log, &ctx), config, driver);
            helper.complete_startup().await;

            let listen = helper.expect("OFP.LISTEN").await;
            assert_eq!(listen["params"]["endpoint"], json!(":6653"));
            assert_eq!(listen["params"]["versions"], json!([4]));
            assert_eq!(listen["params"]["tls_id"], json!(0));
            helper.reply_result(&listen, json!({"conn_id": 100}));

            wait_for(&log, "START").await;
            stored_ctx(&ctx).shutdown();
            let (result, _app) = run.await.expect("controller task");
            result.expect("clean shutdown");
        })
        .await;
}

#[tokio::test]
async fn unsupported_helper_api_version_fails_startup() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let run = spawn_controller(
                LifecycleProbe::new(&log, &ctx),
                test_config(),
                driver,
            );

            let request = helper.expect("OFP.DESCRIPTION").await;
            helper.reply_result(&request, json!({"api_version": "0.8", "versions": [4]}));

            let (result, _app) = run.await.expect("controller task");
            let error = result.expect_err("startup must fail");
            assert!(matches!(
                error,
                ControllerError::Startup(StartupError::ApiVersion { .. })
            ));
            assert_eq!(error.exit_code(), 1);

            // on_start never ran, but on_stop still did (best effort).
            let observed = entries(&log);
            assert!(!observed.iter().any(|entry| entry == "START"), "{observed:?}");
            assert!(observed.iter().any(|entry| entry.starts_with("STOP:")), "{observed:?}");
        })
        .await;
}

#[tokio::test]
async fn unsupported_listen_versions_fail_startup() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let mut config = test_config();
            config.listen_versions = [1u8, 3].into_iter().collect();
            let run = spawn_controller(LifecycleProbe::new(&log, &ctx), config, driver);

            let request = helper.expect("OFP.DESCRIPTION").await;
            // The helper only speaks versions 1 and 4.
            helper.reply_result(&request, json!({"api_version": "0.9", "versions": [1, 4]}));

            let (result, _app) = run.await.expect("controller task");
            let error = result.expect_err("startup must fail");
            match error {
                ControllerError::Startup(StartupError::UnsupportedVersions { versions }) => {
                    assert_eq!(versions, vec![3]);
                }
                other => panic!("expected UnsupportedVersions, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test]
async fn helper_crash_tears_down_and_reports_exit_code_two() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let run = spawn_controller(
                LifecycleProbe::new(&log, &ctx),
                test_config(),
                driver,
            );
            helper.complete_startup().await;
            helper.bring_up(1, "00:00:00:00:00:00:00:01").await;
            wait_for(&log, "UP:1").await;

            // The helper dies: its event stream ends without warning.
            let _outgoing = helper.crash();

            let (result, _app) = run.await.expect("controller task");
            let error = result.expect_err("helper crash must be terminal");
            assert!(matches!(error, ControllerError::HelperCrashed { .. }));
            assert_eq!(error.exit_code(), 2);

            // The live datapath still observed CHANNEL_DOWN, and on_stop ran.
            let observed = entries(&log);
            assert!(observed.iter().any(|entry| entry == "DOWN:1"), "{observed:?}");
            assert!(observed.iter().any(|entry| entry.starts_with("STOP:")), "{observed:?}");
        })
        .await;
}

struct VetoProbe {
    log: Log,
    ctx: CtxSlot,
    signals_seen: Rc<Cell<u32>>,
}

impl ControllerApp for VetoProbe {
    fn on_start(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        *self.ctx.borrow_mut() = Some(ctx.clone());
        record(&self.log, "START");
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &ControllerCtx) -> HandlerResult {
        record(&self.log, "STOP");
        Ok(())
    }

    fn on_signal(
        &mut self,
        _ctx: &ControllerCtx,
        event: &mut ofmux::SignalEvent,
    ) -> HandlerResult {
        let seen = self.signals_seen.get() + 1;
        self.signals_seen.set(seen);
        // The first request is refused; the second is allowed through.
        if seen == 1 {
            event.exit = false;
        }
        record(&self.log, format!("SIGNAL:{}:exit={}", seen, event.exit));
        Ok(())
    }
}

#[tokio::test]
async fn handlers_may_veto_an_exit_signal() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let signals_seen = Rc::new(Cell::new(0));
            let mut config = test_config();
            config.exit_signals = vec![ExitSignal::User1];
            let run = spawn_controller(
                VetoProbe {
                    log: Rc::clone(&log),
                    ctx: Rc::clone(&ctx),
                    signals_seen: Rc::clone(&signals_seen),
                },
                config,
                driver,
            );
            helper.complete_startup().await;
            wait_for(&log, "START").await;

            // SAFETY: raising a signal for which the runtime has installed a
            // handler; delivery is process-wide and caught by tokio.
            unsafe {
                libc::raise(libc::SIGUSR1);
            }
            wait_for(&log, "SIGNAL:1:exit=false").await;
            assert!(!run.is_finished(), "vetoed signal must not stop the run");

            unsafe {
                libc::raise(libc::SIGUSR1);
            }
            wait_for(&log, "SIGNAL:2:exit=true").await;

            let (result, _app) = run.await.expect("controller task");
            result.expect("clean shutdown");
            assert_eq!(signals_seen.get(), 2);
            assert_eq!(entries(&log).last().map(String::as_str), Some("STOP"));
        })
        .await;
}

struct StartFailProbe {
    log: Log,
    ctx: CtxSlot,
}

impl ControllerApp for StartFailProbe {
    fn on_start(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        *self.ctx.borrow_mut() = Some(ctx.clone());
        Err("start handler broke".into())
    }

    fn on_exception(
        &mut self,
        _ctx: &ControllerCtx,
        error: &ofmux::HandlerError,
    ) -> HandlerResult {
        record(&self.log, format!("EXC:{}:{}", error.event(), error));
        Ok(())
    }
}

#[tokio::test]
async fn on_start_failures_are_routed_to_on_exception() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let run = spawn_controller(
                StartFailProbe {
                    log: Rc::clone(&log),
                    ctx: Rc::clone(&ctx),
                },
                test_config(),
                driver,
            );
            helper.complete_startup().await;

            wait_for(&log, "EXC:START").await;
            assert!(entries(&log)[0].contains("start handler broke"));

            stored_ctx(&ctx).shutdown();
            let (result, _app) = run.await.expect("controller task");
            result.expect("a failing on_start does not abort the run");
        })
        .await;
}

/// Outgoing connections are initiated through the context.
struct ConnectProbe {
    log: Log,
    ctx: CtxSlot,
}

impl ControllerApp for ConnectProbe {
    fn on_start(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        *self.ctx.borrow_mut() = Some(ctx.clone());
        let log = Rc::clone(&self.log);
        let ctx = ctx.clone();
        ctx.clone().create_task(async move {
            let conn_id = ctx.connect("203.0.113.5:6653").await?;
            record(&log, format!("CONNECTED:{conn_id}"));
            Ok(())
        });
        Ok(())
    }
}

#[tokio::test]
async fn outgoing_connections_use_the_connect_rpc() {
    LocalSet::new()
        .run_until(async {
            let (driver, mut helper) = Helper::channel();
            let log = new_log();
            let ctx = new_ctx_slot();
            let run = spawn_controller(
                ConnectProbe {
                    log: Rc::clone(&log),
                    ctx: Rc::clone(&ctx),
                },
                test_config(),
                driver,
            );
            helper.complete_startup().await;

            let connect = helper.expect("OFP.CONNECT").await;
            assert_eq!(connect["params"]["endpoint"], json!("203.0.113.5:6653"));
            helper.reply_result(&connect, json!({"conn_id": 7}));

            wait_for(&log, "CONNECTED:7").await;
            stored_ctx(&ctx).shutdown();
            let (result, _app) = run.await.expect("controller task");
            result.expect("clean shutdown");
        })
        .await;
}
