//! Supervision of the `oftr` helper process and its framed JSON channel.
//!
//! The driver owns the helper's three pipes. Outgoing objects are queued to
//! a writer task so ordering is preserved; incoming bytes are split into
//! frames and parsed off a reader task; stderr lines are forwarded to the
//! logger with a level derived from the helper's `[LEVEL]` tag. An
//! in-memory variant ([`Driver::from_channel`]) carries the same interface
//! over plain channels so tests and embedders can script the helper side.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use ofmux_config::{debug_enabled, Config, Framing};

use crate::error::{DriverError, ProtocolError, StartupError};

pub(crate) mod framing;

use framing::FrameCodec;

/// Tracing target for driver operations.
const DRIVER_TARGET: &str = "ofmux::driver";

/// Subcommand that switches the helper into its JSON-RPC mode.
const HELPER_MODE: &str = "jsonrpc";

/// Capacity of the incoming frame queue read by the transport.
const INCOMING_QUEUE: usize = 256;

/// How the helper process is launched.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Helper binary path.
    pub path: PathBuf,
    /// Extra arguments appended after the mode flag.
    pub args: Vec<String>,
    /// Channel framing to apply on stdin/stdout.
    pub framing: Framing,
}

impl DriverConfig {
    /// Derives the driver configuration from a controller [`Config`].
    ///
    /// When `ZOFDEBUG` is set the helper is additionally asked to trace its
    /// RPC channel.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut args = config.oftr_args.clone();
        if debug_enabled() {
            args.push("--trace=rpc".to_string());
        }
        Self {
            path: config.oftr_path.clone(),
            args,
            framing: config.framing,
        }
    }
}

#[derive(Debug)]
enum Incoming {
    Framed(mpsc::Receiver<Result<Value, ProtocolError>>),
    Plain(mpsc::UnboundedReceiver<Value>),
}

#[derive(Debug)]
enum Backend {
    Process {
        child: Child,
        tasks: Vec<JoinHandle<()>>,
    },
    Channel,
}

/// A running helper channel.
#[derive(Debug)]
pub struct Driver {
    outgoing: mpsc::UnboundedSender<Value>,
    incoming: Incoming,
    backend: Backend,
}

impl Driver {
    /// Spawns the helper process and wires up its pipes.
    ///
    /// Must be called from within a `tokio` local task context (the
    /// controller runtime provides one). The helper is placed in its own
    /// process group so terminal interrupts reach only the controller.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError::Spawn`] when the binary cannot be launched.
    pub fn spawn(config: &DriverConfig) -> Result<Self, StartupError> {
        let mut command = Command::new(&config.path);
        command.arg(HELPER_MODE);
        command.args(&config.args);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        debug!(
            target: DRIVER_TARGET,
            path = %config.path.display(),
            args = ?config.args,
            "spawning helper process"
        );

        let mut child = command.spawn().map_err(|source| StartupError::Spawn {
            path: config.path.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            // Piped stdio is always present after a successful spawn.
            return Err(StartupError::Spawn {
                path: config.path.clone(),
                source: std::io::Error::other("helper stdio was not captured"),
            });
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);

        let tasks = vec![
            tokio::task::spawn_local(write_loop(stdin, config.framing, outgoing_rx)),
            tokio::task::spawn_local(read_loop(stdout, config.framing, incoming_tx)),
            tokio::task::spawn_local(forward_stderr(stderr)),
        ];

        if let Some(pid) = child.id() {
            info!(target: DRIVER_TARGET, pid, "helper process started");
        }

        Ok(Self {
            outgoing,
            incoming: Incoming::Framed(incoming_rx),
            backend: Backend::Process { child, tasks },
        })
    }

    /// Builds a driver over in-memory channels.
    ///
    /// The peer injects incoming objects through the sender side of
    /// `incoming` and observes outgoing objects on the receiver side of
    /// `outgoing`. Closing `incoming` is equivalent to helper EOF.
    #[must_use]
    pub fn from_channel(
        outgoing: mpsc::UnboundedSender<Value>,
        incoming: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            outgoing,
            incoming: Incoming::Plain(incoming),
            backend: Backend::Channel,
        }
    }

    /// Enqueues an object for delivery to the helper.
    ///
    /// Ordering towards the helper matches enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Closed`] when the channel has shut down.
    pub fn send(&self, message: Value) -> Result<(), DriverError> {
        self.outgoing
            .send(message)
            .map_err(|_| DriverError::Closed)
    }

    /// Receives the next parsed object from the helper.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Closed`] after EOF (the terminal sentinel) and
    /// [`DriverError::Protocol`] when the helper corrupts the frame stream.
    pub async fn recv(&mut self) -> Result<Value, DriverError> {
        match &mut self.incoming {
            Incoming::Framed(rx) => match rx.recv().await {
                Some(Ok(value)) => Ok(value),
                Some(Err(error)) => Err(error.into()),
                None => Err(DriverError::Closed),
            },
            Incoming::Plain(rx) => rx.recv().await.ok_or(DriverError::Closed),
        }
    }

    /// Stops the helper: closes stdin, waits up to the grace window, then
    /// kills the child. Returns the helper's exit code when one could be
    /// collected.
    pub async fn stop(self, grace: Duration) -> Option<i32> {
        let Self {
            outgoing,
            incoming,
            backend,
        } = self;
        // Dropping the queue ends the writer task, which closes stdin and
        // signals the helper to exit.
        drop(outgoing);
        drop(incoming);

        match backend {
            Backend::Channel => None,
            Backend::Process { mut child, tasks } => {
                let status = match time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(error)) => {
                        warn!(target: DRIVER_TARGET, %error, "failed to reap helper process");
                        None
                    }
                    Err(_) => {
                        warn!(
                            target: DRIVER_TARGET,
                            grace_ms = grace.as_millis() as u64,
                            "helper did not exit within the grace window; killing it"
                        );
                        match child.start_kill() {
                            Ok(()) => child.wait().await.ok(),
                            Err(error) => {
                                warn!(target: DRIVER_TARGET, %error, "failed to kill helper process");
                                None
                            }
                        }
                    }
                };
                for task in tasks {
                    task.abort();
                }
                match status {
                    Some(status) if status.success() => {
                        info!(target: DRIVER_TARGET, "helper process exited cleanly");
                    }
                    Some(status) => {
                        warn!(target: DRIVER_TARGET, ?status, "helper process exited with failure");
                    }
                    None => {}
                }
                status.and_then(|status| status.code())
            }
        }
    }
}

/// Serialises queued objects onto the helper's stdin.
async fn write_loop(
    mut stdin: ChildStdin,
    framing: Framing,
    mut queue: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(message) = queue.recv().await {
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(error) => {
                error!(target: DRIVER_TARGET, %error, "failed to serialise outgoing message");
                continue;
            }
        };
        let frame = framing::encode(framing, &payload);
        if stdin.write_all(&frame).await.is_err() || stdin.flush().await.is_err() {
            warn!(target: DRIVER_TARGET, "helper stdin closed; dropping outgoing messages");
            break;
        }
    }
    // Queue closed or the pipe broke; dropping stdin delivers EOF.
}

/// Splits the helper's stdout into parsed JSON objects.
async fn read_loop(
    mut stdout: ChildStdout,
    framing: Framing,
    frames: mpsc::Sender<Result<Value, ProtocolError>>,
) {
    let mut codec = FrameCodec::new(framing);
    let mut chunk = [0u8; 8192];
    loop {
        loop {
            match codec.next_frame() {
                Ok(Some(frame)) => match serde_json::from_slice(&frame) {
                    Ok(value) => {
                        if frames.send(Ok(value)).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let fault = ProtocolError::InvalidJson {
                            detail: error.to_string(),
                        };
                        let _ = frames.send(Err(fault)).await;
                        return;
                    }
                },
                Ok(None) => break,
                Err(fault) => {
                    let _ = frames.send(Err(fault)).await;
                    return;
                }
            }
        }
        match stdout.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(read) => codec.push(&chunk[..read]),
        }
    }
}

/// Forwards helper stderr lines to the logger.
async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let (severity, text) = split_severity(&line);
        match severity {
            Severity::Debug => debug!(target: DRIVER_TARGET, "helper: {text}"),
            Severity::Info => info!(target: DRIVER_TARGET, "helper: {text}"),
            Severity::Warn => warn!(target: DRIVER_TARGET, "helper: {text}"),
            Severity::Error => error!(target: DRIVER_TARGET, "helper: {text}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Derives a log level from a helper stderr line's leading tag.
fn split_severity(line: &str) -> (Severity, &str) {
    const TAGS: [(&str, Severity); 5] = [
        ("[DEBUG]", Severity::Debug),
        ("[INFO]", Severity::Info),
        ("[WARN]", Severity::Warn),
        ("[WARNING]", Severity::Warn),
        ("[ERROR]", Severity::Error),
    ];
    for (tag, severity) in TAGS {
        if let Some(rest) = line.strip_prefix(tag) {
            return (severity, rest.trim_start());
        }
    }
    (Severity::Info, line)
}

#[cfg(test)]
mod tests;
