//! Top-level controller lifecycle.
//!
//! [`Controller::run`] owns the whole runtime: it brings the helper up,
//! performs the startup handshake, installs signal listeners, runs the
//! dispatch loop on a single-threaded cooperative scheduler, and winds
//! everything down in order — datapaths first, then the controller task
//! scope, then `on_stop`, then the helper itself. `on_stop` runs
//! best-effort even when the run is terminating with an error.

use std::future::Future;
use std::process::ExitCode;
use std::rc::Rc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

use ofmux_config::{Config, ExitSignal, TlsIdentity};

use crate::app::ControllerApp;
use crate::datapath::Datapath;
use crate::dispatch::{ControlMsg, DispatchOutcome, Dispatcher};
use crate::driver::{Driver, DriverConfig};
use crate::error::{ControllerError, HandlerError, RequestError, StartupError};
use crate::event::DatapathId;
use crate::registry::DatapathRegistry;
use crate::rpc::{ExitReason, RpcHandle, Transport, TransportExit};
use crate::tasks::TaskGroup;
use crate::HandlerResult;

/// Tracing target for controller lifecycle operations.
const CONTROLLER_TARGET: &str = "ofmux::controller";

/// Helper RPC API version this runtime speaks.
const SUPPORTED_API_VERSION: &str = "0.9";

struct CtxInner {
    config: Config,
    rpc: RpcHandle,
    registry: DatapathRegistry,
    tasks: TaskGroup,
    control: mpsc::UnboundedSender<ControlMsg>,
}

/// Shared controller context handed to every handler.
///
/// Cheap to clone; all clones refer to the same running controller.
#[derive(Clone)]
pub struct ControllerCtx {
    inner: Rc<CtxInner>,
}

impl ControllerCtx {
    pub(crate) fn new(
        config: Config,
        rpc: RpcHandle,
        control: mpsc::UnboundedSender<ControlMsg>,
    ) -> Self {
        Self {
            inner: Rc::new(CtxInner {
                config,
                rpc,
                registry: DatapathRegistry::new(),
                tasks: TaskGroup::new("controller"),
                control,
            }),
        }
    }

    /// The controller's immutable configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The registry of ready datapaths.
    #[must_use]
    pub fn registry(&self) -> &DatapathRegistry {
        &self.inner.registry
    }

    /// Snapshot of every ready datapath.
    #[must_use]
    pub fn datapaths(&self) -> Vec<Rc<Datapath>> {
        self.inner.registry.snapshot()
    }

    /// Looks a datapath up by its datapath id.
    #[must_use]
    pub fn find_datapath(&self, datapath_id: DatapathId) -> Option<Rc<Datapath>> {
        self.inner.registry.find_by_datapath_id(datapath_id)
    }

    /// Spawns a task scoped to the controller's lifetime.
    ///
    /// The task is cancelled during shutdown; an error it returns is routed
    /// to the exception handler.
    pub fn create_task<F>(&self, future: F)
    where
        F: Future<Output = HandlerResult> + 'static,
    {
        let control = self.inner.control.clone();
        self.inner.tasks.spawn(async move {
            if let Err(source) = future.await {
                let error = HandlerError::new("task", None, source);
                let _ = control.send(ControlMsg::HandlerFailure(error));
            }
        });
    }

    /// Opens an outgoing OpenFlow connection to a switch.
    ///
    /// Returns the helper-assigned connection id; the datapath itself
    /// appears through the usual CHANNEL_UP path once negotiation
    /// completes.
    ///
    /// # Errors
    ///
    /// Fails with a [`RequestError`] when the helper rejects the endpoint
    /// or the channel is down.
    pub async fn connect(&self, endpoint: &str) -> Result<u64, RequestError> {
        let reply = self
            .inner
            .rpc
            .call_rpc("OFP.CONNECT", json!({"endpoint": endpoint}))
            .await?;
        reply
            .get("conn_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| RequestError::Rpc {
                code: -1,
                message: "connect reply carried no conn_id".to_string(),
            })
    }

    /// Requests a graceful shutdown, as if an exit signal had been
    /// accepted.
    pub fn shutdown(&self) {
        let _ = self.inner.control.send(ControlMsg::Shutdown);
    }

    pub(crate) fn rpc_handle(&self) -> &RpcHandle {
        &self.inner.rpc
    }

    pub(crate) fn control_sender(&self) -> mpsc::UnboundedSender<ControlMsg> {
        self.inner.control.clone()
    }

    pub(crate) fn tasks(&self) -> &TaskGroup {
        &self.inner.tasks
    }
}

/// A controller: an application plus its configuration.
///
/// At most one `run()` is active at a time (it borrows the controller
/// mutably); several controllers may coexist in one process, each owning
/// its own helper subprocess.
pub struct Controller<A: ControllerApp> {
    app: A,
    config: Config,
}

impl<A: ControllerApp> Controller<A> {
    /// Builds a controller from an application and its configuration.
    pub fn new(app: A, config: Config) -> Self {
        Self { app, config }
    }

    /// The application, e.g. for inspecting state after `run()` returns.
    #[must_use]
    pub fn app(&self) -> &A {
        &self.app
    }

    /// Consumes the controller, returning the application.
    #[must_use]
    pub fn into_app(self) -> A {
        self.app
    }

    /// Runs the controller against a freshly spawned helper process.
    ///
    /// # Errors
    ///
    /// Returns a [`ControllerError`] describing the terminal failure;
    /// `on_stop` has already run by the time this returns.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        self.config
            .validate()
            .map_err(|error| ControllerError::Startup(error.into()))?;
        let driver_config = DriverConfig::from_config(&self.config);
        let local = LocalSet::new();
        local
            .run_until(async {
                let driver = Driver::spawn(&driver_config).map_err(ControllerError::Startup)?;
                self.execute(driver).await
            })
            .await
    }

    /// Runs the controller over an existing driver channel.
    ///
    /// Intended for tests and embedders that already own a helper channel
    /// (see [`Driver::from_channel`]). Unlike [`run`](Self::run), this does
    /// not create its own task context: it must be awaited inside a
    /// [`LocalSet`], so the caller can run the helper side concurrently.
    ///
    /// # Errors
    ///
    /// Identical to [`run`](Self::run).
    pub async fn run_with_driver(&mut self, driver: Driver) -> Result<(), ControllerError> {
        self.config
            .validate()
            .map_err(|error| ControllerError::Startup(error.into()))?;
        self.execute(driver).await
    }

    async fn execute(&mut self, driver: Driver) -> Result<(), ControllerError> {
        let config = self.config.clone();
        let (rpc, events, transport_task) = Transport::start(driver, config.rpc_timeout);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let ctx = ControllerCtx::new(config.clone(), rpc.clone(), control_tx);

        install_signal_listeners(&ctx);

        let startup_result = startup_sequence(&mut self.app, &ctx).await;

        let mut dispatcher = Dispatcher::new(&mut self.app, ctx.clone(), events, control_rx);
        let outcome = match &startup_result {
            Ok(()) => dispatcher.run().await,
            // Startup failed: skip the dispatch loop but still wind down so
            // on_stop observes the partial start.
            Err(_) => DispatchOutcome::ShutdownRequested,
        };
        dispatcher.wind_down().await;

        rpc.shutdown();
        let exit = match transport_task.await {
            Ok(exit) => exit,
            Err(join_error) => {
                error!(target: CONTROLLER_TARGET, %join_error, "transport task failed");
                return Err(ControllerError::HelperCrashed { status: None });
            }
        };
        let TransportExit { reason, driver } = exit;
        let status = driver.stop(config.shutdown_grace).await;

        if let Err(startup_error) = startup_result {
            return Err(ControllerError::Startup(startup_error));
        }
        match outcome {
            DispatchOutcome::ShutdownRequested => {
                info!(target: CONTROLLER_TARGET, "controller stopped");
                Ok(())
            }
            DispatchOutcome::ChannelClosed => match reason {
                ExitReason::Protocol(fault) => Err(ControllerError::Protocol(fault)),
                ExitReason::Closed | ExitReason::Shutdown => {
                    Err(ControllerError::HelperCrashed { status })
                }
            },
        }
    }
}

/// Handshake, TLS identity, `on_start`, and listeners, in that order.
async fn startup_sequence<A: ControllerApp>(
    app: &mut A,
    ctx: &ControllerCtx,
) -> Result<(), StartupError> {
    let supported_versions = startup_handshake(ctx).await?;
    check_versions(ctx.config(), &supported_versions)?;

    let tls_id = match &ctx.config().tls {
        Some(identity) => add_tls_identity(ctx, identity).await?,
        None => 0,
    };

    if let Err(source) = app.on_start(ctx) {
        // Handler failures never abort the run; route it like any other.
        let error = HandlerError::new("START", None, source);
        let _ = ctx.control_sender().send(ControlMsg::HandlerFailure(error));
    }

    let versions: Vec<u8> = ctx.config().listen_versions.iter().copied().collect();
    for endpoint in &ctx.config().listen_endpoints {
        let reply = ctx
            .rpc_handle()
            .call_rpc(
                "OFP.LISTEN",
                json!({
                    "endpoint": endpoint.to_string(),
                    "versions": versions,
                    "tls_id": tls_id,
                }),
            )
            .await
            .map_err(|source| StartupError::Listen {
                endpoint: endpoint.to_string(),
                source,
            })?;
        info!(
            target: CONTROLLER_TARGET,
            endpoint = %endpoint,
            conn_id = reply.get("conn_id").and_then(serde_json::Value::as_u64),
            "listening for OpenFlow connections"
        );
    }
    Ok(())
}

/// Verifies the helper's API version and collects its supported OpenFlow
/// versions.
async fn startup_handshake(ctx: &ControllerCtx) -> Result<Vec<u8>, StartupError> {
    let description = ctx
        .rpc_handle()
        .call_rpc("OFP.DESCRIPTION", json!({}))
        .await
        .map_err(|source| StartupError::Handshake { source })?;

    let reported = match description.get("api_version") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    if reported != SUPPORTED_API_VERSION {
        return Err(StartupError::ApiVersion {
            reported,
            expected: SUPPORTED_API_VERSION,
        });
    }

    if let Some(sw_desc) = description.get("sw_desc").and_then(Value::as_str) {
        info!(target: CONTROLLER_TARGET, sw_desc, "connected to helper");
    }

    let supported = description
        .get("versions")
        .and_then(Value::as_array)
        .map(|versions| {
            versions
                .iter()
                .filter_map(Value::as_u64)
                .filter_map(|version| u8::try_from(version).ok())
                .collect()
        })
        .unwrap_or_default();
    Ok(supported)
}

/// Rejects configured listen versions the helper cannot speak.
fn check_versions(config: &Config, supported: &[u8]) -> Result<(), StartupError> {
    if supported.is_empty() {
        return Ok(());
    }
    let unsupported: Vec<u8> = config
        .listen_versions
        .iter()
        .copied()
        .filter(|version| !supported.contains(version))
        .collect();
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(StartupError::UnsupportedVersions {
            versions: unsupported,
        })
    }
}

/// Registers the TLS identity with the helper, returning its id for use in
/// listen requests.
async fn add_tls_identity(
    ctx: &ControllerCtx,
    identity: &TlsIdentity,
) -> Result<u64, StartupError> {
    let mut params = json!({
        "cert": identity.cert.to_string_lossy(),
        "privkey": identity.privkey.to_string_lossy(),
    });
    if let Some(cacert) = &identity.cacert {
        params["cacert"] = Value::String(cacert.to_string_lossy().into_owned());
    }
    let reply = ctx
        .rpc_handle()
        .call_rpc("OFP.ADD_IDENTITY", params)
        .await
        .map_err(|source| StartupError::Tls { source })?;
    Ok(reply.get("tls_id").and_then(Value::as_u64).unwrap_or(0))
}

/// Translates exit signals into in-band control messages.
///
/// Each configured signal gets a listener task in the controller scope so
/// shutdown requests flow through the dispatcher in order and handlers may
/// veto them.
fn install_signal_listeners(ctx: &ControllerCtx) {
    #[cfg(unix)]
    for signal in ctx.config().exit_signals.clone() {
        let kind = signal_kind(signal);
        match tokio::signal::unix::signal(kind) {
            Ok(mut stream) => {
                let control = ctx.control_sender();
                ctx.tasks().spawn(async move {
                    while stream.recv().await.is_some() {
                        info!(target: CONTROLLER_TARGET, %signal, "caught exit signal");
                        let _ = control.send(ControlMsg::SignalCaught(signal));
                    }
                });
            }
            Err(error) => {
                warn!(target: CONTROLLER_TARGET, %signal, %error, "failed to install signal listener");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = ctx;
}

#[cfg(unix)]
fn signal_kind(signal: ExitSignal) -> tokio::signal::unix::SignalKind {
    use tokio::signal::unix::SignalKind;
    match signal {
        ExitSignal::Interrupt => SignalKind::interrupt(),
        ExitSignal::Terminate => SignalKind::terminate(),
        ExitSignal::Hangup => SignalKind::hangup(),
        ExitSignal::User1 => SignalKind::user_defined1(),
        ExitSignal::User2 => SignalKind::user_defined2(),
    }
}

/// Runs a controller to completion, mapping the outcome to a process exit
/// code: 0 for a clean shutdown, 1 for startup failures, 2 when the helper
/// crashed or corrupted its channel.
pub async fn run<A: ControllerApp>(app: A, config: Config) -> ExitCode {
    let mut controller = Controller::new(app, config);
    match controller.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(target: CONTROLLER_TARGET, %error, "controller terminated");
            ExitCode::from(error.exit_code())
        }
    }
}
