//! The dispatch loop: per-connection state machine and handler invocation.
//!
//! Exactly one dispatcher runs per controller. It consumes decoded events
//! in helper-emission order, drives each connection through negotiation to
//! readiness, tears connections down with their task groups joined before
//! CHANNEL_DOWN is delivered, and contains every handler failure at the
//! dispatch boundary. After each event the dispatcher yields once so a
//! freshly spawned handler task can take its first step before the next
//! event is dispatched.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{ControllerApp, SignalEvent};
use crate::controller::ControllerCtx;
use crate::datapath::Datapath;
use crate::error::{HandlerError, RequestError};
use crate::event::{DatapathId, Event, EventKind};
use crate::rpc::RpcHandle;
use ofmux_config::ExitSignal;

/// Tracing target for dispatch operations.
const DISPATCH_TARGET: &str = "ofmux::dispatch";

/// In-band messages that bypass the helper event stream.
#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// An error escaped a handler or a handler task.
    HandlerFailure(HandlerError),
    /// An exit signal was caught by a listener task.
    SignalCaught(ExitSignal),
    /// A negotiation task finished.
    NegotiationDone {
        /// Connection the negotiation belongs to.
        conn_id: u64,
        /// The merged result, or why negotiation failed.
        outcome: Result<NegotiatedChannel, NegotiationError>,
    },
    /// A graceful shutdown was requested programmatically.
    Shutdown,
}

/// Everything learnt about a connection during negotiation.
#[derive(Debug)]
pub(crate) struct NegotiatedChannel {
    datapath_id: DatapathId,
    version: u8,
    endpoint: Option<String>,
    features: Value,
    ports: Value,
    body: Value,
}

/// Why a negotiation attempt was abandoned.
#[derive(Debug, Error)]
pub(crate) enum NegotiationError {
    /// A negotiation request failed or timed out.
    #[error(transparent)]
    Request(RequestError),
    /// Neither the reply nor the raw channel event named a datapath id.
    #[error("no datapath id reported")]
    MissingDatapathId,
    /// The reported datapath id did not parse.
    #[error("invalid datapath id '{text}'")]
    InvalidDatapathId {
        /// The rejected text.
        text: String,
    },
    /// No protocol version was reported for the connection.
    #[error("no protocol version reported")]
    MissingVersion,
}

/// How the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// A signal or explicit request asked for shutdown.
    ShutdownRequested,
    /// The helper event stream ended.
    ChannelClosed,
}

enum Flow {
    Continue,
    Exit,
}

/// The per-controller dispatch loop.
pub(crate) struct Dispatcher<'app, A: ControllerApp> {
    app: &'app mut A,
    ctx: ControllerCtx,
    events: mpsc::UnboundedReceiver<Event>,
    control: mpsc::UnboundedReceiver<ControlMsg>,
    negotiating: HashMap<u64, CancellationToken>,
}

impl<'app, A: ControllerApp> Dispatcher<'app, A> {
    pub(crate) fn new(
        app: &'app mut A,
        ctx: ControllerCtx,
        events: mpsc::UnboundedReceiver<Event>,
        control: mpsc::UnboundedReceiver<ControlMsg>,
    ) -> Self {
        Self {
            app,
            ctx,
            events,
            control,
            negotiating: HashMap::new(),
        }
    }

    /// Runs until shutdown is requested or the helper channel ends.
    pub(crate) async fn run(&mut self) -> DispatchOutcome {
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => {
                    let message = match control {
                        Some(message) => message,
                        None => return DispatchOutcome::ShutdownRequested,
                    };
                    if let Flow::Exit = self.handle_control(message) {
                        return DispatchOutcome::ShutdownRequested;
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => {
                        self.dispatch(event).await;
                        // Give a just-spawned handler task its first step
                        // before the next event is dispatched.
                        tokio::task::yield_now().await;
                    }
                    None => return DispatchOutcome::ChannelClosed,
                },
            }
        }
    }

    fn handle_control(&mut self, message: ControlMsg) -> Flow {
        match message {
            ControlMsg::HandlerFailure(error) => {
                self.invoke_exception(error);
                Flow::Continue
            }
            ControlMsg::SignalCaught(signal) => self.handle_signal(signal),
            ControlMsg::NegotiationDone { conn_id, outcome } => {
                self.complete_negotiation(conn_id, outcome);
                Flow::Continue
            }
            ControlMsg::Shutdown => {
                debug!(target: DISPATCH_TARGET, "shutdown requested");
                Flow::Exit
            }
        }
    }

    fn handle_signal(&mut self, signal: ExitSignal) -> Flow {
        let mut event = SignalEvent::new(signal);
        let result = self.app.on_signal(&self.ctx, &mut event);
        self.route_result("SIGNAL", None, result);
        if event.exit {
            info!(target: DISPATCH_TARGET, %signal, "exit signal accepted; shutting down");
            Flow::Exit
        } else {
            info!(target: DISPATCH_TARGET, %signal, "exit signal vetoed by handler");
            Flow::Continue
        }
    }

    async fn dispatch(&mut self, event: Event) {
        match event.kind() {
            EventKind::ChannelUp => self.begin_negotiation(&event),
            EventKind::ChannelDown => self.complete_channel_down(&event).await,
            EventKind::ChannelAlert => self.dispatch_alert(&event),
            EventKind::Message(name) => {
                let name = name.clone();
                self.dispatch_message(&name, &event);
            }
        }
    }

    /// Raw CHANNEL_UP from the helper: start negotiating the connection.
    fn begin_negotiation(&mut self, event: &Event) {
        let Some(conn_id) = event.conn_id() else {
            warn!(target: DISPATCH_TARGET, "CHANNEL_UP without conn_id");
            return;
        };
        if self.negotiating.contains_key(&conn_id) || self.ctx.registry().get(conn_id).is_some() {
            warn!(
                target: DISPATCH_TARGET,
                conn_id, "duplicate CHANNEL_UP for a live connection"
            );
            return;
        }

        debug!(target: DISPATCH_TARGET, conn_id, "negotiating new connection");
        let token = CancellationToken::new();
        self.negotiating.insert(conn_id, token.clone());

        let rpc = self.ctx.rpc_handle().clone();
        let control = self.ctx.control_sender();
        let raw = event.body().clone();
        self.ctx.tasks().spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                outcome = negotiate(&rpc, conn_id, raw) => {
                    let _ = control.send(ControlMsg::NegotiationDone { conn_id, outcome });
                }
            }
        });
    }

    /// A negotiation task reported back: promote the connection to ready
    /// (synthesising the user-visible CHANNEL_UP) or drop it silently.
    fn complete_negotiation(
        &mut self,
        conn_id: u64,
        outcome: Result<NegotiatedChannel, NegotiationError>,
    ) {
        if self.negotiating.remove(&conn_id).is_none() {
            // The connection went down while the result was in flight.
            debug!(target: DISPATCH_TARGET, conn_id, "discarding stale negotiation result");
            return;
        }

        let negotiated = match outcome {
            Ok(negotiated) => negotiated,
            Err(error) => {
                warn!(
                    target: DISPATCH_TARGET,
                    conn_id, %error, "negotiation failed; dropping connection"
                );
                self.close_connection(conn_id);
                return;
            }
        };

        let datapath = Datapath::new(
            conn_id,
            negotiated.datapath_id,
            negotiated.version,
            negotiated.endpoint,
            negotiated.features,
            negotiated.ports,
            self.ctx.rpc_handle().clone(),
            self.ctx.control_sender(),
        );
        if let Err(error) = self.ctx.registry().insert(Rc::clone(&datapath)) {
            error!(
                target: DISPATCH_TARGET,
                conn_id, %error, "datapath registration failed; dropping connection"
            );
            self.close_connection(conn_id);
            return;
        }

        info!(
            target: DISPATCH_TARGET,
            conn_id,
            datapath_id = %datapath.datapath_id(),
            version = datapath.version(),
            "channel up"
        );
        let event = Event::channel_up(conn_id, datapath.datapath_id(), negotiated.body);
        let result = self.app.on_channel_up(&self.ctx, &datapath, &event);
        self.route_result("CHANNEL_UP", Some(conn_id), result);
    }

    /// CHANNEL_DOWN from the helper: tear the connection down. The task
    /// group is cancelled and joined before the handler observes the event.
    async fn complete_channel_down(&mut self, event: &Event) {
        let Some(conn_id) = event.conn_id() else {
            warn!(target: DISPATCH_TARGET, "CHANNEL_DOWN without conn_id");
            return;
        };
        if let Some(token) = self.negotiating.remove(&conn_id) {
            token.cancel();
            debug!(target: DISPATCH_TARGET, conn_id, "connection lost during negotiation");
            return;
        }
        let Some(datapath) = self.ctx.registry().remove(conn_id) else {
            debug!(target: DISPATCH_TARGET, conn_id, "CHANNEL_DOWN for unknown connection");
            return;
        };

        datapath.mark_closed();
        let grace = self.ctx.config().shutdown_grace;
        datapath.tasks().close(grace).await;

        info!(target: DISPATCH_TARGET, conn_id, "channel down");
        let result = self.app.on_channel_down(&self.ctx, &datapath, event);
        self.route_result("CHANNEL_DOWN", Some(conn_id), result);
    }

    fn dispatch_alert(&mut self, event: &Event) {
        let datapath = event.conn_id().and_then(|conn_id| self.ctx.registry().get(conn_id));
        let result = self.app.on_channel_alert(&self.ctx, datapath.as_ref(), event);
        self.route_result("CHANNEL_ALERT", event.conn_id(), result);
    }

    fn dispatch_message(&mut self, name: &str, event: &Event) {
        let datapath = event.conn_id().and_then(|conn_id| self.ctx.registry().get(conn_id));
        if event.conn_id().is_some() && datapath.is_none() {
            debug!(
                target: DISPATCH_TARGET,
                conn_id = event.conn_id(),
                kind = name,
                "dropping event for a connection that is not ready"
            );
            return;
        }

        let result = match datapath.as_ref() {
            Some(datapath) => match name {
                "PACKET_IN" => self.app.on_packet_in(&self.ctx, datapath, event),
                "FLOW_REMOVED" => self.app.on_flow_removed(&self.ctx, datapath, event),
                "PORT_STATUS" => self.app.on_port_status(&self.ctx, datapath, event),
                _ => self.app.on_message(&self.ctx, Some(datapath), event),
            },
            None => self.app.on_message(&self.ctx, None, event),
        };
        self.route_result(name, event.conn_id(), result);
    }

    /// Winds the controller down: every datapath closes (emitting its
    /// CHANNEL_DOWN), the controller scope joins, and `on_stop` runs
    /// best-effort.
    pub(crate) async fn wind_down(mut self) {
        let grace = self.ctx.config().shutdown_grace;

        for (_, token) in self.negotiating.drain() {
            token.cancel();
        }

        // Cancel every datapath scope first, then join them in parallel so
        // the grace window bounds the whole teardown rather than each
        // connection in turn.
        let datapaths = self.ctx.registry().snapshot();
        for datapath in &datapaths {
            self.ctx.registry().remove(datapath.conn_id());
            datapath.mark_closed();
            datapath.tasks().cancel();
        }
        futures::future::join_all(
            datapaths
                .iter()
                .map(|datapath| datapath.tasks().join(grace)),
        )
        .await;

        for datapath in &datapaths {
            let event = Event::channel_down(datapath.conn_id(), Some(datapath.datapath_id()));
            let result = self.app.on_channel_down(&self.ctx, datapath, &event);
            self.route_result("CHANNEL_DOWN", Some(datapath.conn_id()), result);
        }

        self.ctx.tasks().close(grace).await;

        if let Err(source) = self.app.on_stop(&self.ctx) {
            let error = HandlerError::new("STOP", None, source);
            self.invoke_exception(error);
        }

        let mut undispatched = 0usize;
        while self.events.try_recv().is_ok() {
            undispatched += 1;
        }
        if undispatched > 0 {
            warn!(
                target: DISPATCH_TARGET,
                undispatched, "exiting with events still queued"
            );
        }
    }

    fn close_connection(&self, conn_id: u64) {
        let request = self
            .ctx
            .rpc_handle()
            .send_rpc("OFP.CLOSE", json!({"conn_id": conn_id}));
        if request.is_err() {
            debug!(target: DISPATCH_TARGET, conn_id, "helper gone; close request dropped");
        }
    }

    fn route_result(&mut self, event_name: &str, conn_id: Option<u64>, result: crate::HandlerResult) {
        if let Err(source) = result {
            let error = HandlerError::new(event_name, conn_id, source);
            self.invoke_exception(error);
        }
    }

    /// Delivers a handler failure to `on_exception` exactly once; a
    /// failure of the exception handler itself is logged, never re-routed.
    fn invoke_exception(&mut self, error: HandlerError) {
        if let Err(secondary) = self.app.on_exception(&self.ctx, &error) {
            error!(
                target: DISPATCH_TARGET,
                primary = %error,
                secondary = %secondary,
                "exception handler itself failed"
            );
        }
    }
}

/// Performs the FEATURES_REQUEST / PORT_DESC_REQUEST exchange for a new
/// connection. The two requests run concurrently; either failure abandons
/// the connection.
async fn negotiate(
    rpc: &RpcHandle,
    conn_id: u64,
    raw: Value,
) -> Result<NegotiatedChannel, NegotiationError> {
    let features_request = json!({"type": "FEATURES_REQUEST", "conn_id": conn_id, "msg": {}});
    let port_desc_request = json!({"type": "PORT_DESC_REQUEST", "conn_id": conn_id, "msg": {}});
    let (features_reply, port_desc_reply) = tokio::try_join!(
        rpc.call_message(features_request),
        rpc.call_message(port_desc_request),
    )
    .map_err(NegotiationError::Request)?;
    merge_channel_up(raw, features_reply, port_desc_reply)
}

/// Merges the helper's connection attributes with the negotiation replies
/// into the body of the synthesised CHANNEL_UP event.
fn merge_channel_up(
    raw: Value,
    features_reply: Value,
    port_desc_reply: Value,
) -> Result<NegotiatedChannel, NegotiationError> {
    let features = match features_reply.get("msg") {
        Some(msg) if msg.is_object() => msg.clone(),
        _ => features_reply,
    };

    let datapath_text = features
        .get("datapath_id")
        .and_then(Value::as_str)
        .or_else(|| raw.get("datapath_id").and_then(Value::as_str))
        .ok_or(NegotiationError::MissingDatapathId)?
        .to_string();
    let datapath_id: DatapathId =
        datapath_text
            .parse()
            .map_err(|_| NegotiationError::InvalidDatapathId {
                text: datapath_text.clone(),
            })?;

    let version = raw
        .get("version")
        .and_then(Value::as_u64)
        .or_else(|| features.get("version").and_then(Value::as_u64))
        .and_then(|version| u8::try_from(version).ok())
        .ok_or(NegotiationError::MissingVersion)?;

    let endpoint = raw
        .get("endpoint")
        .and_then(Value::as_str)
        .map(str::to_string);
    let ports = extract_ports(&port_desc_reply);

    let mut body = if raw.is_object() { raw } else { json!({}) };
    body["type"] = Value::String("CHANNEL_UP".to_string());
    body["datapath_id"] = Value::String(datapath_text);
    body["features"] = features.clone();
    body["ports"] = ports.clone();

    Ok(NegotiatedChannel {
        datapath_id,
        version,
        endpoint,
        features,
        ports,
        body,
    })
}

/// Pulls the port list out of a PORT_DESC reply, wherever it sits.
fn extract_ports(reply: &Value) -> Value {
    if let Some(msg) = reply.get("msg") {
        if msg.is_array() {
            return msg.clone();
        }
        if let Some(ports) = msg.get("ports") {
            return ports.clone();
        }
    }
    if let Some(ports) = reply.get("ports") {
        return ports.clone();
    }
    json!([])
}
