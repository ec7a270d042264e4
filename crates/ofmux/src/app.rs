//! The controller handler surface.
//!
//! A controller application is a capability set: it implements whichever
//! handlers it needs and inherits no-op defaults for the rest. Handlers
//! are synchronous and run inline on the dispatcher; asynchronous work is
//! expressed by spawning a task onto the datapath or controller scope,
//! which the dispatcher lets take its first step before the next event is
//! dispatched.

use std::rc::Rc;

use ofmux_config::ExitSignal;
use serde_json::Value;
use tracing::{error, warn};

use crate::controller::ControllerCtx;
use crate::datapath::Datapath;
use crate::error::{BoxError, HandlerError};
use crate::event::Event;

/// Tracing target for default handlers.
const APP_TARGET: &str = "ofmux::app";

/// Longest alert payload reproduced in log output.
const ALERT_DATA_LIMIT: usize = 100;

/// Caps an alert's hex payload for logging.
fn truncate_alert_data(data: &str) -> String {
    match data.get(..ALERT_DATA_LIMIT) {
        Some(head) if data.len() > ALERT_DATA_LIMIT => format!("{head}..."),
        _ => data.to_string(),
    }
}

/// Result type returned by handlers.
///
/// An `Err` is caught at the dispatch boundary and routed to
/// [`ControllerApp::on_exception`]; it never escapes the dispatcher.
pub type HandlerResult = Result<(), BoxError>;

/// A shutdown-requesting signal, delivered in-band.
///
/// Clearing [`exit`](Self::exit) vetoes the default termination.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    /// The signal that was caught.
    pub signal: ExitSignal,
    /// Whether the controller proceeds to shut down; defaults to `true`.
    pub exit: bool,
}

impl SignalEvent {
    pub(crate) fn new(signal: ExitSignal) -> Self {
        Self { signal, exit: true }
    }
}

/// Handlers a controller application may implement.
///
/// Message handlers receive the originating [`Datapath`] and the decoded
/// [`Event`]; lifecycle handlers receive the controller context (and the
/// event where one exists). Unimplemented message handlers fall through to
/// [`on_message`](Self::on_message), whose own default discards the event.
///
/// # Example
///
/// ```no_run
/// use std::rc::Rc;
///
/// use serde_json::json;
/// use ofmux::{ControllerApp, ControllerCtx, Datapath, Event, HandlerResult};
///
/// struct Hub;
///
/// impl ControllerApp for Hub {
///     fn on_packet_in(
///         &mut self,
///         _ctx: &ControllerCtx,
///         dp: &Rc<Datapath>,
///         event: &Event,
///     ) -> HandlerResult {
///         let msg = event.field("msg").cloned().unwrap_or_default();
///         dp.send(json!({
///             "type": "PACKET_OUT",
///             "msg": {
///                 "in_port": msg["in_port"],
///                 "actions": [{"action": "OUTPUT", "port_no": "ALL"}],
///                 "data": msg["data"],
///             },
///         }))?;
///         Ok(())
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait ControllerApp: 'static {
    /// Invoked once the controller is ready, before listeners open.
    fn on_start(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        Ok(())
    }

    /// Invoked during shutdown, after every datapath has closed.
    fn on_stop(&mut self, ctx: &ControllerCtx) -> HandlerResult {
        Ok(())
    }

    /// Invoked when an exit signal is caught.
    ///
    /// Clear `event.exit` to veto the shutdown.
    fn on_signal(&mut self, ctx: &ControllerCtx, event: &mut SignalEvent) -> HandlerResult {
        Ok(())
    }

    /// Invoked for every failure escaping a handler or handler task.
    ///
    /// Must not block; an error returned here is logged and not re-routed.
    fn on_exception(&mut self, ctx: &ControllerCtx, error: &HandlerError) -> HandlerResult {
        error!(target: APP_TARGET, %error, "handler failed");
        Ok(())
    }

    /// A datapath completed negotiation.
    ///
    /// The event body merges the helper's connection attributes with the
    /// captured features and port descriptions.
    fn on_channel_up(&mut self, ctx: &ControllerCtx, dp: &Rc<Datapath>, event: &Event) -> HandlerResult {
        self.on_message(ctx, Some(dp), event)
    }

    /// A datapath's connection terminated; its tasks are already cancelled.
    fn on_channel_down(&mut self, ctx: &ControllerCtx, dp: &Rc<Datapath>, event: &Event) -> HandlerResult {
        self.on_message(ctx, Some(dp), event)
    }

    /// The helper flagged a connection anomaly.
    ///
    /// The default reports the alert text with its payload truncated to a
    /// loggable length.
    fn on_channel_alert(&mut self, ctx: &ControllerCtx, dp: Option<&Rc<Datapath>>, event: &Event) -> HandlerResult {
        let alert = event
            .field("alert")
            .and_then(Value::as_str)
            .unwrap_or("(no alert text)");
        let data = event.field("data").and_then(Value::as_str).unwrap_or("");
        warn!(
            target: APP_TARGET,
            conn_id = event.conn_id(),
            datapath_id = ?event.datapath_id(),
            xid = event.xid(),
            data = %truncate_alert_data(data),
            data_bytes = data.len() / 2,
            "channel alert: {alert}"
        );
        Ok(())
    }

    /// A PACKET_IN message arrived.
    fn on_packet_in(&mut self, ctx: &ControllerCtx, dp: &Rc<Datapath>, event: &Event) -> HandlerResult {
        self.on_message(ctx, Some(dp), event)
    }

    /// A FLOW_REMOVED message arrived.
    fn on_flow_removed(&mut self, ctx: &ControllerCtx, dp: &Rc<Datapath>, event: &Event) -> HandlerResult {
        self.on_message(ctx, Some(dp), event)
    }

    /// A PORT_STATUS message arrived.
    fn on_port_status(&mut self, ctx: &ControllerCtx, dp: &Rc<Datapath>, event: &Event) -> HandlerResult {
        self.on_message(ctx, Some(dp), event)
    }

    /// Fallback for events with no dedicated handler; discards by default.
    fn on_message(
        &mut self,
        ctx: &ControllerCtx,
        dp: Option<&Rc<Datapath>>,
        event: &Event,
    ) -> HandlerResult {
        Ok(())
    }
}
