//! Request/reply and notification layer over the driver.
//!
//! A single transport task owns the driver and the pending-request table.
//! Callers talk to it through cloneable [`RpcHandle`]s; replies are routed
//! back over per-request channels, notifications are decoded into
//! [`Event`]s and handed to the dispatcher in helper-emission order.
//! Deadlines are enforced by a periodic sweep over the pending table, the
//! way a single-owner loop can without locks.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::driver::Driver;
use crate::error::{DriverError, ProtocolError, RequestError};
use crate::event::Event;

/// Tracing target for transport operations.
const RPC_TARGET: &str = "ofmux::rpc";

/// Cadence of the pending-request expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// RPC method wrapping an OpenFlow message for transmission.
const METHOD_SEND: &str = "OFP.SEND";

/// Notification method carrying a decoded OpenFlow message.
const METHOD_MESSAGE: &str = "OFP.MESSAGE";

/// An outgoing object before the transport addresses it.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A control-plane RPC (`OFP.LISTEN`, `OFP.CONNECT`, ...).
    Rpc {
        /// RPC method name.
        method: &'static str,
        /// Method parameters.
        params: Value,
    },
    /// An OpenFlow message, wrapped into `OFP.SEND`.
    Message(Value),
}

struct SlotRequest {
    reply_tx: mpsc::UnboundedSender<Result<Value, RequestError>>,
    multipart: bool,
    timeout: Duration,
}

enum Command {
    Send {
        outbound: Outbound,
        slot: Option<SlotRequest>,
    },
    Shutdown,
}

/// Why the transport task finished.
#[derive(Debug)]
pub(crate) enum ExitReason {
    /// The helper channel reached EOF.
    Closed,
    /// The helper corrupted the frame stream.
    Protocol(ProtocolError),
    /// The controller asked the transport to stop.
    Shutdown,
}

/// Final state handed back when the transport task ends.
pub(crate) struct TransportExit {
    pub(crate) reason: ExitReason,
    pub(crate) driver: Driver,
}

/// Cloneable handle submitting requests to the transport task.
#[derive(Clone)]
pub(crate) struct RpcHandle {
    commands: mpsc::UnboundedSender<Command>,
    timeout: Duration,
}

impl RpcHandle {
    /// Fire-and-forget transmission of an OpenFlow message.
    pub(crate) fn send_message(&self, message: Value) -> Result<(), RequestError> {
        self.submit(Outbound::Message(message), None)
    }

    /// Fire-and-forget control-plane RPC.
    pub(crate) fn send_rpc(&self, method: &'static str, params: Value) -> Result<(), RequestError> {
        self.submit(Outbound::Rpc { method, params }, None)
    }

    /// Sends an OpenFlow message and awaits its correlated reply.
    pub(crate) async fn call_message(&self, message: Value) -> Result<Value, RequestError> {
        self.call(Outbound::Message(message)).await
    }

    /// Performs a control-plane RPC and awaits its result object.
    pub(crate) async fn call_rpc(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<Value, RequestError> {
        self.call(Outbound::Rpc { method, params }).await
    }

    /// Sends an OpenFlow request that yields a multipart reply.
    pub(crate) fn stream_message(&self, message: Value) -> ReplyStream {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let slot = SlotRequest {
            reply_tx: reply_tx.clone(),
            multipart: true,
            timeout: self.timeout,
        };
        if self
            .commands
            .send(Command::Send {
                outbound: Outbound::Message(message),
                slot: Some(slot),
            })
            .is_err()
        {
            let _ = reply_tx.send(Err(RequestError::Closed));
        }
        ReplyStream { replies: reply_rx }
    }

    /// Asks the transport task to wind down.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn call(&self, outbound: Outbound) -> Result<Value, RequestError> {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let slot = SlotRequest {
            reply_tx,
            multipart: false,
            timeout: self.timeout,
        };
        self.submit(outbound, Some(slot))?;
        match reply_rx.recv().await {
            Some(item) => item,
            None => Err(RequestError::Closed),
        }
    }

    fn submit(&self, outbound: Outbound, slot: Option<SlotRequest>) -> Result<(), RequestError> {
        self.commands
            .send(Command::Send { outbound, slot })
            .map_err(|_| RequestError::Closed)
    }
}

#[cfg(test)]
impl RpcHandle {
    /// A handle whose transport is gone; every operation fails closed.
    pub(crate) fn disconnected() -> Self {
        let (commands, _dropped) = mpsc::unbounded_channel();
        Self {
            commands,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Lazy sequence of multipart reply fragments.
///
/// The stream ends after the fragment whose MORE flag is clear; a failure
/// (timeout, close, error reply) is yielded as the final item.
pub struct ReplyStream {
    replies: mpsc::UnboundedReceiver<Result<Value, RequestError>>,
}

impl ReplyStream {
    /// Receives the next fragment.
    pub async fn recv(&mut self) -> Option<Result<Value, RequestError>> {
        self.replies.recv().await
    }

    pub(crate) fn closed() -> Self {
        let (reply_tx, replies) = mpsc::unbounded_channel();
        let _ = reply_tx.send(Err(RequestError::Closed));
        Self { replies }
    }
}

impl Stream for ReplyStream {
    type Item = Result<Value, RequestError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().replies.poll_recv(cx)
    }
}

struct Pending {
    reply_tx: mpsc::UnboundedSender<Result<Value, RequestError>>,
    multipart: bool,
    timeout: Duration,
    deadline: Instant,
}

/// The transport task: single reader, single writer, owner of all pending
/// request state.
pub(crate) struct Transport {
    driver: Driver,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Event>,
    pending: HashMap<u32, Pending>,
    last_xid: u32,
}

impl Transport {
    /// Starts the transport task over a driver.
    ///
    /// Returns the caller handle, the decoded notification stream, and the
    /// join handle resolving to the transport's exit state.
    pub(crate) fn start(
        driver: Driver,
        timeout: Duration,
    ) -> (
        RpcHandle,
        mpsc::UnboundedReceiver<Event>,
        JoinHandle<TransportExit>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Self {
            driver,
            commands: command_rx,
            events: event_tx,
            pending: HashMap::new(),
            last_xid: 0,
        };
        let handle = RpcHandle {
            commands: command_tx,
            timeout,
        };
        let task = tokio::task::spawn_local(transport.run());
        (handle, event_rx, task)
    }

    async fn run(mut self) -> TransportExit {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = sweep.tick() => self.expire_pending(),
                command = self.commands.recv() => match command {
                    Some(Command::Send { outbound, slot }) => self.handle_send(outbound, slot),
                    Some(Command::Shutdown) | None => break ExitReason::Shutdown,
                },
                incoming = self.driver.recv() => match incoming {
                    Ok(value) => self.handle_incoming(value),
                    Err(DriverError::Closed) => break ExitReason::Closed,
                    Err(DriverError::Protocol(fault)) => break ExitReason::Protocol(fault),
                },
            }
        };

        self.fail_all_pending();
        TransportExit {
            reason,
            driver: self.driver,
        }
    }

    /// Allocates the next transaction id: strictly increasing, skipping
    /// zero and any id still outstanding after a wrap.
    fn allocate_xid(&mut self) -> u32 {
        loop {
            self.last_xid = self.last_xid.wrapping_add(1);
            if self.last_xid == 0 {
                continue;
            }
            if !self.pending.contains_key(&self.last_xid) {
                return self.last_xid;
            }
        }
    }

    fn handle_send(&mut self, outbound: Outbound, slot: Option<SlotRequest>) {
        let (message, xid) = match outbound {
            Outbound::Rpc { method, params } => {
                if slot.is_some() {
                    let xid = self.allocate_xid();
                    (
                        json!({"id": xid, "method": method, "params": params}),
                        Some(xid),
                    )
                } else {
                    (json!({"method": method, "params": params}), None)
                }
            }
            Outbound::Message(mut message) => {
                let existing = message
                    .get("xid")
                    .and_then(Value::as_u64)
                    .and_then(|xid| u32::try_from(xid).ok());
                let xid = match existing {
                    Some(xid) => xid,
                    None => {
                        let xid = self.allocate_xid();
                        if let Some(object) = message.as_object_mut() {
                            object.insert("xid".to_string(), xid.into());
                        }
                        xid
                    }
                };
                (json!({"method": METHOD_SEND, "params": message}), Some(xid))
            }
        };

        if let (Some(xid), Some(slot)) = (xid, slot) {
            let pending = Pending {
                reply_tx: slot.reply_tx,
                multipart: slot.multipart,
                timeout: slot.timeout,
                deadline: Instant::now() + slot.timeout,
            };
            if let Some(stale) = self.pending.insert(xid, pending) {
                warn!(target: RPC_TARGET, xid, "replacing a pending request that reused its xid");
                let _ = stale.reply_tx.send(Err(RequestError::Closed));
            }
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(target: RPC_TARGET, message = %sanitize(&message), "sending");
        }

        if let Err(error) = self.driver.send(message) {
            debug!(target: RPC_TARGET, %error, "send failed; completing request as closed");
            if let Some(xid) = xid {
                if let Some(pending) = self.pending.remove(&xid) {
                    let _ = pending.reply_tx.send(Err(RequestError::Closed));
                }
            }
        }
    }

    fn handle_incoming(&mut self, value: Value) {
        let is_message = value.get("method").and_then(Value::as_str) == Some(METHOD_MESSAGE);
        if is_message {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let xid = params
                .get("xid")
                .and_then(Value::as_u64)
                .and_then(|xid| u32::try_from(xid).ok())
                // Zero is never allocated, so it cannot correlate to a
                // request; asynchronous messages carry it freely.
                .filter(|xid| *xid != 0);
            if let Some(xid) = xid {
                if self.pending.contains_key(&xid) {
                    self.complete_message_reply(xid, params);
                    return;
                }
                // Alerts flag problems with messages that need not be ours,
                // so they still dispatch; anything else with an unknown xid
                // is a reply whose request already timed out.
                if params.get("type").and_then(Value::as_str) != Some("CHANNEL_ALERT") {
                    debug!(
                        target: RPC_TARGET,
                        xid, "discarding message reply with no pending request"
                    );
                    return;
                }
            }
            self.forward_event(params);
        } else if let Some(id) = value
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
        {
            if self.pending.contains_key(&id) {
                self.complete_rpc_reply(id, value);
            } else {
                // Covers replies for requests that already timed out.
                debug!(target: RPC_TARGET, xid = id, "discarding reply with no pending request");
            }
        } else {
            warn!(target: RPC_TARGET, "ignoring unrecognised object from helper");
        }
    }

    /// Completes a pending request from an `OFP.MESSAGE` reply.
    fn complete_message_reply(&mut self, xid: u32, params: Value) {
        let message_type = params.get("type").and_then(Value::as_str).unwrap_or("");
        match message_type {
            "ERROR" => self.fail(xid, RequestError::ErrorReply { body: params }),
            "CHANNEL_ALERT" => {
                let alert = params
                    .get("alert")
                    .and_then(Value::as_str)
                    .unwrap_or("channel alert")
                    .to_string();
                self.fail(xid, RequestError::Delivery { alert });
            }
            _ => {
                let more = has_more_flag(params.get("flags"));
                self.fulfil(xid, params, more);
            }
        }
    }

    /// Completes a pending request from a JSON-RPC reply object.
    fn complete_rpc_reply(&mut self, xid: u32, value: Value) {
        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            self.fail(xid, RequestError::Rpc { code, message });
        } else if let Some(result) = value.get("result") {
            let more = has_more_flag(value.get("flags"));
            self.fulfil(xid, result.clone(), more);
        } else {
            warn!(target: RPC_TARGET, xid, "reply carries neither result nor error");
        }
    }

    /// Delivers one reply fragment, retiring the slot when it is final.
    fn fulfil(&mut self, xid: u32, reply: Value, more: bool) {
        let Some(pending) = self.pending.get_mut(&xid) else {
            return;
        };
        if !pending.multipart && more {
            // A single-reply request answered multipart: deliver the first
            // fragment, later ones fall out as unknown xids at debug level.
            warn!(target: RPC_TARGET, xid, "multipart reply for a single-reply request");
        }
        let delivered = pending.reply_tx.send(Ok(reply)).is_ok();
        let keep = delivered && more && pending.multipart;
        if keep {
            pending.deadline = Instant::now() + pending.timeout;
        } else {
            // Final fragment, or the caller stopped listening.
            self.pending.remove(&xid);
        }
    }

    fn fail(&mut self, xid: u32, error: RequestError) {
        if let Some(pending) = self.pending.remove(&xid) {
            let _ = pending.reply_tx.send(Err(error));
        }
    }

    /// Decodes a notification and forwards it to the dispatcher.
    fn forward_event(&mut self, params: Value) {
        let Some(event) = Event::from_params(params) else {
            return;
        };
        if event.kind().name() == "ERROR" {
            // OpenFlow errors not tied to one of our requests are logged
            // before being dispatched like any other message.
            error!(target: RPC_TARGET, body = %event.body(), "unsolicited ERROR message");
        }
        if self.events.send(event).is_err() {
            debug!(target: RPC_TARGET, "dispatcher gone; dropping event");
        }
    }

    /// Times out pending requests whose deadline has passed.
    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(xid, _)| *xid)
            .collect();
        for xid in expired {
            if let Some(pending) = self.pending.remove(&xid) {
                debug!(target: RPC_TARGET, xid, "request timed out");
                let _ = pending.reply_tx.send(Err(RequestError::Timeout {
                    after: pending.timeout,
                }));
            }
        }
    }

    fn fail_all_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply_tx.send(Err(RequestError::Closed));
        }
    }
}

/// True when a `flags` array carries the multipart MORE marker.
fn has_more_flag(flags: Option<&Value>) -> bool {
    flags
        .and_then(Value::as_array)
        .is_some_and(|flags| {
            flags
                .iter()
                .filter_map(Value::as_str)
                .any(|flag| flag.eq_ignore_ascii_case("more"))
        })
}

/// Hides private key material before a request is logged.
fn sanitize(message: &Value) -> Value {
    let mut message = message.clone();
    if message.get("method").and_then(Value::as_str) == Some("OFP.ADD_IDENTITY") {
        if let Some(params) = message.get_mut("params").and_then(Value::as_object_mut) {
            if params.contains_key("privkey") {
                params.insert("privkey".to_string(), Value::String("*** ELIDED ***".into()));
            }
        }
    }
    message
}
