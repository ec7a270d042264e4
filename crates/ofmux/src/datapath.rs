//! Per-switch datapath objects.
//!
//! A [`Datapath`] is created when negotiation completes and removed when
//! its connection terminates. Handlers receive it by shared reference and
//! may keep clones; the registry's reference defines liveness, and the
//! closed flag makes operations fail fast once the connection is gone.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatch::ControlMsg;
use crate::error::{HandlerError, RequestError};
use crate::event::DatapathId;
use crate::rpc::{ReplyStream, RpcHandle};
use crate::tasks::TaskGroup;
use crate::HandlerResult;

/// Tracing target for datapath operations.
const DATAPATH_TARGET: &str = "ofmux::datapath";

/// A live OpenFlow switch connection.
pub struct Datapath {
    conn_id: u64,
    datapath_id: DatapathId,
    version: u8,
    endpoint: Option<String>,
    features: Value,
    ports: Value,
    closed: Cell<bool>,
    tasks: TaskGroup,
    rpc: RpcHandle,
    control: mpsc::UnboundedSender<ControlMsg>,
}

impl Datapath {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn_id: u64,
        datapath_id: DatapathId,
        version: u8,
        endpoint: Option<String>,
        features: Value,
        ports: Value,
        rpc: RpcHandle,
        control: mpsc::UnboundedSender<ControlMsg>,
    ) -> Rc<Self> {
        Rc::new(Self {
            conn_id,
            datapath_id,
            version,
            endpoint,
            features,
            ports,
            closed: Cell::new(false),
            tasks: TaskGroup::new("datapath"),
            rpc,
            control,
        })
    }

    /// Connection id assigned by the helper.
    #[must_use]
    pub const fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The switch's 64-bit datapath identifier.
    #[must_use]
    pub const fn datapath_id(&self) -> DatapathId {
        self.datapath_id
    }

    /// Negotiated OpenFlow protocol version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Remote address of the switch, as reported by the helper.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Features captured from the negotiation FEATURES_REPLY.
    #[must_use]
    pub const fn features(&self) -> &Value {
        &self.features
    }

    /// Port descriptions captured during negotiation.
    #[must_use]
    pub const fn ports(&self) -> &Value {
        &self.ports
    }

    /// Whether the connection has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// The datapath's task group.
    #[must_use]
    pub const fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    /// Sends an OpenFlow message to the switch, fire and forget.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Closed`] when the datapath has closed; the
    /// message never reaches the helper in that case.
    pub fn send(&self, message: Value) -> Result<(), RequestError> {
        if self.closed.get() {
            return Err(RequestError::Closed);
        }
        self.rpc.send_message(self.addressed(message))
    }

    /// Sends an OpenFlow request and awaits its reply.
    ///
    /// # Errors
    ///
    /// Fails with [`RequestError::Closed`], [`RequestError::Timeout`], or
    /// one of the reply error variants.
    pub async fn request(&self, message: Value) -> Result<Value, RequestError> {
        if self.closed.get() {
            return Err(RequestError::Closed);
        }
        self.rpc.call_message(self.addressed(message)).await
    }

    /// Sends a multipart request and returns the lazy reply sequence.
    ///
    /// The stream terminates after the fragment whose MORE flag is clear.
    #[must_use]
    pub fn request_all(&self, message: Value) -> ReplyStream {
        if self.closed.get() {
            return ReplyStream::closed();
        }
        self.rpc.stream_message(self.addressed(message))
    }

    /// Spawns a task scoped to this datapath's connection.
    ///
    /// The task is cancelled when the connection terminates, before the
    /// CHANNEL_DOWN handler runs. An error returned by the task is routed
    /// to the controller's exception handler.
    pub fn create_task<F>(self: &Rc<Self>, future: F)
    where
        F: Future<Output = HandlerResult> + 'static,
    {
        let control = self.control.clone();
        let conn_id = self.conn_id;
        self.tasks.spawn(async move {
            if let Err(source) = future.await {
                let error = HandlerError::new("task", Some(conn_id), source);
                let _ = control.send(ControlMsg::HandlerFailure(error));
            }
        });
    }

    /// Asks the helper to drop the underlying connection.
    ///
    /// The datapath stays registered until the helper confirms with a
    /// CHANNEL_DOWN event; closing an already-closed datapath is a no-op.
    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        debug!(target: DATAPATH_TARGET, conn_id = self.conn_id, "requesting connection close");
        let _ = self
            .rpc
            .send_rpc("OFP.CLOSE", serde_json::json!({"conn_id": self.conn_id}));
    }

    /// Marks the datapath closed; called by the dispatcher on teardown.
    pub(crate) fn mark_closed(&self) {
        self.closed.set(true);
    }

    /// Stamps the datapath's connection id onto an outgoing message.
    fn addressed(&self, mut message: Value) -> Value {
        if let Some(object) = message.as_object_mut() {
            object.insert("conn_id".to_string(), self.conn_id.into());
        }
        message
    }
}

impl fmt::Debug for Datapath {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Datapath")
            .field("conn_id", &self.conn_id)
            .field("datapath_id", &self.datapath_id.to_string())
            .field("version", &self.version)
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}
