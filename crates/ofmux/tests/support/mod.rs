//! Scripted helper harness for end-to-end controller tests.
//!
//! Plays the part of the `oftr` helper over an in-memory driver channel:
//! tests inject notifications and answer the controller's requests in
//! whatever order the scenario calls for.

// Each test binary uses its own subset of the harness.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use ofmux::{Controller, ControllerApp, ControllerCtx, ControllerError, Driver};
use ofmux_config::Config;

/// Shared log of observations made by a test application.
pub type Log = Rc<RefCell<Vec<String>>>;

/// Slot the application drops its context into during `on_start`.
pub type CtxSlot = Rc<RefCell<Option<ControllerCtx>>>;

/// Creates an empty observation log.
pub fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

/// Creates an empty context slot.
pub fn new_ctx_slot() -> CtxSlot {
    Rc::new(RefCell::new(None))
}

/// Appends an entry to a log.
pub fn record(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// Snapshot of the log contents.
pub fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// The controller context stashed by the application under test.
pub fn stored_ctx(slot: &CtxSlot) -> ControllerCtx {
    slot.borrow().clone().expect("controller should have started")
}

/// Waits until the log contains an entry matching `needle`.
///
/// Sleeps between polls so tests under paused time advance the clock.
pub async fn wait_for(log: &Log, needle: &str) {
    for _ in 0..1000 {
        if entries(log).iter().any(|entry| entry.contains(needle)) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("log never contained '{needle}': {:?}", entries(log));
}

/// Index of the first log entry containing `needle`.
pub fn position(log: &Log, needle: &str) -> usize {
    entries(log)
        .iter()
        .position(|entry| entry.contains(needle))
        .unwrap_or_else(|| panic!("log does not contain '{needle}': {:?}", entries(log)))
}

/// A controller configuration suitable for scripted tests.
pub fn test_config() -> Config {
    Config {
        // No signal listeners by default; signal tests opt back in.
        exit_signals: Vec::new(),
        ..Config::default()
    }
}

/// Runs the controller as a local task so the test body can play helper.
pub fn spawn_controller<A: ControllerApp>(
    app: A,
    config: Config,
    driver: Driver,
) -> tokio::task::JoinHandle<(Result<(), ControllerError>, A)> {
    tokio::task::spawn_local(async move {
        let mut controller = Controller::new(app, config);
        let result = controller.run_with_driver(driver).await;
        (result, controller.into_app())
    })
}

/// The helper's side of the driver channel.
pub struct Helper {
    outgoing: mpsc::UnboundedReceiver<Value>,
    incoming: mpsc::UnboundedSender<Value>,
}

impl Helper {
    /// Builds a driver/helper pair over in-memory channels.
    pub fn channel() -> (Driver, Self) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let driver = Driver::from_channel(outgoing_tx, incoming_rx);
        (
            driver,
            Self {
                outgoing: outgoing_rx,
                incoming: incoming_tx,
            },
        )
    }

    /// Receives the next outgoing request, asserting its RPC method.
    pub async fn expect(&mut self, method: &str) -> Value {
        let request = self
            .outgoing
            .recv()
            .await
            .expect("controller should have sent a request");
        assert_eq!(
            request["method"],
            json!(method),
            "unexpected request: {request}"
        );
        request
    }

    /// Receives the next outgoing `OFP.SEND`, asserting the message type.
    pub async fn expect_sent(&mut self, message_type: &str) -> Value {
        let request = self.expect("OFP.SEND").await;
        assert_eq!(
            request["params"]["type"],
            json!(message_type),
            "unexpected message: {request}"
        );
        request
    }

    /// Answers an id-correlated RPC request.
    pub fn reply_result(&self, request: &Value, result: Value) {
        let id = request["id"].as_u64().expect("request should carry an id");
        self.incoming
            .send(json!({"id": id, "result": result}))
            .expect("helper channel should be open");
    }

    /// Injects an `OFP.MESSAGE` notification.
    pub fn notify(&self, params: Value) {
        self.incoming
            .send(json!({"method": "OFP.MESSAGE", "params": params}))
            .expect("helper channel should be open");
    }

    /// Answers the startup handshake.
    pub async fn complete_startup(&mut self) {
        let request = self.expect("OFP.DESCRIPTION").await;
        self.reply_result(
            &request,
            json!({
                "api_version": "0.9",
                "sw_desc": "scripted helper 1.0",
                "versions": [1, 4, 5, 6],
            }),
        );
    }

    /// Drives one connection through negotiation to readiness.
    ///
    /// Emits the raw CHANNEL_UP, then answers the controller's
    /// FEATURES_REQUEST and PORT_DESC_REQUEST.
    pub async fn bring_up(&mut self, conn_id: u64, datapath_id: &str) {
        self.notify(json!({
            "type": "CHANNEL_UP",
            "conn_id": conn_id,
            "version": 4,
            "endpoint": "10.0.0.9:46653",
        }));
        let features = self.expect_sent("FEATURES_REQUEST").await;
        assert_eq!(features["params"]["conn_id"], json!(conn_id));
        let features_xid = features["params"]["xid"].as_u64().expect("features xid");
        let port_desc = self.expect_sent("PORT_DESC_REQUEST").await;
        let port_desc_xid = port_desc["params"]["xid"].as_u64().expect("port_desc xid");
        self.notify(json!({
            "type": "FEATURES_REPLY",
            "conn_id": conn_id,
            "xid": features_xid,
            "msg": {"datapath_id": datapath_id, "n_buffers": 256},
        }));
        self.notify(json!({
            "type": "PORT_DESC_REPLY",
            "conn_id": conn_id,
            "xid": port_desc_xid,
            "msg": {"ports": [{"port_no": 1}, {"port_no": 2}]},
        }));
    }

    /// Simulates a helper crash: closes the incoming stream while keeping
    /// the outgoing side readable.
    pub fn crash(self) -> mpsc::UnboundedReceiver<Value> {
        self.outgoing
    }

    /// Returns the next outgoing request if one is already queued.
    pub fn try_next(&mut self) -> Option<Value> {
        self.outgoing.try_recv().ok()
    }
}
