//! OpenFlow controller runtime.
//!
//! `ofmux` accepts persistent connections from OpenFlow switches through
//! the `oftr` helper process, which terminates the binary protocol and
//! translates messages to JSON. The runtime supervises the helper,
//! correlates request/reply transactions, negotiates each new connection
//! (FEATURES_REQUEST and PORT_DESC_REQUEST, merged into a synthesised
//! CHANNEL_UP), and dispatches decoded events to the application's
//! handlers with lifecycle guarantees tied to the connection.
//!
//! Everything runs on one logical thread: the dispatcher, the RPC reader,
//! and every handler task share a cooperative scheduler, so handler state
//! needs no locks. Handlers are synchronous and must not block; long-lived
//! work is spawned onto the datapath or controller task scope, where it is
//! cancelled when the owning scope closes.
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//!
//! use ofmux::{Controller, ControllerApp, ControllerCtx, Datapath, Event, HandlerResult};
//! use ofmux_config::Config;
//!
//! struct Logger;
//!
//! impl ControllerApp for Logger {
//!     fn on_channel_up(
//!         &mut self,
//!         _ctx: &ControllerCtx,
//!         dp: &Rc<Datapath>,
//!         _event: &Event,
//!     ) -> HandlerResult {
//!         println!("switch {} connected", dp.datapath_id());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> std::process::ExitCode {
//!     let mut config = Config::default();
//!     config.listen_endpoints = vec![":6653".parse().expect("endpoint")];
//!     ofmux::run(Logger, config).await
//! }
//! ```

mod app;
mod controller;
mod datapath;
mod dispatch;
pub mod driver;
mod error;
mod event;
mod registry;
mod rpc;
mod tasks;

pub use app::{ControllerApp, HandlerResult, SignalEvent};
pub use controller::{run, Controller, ControllerCtx};
pub use datapath::Datapath;
pub use driver::{Driver, DriverConfig};
pub use error::{
    BoxError, ControllerError, DriverError, HandlerError, ProtocolError, RequestError,
    StartupError,
};
pub use event::{DatapathId, DatapathIdParseError, Event, EventKind};
pub use registry::{DatapathRegistry, RegistryError};
pub use rpc::ReplyStream;
pub use tasks::TaskGroup;
