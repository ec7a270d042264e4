//! A hub: floods every received packet out of all ports.
//!
//! Run with an `oftr` binary on `PATH`:
//!
//! ```text
//! cargo run --example hub
//! ```

use std::process::ExitCode;
use std::rc::Rc;

use serde_json::json;

use ofmux::{ControllerApp, ControllerCtx, Datapath, Event, HandlerResult};
use ofmux_config::{telemetry, Config, TelemetryOptions};

struct Hub;

impl ControllerApp for Hub {
    fn on_channel_up(
        &mut self,
        _ctx: &ControllerCtx,
        dp: &Rc<Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        println!("switch {} connected from {:?}", dp.datapath_id(), dp.endpoint());
        Ok(())
    }

    fn on_channel_down(
        &mut self,
        _ctx: &ControllerCtx,
        dp: &Rc<Datapath>,
        _event: &Event,
    ) -> HandlerResult {
        println!("switch {} disconnected", dp.datapath_id());
        Ok(())
    }

    fn on_packet_in(
        &mut self,
        _ctx: &ControllerCtx,
        dp: &Rc<Datapath>,
        event: &Event,
    ) -> HandlerResult {
        let msg = event.field("msg").cloned().unwrap_or_default();
        dp.send(json!({
            "type": "PACKET_OUT",
            "msg": {
                "in_port": msg["in_port"],
                "actions": [{"action": "OUTPUT", "port_no": "ALL"}],
                "data": msg["data"],
            },
        }))?;
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    if let Err(error) = telemetry::init(&TelemetryOptions::default()) {
        eprintln!("failed to initialise logging: {error}");
        return ExitCode::FAILURE;
    }
    let mut config = Config::default();
    config.listen_endpoints = vec![":6653".parse().expect("endpoint")];
    ofmux::run(Hub, config).await
}
