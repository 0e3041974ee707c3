//! Small demo binary driving the engine manually: subscribe to status,
//! initialize a blank card, verify the PIN. No argument parsing; PIN,
//! PUK and pairing password are the applet defaults for a fresh card.

use std::sync::Arc;
use std::time::Duration;

use keycard_driver::command_surface::{CommandSurface, InitializeRequest, VerifyPinRequest};
use keycard_driver::{Engine, EngineConfig, State};

#[tokio::main]
async fn main() {
    let config = EngineConfig {
        pairing_store_path: "keycard-pairings.json".into(),
        log_file_path: Some("keycard-driver.log".into()),
        log_level: log::LevelFilter::Debug,
    };

    let engine = Engine::start(config).expect("failed to start engine");

    engine.status().subscribe(Box::new(|status| {
        log::info!("status changed: {:?}", status.state);
    }));

    let surface = CommandSurface::new(Arc::clone(&engine));

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;

        match engine.status().get().state {
            State::EmptyKeycard => {
                let req = InitializeRequest {
                    pin: "123456".to_string(),
                    puk: "123456123456".to_string(),
                    pairing_password: "KeycardDefaultPairing".to_string(),
                };
                if let Err(err) = surface.initialize(req) {
                    log::error!("initialize failed: {err}");
                }
            }
            State::Ready => {
                let req = VerifyPinRequest {
                    pin: "123456".to_string(),
                };
                if let Err(err) = surface.verify_pin(req) {
                    log::error!("verify pin failed: {err}");
                }
            }
            State::Authorized => {
                log::info!("card authorized, demo loop idling");
            }
            _ => {}
        }
    }
}
