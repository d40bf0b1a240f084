//! Headless Client: verbindet, wartet auf einen Partner, telefoniert.
//! Ctrl-C verlässt den Anruf.

use anyhow::Result;
use callmatch::call_engine::{
    HandleSlot, MediaCapture, SessionState, SystemClock, WebRtcTransportFactory,
};
use callmatch::{init_tracing, CallConfig, CallDeps, SessionController, SignalingClient};
use std::sync::Arc;

#[cfg(feature = "cpal-capture")]
fn capture() -> Arc<dyn MediaCapture> {
    Arc::new(callmatch::call_engine::CpalCapture)
}

#[cfg(not(feature = "cpal-capture"))]
fn capture() -> Arc<dyn MediaCapture> {
    tracing::warn!("Built without cpal-capture, sending silence");
    Arc::new(callmatch::call_engine::SilentCapture)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = CallConfig::from_env();
    tracing::info!("Connecting to relay at {}", config.signaling_url);

    let (client, events) = SignalingClient::start(&config);
    let deps = CallDeps {
        sink: client.clone(),
        capture: capture(),
        transports: Arc::new(WebRtcTransportFactory::new(config.rtc_ice_servers())),
        clock: Arc::new(SystemClock),
        slot: HandleSlot::global(),
    };

    let call = SessionController::spawn(config, deps, events);
    let mut updates = call.subscribe();
    let mut last_status = None;
    let mut last_elapsed = 0;

    loop {
        {
            let snap = updates.borrow_and_update().clone();
            if last_status != Some(snap.status) {
                println!("{}", snap.status);
                last_status = Some(snap.status);
            }
            if snap.state == SessionState::Active && snap.elapsed_secs / 60 != last_elapsed / 60 {
                println!("{:02}:{:02}", snap.elapsed_secs / 60, snap.elapsed_secs % 60);
            }
            last_elapsed = snap.elapsed_secs;
            if snap.navigate_away {
                break;
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, leaving call");
                call.leave();
            }
        }
    }

    call.finished().await;
    client.close();
    Ok(())
}
