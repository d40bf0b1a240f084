//! Callmatch - anonyme 1:1 Sprachanrufe
//!
//! Kern einer Voice-Call-Applikation mit:
//! - Relay-Server für Matching und Signaling (WebSocket)
//! - WebRTC für P2P Audio-Kommunikation
//! - Zeitlimit pro Gespräch
//!
//! Die Präsentationsschicht spricht ausschließlich mit dem `CallHandle`.

pub mod call_engine;
pub mod config;
pub mod signaling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use call_engine::{
    CallDeps, CallError, CallHandle, CallSnapshot, CallStatus, SessionController, SessionState,
};
pub use config::CallConfig;
pub use signaling::{SignalSink, SignalingClient, SignalingEvent};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "callmatch=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// `RUST_LOG` überschreibt den Default-Filter. Mehrfacher Aufruf ist
/// unschädlich.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
