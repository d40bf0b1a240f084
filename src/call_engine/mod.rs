//! Call Engine Module - Session-Lebenszyklus
//!
//! Dieses Modul verwaltet:
//! - Session Controller (Zustandsautomat, Status für die UI)
//! - Negotiation Engine (Offer/Answer/ICE über WebRTC)
//! - Media Capture (Mikrofon)
//! - Lifecycle Guards (Gathering-Timeout, Gesprächsdauer)

mod capture;
mod controller;
mod error;
mod guard;
mod negotiation;
mod session;
mod status;
mod transport;

#[cfg(feature = "cpal-capture")]
pub use capture::{CpalCapture, CpalSource, SAMPLE_RATE};
pub use capture::{AudioSource, CaptureError, MediaCapture, SilentCapture, SilentSource};
pub use controller::{CallDeps, CallHandle, SessionController};
pub use error::{CallError, ProtocolError};
pub use guard::{
    Clock, DurationGuard, GatherOutcome, GatheringGuard, GuardVerdict, SystemClock,
};
pub use negotiation::{EngineDeps, EngineEvent, EngineEvents, HandleSlot, NegotiationEngine};
pub use session::{Role, Session, SessionState};
pub use status::{CallSnapshot, CallStatus};
pub use transport::{
    PeerState, PeerTransport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    WebRtcTransport, WebRtcTransportFactory,
};
