//! Fehler-Taxonomie auf Session-Ebene

use super::capture::CaptureError;
use super::session::Role;
use super::status::CallStatus;
use super::transport::TransportError;
use crate::signaling::{MalformedSignal, SignalingError};
use thiserror::Error;

// ============================================================================
// PROTOCOL ERRORS
// ============================================================================

/// Verletzung des Offer/Answer-Protokolls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("offer received in {0} role")]
    UnexpectedOffer(Role),

    #[error("offer received while already holding a local description")]
    DuplicateOffer,

    #[error("answer received in {0} role")]
    UnexpectedAnswer(Role),

    #[error("answer already applied for this session")]
    DuplicateAnswer,

    #[error("remote description rejected: {0}")]
    DescriptionRejected(String),

    #[error(transparent)]
    Malformed(#[from] MalformedSignal),
}

impl ProtocolError {
    /// Betrifft der Fehler die Offer/Answer-Aushandlung selbst
    pub fn concerns_description(&self) -> bool {
        !matches!(self, ProtocolError::Malformed(MalformedSignal::Payload(_)))
    }
}

// ============================================================================
// CALL ERRORS
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("microphone unavailable: {0}")]
    Permission(#[from] CaptureError),

    #[error("signaling protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("media transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("relay channel error: {0}")]
    Channel(#[from] SignalingError),
}

impl CallError {
    /// Status, der für diesen Fehler angezeigt wird
    pub fn status(&self) -> CallStatus {
        match self {
            CallError::Permission(e) => CallStatus::for_capture_error(e),
            CallError::Protocol(_) => CallStatus::Error,
            CallError::Transport(_) => CallStatus::PartnerDisconnected,
            CallError::Channel(_) => CallStatus::Reconnecting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            CallError::from(CaptureError::PermissionDenied).status(),
            CallStatus::MicPermissionDenied
        );
        assert_eq!(
            CallError::from(ProtocolError::DuplicateAnswer).status(),
            CallStatus::Error
        );
        assert_eq!(
            CallError::from(TransportError::ConnectionFailed).status(),
            CallStatus::PartnerDisconnected
        );
        assert_eq!(
            CallError::from(SignalingError::NotConnected).status(),
            CallStatus::Reconnecting
        );
    }

    #[test]
    fn test_malformed_candidate_is_not_a_description_error() {
        assert!(!ProtocolError::Malformed(MalformedSignal::Payload("x".into()))
            .concerns_description());
        assert!(ProtocolError::Malformed(MalformedSignal::Description("x".into()))
            .concerns_description());
    }
}
