//! Status für die Präsentationsschicht

use super::capture::CaptureError;
use super::session::SessionState;
use std::fmt;

/// Anzeige-Status einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallStatus {
    #[default]
    Connecting,
    LookingForPartner,
    PartnerFoundConnecting,
    Connected,
    Reconnecting,
    PartnerDisconnected,
    PartnerLeft,
    CallEndedTimeLimit,
    LeftCall,
    MicPermissionDenied,
    MicNotFound,
    MicUnavailable,
    Error,
}

impl CallStatus {
    pub fn message(self) -> &'static str {
        match self {
            CallStatus::Connecting => "Connecting to server...",
            CallStatus::LookingForPartner => "Looking for a partner...",
            CallStatus::PartnerFoundConnecting => "Partner found! Connecting...",
            CallStatus::Connected => "Connected! You are now talking.",
            CallStatus::Reconnecting => "Connection lost. Reconnecting...",
            CallStatus::PartnerDisconnected => "Your partner has disconnected.",
            CallStatus::PartnerLeft => "Partner left the call.",
            CallStatus::CallEndedTimeLimit => "Call ended: 15 minute limit.",
            CallStatus::LeftCall => "You left the call.",
            CallStatus::MicPermissionDenied => "Microphone access denied.",
            CallStatus::MicNotFound => "No microphone found.",
            CallStatus::MicUnavailable => "Could not access the microphone.",
            CallStatus::Error => "Something went wrong. Please try again.",
        }
    }

    /// Status der bei einem Capture-Fehler angezeigt wird
    pub fn for_capture_error(err: &CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => CallStatus::MicPermissionDenied,
            CaptureError::DeviceNotFound => CallStatus::MicNotFound,
            CaptureError::Other(_) => CallStatus::MicUnavailable,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Was die UI von einer Session sieht
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub state: SessionState,
    pub status: CallStatus,
    /// Nur in `Active` wahr
    pub active: bool,
    pub elapsed_secs: u64,
    pub partner_id: Option<String>,
    pub live_users: Option<u32>,
    /// Die UI soll den Anruf-Bildschirm verlassen
    pub navigate_away: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_errors_map_to_distinct_statuses() {
        let statuses = [
            CallStatus::for_capture_error(&CaptureError::PermissionDenied),
            CallStatus::for_capture_error(&CaptureError::DeviceNotFound),
            CallStatus::for_capture_error(&CaptureError::Other("busy".into())),
        ];
        assert_ne!(statuses[0].message(), statuses[1].message());
        assert_ne!(statuses[1].message(), statuses[2].message());
        assert_ne!(statuses[0].message(), statuses[2].message());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(
            CallStatus::Connected.to_string(),
            "Connected! You are now talking."
        );
        assert_eq!(
            CallStatus::CallEndedTimeLimit.to_string(),
            "Call ended: 15 minute limit."
        );
    }
}
