//! Message Types für das Relay-Protokoll
//!
//! Diese Strukturen spiegeln die Events des Relay-Servers wider
//! (`find_partner`, `signal`, `partner_found`, ...) und ermöglichen
//! typsichere Kommunikation. Jede Nachricht ist ein JSON-Objekt mit
//! `"type"`-Tag.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

// ============================================================================
// SIGNAL PAYLOADS
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Browser-Format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Inhalt einer `signal` Nachricht: Description oder `{candidate}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalData {
    Description(SessionDescription),
    Candidate { candidate: IceCandidate },
}

/// Fehler beim Interpretieren eines eingehenden `signal` Payloads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedSignal {
    #[error("malformed session description: {0}")]
    Description(String),

    #[error("malformed signal payload: {0}")]
    Payload(String),
}

impl SignalData {
    /// Parst den rohen `data` Payload einer `signal` Nachricht
    ///
    /// Payloads mit `type` oder `sdp` Feld gelten als (kaputte) Description,
    /// alles andere als kaputter Candidate-Payload.
    pub fn parse(value: &serde_json::Value) -> Result<Self, MalformedSignal> {
        serde_json::from_value(value.clone()).map_err(|e| {
            let looks_like_description = value
                .as_object()
                .map(|obj| obj.contains_key("type") || obj.contains_key("sdp"))
                .unwrap_or(false);
            if looks_like_description {
                MalformedSignal::Description(e.to_string())
            } else {
                MalformedSignal::Payload(e.to_string())
            }
        })
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            SignalData::Description(d) if d.kind == SdpKind::Offer => SignalKind::Offer,
            SignalData::Description(_) => SignalKind::Answer,
            SignalData::Candidate { .. } => SignalKind::IceCandidate,
        }
    }
}

// ============================================================================
// MESSAGE KINDS
// ============================================================================

/// Art einer Signaling-Nachricht (für Logging und Protokoll-Checks)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    PartnerFound,
    WaitingForPartner,
    PartnerDisconnected,
    ForceDisconnect,
    LeaveCall,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
            SignalKind::PartnerFound => "partner_found",
            SignalKind::WaitingForPartner => "waiting_for_partner",
            SignalKind::PartnerDisconnected => "partner_disconnected",
            SignalKind::ForceDisconnect => "force_disconnect",
            SignalKind::LeaveCall => "leave_call",
        };
        f.write_str(name)
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten an den Relay-Server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// In die Warteschlange für einen Partner eintreten
    FindPartner,

    /// Offer, Answer oder Candidate an den Partner weiterleiten
    Signal { to: String, data: SignalData },

    /// Anruf verlassen
    LeaveCall { to: String },

    /// Keep-alive
    Heartbeat,
}

impl ClientMessage {
    pub fn signal(to: impl Into<String>, data: SignalData) -> Self {
        ClientMessage::Signal {
            to: to.into(),
            data,
        }
    }

    /// Kurzname für Logging
    pub fn label(&self) -> String {
        match self {
            ClientMessage::FindPartner => "find_partner".to_string(),
            ClientMessage::Signal { data, .. } => format!("signal/{}", data.kind()),
            ClientMessage::LeaveCall { .. } => SignalKind::LeaveCall.to_string(),
            ClientMessage::Heartbeat => "heartbeat".to_string(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Server-Nachrichten
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Partner gefunden, Session beginnt
    PartnerFound {
        #[serde(rename = "partnerId")]
        partner_id: String,
        /// Millisekunden seit Unix-Epoch, vom Server vergeben
        #[serde(rename = "startTime")]
        start_time: i64,
        #[serde(rename = "shouldInitiate")]
        should_initiate: bool,
    },

    /// Noch kein Partner verfügbar
    WaitingForPartner,

    /// Weitergeleitetes Signal vom Partner
    ///
    /// `data` bleibt roh, damit kaputte Payloads als Protokollfehler
    /// behandelt werden können statt den ganzen Frame zu verwerfen.
    Signal {
        from: String,
        data: serde_json::Value,
    },

    /// Ein Partner hat die Verbindung zum Server verloren
    PartnerDisconnected { id: String },

    /// Der Partner hat den Anruf verlassen
    ForceDisconnect,

    /// Anzahl der verbundenen Benutzer
    UserCount { count: u32 },

    /// Heartbeat Antwort
    Pong,
}

impl ServerMessage {
    /// Protokoll-Art, falls die Nachricht zum Session-Protokoll gehört
    pub fn kind(&self) -> Option<SignalKind> {
        match self {
            ServerMessage::PartnerFound { .. } => Some(SignalKind::PartnerFound),
            ServerMessage::WaitingForPartner => Some(SignalKind::WaitingForPartner),
            ServerMessage::Signal { data, .. } => SignalData::parse(data).ok().map(|d| d.kind()),
            ServerMessage::PartnerDisconnected { .. } => Some(SignalKind::PartnerDisconnected),
            ServerMessage::ForceDisconnect => Some(SignalKind::ForceDisconnect),
            ServerMessage::UserCount { .. } | ServerMessage::Pong => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_wire_shape() {
        assert_eq!(
            serde_json::to_value(ClientMessage::FindPartner).unwrap(),
            json!({"type": "find_partner"})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::LeaveCall { to: "p1".into() }).unwrap(),
            json!({"type": "leave_call", "to": "p1"})
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::signal(
                "p1",
                SignalData::Description(SessionDescription::offer("v=0"))
            ))
            .unwrap(),
            json!({"type": "signal", "to": "p1", "data": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_candidate_wire_shape() {
        let data = SignalData::Candidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["candidate"]["sdpMLineIndex"], json!(0));
        assert_eq!(value["candidate"]["sdpMid"], json!("0"));
        assert_eq!(SignalData::parse(&value).unwrap(), data);
    }

    #[test]
    fn test_parse_server_messages() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"partner_found","partnerId":"abc","startTime":1700000000000,"shouldInitiate":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::PartnerFound {
                partner_id: "abc".into(),
                start_time: 1_700_000_000_000,
                should_initiate: true,
            }
        );

        let msg: ServerMessage = serde_json::from_str(r#"{"type":"force_disconnect"}"#).unwrap();
        assert_eq!(msg, ServerMessage::ForceDisconnect);

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"waiting_for_partner"}"#).unwrap();
        assert_eq!(msg.kind(), Some(SignalKind::WaitingForPartner));

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"user_count","count":42}"#).unwrap();
        assert_eq!(msg, ServerMessage::UserCount { count: 42 });
    }

    #[test]
    fn test_signal_kind_from_payload() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"type":"signal","from":"abc","data":{"type":"answer","sdp":"v=0"}}"#,
        )
        .unwrap();
        assert_eq!(msg.kind(), Some(SignalKind::Answer));
    }

    #[test]
    fn test_malformed_signal_classification() {
        assert!(matches!(
            SignalData::parse(&json!({"type": "pranswer", "sdp": "v=0"})),
            Err(MalformedSignal::Description(_))
        ));
        assert!(matches!(
            SignalData::parse(&json!({"type": "offer"})),
            Err(MalformedSignal::Description(_))
        ));
        assert!(matches!(
            SignalData::parse(&json!({"foo": 1})),
            Err(MalformedSignal::Payload(_))
        ));
    }
}
