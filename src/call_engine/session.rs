//! Session - ein einzelner vermittelter Anrufversuch

use std::fmt;
use uuid::Uuid;

// ============================================================================
// ROLE
// ============================================================================

/// Rolle in der Offer/Answer-Aushandlung, fest für die ganze Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Erstellt das Offer
    Initiator,
    /// Antwortet nur auf ein empfangenes Offer
    Responder,
}

impl Role {
    pub fn from_should_initiate(should_initiate: bool) -> Self {
        if should_initiate {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lebenszyklus einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Matching,
    Negotiating,
    Active,
    Ending,
    Terminated,
}

impl SessionState {
    /// Erlaubte Übergänge; `Matching` wird nie erneut betreten
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Matching)
                | (Idle, Ending)
                | (Matching, Negotiating)
                | (Matching, Ending)
                | (Negotiating, Active)
                | (Negotiating, Ending)
                | (Negotiating, Terminated)
                | (Active, Ending)
                | (Ending, Terminated)
        )
    }

    /// Session hält (potentiell) Medienressourcen
    pub fn is_in_call(self) -> bool {
        matches!(self, SessionState::Negotiating | SessionState::Active)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Ending | SessionState::Terminated)
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Ein vermittelter Anruf; wird nie wiederverwendet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Lokale ID dieses Versuchs (für Logging und veraltete Events)
    pub attempt: Uuid,
    /// Peer-ID des Partners, vom Relay-Server vergeben
    pub partner_id: String,
    pub role: Role,
    /// Startzeitpunkt vom Server (ms seit Unix-Epoch)
    pub start_time_ms: i64,
}

impl Session {
    pub fn new(partner_id: String, role: Role, start_time_ms: i64) -> Self {
        Self {
            attempt: Uuid::new_v4(),
            partner_id,
            role,
            start_time_ms,
        }
    }

    pub fn is_partner(&self, peer_id: &str) -> bool {
        self.partner_id == peer_id
    }
}
