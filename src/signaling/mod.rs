//! Signaling Module - WebSocket Client für den Relay-Server
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Relay-Server:
//! - WebSocket-Verbindung aufbauen, halten und wiederherstellen
//! - Nachrichten serialisieren und senden
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalSink, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
