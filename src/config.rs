//! Konfiguration für Signaling, ICE und Session-Limits
//!
//! Alle Werte haben sinnvolle Defaults; `CallConfig::from_env()` überschreibt
//! einzelne Werte aus Umgebungsvariablen.

use serde::Deserialize;
use std::time::Duration;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:5000/ws";

/// Maximale Gesprächsdauer in Sekunden (15 Minuten)
pub const MAX_CALL_SECS: u64 = 900;

/// Best-Effort Wartezeit für ICE Gathering in Millisekunden
pub const GATHER_TIMEOUT_MS: u64 = 3000;

// ============================================================================
// CONFIG
// ============================================================================

/// ICE Server Eintrag (STUN oder TURN)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

/// Gesamte Laufzeit-Konfiguration einer Call-Session
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(with = "millis")]
    pub gather_timeout: Duration,
    #[serde(with = "millis")]
    pub max_call_duration: Duration,
    #[serde(with = "millis")]
    pub duration_tick: Duration,
    /// Verzögerung bis zur Navigation nach `force_disconnect`
    #[serde(with = "millis")]
    pub force_disconnect_navigation_delay: Duration,
    /// Verzögerung bis zur Navigation nach Erreichen des Zeitlimits
    #[serde(with = "millis")]
    pub time_limit_navigation_delay: Duration,
    #[serde(with = "millis")]
    pub reconnect_initial_backoff: Duration,
    #[serde(with = "millis")]
    pub reconnect_max_backoff: Duration,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: default_ice_servers(),
            gather_timeout: Duration::from_millis(GATHER_TIMEOUT_MS),
            max_call_duration: Duration::from_secs(MAX_CALL_SECS),
            duration_tick: Duration::from_secs(1),
            force_disconnect_navigation_delay: Duration::from_secs(1),
            time_limit_navigation_delay: Duration::from_secs(2),
            reconnect_initial_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

impl CallConfig {
    /// Lädt die Defaults und überschreibt sie mit Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`
    /// - `CALLMATCH_STUN_URLS` (kommagetrennt)
    /// - `CALLMATCH_MAX_CALL_SECS`
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup("SIGNALING_URL") {
            if is_websocket_url(&url) {
                self.signaling_url = url;
            } else {
                tracing::warn!("Ignoring invalid SIGNALING_URL: {}", url);
            }
        }

        if let Some(urls) = lookup("CALLMATCH_STUN_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                self.ice_servers = vec![IceServerConfig {
                    urls,
                    username: String::new(),
                    credential: String::new(),
                }];
            }
        }

        if let Some(secs) = lookup("CALLMATCH_MAX_CALL_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => self.max_call_duration = Duration::from_secs(secs),
                _ => tracing::warn!("Ignoring invalid CALLMATCH_MAX_CALL_SECS: {}", secs),
            }
        }

        self
    }

    /// ICE Server im Format von webrtc-rs
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

/// Dauer-Felder werden in der Konfiguration als Millisekunden angegeben
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Nur `ws://` und `wss://` URLs mit Host sind gültig
fn is_websocket_url(raw: &str) -> bool {
    match Url::parse(raw) {
        Ok(url) => matches!(url.scheme(), "ws" | "wss") && url.host_str().is_some(),
        Err(_) => false,
    }
}
