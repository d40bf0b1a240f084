//! WebSocket Client für den Relay-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Relay:
//! - Automatische Reconnection mit exponentiellem Backoff
//! - Heartbeat-Keeping
//! - Event-basierte Kommunikation (in Empfangsreihenfolge)

use super::messages::*;
use crate::config::CallConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Verbunden mit Relay-Server
    Connected,

    /// Verbindung getrennt (Reconnect läuft automatisch)
    Disconnected,

    /// Verbindungsaufbau fehlgeschlagen
    ConnectError(String),

    /// Nachricht vom Relay-Server
    Message(ServerMessage),
}

// ============================================================================
// SIGNAL SINK
// ============================================================================

/// Ausgehende Seite des Signal-Kanals
///
/// `send` blockiert nie; die Nachricht wird in die Schreib-Queue gelegt.
pub trait SignalSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    connections: u64,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Relay-Server Kommunikation
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Startet den Client im Hintergrund
    ///
    /// Gibt den Client (als `SignalSink`) und den Event-Receiver zurück.
    /// Die Verbindung wird bei Abbruch automatisch neu aufgebaut, bis
    /// `close()` aufgerufen oder der Client gedroppt wird.
    pub fn start(config: &CallConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let client = Arc::new(Self {
            server_url: config.signaling_url.clone(),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        });

        let task = tokio::spawn(connection_loop(
            client.server_url.clone(),
            Arc::clone(&client.state),
            Arc::clone(&client.tx),
            event_tx,
            client.shutdown.clone(),
            Backoff::new(config.reconnect_initial_backoff, config.reconnect_max_backoff),
            config.heartbeat_interval,
        ));
        *client.task.lock() = Some(task);

        (client, event_rx)
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Anzahl erfolgreicher Verbindungsaufbauten (inkl. Reconnects)
    pub fn connection_count(&self) -> u64 {
        self.state.read().connections
    }

    /// Beendet die Verbindung und stoppt den Reconnect-Loop
    pub fn close(&self) {
        self.shutdown.cancel();
        *self.tx.write() = None;
    }
}

impl SignalSink for SignalingClient {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.read().clone().ok_or(SignalingError::NotConnected)?;

        let msg_string =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tracing::debug!("Sending {}", msg.label());

        // try_send ist non-blocking
        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponentieller Backoff für Reconnects
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ============================================================================
// CONNECTION LOOP
// ============================================================================

async fn connection_loop(
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx_slot: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    shutdown: CancellationToken,
    mut backoff: Backoff,
    heartbeat_interval: Duration,
) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        tracing::info!("Connecting to signaling server: {}", server_url);

        let connect = tokio::select! {
            result = connect_async(server_url.as_str()) => result,
            _ = shutdown.cancelled() => break,
        };

        match connect {
            Ok((ws_stream, _)) => {
                backoff.reset();

                // Message-Sender für diese Verbindung
                let (tx, rx) = mpsc::channel::<String>(100);
                *tx_slot.write() = Some(tx);
                {
                    let mut s = state.write();
                    s.is_connected = true;
                    s.connections += 1;
                }
                let _ = event_tx.send(SignalingEvent::Connected);

                run_connection(ws_stream, rx, &event_tx, &shutdown, heartbeat_interval).await;

                *tx_slot.write() = None;
                state.write().is_connected = false;
                let _ = event_tx.send(SignalingEvent::Disconnected);
            }
            Err(e) => {
                tracing::warn!("Signaling connection failed: {}", e);
                let _ = event_tx.send(SignalingEvent::ConnectError(e.to_string()));
            }
        }

        if event_tx.is_closed() {
            tracing::debug!("No listener for signaling events, stopping reconnect loop");
            break;
        }

        let delay = backoff.next_delay();
        tracing::debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => break,
        }
    }

    tracing::info!("Signaling client stopped");
}

/// Bedient eine einzelne WebSocket-Verbindung bis sie endet
async fn run_connection<S>(
    ws_stream: S,
    mut rx: mpsc::Receiver<String>,
    event_tx: &mpsc::UnboundedSender<SignalingEvent>,
    shutdown: &CancellationToken,
    heartbeat_interval: Duration,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws_stream.split();

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // Erster Tick feuert sofort
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg_result = read.next() => match msg_result {
                Some(Ok(Message::Text(text))) => handle_text(&text, event_tx),
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            },

            outgoing = rx.recv() => match outgoing {
                Some(msg) => {
                    if let Err(e) = write.send(Message::Text(msg)).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                None => break,
            },

            _ = heartbeat.tick() => {
                if let Ok(msg) = serde_json::to_string(&ClientMessage::Heartbeat) {
                    if let Err(e) = write.send(Message::Text(msg)).await {
                        tracing::warn!("Failed to send heartbeat: {}", e);
                        break;
                    }
                }
            }

            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Verarbeitet einen eingehenden Text-Frame
fn handle_text(text: &str, event_tx: &mpsc::UnboundedSender<SignalingEvent>) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::Pong) => {
            // Heartbeat-Response - nichts zu tun
        }
        Ok(msg) => {
            tracing::debug!("Received {:?}", msg.kind());
            let _ = event_tx.send(SignalingEvent::Message(msg));
        }
        Err(e) => {
            tracing::warn!("Dropping unparseable server message: {} ({})", e, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_handle_text_forwards_and_drops() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_text(r#"{"type":"force_disconnect"}"#, &tx);
        handle_text(r#"{"type":"pong"}"#, &tx);
        handle_text("not json", &tx);
        handle_text(r#"{"type":"partner_disconnected","id":"p1"}"#, &tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::Message(ServerMessage::ForceDisconnect)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SignalingEvent::Message(ServerMessage::PartnerDisconnected { id: "p1".into() })
        );
        assert!(rx.try_recv().is_err());
    }
}
