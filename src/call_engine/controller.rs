//! Session Controller - Zustandsautomat eines Anrufs
//!
//! Der Controller läuft als einzelner Task. Alle Eingaben (Relay-Nachrichten,
//! Engine-Events, Timer-Ticks, Benutzeraktionen) landen in einer Queue und
//! werden strikt nacheinander angewendet. Die UI sieht nur den
//! `CallSnapshot` über einen watch-Kanal.
//!
//! Ein Controller betreut genau einen Anruf-Bildschirm: nach `Terminated`
//! wird nicht erneut gematcht.

use super::capture::MediaCapture;
use super::error::CallError;
use super::guard::{Clock, DurationGuard, GuardVerdict};
use super::negotiation::{EngineDeps, EngineEvent, HandleSlot, NegotiationEngine};
use super::session::{Role, Session, SessionState};
use super::status::{CallSnapshot, CallStatus};
use super::transport::{PeerState, TransportEvent, TransportFactory};
use crate::config::CallConfig;
use crate::signaling::{
    ClientMessage, ServerMessage, SignalData, SignalSink, SignalingEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// INPUTS
// ============================================================================

#[derive(Debug)]
enum ControllerEvent {
    Engine { attempt: Uuid, event: EngineEvent },
    Tick,
    Leave,
    Dispose,
}

/// Kollaborateure des Controllers
#[derive(Clone)]
pub struct CallDeps {
    pub sink: Arc<dyn SignalSink>,
    pub capture: Arc<dyn MediaCapture>,
    pub transports: Arc<dyn TransportFactory>,
    pub clock: Arc<dyn Clock>,
    pub slot: HandleSlot,
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Verbindung der Präsentationsschicht zum laufenden Controller
///
/// Droppen des Handles beendet die Session ohne `leave_call`.
pub struct CallHandle {
    inbox: mpsc::UnboundedSender<ControllerEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    /// Benutzer verlässt den Anruf
    pub fn leave(&self) {
        if self.inbox.send(ControllerEvent::Leave).is_err() {
            tracing::debug!("Controller already finished, ignoring leave");
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wartet bis `pred` auf den aktuellen Snapshot zutrifft
    ///
    /// Endet der Controller vorher, wird der letzte Snapshot geliefert.
    pub async fn wait_for(&self, mut pred: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        let mut rx = self.snapshot.clone();
        let result = rx.wait_for(|s| pred(s)).await.map(|s| s.clone());
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Wartet auf das Ende des Controller-Tasks
    pub async fn finished(mut self) {
        self.join().await;
    }

    /// Beendet die Session still (wie beim Schließen des Bildschirms)
    pub async fn dispose(mut self) {
        let _ = self.inbox.send(ControllerEvent::Dispose);
        self.join().await;
    }

    async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Session controller task failed: {}", e);
            }
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        let _ = self.inbox.send(ControllerEvent::Dispose);
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish()
    }
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

pub struct SessionController {
    config: CallConfig,
    sink: Arc<dyn SignalSink>,
    clock: Arc<dyn Clock>,
    engine: NegotiationEngine,
    inbox: mpsc::UnboundedSender<ControllerEvent>,
    state: SessionState,
    session: Option<Session>,
    guard: Option<DurationGuard>,
    snapshot: CallSnapshot,
    published: watch::Sender<CallSnapshot>,
    channel_seen: bool,
    awaiting_release: bool,
    navigate_at: Option<Instant>,
}

impl SessionController {
    /// Startet den Controller-Task für einen Anruf-Bildschirm
    pub fn spawn(
        config: CallConfig,
        deps: CallDeps,
        channel: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> CallHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (published, snapshot) = watch::channel(CallSnapshot::default());

        let engine = NegotiationEngine::new(EngineDeps {
            capture: deps.capture,
            transports: deps.transports,
            sink: Arc::clone(&deps.sink),
            slot: deps.slot,
            gather_timeout: config.gather_timeout,
        });

        let controller = Self {
            config,
            sink: deps.sink,
            clock: deps.clock,
            engine,
            inbox: inbox_tx.clone(),
            state: SessionState::Idle,
            session: None,
            guard: None,
            snapshot: CallSnapshot::default(),
            published,
            channel_seen: false,
            awaiting_release: false,
            navigate_at: None,
        };

        let task = tokio::spawn(controller.run(inbox_rx, channel));

        CallHandle {
            inbox: inbox_tx,
            snapshot,
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<ControllerEvent>,
        channel: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let mut channel = Some(channel);
        tracing::info!("Session controller started");

        loop {
            let navigate_at = self.navigate_at;
            tokio::select! {
                biased;
                event = inbox.recv() => match event {
                    Some(ControllerEvent::Dispose) | None => {
                        self.dispose();
                        break;
                    }
                    Some(event) => self.handle_input(event),
                },
                event = recv_channel(&mut channel) => match event {
                    Some(event) => self.handle_channel(event),
                    None => {
                        tracing::debug!("Signaling event stream closed");
                        channel = None;
                    }
                },
                _ = navigation_due(navigate_at) => {
                    self.navigate_at = None;
                    self.navigate_away();
                }
            }

            let done = match self.state {
                SessionState::Idle => true,
                SessionState::Terminated => !self.awaiting_release,
                _ => false,
            };
            if done && self.snapshot.navigate_away {
                break;
            }
        }

        tracing::info!("Session controller finished in state {:?}", self.state);
    }

    // ------------------------------------------------------------------------
    // Relay-Kanal
    // ------------------------------------------------------------------------

    fn handle_channel(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected => self.on_connected(),
            SignalingEvent::Disconnected => self.on_channel_lost("disconnected"),
            SignalingEvent::ConnectError(e) => self.on_channel_lost(&e),
            SignalingEvent::Message(msg) => self.handle_message(msg),
        }
    }

    fn on_connected(&mut self) {
        self.channel_seen = true;
        match self.state {
            SessionState::Idle => {
                self.transition(SessionState::Matching);
                self.request_partner();
            }
            // Nach einem Reconnect kennt der Server uns nicht mehr
            SessionState::Matching => self.request_partner(),
            SessionState::Negotiating => self.set_status(CallStatus::PartnerFoundConnecting),
            SessionState::Active => self.set_status(CallStatus::Connected),
            SessionState::Ending | SessionState::Terminated => {}
        }
    }

    fn on_channel_lost(&mut self, reason: &str) {
        tracing::warn!("Relay channel lost: {}", reason);
        if self.channel_seen && !self.state.is_finished() {
            self.set_status(CallStatus::Reconnecting);
        }
    }

    fn request_partner(&mut self) {
        self.send(ClientMessage::FindPartner);
        self.set_status(CallStatus::LookingForPartner);
    }

    fn handle_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::PartnerFound {
                partner_id,
                start_time,
                should_initiate,
            } => self.on_partner_found(partner_id, start_time, should_initiate),

            ServerMessage::WaitingForPartner => {
                if self.state == SessionState::Matching {
                    self.set_status(CallStatus::LookingForPartner);
                }
            }

            ServerMessage::Signal { from, data } => self.on_signal(&from, &data),

            ServerMessage::PartnerDisconnected { id } => {
                let current = self.session.as_ref().is_some_and(|s| s.is_partner(&id));
                if current && self.state.is_in_call() {
                    tracing::info!("Partner {} disconnected", id);
                    self.teardown(Some(CallStatus::PartnerDisconnected), None);
                } else {
                    tracing::debug!("Ignoring stale partner_disconnected for {}", id);
                }
            }

            ServerMessage::ForceDisconnect => {
                if self.state.is_in_call() {
                    tracing::info!("Relay forced disconnect");
                    let delay = self.config.force_disconnect_navigation_delay;
                    self.teardown(Some(CallStatus::PartnerLeft), Some(delay));
                } else {
                    tracing::debug!("Ignoring force_disconnect in state {:?}", self.state);
                }
            }

            ServerMessage::UserCount { count } => {
                self.snapshot.live_users = Some(count);
                self.publish();
            }

            ServerMessage::Pong => {}
        }
    }

    fn on_partner_found(&mut self, partner_id: String, start_time: i64, should_initiate: bool) {
        if self.state != SessionState::Matching {
            tracing::warn!(
                "Ignoring partner_found for {} in state {:?}",
                partner_id,
                self.state
            );
            return;
        }

        let role = Role::from_should_initiate(should_initiate);
        let session = Session::new(partner_id, role, start_time);
        tracing::info!(
            "Matched with {} as {} (attempt {})",
            session.partner_id,
            role,
            session.attempt
        );

        let attempt = session.attempt;
        let inbox = self.inbox.clone();
        self.engine.start(
            role,
            session.partner_id.clone(),
            Arc::new(move |event| {
                let _ = inbox.send(ControllerEvent::Engine { attempt, event });
            }),
        );

        self.snapshot.partner_id = Some(session.partner_id.clone());
        self.session = Some(session);
        self.transition(SessionState::Negotiating);
        self.set_status(CallStatus::PartnerFoundConnecting);
    }

    fn on_signal(&mut self, from: &str, data: &serde_json::Value) {
        let current = self.session.as_ref().is_some_and(|s| s.is_partner(from));
        if !current || !self.state.is_in_call() {
            tracing::debug!("Ignoring signal from {} in state {:?}", from, self.state);
            return;
        }

        match SignalData::parse(data) {
            Ok(signal) => self.engine.on_remote_signal(signal),
            Err(e) => self.engine.on_malformed_signal(e),
        }
    }

    // ------------------------------------------------------------------------
    // Interne Eingaben
    // ------------------------------------------------------------------------

    fn handle_input(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Engine { attempt, event } => {
                if self.session.as_ref().is_some_and(|s| s.attempt == attempt) {
                    self.handle_engine(event);
                } else {
                    tracing::debug!("Dropping engine event from attempt {}", attempt);
                }
            }
            ControllerEvent::Tick => self.on_tick(),
            ControllerEvent::Leave => self.leave(),
            ControllerEvent::Dispose => self.dispose(),
        }
    }

    fn handle_engine(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Established => self.on_established(),

            EngineEvent::Rejected(e) => tracing::warn!("Remote signal rejected: {}", e),

            EngineEvent::Failed(CallError::Permission(e)) => {
                if self.state.is_finished() {
                    return;
                }
                tracing::error!("Media capture failed: {}", e);
                self.engine.stop();
                self.snapshot.active = false;
                self.snapshot.status = CallStatus::for_capture_error(&e);
                self.transition(SessionState::Terminated);
            }

            EngineEvent::Failed(err) => self.teardown(Some(err.status()), None),

            EngineEvent::Transport(TransportEvent::LocalCandidate(candidate)) => {
                // Nach dem Teardown gibt es keine Session mehr, an die gesendet wird
                if !self.state.is_in_call() {
                    tracing::debug!("Dropping local candidate after teardown");
                } else if let Some(session) = &self.session {
                    let msg = ClientMessage::signal(
                        session.partner_id.clone(),
                        SignalData::Candidate { candidate },
                    );
                    self.send(msg);
                }
            }

            EngineEvent::Transport(TransportEvent::StateChanged(PeerState::Failed)) => {
                if self.state.is_in_call() {
                    tracing::warn!("Peer connection failed");
                    self.teardown(Some(CallStatus::PartnerDisconnected), None);
                }
            }

            EngineEvent::Transport(TransportEvent::StateChanged(state)) => {
                tracing::debug!("Peer connection state {:?}", state);
            }

            EngineEvent::Transport(TransportEvent::RemoteTrack { kind }) => {
                tracing::info!("Remote {} track attached", kind);
            }

            EngineEvent::Released { had_resources } => {
                tracing::debug!("Negotiation released (had resources: {})", had_resources);
                if self.awaiting_release {
                    self.awaiting_release = false;
                    if self.state == SessionState::Ending {
                        self.transition(SessionState::Terminated);
                    }
                }
            }
        }
    }

    fn on_established(&mut self) {
        if self.state != SessionState::Negotiating {
            return;
        }
        let Some(session) = &self.session else {
            return;
        };

        let mut guard = DurationGuard::new(session.start_time_ms, self.config.max_call_duration);
        let inbox = self.inbox.clone();
        guard.arm(self.config.duration_tick, move || {
            inbox.send(ControllerEvent::Tick).is_ok()
        });

        self.snapshot.elapsed_secs = guard.elapsed_secs(self.clock.now_millis());
        self.guard = Some(guard);
        self.snapshot.active = true;
        self.transition(SessionState::Active);
        self.set_status(CallStatus::Connected);
    }

    fn on_tick(&mut self) {
        let now = self.clock.now_millis();
        let Some(guard) = self.guard.as_mut() else {
            return;
        };

        match guard.check(now) {
            GuardVerdict::Running { elapsed_secs } => {
                if self.snapshot.elapsed_secs != elapsed_secs {
                    self.snapshot.elapsed_secs = elapsed_secs;
                    self.publish();
                }
            }
            GuardVerdict::Expired { elapsed_secs } => {
                tracing::info!("Call reached time limit after {}s", elapsed_secs);
                self.snapshot.elapsed_secs = elapsed_secs;
                let delay = self.config.time_limit_navigation_delay;
                self.teardown(Some(CallStatus::CallEndedTimeLimit), Some(delay));
            }
            GuardVerdict::Inactive => {}
        }
    }

    /// Im Idle-Zustand gibt es nichts abzubauen, nur die Navigation
    fn leave(&mut self) {
        if self.state != SessionState::Idle && !self.state.is_finished() {
            if let Some(session) = &self.session {
                let msg = ClientMessage::LeaveCall {
                    to: session.partner_id.clone(),
                };
                self.send(msg);
            }
            self.teardown(Some(CallStatus::LeftCall), None);
        }
        self.navigate_away();
    }

    fn dispose(&mut self) {
        tracing::info!("Session controller disposed");
        self.teardown(None, None);
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Beendet die Session; wiederholte Aufrufe sind No-ops
    fn teardown(&mut self, status: Option<CallStatus>, navigate_after: Option<Duration>) {
        if self.state.is_finished() {
            return;
        }

        self.transition(SessionState::Ending);
        if let Some(mut guard) = self.guard.take() {
            guard.cancel();
        }
        self.snapshot.active = false;
        if let Some(status) = status {
            self.snapshot.status = status;
        }

        self.awaiting_release = self.engine.stop();
        if !self.awaiting_release {
            self.transition(SessionState::Terminated);
        }

        if let Some(delay) = navigate_after {
            self.navigate_at = Some(Instant::now() + delay);
        }
        self.publish();
    }

    fn navigate_away(&mut self) {
        if !self.snapshot.navigate_away {
            self.snapshot.navigate_away = true;
            self.publish();
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            tracing::warn!("Invalid transition {:?} -> {:?}", self.state, next);
            return;
        }
        tracing::debug!("Session state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.publish();
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.snapshot.status != status {
            tracing::info!("Status: {}", status);
            self.snapshot.status = status;
            self.publish();
        }
    }

    fn send(&self, msg: ClientMessage) {
        let label = msg.label();
        if let Err(e) = self.sink.send(msg) {
            tracing::error!("Failed to send {}: {}", label, e);
        }
    }

    fn publish(&mut self) {
        self.snapshot.state = self.state;
        self.published.send_replace(self.snapshot.clone());
    }
}

async fn recv_channel(
    channel: &mut Option<mpsc::UnboundedReceiver<SignalingEvent>>,
) -> Option<SignalingEvent> {
    match channel {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn navigation_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
