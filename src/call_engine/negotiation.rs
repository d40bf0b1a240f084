//! Negotiation Engine - Offer/Answer/ICE Ablauf
//!
//! Pro Session läuft ein Worker-Task, der den `NegotiationHandle` exklusiv
//! besitzt. Befehle (eingehende Signale, Stop) werden über eine Queue in
//! Empfangsreihenfolge abgearbeitet; der Controller wartet nie auf einen
//! Aushandlungsschritt. Ein Stop während eines laufenden Schritts wird nach
//! dessen Abschluss wirksam und gibt den Handle in jedem Fall frei.

use super::capture::{AudioSource, MediaCapture};
use super::error::{CallError, ProtocolError};
use super::guard::{GatherOutcome, GatheringGuard};
use super::session::Role;
use super::transport::{PeerTransport, TransportError, TransportEvent, TransportFactory};
use crate::signaling::{
    ClientMessage, IceCandidate, MalformedSignal, SdpKind, SessionDescription, SignalData,
    SignalSink,
};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// HANDLE SLOT
// ============================================================================

static GLOBAL_SLOT: Lazy<HandleSlot> = Lazy::new(HandleSlot::new);

/// Erlaubt höchstens einen lebenden `NegotiationHandle` gleichzeitig
#[derive(Debug, Clone)]
pub struct HandleSlot {
    busy: Arc<AtomicBool>,
}

impl HandleSlot {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prozessweiter Slot
    pub fn global() -> Self {
        GLOBAL_SLOT.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn try_claim(&self) -> Option<SlotClaim> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotClaim {
                busy: Arc::clone(&self.busy),
            })
    }
}

impl Default for HandleSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct SlotClaim {
    busy: Arc<AtomicBool>,
}

impl Drop for SlotClaim {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// NEGOTIATION HANDLE
// ============================================================================

/// Peer Connection plus lokale Audioquelle einer Session
pub struct NegotiationHandle {
    transport: Option<Arc<dyn PeerTransport>>,
    source: Option<Box<dyn AudioSource>>,
    claim: Option<SlotClaim>,
}

impl NegotiationHandle {
    fn new(source: Box<dyn AudioSource>, claim: SlotClaim) -> Self {
        Self {
            transport: None,
            source: Some(source),
            claim: Some(claim),
        }
    }

    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.clone()
    }

    /// Schließt die Verbindung und stoppt alle Tracks
    ///
    /// Mehrfacher Aufruf ist ein No-op.
    async fn release(&mut self) -> bool {
        let mut released = false;

        if let Some(mut source) = self.source.take() {
            source.stop();
            released = true;
        }

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
            released = true;
        }

        // Slot erst nach dem Schließen freigeben
        self.claim.take();
        released
    }
}

// ============================================================================
// EVENTS & COMMANDS
// ============================================================================

/// Events vom Engine-Worker an den Controller
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lokale und entfernte Description gesetzt, Gathering abgeschlossen
    Established,
    /// Protokollverletzung nach dem Handshake; Nachricht verworfen
    Rejected(ProtocolError),
    /// Session-beendender Fehler
    Failed(CallError),
    Transport(TransportEvent),
    /// Worker beendet, Handle freigegeben
    Released { had_resources: bool },
}

/// Callback für Engine-Events
pub type EngineEvents = Arc<dyn Fn(EngineEvent) + Send + Sync>;

#[derive(Debug)]
enum EngineCommand {
    Remote(SignalData),
    Malformed(MalformedSignal),
    Stop,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Abhängigkeiten der Engine
#[derive(Clone)]
pub struct EngineDeps {
    pub capture: Arc<dyn MediaCapture>,
    pub transports: Arc<dyn TransportFactory>,
    pub sink: Arc<dyn SignalSink>,
    pub slot: HandleSlot,
    pub gather_timeout: Duration,
}

/// Treibt die Aushandlung einer Session
pub struct NegotiationEngine {
    deps: EngineDeps,
    commands: Option<mpsc::UnboundedSender<EngineCommand>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NegotiationEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            deps,
            commands: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Startet den Worker für eine Session
    ///
    /// Ein zweiter Aufruf ohne vorheriges `stop()` wird ignoriert.
    pub fn start(&mut self, role: Role, partner_id: String, events: EngineEvents) {
        if self.commands.is_some() {
            tracing::error!("Negotiation already started, ignoring second start");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.commands = Some(tx);
        self.cancel = CancellationToken::new();

        let worker = Worker {
            deps: self.deps.clone(),
            role,
            partner_id,
            events,
            cancel: self.cancel.clone(),
            gathering: GatheringGuard::start(self.deps.gather_timeout),
            progress: Progress::default(),
            outbound: Arc::default(),
        };
        self.task = Some(tokio::spawn(worker.run(rx)));
    }

    /// Leitet ein Signal des Partners an den Worker weiter
    pub fn on_remote_signal(&self, data: SignalData) {
        self.send(EngineCommand::Remote(data));
    }

    /// Meldet einen kaputten Signal-Payload des Partners
    pub fn on_malformed_signal(&self, err: MalformedSignal) {
        self.send(EngineCommand::Malformed(err));
    }

    /// Beendet die Aushandlung; sicher mehrfach aufrufbar
    ///
    /// Gibt `true` zurück wenn ein Worker lief, der noch `Released` meldet.
    pub fn stop(&mut self) -> bool {
        self.cancel.cancel();
        match self.commands.take() {
            Some(tx) => {
                let _ = tx.send(EngineCommand::Stop);
                self.task.take().is_some_and(|t| !t.is_finished())
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn send(&self, cmd: EngineCommand) {
        match &self.commands {
            Some(tx) => {
                if tx.send(cmd).is_err() {
                    tracing::debug!("Negotiation worker already finished, dropping command");
                }
            }
            None => tracing::debug!("Negotiation not running, dropping command {:?}", cmd),
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        // Worker räumt selbst auf, sobald er den Abbruch sieht
        self.stop();
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Default)]
struct Progress {
    local_set: bool,
    remote_set: bool,
    gathering_settled: bool,
    established: bool,
    offers_applied: u32,
    answers_applied: u32,
    pending_candidates: Vec<IceCandidate>,
}

/// Lokale Kandidaten gehen erst nach der eigenen Description raus
#[derive(Default)]
struct OutboundCandidates {
    inner: Mutex<OutboundState>,
}

#[derive(Default)]
struct OutboundState {
    open: bool,
    pending: Vec<IceCandidate>,
}

impl OutboundCandidates {
    fn push(&self, candidate: IceCandidate, events: &EngineEvents) {
        let mut state = self.inner.lock();
        if state.open {
            events(EngineEvent::Transport(TransportEvent::LocalCandidate(candidate)));
        } else {
            state.pending.push(candidate);
        }
    }

    fn open(&self, events: &EngineEvents) {
        let mut state = self.inner.lock();
        state.open = true;
        for candidate in std::mem::take(&mut state.pending) {
            events(EngineEvent::Transport(TransportEvent::LocalCandidate(candidate)));
        }
    }
}

enum StartFailure {
    Cancelled,
    Fatal(CallError),
}

struct Worker {
    deps: EngineDeps,
    role: Role,
    partner_id: String,
    events: EngineEvents,
    cancel: CancellationToken,
    gathering: GatheringGuard,
    progress: Progress,
    outbound: Arc<OutboundCandidates>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) {
        let mut handle = None;

        match self.prepare(&mut handle).await {
            Ok(()) => {
                // Nur der Transport wandert in die Schleife, der Handle bleibt hier
                let transport = handle.as_ref().and_then(NegotiationHandle::transport);
                if let Some(transport) = transport {
                    self.process(transport, &mut commands).await;
                }
            }
            Err(StartFailure::Cancelled) => {
                tracing::info!("Negotiation cancelled during start");
            }
            Err(StartFailure::Fatal(err)) => {
                tracing::error!("Negotiation failed: {}", err);
                (self.events)(EngineEvent::Failed(err));
            }
        }

        let had_resources = match handle.as_mut() {
            Some(h) => h.release().await,
            None => false,
        };
        tracing::info!("Negotiation handle released");
        (self.events)(EngineEvent::Released { had_resources });
    }

    /// Medien holen, Verbindung aufbauen, Gathering abwarten, ggf. Offer senden
    async fn prepare(
        &mut self,
        handle: &mut Option<NegotiationHandle>,
    ) -> Result<(), StartFailure> {
        let acquired = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StartFailure::Cancelled),
            result = self.deps.capture.acquire() => result,
        };
        let mut source = acquired.map_err(|e| StartFailure::Fatal(e.into()))?;

        let Some(claim) = self.deps.slot.try_claim() else {
            source.stop();
            return Err(StartFailure::Fatal(TransportError::HandleBusy.into()));
        };
        let label = source.label().to_string();
        let h = handle.insert(NegotiationHandle::new(source, claim));
        self.check_cancelled()?;

        let events = Arc::clone(&self.events);
        let outbound = Arc::clone(&self.outbound);
        let transport = self
            .deps
            .transports
            .create(Arc::new(move |ev| match ev {
                TransportEvent::LocalCandidate(candidate) => outbound.push(candidate, &events),
                other => events(EngineEvent::Transport(other)),
            }))
            .await
            .map_err(fatal)?;
        h.transport = Some(Arc::clone(&transport));
        self.check_cancelled()?;

        transport.attach_audio(&label).await.map_err(fatal)?;

        match self
            .gathering
            .settle(transport.gathering_complete(), &self.cancel)
            .await
        {
            GatherOutcome::Cancelled => return Err(StartFailure::Cancelled),
            GatherOutcome::Complete => tracing::debug!("ICE gathering complete"),
            GatherOutcome::TimedOut => tracing::info!("ICE gathering timed out, continuing"),
        }
        self.progress.gathering_settled = true;

        if self.role == Role::Initiator {
            let offer = transport.create_offer().await.map_err(fatal)?;
            self.check_cancelled()?;
            transport
                .set_local_description(offer.clone())
                .await
                .map_err(fatal)?;
            self.progress.local_set = true;
            self.check_cancelled()?;
            self.send_signal(SignalData::Description(offer));
            self.outbound.open(&self.events);
            tracing::info!("Offer sent to {}", self.partner_id);
        }

        Ok(())
    }

    /// Arbeitet eingehende Signale in Reihenfolge ab bis Stop oder Fehler
    async fn process(
        &mut self,
        transport: Arc<dyn PeerTransport>,
        commands: &mut mpsc::UnboundedReceiver<EngineCommand>,
    ) {
        loop {
            let cmd = tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = commands.recv() => cmd,
            };

            let result = match cmd {
                Some(EngineCommand::Remote(data)) => self.apply(transport.as_ref(), data).await,
                Some(EngineCommand::Malformed(err)) => Err(ProtocolError::Malformed(err).into()),
                Some(EngineCommand::Stop) | None => break,
            };

            if let Err(err) = result {
                if !self.absorb(err) {
                    break;
                }
            }

            if self.progress.local_set
                && self.progress.remote_set
                && self.progress.gathering_settled
                && !self.progress.established
            {
                self.progress.established = true;
                tracing::info!("Negotiation established with {}", self.partner_id);
                (self.events)(EngineEvent::Established);
            }
        }
    }

    /// Entscheidet ob ein Fehler die Session beendet
    ///
    /// Vor Abschluss des Handshakes ist jeder Description-Fehler fatal,
    /// danach wird die Nachricht nur verworfen. Ein zweites Offer bei
    /// gesetzter lokaler Description beendet die Session immer.
    fn absorb(&self, err: CallError) -> bool {
        let fatal = match &err {
            CallError::Protocol(ProtocolError::DuplicateOffer) if self.progress.local_set => true,
            CallError::Protocol(p) => !self.progress.established && p.concerns_description(),
            _ => !self.progress.established,
        };

        if fatal {
            tracing::error!("Fatal negotiation error: {}", err);
            (self.events)(EngineEvent::Failed(err));
            return false;
        }

        match err {
            CallError::Protocol(p) => {
                tracing::warn!("Dropping signal from {}: {}", self.partner_id, p);
                (self.events)(EngineEvent::Rejected(p));
            }
            other => tracing::warn!("Ignoring negotiation error: {}", other),
        }
        true
    }

    async fn apply(
        &mut self,
        transport: &dyn PeerTransport,
        data: SignalData,
    ) -> Result<(), CallError> {
        match data {
            SignalData::Description(desc) if desc.kind == SdpKind::Offer => {
                self.apply_offer(transport, desc).await
            }
            SignalData::Description(desc) => self.apply_answer(transport, desc).await,
            SignalData::Candidate { candidate } => {
                self.apply_candidate(transport, candidate).await;
                Ok(())
            }
        }
    }

    async fn apply_offer(
        &mut self,
        transport: &dyn PeerTransport,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.role != Role::Responder {
            return Err(ProtocolError::UnexpectedOffer(self.role).into());
        }
        if self.progress.local_set || self.progress.offers_applied > 0 {
            return Err(ProtocolError::DuplicateOffer.into());
        }
        self.progress.offers_applied += 1;

        transport
            .set_remote_description(offer)
            .await
            .map_err(|e| ProtocolError::DescriptionRejected(e.to_string()))?;
        self.progress.remote_set = true;
        self.flush_candidates(transport).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.progress.local_set = true;

        self.send_signal(SignalData::Description(answer));
        self.outbound.open(&self.events);
        tracing::info!("Answer sent to {}", self.partner_id);
        Ok(())
    }

    async fn apply_answer(
        &mut self,
        transport: &dyn PeerTransport,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.role != Role::Initiator {
            return Err(ProtocolError::UnexpectedAnswer(self.role).into());
        }
        if self.progress.answers_applied > 0 {
            return Err(ProtocolError::DuplicateAnswer.into());
        }
        self.progress.answers_applied += 1;

        transport
            .set_remote_description(answer)
            .await
            .map_err(|e| ProtocolError::DescriptionRejected(e.to_string()))?;
        self.progress.remote_set = true;
        self.flush_candidates(transport).await;
        Ok(())
    }

    /// Kandidaten vor der Remote Description werden gepuffert
    async fn apply_candidate(&mut self, transport: &dyn PeerTransport, candidate: IceCandidate) {
        if !self.progress.remote_set {
            tracing::debug!("Buffering remote candidate until remote description is set");
            self.progress.pending_candidates.push(candidate);
            return;
        }

        if let Err(e) = transport.add_ice_candidate(candidate).await {
            tracing::warn!("Failed to add ICE candidate: {}", e);
        }
    }

    async fn flush_candidates(&mut self, transport: &dyn PeerTransport) {
        for candidate in std::mem::take(&mut self.progress.pending_candidates) {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
    }

    fn send_signal(&self, data: SignalData) {
        let msg = ClientMessage::signal(self.partner_id.clone(), data);
        if let Err(e) = self.deps.sink.send(msg) {
            tracing::error!("Failed to send signal to {}: {}", self.partner_id, e);
        }
    }

    fn check_cancelled(&self) -> Result<(), StartFailure> {
        if self.cancel.is_cancelled() {
            Err(StartFailure::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn fatal(err: TransportError) -> StartFailure {
    StartFailure::Fatal(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::capture::CaptureError;
    use crate::testing::{FakeCapture, FakeTransportFactory, RecordingSink};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Rig {
        engine: NegotiationEngine,
        events: UnboundedReceiver<EngineEvent>,
        capture: Arc<FakeCapture>,
        transports: Arc<FakeTransportFactory>,
        sink: Arc<RecordingSink>,
        slot: HandleSlot,
    }

    fn rig() -> Rig {
        let capture = Arc::new(FakeCapture::new());
        let transports = Arc::new(FakeTransportFactory::new());
        let sink = Arc::new(RecordingSink::new());
        let slot = HandleSlot::new();
        let engine = NegotiationEngine::new(EngineDeps {
            capture: capture.clone(),
            transports: transports.clone(),
            sink: sink.clone(),
            slot: slot.clone(),
            gather_timeout: Duration::from_millis(3000),
        });
        Rig {
            engine,
            events: mpsc::unbounded_channel().1,
            capture,
            transports,
            sink,
            slot,
        }
    }

    fn start(rig: &mut Rig, role: Role) {
        let (tx, rx) = mpsc::unbounded_channel();
        rig.events = rx;
        rig.engine.start(
            role,
            "partner".into(),
            Arc::new(move |ev| {
                let _ = tx.send(ev);
            }),
        );
    }

    async fn next_engine_event(rx: &mut UnboundedReceiver<EngineEvent>) -> EngineEvent {
        loop {
            match rx.recv().await.expect("engine event") {
                EngineEvent::Transport(_) => continue,
                other => return other,
            }
        }
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_worker_future_is_send() {
        let deps = rig().engine.deps.clone();
        let worker = Worker {
            gathering: GatheringGuard::start(deps.gather_timeout),
            deps,
            role: Role::Initiator,
            partner_id: "partner".into(),
            events: Arc::new(|_| {}),
            cancel: CancellationToken::new(),
            progress: Progress::default(),
            outbound: Arc::default(),
        };
        let (_tx, rx) = mpsc::unbounded_channel();
        let fut = worker.run(rx);
        assert_send(&fut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_sends_single_offer() {
        let mut rig = rig();
        start(&mut rig, Role::Initiator);

        rig.sink.wait_for_offers(1).await;
        rig.engine
            .on_remote_signal(SignalData::Description(SessionDescription::answer("v=0 answer")));

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Established
        ));
        assert_eq!(rig.sink.offers_sent(), 1);
        assert_eq!(rig.sink.answers_sent(), 0);

        let transport = rig.transports.last().unwrap();
        assert_eq!(transport.attached(), vec!["fake-microphone".to_string()]);
        assert_eq!(transport.local_descriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_candidates_follow_the_offer() {
        let mut rig = rig();
        start(&mut rig, Role::Initiator);
        rig.sink.wait_for_offers(1).await;

        let candidate = loop {
            match rig.events.recv().await.expect("engine event") {
                EngineEvent::Transport(TransportEvent::LocalCandidate(c)) => break c,
                _ => continue,
            }
        };
        assert!(candidate.candidate.starts_with("candidate:"));
        assert!(matches!(
            rig.sink.sent().first(),
            Some(ClientMessage::Signal {
                data: SignalData::Description(_),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_answer_is_rejected_without_ending_session() {
        let mut rig = rig();
        start(&mut rig, Role::Initiator);
        rig.sink.wait_for_offers(1).await;

        let answer = SignalData::Description(SessionDescription::answer("v=0 answer"));
        rig.engine.on_remote_signal(answer.clone());
        rig.engine.on_remote_signal(answer);

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Established
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Rejected(ProtocolError::DuplicateAnswer)
        ));
        assert!(rig.engine.is_running());
        assert_eq!(rig.transports.last().unwrap().remote_descriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_answers_once_and_never_offers() {
        let mut rig = rig();
        start(&mut rig, Role::Responder);

        let offer = SignalData::Description(SessionDescription::offer("v=0 offer"));
        rig.engine.on_remote_signal(offer.clone());
        rig.engine.on_remote_signal(offer);

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Established
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Failed(CallError::Protocol(ProtocolError::DuplicateOffer))
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Released { had_resources: true }
        ));
        assert_eq!(rig.sink.offers_sent(), 0);
        assert_eq!(rig.sink.answers_sent(), 1);
        assert_eq!(rig.transports.last().unwrap().remote_descriptions(), 1);
        assert!(!rig.slot.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_to_initiator_during_handshake_is_fatal() {
        let mut rig = rig();
        start(&mut rig, Role::Initiator);
        rig.sink.wait_for_offers(1).await;

        rig.engine
            .on_remote_signal(SignalData::Description(SessionDescription::offer("v=0 glare")));

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Failed(CallError::Protocol(ProtocolError::UnexpectedOffer(
                Role::Initiator
            )))
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Released { had_resources: true }
        ));
        assert_eq!(rig.capture.released(), 1);
        assert!(!rig.slot.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_candidate_is_dropped() {
        let mut rig = rig();
        start(&mut rig, Role::Responder);

        rig.engine
            .on_malformed_signal(MalformedSignal::Payload("garbage".into()));
        rig.engine
            .on_remote_signal(SignalData::Description(SessionDescription::offer("v=0 offer")));

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Rejected(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Established
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidates_buffered_until_remote_description() {
        let mut rig = rig();
        start(&mut rig, Role::Responder);

        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.2 4000 typ host".into(),
            ..Default::default()
        };
        rig.engine.on_remote_signal(SignalData::Candidate {
            candidate: candidate.clone(),
        });
        rig.engine
            .on_remote_signal(SignalData::Description(SessionDescription::offer("v=0 offer")));

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Established
        ));
        let transport = rig.transports.last().unwrap();
        assert_eq!(transport.candidates(), vec![candidate]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_releases_once() {
        let mut rig = rig();
        start(&mut rig, Role::Responder);
        rig.transports.wait_for_created(1).await;

        assert!(rig.engine.stop());
        assert!(!rig.engine.stop());

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Released { had_resources: true }
        ));
        assert_eq!(rig.capture.acquired(), 1);
        assert_eq!(rig.capture.released(), 1);
        assert_eq!(rig.transports.last().unwrap().close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_creates_no_handle() {
        let mut rig = rig();
        rig.capture.fail_with(CaptureError::PermissionDenied);
        start(&mut rig, Role::Initiator);

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Failed(CallError::Permission(_))
        ));
        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Released {
                had_resources: false
            }
        ));
        assert_eq!(rig.transports.created(), 0);
        assert!(rig.sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_slot_refuses_second_handle() {
        let mut rig = rig();
        let _held = rig.slot.try_claim().unwrap();
        start(&mut rig, Role::Initiator);

        assert!(matches!(
            next_engine_event(&mut rig.events).await,
            EngineEvent::Failed(CallError::Transport(TransportError::HandleBusy))
        ));
        assert_eq!(rig.capture.acquired(), 1);
        assert_eq!(rig.capture.released(), 1);
        assert_eq!(rig.transports.created(), 0);
    }
}
