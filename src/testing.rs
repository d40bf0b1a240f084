//! Test-Doubles für Signal-Kanal, Capture, Transport und Uhr
//!
//! Alle Fakes zählen ihre Aufrufe, damit Tests Acquire/Release-Paare und
//! gesendete Nachrichten prüfen können.

use crate::call_engine::{
    AudioSource, CaptureError, Clock, MediaCapture, PeerTransport, TransportError,
    TransportEvent, TransportEvents, TransportFactory,
};
use crate::signaling::{
    ClientMessage, IceCandidate, SdpKind, SessionDescription, SignalData, SignalSink,
    SignalingError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(5);

// ============================================================================
// SIGNAL SINK
// ============================================================================

/// Zeichnet alle ausgehenden Nachrichten auf
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<ClientMessage>>,
    offline: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simuliert einen getrennten Kanal
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    fn count(&self, pred: impl Fn(&ClientMessage) -> bool) -> usize {
        self.sent.lock().iter().filter(|m| pred(m)).count()
    }

    fn count_descriptions(&self, kind: SdpKind) -> usize {
        self.count(|m| {
            matches!(m, ClientMessage::Signal { data: SignalData::Description(d), .. } if d.kind == kind)
        })
    }

    pub fn offers_sent(&self) -> usize {
        self.count_descriptions(SdpKind::Offer)
    }

    pub fn answers_sent(&self) -> usize {
        self.count_descriptions(SdpKind::Answer)
    }

    pub fn candidates_sent(&self) -> usize {
        self.count(|m| {
            matches!(
                m,
                ClientMessage::Signal {
                    data: SignalData::Candidate { .. },
                    ..
                }
            )
        })
    }

    pub fn find_partner_requests(&self) -> usize {
        self.count(|m| matches!(m, ClientMessage::FindPartner))
    }

    pub fn leave_calls(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::LeaveCall { to } => Some(to.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn wait_for_offers(&self, n: usize) {
        while self.offers_sent() < n {
            tokio::time::sleep(POLL).await;
        }
    }

    pub async fn wait_for_answers(&self, n: usize) {
        while self.answers_sent() < n {
            tokio::time::sleep(POLL).await;
        }
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(msg);
        Ok(())
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Capture mit zählbaren Acquire/Release-Aufrufen
#[derive(Debug, Default)]
pub struct FakeCapture {
    acquired: AtomicUsize,
    released: Arc<AtomicUsize>,
    failure: Mutex<Option<CaptureError>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alle folgenden `acquire()` Aufrufe schlagen fehl
    pub fn fail_with(&self, err: CaptureError) {
        *self.failure.lock() = Some(err);
    }

    /// Simuliert einen langsamen Berechtigungsdialog
    pub fn delay_acquire(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self) -> Result<Box<dyn AudioSource>, CaptureError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failure.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }

        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            live: true,
            released: Arc::clone(&self.released),
        }))
    }
}

#[derive(Debug)]
struct FakeSource {
    live: bool,
    released: Arc<AtomicUsize>,
}

impl AudioSource for FakeSource {
    fn label(&self) -> &str {
        "fake-microphone"
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Verhalten von `gathering_complete()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatheringMode {
    #[default]
    Immediate,
    /// Gathering meldet nie Abschluss (Guard muss greifen)
    Never,
}

/// Factory für `FakeTransport`s
#[derive(Default)]
pub struct FakeTransportFactory {
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    gathering: Mutex<GatheringMode>,
    fail_create: AtomicBool,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gathering(&self, mode: GatheringMode) {
        *self.gathering.lock() = mode;
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().last().cloned()
    }

    pub async fn wait_for_created(&self, n: usize) {
        while self.created() < n {
            tokio::time::sleep(POLL).await;
        }
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::WebRTC("fake create failure".into()));
        }

        let transport = Arc::new(FakeTransport {
            events,
            gathering: *self.gathering.lock(),
            state: Mutex::new(FakeState::default()),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[derive(Debug, Default)]
struct FakeState {
    attached: Vec<String>,
    local: Vec<SessionDescription>,
    remote: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    close_calls: usize,
}

/// Peer Connection ohne Netzwerk
///
/// SDPs müssen mit `v=0` beginnen, sonst gilt die Description als kaputt.
/// Nach `set_local_description` wird ein lokaler Kandidat gemeldet.
pub struct FakeTransport {
    events: TransportEvents,
    gathering: GatheringMode,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    /// Meldet ein Event wie es der echte Transport tun würde
    pub fn emit(&self, event: TransportEvent) {
        (self.events)(event);
    }

    pub fn attached(&self) -> Vec<String> {
        self.state.lock().attached.clone()
    }

    pub fn local_descriptions(&self) -> usize {
        self.state.lock().local.len()
    }

    pub fn remote_descriptions(&self) -> usize {
        self.state.lock().remote.len()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

fn validate(desc: &SessionDescription) -> Result<(), TransportError> {
    if desc.sdp.starts_with("v=0") {
        Ok(())
    } else {
        Err(TransportError::InvalidSdp(desc.sdp.clone()))
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn attach_audio(&self, label: &str) -> Result<(), TransportError> {
        self.state.lock().attached.push(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer("v=0 fake offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.state.lock().remote.is_empty() {
            return Err(TransportError::WebRTC("no remote offer".into()));
        }
        Ok(SessionDescription::answer("v=0 fake answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        validate(&desc)?;
        let n = {
            let mut state = self.state.lock();
            state.local.push(desc);
            state.local.len()
        };
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        validate(&desc)?;
        self.state.lock().remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn gathering_complete(&self) {
        match self.gathering {
            GatheringMode::Immediate => {}
            GatheringMode::Never => std::future::pending::<()>().await,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}

// ============================================================================
// CLOCK
// ============================================================================

/// Manuell gestellte Wanduhr
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
