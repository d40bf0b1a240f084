//! Lifecycle Guard - Zeitgrenzen einer Session
//!
//! - Gathering Guard: ICE Gathering wartet höchstens `gather_timeout`
//!   ab `start()`, danach wird ohne vollständige Kandidaten weitergemacht.
//! - Duration Guard: beendet den Anruf sobald `now - startTime` das Limit
//!   erreicht. Die verstrichene Zeit wird bei jedem Tick neu berechnet,
//!   nicht aufsummiert.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// CLOCK
// ============================================================================

/// Wanduhr in Millisekunden seit Unix-Epoch
///
/// Der Startzeitpunkt kommt vom Server, daher wird gegen Wanduhrzeit
/// gerechnet.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ============================================================================
// GATHERING GUARD
// ============================================================================

/// Ergebnis des Wartens auf ICE Gathering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOutcome {
    Complete,
    /// Zeitlimit erreicht, es geht mit den bisherigen Kandidaten weiter
    TimedOut,
    Cancelled,
}

/// Einmaliger Timer ab dem Aufruf von `start()`
#[derive(Debug, Clone, Copy)]
pub struct GatheringGuard {
    deadline: Instant,
}

impl GatheringGuard {
    pub fn start(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    /// Wartet auf `gathering`, die Deadline oder Abbruch - was zuerst kommt
    pub async fn settle<F>(&self, gathering: F, cancel: &CancellationToken) -> GatherOutcome
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = cancel.cancelled() => GatherOutcome::Cancelled,
            _ = gathering => GatherOutcome::Complete,
            _ = tokio::time::sleep_until(self.deadline) => {
                tracing::debug!("ICE gathering not complete, proceeding with partial candidates");
                GatherOutcome::TimedOut
            }
        }
    }
}

// ============================================================================
// DURATION GUARD
// ============================================================================

/// Ergebnis eines Duration-Checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Running { elapsed_secs: u64 },
    /// Limit erreicht; wird pro Session genau einmal geliefert
    Expired { elapsed_secs: u64 },
    Inactive,
}

/// Begrenzt die Gesprächsdauer
#[derive(Debug)]
pub struct DurationGuard {
    start_time_ms: i64,
    limit: Duration,
    fired: bool,
    cancelled: bool,
    ticker: Option<JoinHandle<()>>,
}

impl DurationGuard {
    pub fn new(start_time_ms: i64, limit: Duration) -> Self {
        Self {
            start_time_ms,
            limit,
            fired: false,
            cancelled: false,
            ticker: None,
        }
    }

    /// Startet den Tick-Task; `on_tick` liefert `false` um ihn zu beenden
    pub fn arm<F>(&mut self, interval: Duration, on_tick: F)
    where
        F: Fn() -> bool + Send + 'static,
    {
        if let Some(old) = self.ticker.take() {
            old.abort();
        }
        self.ticker = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if !on_tick() {
                    break;
                }
            }
        }));
    }

    /// Verstrichene Sekunden, nie negativ
    pub fn elapsed_secs(&self, now_ms: i64) -> u64 {
        (now_ms.saturating_sub(self.start_time_ms).max(0) / 1000) as u64
    }

    pub fn check(&mut self, now_ms: i64) -> GuardVerdict {
        if self.cancelled || self.fired {
            return GuardVerdict::Inactive;
        }

        let elapsed_secs = self.elapsed_secs(now_ms);
        if elapsed_secs >= self.limit.as_secs() {
            self.fired = true;
            GuardVerdict::Expired { elapsed_secs }
        } else {
            GuardVerdict::Running { elapsed_secs }
        }
    }

    /// Stoppt den Tick-Task; weitere Checks liefern `Inactive`
    pub fn cancel(&mut self) {
        self.cancelled = true;
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.ticker.is_some() && !self.cancelled
    }
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn test_duration_guard_fires_exactly_once() {
        let mut guard = DurationGuard::new(T0, Duration::from_secs(900));

        assert_eq!(
            guard.check(T0 + 899_999),
            GuardVerdict::Running { elapsed_secs: 899 }
        );
        assert_eq!(
            guard.check(T0 + 900_000),
            GuardVerdict::Expired { elapsed_secs: 900 }
        );
        assert_eq!(guard.check(T0 + 901_000), GuardVerdict::Inactive);
        assert_eq!(guard.check(T0 + 2_000_000), GuardVerdict::Inactive);
    }

    #[test]
    fn test_duration_guard_recomputes_after_suspension() {
        let mut guard = DurationGuard::new(T0, Duration::from_secs(900));
        assert_eq!(guard.check(T0 + 5_000), GuardVerdict::Running { elapsed_secs: 5 });
        // Prozess war suspendiert: ein einziger Check reicht
        assert_eq!(
            guard.check(T0 + 1_000_000),
            GuardVerdict::Expired { elapsed_secs: 1000 }
        );
    }

    #[test]
    fn test_clock_skew_never_underflows() {
        let mut guard = DurationGuard::new(T0, Duration::from_secs(900));
        assert_eq!(guard.check(T0 - 5_000), GuardVerdict::Running { elapsed_secs: 0 });
    }

    #[test]
    fn test_cancelled_guard_never_fires() {
        let mut guard = DurationGuard::new(T0, Duration::from_secs(900));
        guard.cancel();
        assert_eq!(guard.check(T0 + 900_000), GuardVerdict::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_on_cancel() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut guard = DurationGuard::new(T0, Duration::from_secs(900));

        let counter = Arc::clone(&ticks);
        guard.arm(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        assert!(guard.is_armed());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "ticks: {seen}");

        guard.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_guard_times_out() {
        let guard = GatheringGuard::start(Duration::from_millis(3000));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let outcome = guard.settle(std::future::pending(), &cancel).await;

        assert_eq!(outcome, GatherOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_guard_completes_early() {
        let guard = GatheringGuard::start(Duration::from_millis(3000));
        let cancel = CancellationToken::new();

        let outcome = guard
            .settle(tokio::time::sleep(Duration::from_millis(10)), &cancel)
            .await;

        assert_eq!(outcome, GatherOutcome::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gathering_guard_cancelled() {
        let guard = GatheringGuard::start(Duration::from_millis(3000));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = guard.settle(std::future::pending(), &cancel).await;

        assert_eq!(outcome, GatherOutcome::Cancelled);
    }
}
