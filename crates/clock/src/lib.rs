//! Clock abstraction for components that need periodic ticks.
//!
//! Production code uses [`SystemClock`], which is backed by tokio timers.
//! Tests use [`ManualClock`], which only advances when told to and delivers
//! every tick a real clock would have delivered in between, so schedules that
//! depend on catch-up behaviour stay deterministic.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Source of time and periodic tickers.
///
/// Implementations must be cheap to query; `now` is called on hot paths.
pub trait Clock: Debug + Send + Sync + 'static {
    /// Current instant according to this clock.
    fn now(&self) -> Instant;

    /// Create a ticker firing every `period`, starting one period from now.
    ///
    /// Must be called from within a tokio runtime.
    fn ticker(&self, period: Duration) -> Ticker;
}

/// Receiving half of a periodic tick schedule.
///
/// Each tick carries the instant it was due at, which for a [`ManualClock`]
/// may lag far behind the clock's current time when a large advance delivers
/// several ticks at once.
#[derive(Debug)]
pub struct Ticker {
    rx: mpsc::UnboundedReceiver<Instant>,
}

impl Ticker {
    /// Wait for the next tick. Returns `None` once the clock is gone.
    pub async fn tick(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }
}

/// Wall-clock time backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Instant::now()).is_err() {
                    break;
                }
            }
        });
        Ticker { rx }
    }
}

#[derive(Debug)]
struct ManualTicker {
    period: Duration,
    /// Offset from the clock's start at which the next tick is due.
    next: Duration,
    tx: mpsc::UnboundedSender<Instant>,
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    tickers: Vec<ManualTicker>,
}

/// A clock that only moves when [`advance`](ManualClock::advance) is called.
///
/// Advancing by `n` periods delivers `n` ticks, each stamped with the instant
/// it was due at, in order. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            state: Arc::new(Mutex::new(ManualState {
                offset: Duration::ZERO,
                tickers: Vec::new(),
            })),
        }
    }

    /// Move time forward, delivering every tick that became due.
    pub fn advance(&self, d: Duration) {
        let mut state = self.state.lock();
        state.offset += d;
        let now = state.offset;
        let start = self.start;
        state.tickers.retain_mut(|t| {
            while t.next <= now {
                if t.tx.send(start + t.next).is_err() {
                    return false;
                }
                t.next += t.period;
            }
            true
        });
    }

    /// Duration elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + self.state.lock().offset
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let next = state.offset + period;
        state.tickers.push(ManualTicker { period, next, tx });
        Ticker { rx }
    }
}
