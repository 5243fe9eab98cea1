//! Per-document write-back state machine: trailing debounce with max wait.
//!
//! ```text
//!            trigger                     deadline reached
//!   Idle ───────────────► Pending ─────────────────────────► Flushing
//!    ▲                    │    ▲ trigger: push fire_at back      │
//!    │                    └────┘ (capped at since + max_wait)    │
//!    │                                                           │
//!    │   finished, no trigger while flushing                     │
//!    ├───────────────────────────────────────────────────────────┤
//!    │                                                           │
//!    │   finished, triggered while flushing: Pending again ──────┘
//! ```
//!
//! `gate` serializes flushes of one document; `Flushing` only ever exists
//! while the gate is held.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Debounce timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBackPolicy {
    /// Quiet period after the latest trigger
    pub wait: Duration,
    /// Upper bound from the first trigger of a burst
    pub max_wait: Duration,
}

impl Default for WriteBackPolicy {
    fn default() -> Self {
        Self {
            wait: Duration::from_millis(2000),
            max_wait: Duration::from_millis(10_000),
        }
    }
}

impl WriteBackPolicy {
    /// When a burst that started at `since` fires, given a trigger at `now`.
    pub fn fire_at(&self, since: Instant, now: Instant) -> Instant {
        (now + self.wait).min(since + self.max_wait)
    }
}

/// Observable phase of a document's write-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBackPhase {
    Idle,
    Pending {
        since: Instant,
        fire_at: Instant,
        epoch: u64,
    },
    Flushing {
        /// First and latest trigger seen while flushing
        retrigger: Option<(Instant, Instant)>,
    },
}

/// Outcome of [`WriteBack::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// New burst; the caller must start a timer for `epoch`.
    Armed { epoch: u64 },
    /// Existing timer's deadline moved.
    Extended,
    /// A flush is running; it re-arms when done.
    Retrigger,
}

/// Outcome of [`WriteBack::begin_flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStart {
    Started,
    /// The timer for this epoch must keep waiting.
    NotDue(Instant),
    /// Nothing pending, or the epoch was superseded.
    Nothing,
}

#[derive(Debug)]
struct State {
    phase: WriteBackPhase,
    next_epoch: u64,
}

impl State {
    fn arm(&mut self, since: Instant, fire_at: Instant) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.phase = WriteBackPhase::Pending { since, fire_at, epoch };
        epoch
    }
}

#[derive(Debug)]
pub struct WriteBack {
    state: Mutex<State>,
    gate: Mutex<()>,
}

impl Default for WriteBack {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBack {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: WriteBackPhase::Idle,
                next_epoch: 0,
            }),
            gate: Mutex::new(()),
        }
    }

    pub async fn phase(&self) -> WriteBackPhase {
        self.state.lock().await.phase
    }

    pub async fn is_idle(&self) -> bool {
        matches!(self.phase().await, WriteBackPhase::Idle)
    }

    /// Record a mutation at `now`.
    pub async fn trigger(&self, policy: &WriteBackPolicy, now: Instant) -> Trigger {
        let mut state = self.state.lock().await;
        match state.phase {
            WriteBackPhase::Idle => {
                let epoch = state.arm(now, policy.fire_at(now, now));
                Trigger::Armed { epoch }
            }
            WriteBackPhase::Pending { since, epoch, .. } => {
                state.phase = WriteBackPhase::Pending {
                    since,
                    fire_at: policy.fire_at(since, now),
                    epoch,
                };
                Trigger::Extended
            }
            WriteBackPhase::Flushing { retrigger } => {
                let since = retrigger.map_or(now, |(since, _)| since);
                state.phase = WriteBackPhase::Flushing {
                    retrigger: Some((since, now)),
                };
                Trigger::Retrigger
            }
        }
    }

    /// Current deadline for `epoch`, or `None` once it no longer applies.
    pub async fn deadline(&self, epoch: u64) -> Option<Instant> {
        match self.state.lock().await.phase {
            WriteBackPhase::Pending { fire_at, epoch: current, .. } if current == epoch => Some(fire_at),
            _ => None,
        }
    }

    /// Serialize flushes. Hold the returned guard from `begin_flush` to `finish_flush`.
    pub async fn lock_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Enter `Flushing`.
    ///
    /// With `Some(epoch)` (timer path) the pending burst must be that epoch
    /// and due at `now`. With `None` (explicit flush) any pending burst starts.
    pub async fn begin_flush(&self, epoch: Option<u64>, now: Instant) -> FlushStart {
        let mut state = self.state.lock().await;
        match (state.phase, epoch) {
            (WriteBackPhase::Pending { epoch: current, .. }, Some(expected)) if current != expected => {
                FlushStart::Nothing
            }
            (WriteBackPhase::Pending { fire_at, .. }, Some(_)) if fire_at > now => FlushStart::NotDue(fire_at),
            (WriteBackPhase::Pending { .. }, _) => {
                state.phase = WriteBackPhase::Flushing { retrigger: None };
                FlushStart::Started
            }
            _ => FlushStart::Nothing,
        }
    }

    /// Leave `Flushing`. Returns the epoch to arm a timer for when a
    /// trigger arrived during the flush.
    pub async fn finish_flush(&self, policy: &WriteBackPolicy) -> Option<u64> {
        let mut state = self.state.lock().await;
        match state.phase {
            WriteBackPhase::Flushing {
                retrigger: Some((since, latest)),
            } => Some(state.arm(since, policy.fire_at(since, latest))),
            _ => {
                state.phase = WriteBackPhase::Idle;
                None
            }
        }
    }
}
