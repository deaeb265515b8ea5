// Renewal scheduler
// Holds at most one renewal timer; every session change cancels before arming

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What a session change asks of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalPlan {
    /// No access token expiry: nothing to renew
    None,
    /// Already inside the safety margin
    Immediate,
    /// Renew after this delay
    After(Duration),
}

impl RenewalPlan {
    /// `deadline = expires_at - now - margin`
    pub fn compute(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>, margin: Duration) -> Self {
        let Some(expires_at) = expires_at else {
            return RenewalPlan::None;
        };

        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        match (expires_at - now - margin).to_std() {
            Ok(delay) if !delay.is_zero() => RenewalPlan::After(delay),
            _ => RenewalPlan::Immediate,
        }
    }

    /// Timer delay for this plan.
    ///
    /// An immediate plan produced by a renewal is held back by `min_interval`
    /// so a provider issuing short-lived tokens cannot drive a hot loop.
    pub fn delay(self, after_renewal: bool, min_interval: Duration) -> Option<Duration> {
        match self {
            RenewalPlan::None => None,
            RenewalPlan::Immediate if after_renewal => Some(min_interval),
            RenewalPlan::Immediate => Some(Duration::ZERO),
            RenewalPlan::After(delay) => Some(delay),
        }
    }
}

/// Timer state machine.
///
/// ```text
/// Idle   --arm-->          Armed(g)
/// Armed  --arm-->          Armed(g+1)   (previous task aborted)
/// Armed  --cancel-->       Idle         (task aborted)
/// Armed(g) --fire(g)-->    Firing(g)    (task detached, runs the renewal)
/// Firing --arm/cancel-->   Armed/Idle
/// Firing(g) --finish(g)--> Idle
/// ```
enum TimerState {
    Idle,
    Armed {
        generation: u64,
        due: Instant,
        handle: JoinHandle<()>,
    },
    Firing {
        generation: u64,
    },
}

pub(crate) struct RenewalScheduler {
    state: TimerState,
    generation: u64,
}

impl RenewalScheduler {
    pub fn new() -> Self {
        Self {
            state: TimerState::Idle,
            generation: 0,
        }
    }

    /// Cancel the armed timer, if any. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        match std::mem::replace(&mut self.state, TimerState::Idle) {
            TimerState::Armed {
                generation, handle, ..
            } => {
                handle.abort();
                tracing::debug!(generation, "Renewal timer cancelled");
                true
            }
            TimerState::Firing { .. } | TimerState::Idle => false,
        }
    }

    /// Cancel any previous timer, then arm a new one.
    ///
    /// `spawn` receives the new generation and the deadline, and must start
    /// a task that sleeps until that deadline; the task reports back through
    /// [`RenewalScheduler::begin_firing`].
    pub fn arm<F>(&mut self, delay: Duration, spawn: F) -> u64
    where
        F: FnOnce(u64, Instant) -> JoinHandle<()>,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let due = Instant::now() + delay;
        let handle = spawn(generation, due);
        self.state = TimerState::Armed {
            generation,
            due,
            handle,
        };
        tracing::debug!(generation, delay_ms = delay.as_millis() as u64, "Renewal timer armed");
        generation
    }

    /// Transition `Armed(g) -> Firing(g)`. A stale or cancelled timer gets `false`.
    pub fn begin_firing(&mut self, generation: u64) -> bool {
        let current = matches!(
            self.state,
            TimerState::Armed { generation: armed, .. } if armed == generation
        );
        if current {
            // Dropping the handle detaches the task that is calling us
            self.state = TimerState::Firing { generation };
        }
        current
    }

    /// Transition `Firing(g) -> Idle` when a renewal ends without rescheduling
    pub fn finish_firing(&mut self, generation: u64) {
        if matches!(self.state, TimerState::Firing { generation: firing } if firing == generation) {
            self.state = TimerState::Idle;
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TimerState::Armed { .. })
    }

    /// Time left before the armed timer fires
    pub fn due_in(&self) -> Option<Duration> {
        match &self.state {
            TimerState::Armed { due, .. } => Some(due.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
