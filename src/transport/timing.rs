//! Backoff schedules and the timers built on them.
//!
//! - [`Backoff`] maps an attempt number to a delay.
//! - [`TimeoutTimer`] fires a callback once per scheduling, with the delay
//!   growing as attempts accumulate. Used for reconnects and rejoins.
//! - [`HeartbeatTimer`] fires a callback at a fixed interval until stopped.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::scheduler::{Scheduler, TimerId};
use crate::core::{REJOIN_FALLBACK, REJOIN_STEPS, RECONNECT_FALLBACK, RECONNECT_STEPS};

/// Callback fired by a timer.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

// =============================================================================
// BACKOFF
// =============================================================================

/// Delay schedule keyed by attempt number.
///
/// Attempts are 1-based; an attempt of 0 is treated as 1.
#[derive(Clone)]
pub struct Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl Backoff {
    /// Walk through `steps`, then stay at `fallback`.
    pub fn stepped(steps: &[Duration], fallback: Duration) -> Self {
        let steps = steps.to_vec();
        Self(Arc::new(move |tries| {
            let index = tries.max(1) as usize - 1;
            steps.get(index).copied().unwrap_or(fallback)
        }))
    }

    /// Same delay for every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self(Arc::new(move |_| delay))
    }

    /// Arbitrary schedule.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Socket reconnect schedule: 10ms ramping to 2s, then 5s.
    pub fn reconnect_default() -> Self {
        Self::stepped(&RECONNECT_STEPS, RECONNECT_FALLBACK)
    }

    /// Channel rejoin schedule: 1s, 2s, 5s, then 10s.
    pub fn rejoin_default() -> Self {
        Self::stepped(&REJOIN_STEPS, REJOIN_FALLBACK)
    }

    /// Delay for the given attempt.
    pub fn delay(&self, tries: u32) -> Duration {
        (self.0)(tries.max(1))
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backoff")
            .field(&self.delay(1))
            .field(&self.delay(2))
            .field(&"..")
            .finish()
    }
}

// =============================================================================
// TIMEOUT TIMER
// =============================================================================

/// One-shot timer with a growing delay.
///
/// Each [`schedule_timeout`](Self::schedule_timeout) replaces any pending
/// fire. When the timer fires, the attempt counter is incremented before the
/// callback runs, so the next scheduling uses the next backoff step.
/// [`reset`](Self::reset) cancels and returns to the first step.
pub struct TimeoutTimer {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    scheduler: Arc<dyn Scheduler>,
    backoff: Backoff,
    callback: TimerCallback,
    state: Mutex<TimeoutState>,
}

#[derive(Default)]
struct TimeoutState {
    tries: u32,
    pending: Option<TimerId>,
    generation: u64,
}

impl TimeoutTimer {
    /// Create an idle timer.
    pub fn new(scheduler: Arc<dyn Scheduler>, backoff: Backoff, callback: TimerCallback) -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                scheduler,
                backoff,
                callback,
                state: Mutex::new(TimeoutState::default()),
            }),
        }
    }

    /// Schedule the callback after the delay for the next attempt.
    pub fn schedule_timeout(&self) {
        let mut state = self.inner.state.lock();
        if let Some(id) = state.pending.take() {
            self.inner.scheduler.cancel(id);
        }
        state.generation = state.generation.wrapping_add(1);

        let generation = state.generation;
        let delay = self.inner.backoff.delay(state.tries.saturating_add(1));
        let weak = Arc::downgrade(&self.inner);
        let id = self
            .inner
            .scheduler
            .schedule_once(delay, Box::new(move || Self::fire(&weak, generation)));
        state.pending = Some(id);
    }

    /// Cancel any pending fire and go back to the first attempt.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.tries = 0;
        state.generation = state.generation.wrapping_add(1);
        if let Some(id) = state.pending.take() {
            self.inner.scheduler.cancel(id);
        }
    }

    /// Number of times the timer has fired since the last reset.
    pub fn tries(&self) -> u32 {
        self.inner.state.lock().tries
    }

    /// Check if a fire is pending.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    fn fire(weak: &Weak<TimeoutInner>, generation: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.pending = None;
            state.tries = state.tries.saturating_add(1);
        }
        (inner.callback)();
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        if let Some(id) = self.inner.state.lock().pending.take() {
            self.inner.scheduler.cancel(id);
        }
    }
}

impl fmt::Debug for TimeoutTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TimeoutTimer")
            .field("tries", &state.tries)
            .field("pending", &state.pending.is_some())
            .finish()
    }
}

// =============================================================================
// HEARTBEAT TIMER
// =============================================================================

/// Fixed-interval repeating timer.
pub struct HeartbeatTimer {
    inner: Arc<HeartbeatInner>,
}

struct HeartbeatInner {
    scheduler: Arc<dyn Scheduler>,
    interval: Duration,
    state: Mutex<HeartbeatState>,
}

#[derive(Default)]
struct HeartbeatState {
    generation: u64,
    timer: Option<TimerId>,
    handler: Option<TimerCallback>,
}

impl HeartbeatTimer {
    /// Create a stopped timer.
    pub fn new(scheduler: Arc<dyn Scheduler>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                scheduler,
                interval,
                state: Mutex::new(HeartbeatState::default()),
            }),
        }
    }

    /// Tick interval.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Start ticking, replacing any previous handler.
    ///
    /// A zero interval leaves the timer stopped.
    pub fn start(&self, handler: TimerCallback) {
        let mut state = self.inner.state.lock();
        if let Some(id) = state.timer.take() {
            self.inner.scheduler.cancel(id);
        }
        state.generation = state.generation.wrapping_add(1);
        if self.inner.interval.is_zero() {
            state.handler = None;
            return;
        }
        state.handler = Some(handler);
        let generation = state.generation;
        state.timer = Some(Self::arm(&self.inner, generation));
    }

    /// Stop ticking. Safe to call when already stopped.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.handler = None;
        if let Some(id) = state.timer.take() {
            self.inner.scheduler.cancel(id);
        }
    }

    /// Check if the timer is ticking.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().handler.is_some()
    }

    fn arm(inner: &Arc<HeartbeatInner>, generation: u64) -> TimerId {
        let weak = Arc::downgrade(inner);
        inner
            .scheduler
            .schedule_once(inner.interval, Box::new(move || Self::tick(&weak, generation)))
    }

    fn tick(weak: &Weak<HeartbeatInner>, generation: u64) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let handler = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            let Some(handler) = state.handler.clone() else {
                return;
            };
            state.timer = Some(Self::arm(&inner, generation));
            handler
        };
        handler();
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("interval", &self.inner.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
