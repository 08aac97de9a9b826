//! Delayed one-shot work.
//!
//! All timers in the client (heartbeat, reconnect, rejoin, push timeouts)
//! are built on [`Scheduler`]. Production code runs on [`TokioScheduler`];
//! tests drive a [`ManualScheduler`] whose clock only moves when told to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Work to run once a delay has elapsed.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Schedules one-shot tasks.
///
/// Tasks run outside any lock held by the scheduler, so a task may schedule
/// or cancel further tasks.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: Task) -> TimerId;

    /// Cancel a task. Unknown or already fired ids are ignored.
    fn cancel(&self, id: TimerId);
}

// =============================================================================
// MANUAL SCHEDULER
// =============================================================================

/// Deterministic scheduler driven by a logical clock.
///
/// Nothing runs until [`advance`](Self::advance) moves the clock; due tasks
/// then run in deadline order, ties broken by scheduling order.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), Task>,
    deadlines: BTreeMap<u64, Duration>,
}

impl ManualScheduler {
    /// Create a scheduler with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current logical time.
    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.clock.lock().queue.len()
    }

    /// Delay until the next task is due, if any.
    pub fn next_due(&self) -> Option<Duration> {
        let clock = self.clock.lock();
        clock
            .queue
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_sub(clock.now))
    }

    /// Move the clock forward, running every task that falls due.
    ///
    /// Tasks scheduled by running tasks also run if they fall inside the window.
    pub fn advance(&self, by: Duration) {
        let target = self.clock.lock().now + by;
        loop {
            let task = {
                let mut clock = self.clock.lock();
                let due = clock
                    .queue
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        clock.now = key.0;
                        clock.deadlines.remove(&key.1);
                        clock.queue.remove(&key)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) -> TimerId {
        let mut clock = self.clock.lock();
        let id = clock.next_id;
        clock.next_id += 1;
        let deadline = clock.now + delay;
        clock.queue.insert((deadline, id), task);
        clock.deadlines.insert(id, deadline);
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let mut clock = self.clock.lock();
        if let Some(deadline) = clock.deadlines.remove(&id.0) {
            clock.queue.remove(&(deadline, id.0));
        }
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clock = self.clock.lock();
        f.debug_struct("ManualScheduler")
            .field("now", &clock.now)
            .field("pending", &clock.queue.len())
            .finish()
    }
}

// =============================================================================
// TOKIO SCHEDULER
// =============================================================================

#[cfg(feature = "runtime")]
pub use self::tokio_scheduler::TokioScheduler;

#[cfg(feature = "runtime")]
mod tokio_scheduler {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::runtime::Handle;
    use tokio::task::AbortHandle;

    use super::{Scheduler, Task, TimerId};

    /// Scheduler backed by tokio timers.
    ///
    /// Each task is a spawned sleep; cancelling aborts it.
    #[derive(Debug, Clone)]
    pub struct TokioScheduler {
        handle: Handle,
        next_id: Arc<AtomicU64>,
        tasks: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    }

    impl TokioScheduler {
        /// Create a scheduler on the given runtime.
        pub fn new(handle: Handle) -> Self {
            Self {
                handle,
                next_id: Arc::new(AtomicU64::new(0)),
                tasks: Arc::new(Mutex::new(HashMap::new())),
            }
        }

        /// Create a scheduler on the runtime of the calling task.
        ///
        /// Returns `None` outside a tokio runtime.
        pub fn current() -> Option<Self> {
            Handle::try_current().ok().map(Self::new)
        }

        /// Number of tasks waiting to run.
        pub fn pending(&self) -> usize {
            self.tasks.lock().len()
        }
    }

    impl Scheduler for TokioScheduler {
        fn schedule_once(&self, delay: Duration, task: Task) -> TimerId {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let tasks = Arc::clone(&self.tasks);

            // Hold the map while spawning so the task cannot deregister
            // itself before it has been registered.
            let mut registry = self.tasks.lock();
            let join = self.handle.spawn(async move {
                tokio::time::sleep(delay).await;
                if tasks.lock().remove(&id).is_some() {
                    task();
                }
            });
            registry.insert(id, join.abort_handle());
            TimerId(id)
        }

        fn cancel(&self, id: TimerId) {
            if let Some(handle) = self.tasks.lock().remove(&id.0) {
                handle.abort();
            }
        }
    }
}
