//! Clocks injected into the graph.
//!
//! Calculators read time through `CalculatorContext::clock`. Executor threads
//! report when they start and finish a job so `SimulationClock` can tell when
//! every thread is idle or asleep and time may jump forward.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::time::Duration;

/// Source of wall time for calculators and the profiler.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn sleep(&self, duration: Duration);

    /// An executor thread began running a job.
    fn thread_start(&self) {}

    /// An executor thread finished running a job.
    fn thread_finish(&self) {}
}

/// Real time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

struct SimulationState {
    now: DateTime<Utc>,
    active_threads: usize,
    wakeups: BinaryHeap<Reverse<DateTime<Utc>>>,
}

/// Virtual time that advances only while no executor thread is running.
///
/// A sleeping thread does not count as running. When the last running thread
/// finishes or sleeps, time jumps to the earliest pending wake-up.
pub struct SimulationClock {
    state: Mutex<SimulationState>,
    changed: Condvar,
}

impl SimulationClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(SimulationState {
                now: start,
                active_threads: 0,
                wakeups: BinaryHeap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// A clock starting at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now))
    }

    /// Threads currently inside a job and not asleep.
    pub fn active_threads(&self) -> usize {
        self.state.lock().active_threads
    }

    fn try_advance(&self, state: &mut SimulationState) {
        if state.active_threads > 0 {
            return;
        }
        if let Some(Reverse(next)) = state.wakeups.pop() {
            if next > state.now {
                state.now = next;
            }
            self.changed.notify_all();
        }
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::at_epoch()
    }
}

impl Clock for SimulationClock {
    fn now(&self) -> DateTime<Utc> {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        let step = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX);
        let wake_at = state.now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.wakeups.push(Reverse(wake_at));
        let counted = state.active_threads > 0;
        if counted {
            state.active_threads -= 1;
        }
        self.try_advance(&mut state);
        while state.now < wake_at {
            self.changed.wait(&mut state);
        }
        if counted {
            state.active_threads += 1;
        }
    }

    fn thread_start(&self) {
        self.state.lock().active_threads += 1;
    }

    fn thread_finish(&self) {
        let mut state = self.state.lock();
        state.active_threads = state.active_threads.saturating_sub(1);
        self.try_advance(&mut state);
    }
}
