//! Maintenance scheduler
//!
//! A min-heap of `TimerEntry` ordered by deadline, drained by one
//! `sessmux-timer` thread that sleeps on a condvar until the earliest
//! deadline (or until a new entry / shutdown wakes it). Recurring entries
//! are re-armed after they fire.
//!
//! ```text
//!   schedule() ──push──► BinaryHeap ◄──take_expired()── sessmux-timer
//!                                                          │
//!                                            TimerCallback::on_timer(action)
//! ```

use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Clear the recently-invalidated identity set and release aged
    /// quarantined identities.
    ClearInvalidated,
    /// Log the server counters.
    ReportStats,
}

#[derive(Debug, Clone)]
pub struct TimerEntry {
    pub deadline: Instant,
    /// Re-arm interval; `None` fires once.
    pub recurrence: Option<Duration>,
    pub action: TimerAction,
    seq: u64,
}

impl TimerEntry {
    #[cfg(test)]
    pub fn once(action: TimerAction, after: Duration) -> Self {
        Self {
            deadline: Instant::now() + after,
            recurrence: None,
            action,
            seq: 0,
        }
    }

    pub fn periodic(action: TimerAction, interval: Duration) -> Self {
        Self {
            deadline: Instant::now() + interval,
            recurrence: Some(interval),
            action,
            seq: 0,
        }
    }

    /// Next occurrence of a recurring entry, counted from `fired_at`.
    pub fn reschedule(&self, fired_at: Instant) -> Option<Self> {
        self.recurrence.map(|interval| Self {
            deadline: fired_at + interval,
            recurrence: self.recurrence,
            action: self.action,
            seq: 0,
        })
    }
}

/// Min-heap ordering: earliest deadline first, insertion order on ties.
struct HeapEntry(TimerEntry);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.seq == other.0.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match other.0.deadline.cmp(&self.0.deadline) {
            std::cmp::Ordering::Equal => other.0.seq.cmp(&self.0.seq),
            ord => ord,
        }
    }
}

/// Receives fired timer actions on the timer thread.
pub trait TimerCallback: Send + Sync {
    fn on_timer(&self, action: TimerAction);
}

struct SchedState {
    heap: BinaryHeap<HeapEntry>,
    running: bool,
    next_seq: u64,
}

impl SchedState {
    fn push(&mut self, mut entry: TimerEntry) {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry(entry));
    }

    /// Pop every entry due at `now`, re-arming recurring ones.
    fn take_expired(&mut self, now: Instant) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while self.heap.peek().is_some_and(|e| e.0.deadline <= now) {
            let Some(HeapEntry(entry)) = self.heap.pop() else {
                break;
            };
            if let Some(next) = entry.reschedule(now) {
                self.push(next);
            }
            fired.push(entry.action);
        }
        fired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.0.deadline)
    }
}

struct SchedShared {
    state: Mutex<SchedState>,
    cond: Condvar,
}

/// Handle to the timer heap; cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedShared>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SchedShared {
                state: Mutex::new(SchedState {
                    heap: BinaryHeap::new(),
                    running: true,
                    next_seq: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn schedule(&self, entry: TimerEntry) {
        self.shared.state.lock().push(entry);
        self.shared.cond.notify_one();
    }

    /// Pop everything due at `now` without running it.
    #[cfg(test)]
    pub fn poll_expired(&self, now: Instant) -> Vec<TimerAction> {
        self.shared.state.lock().take_expired(now)
    }

    #[cfg(test)]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.state.lock().next_deadline()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the `sessmux-timer` thread.
    pub fn start<C>(&self, callback: Arc<C>) -> io::Result<JoinHandle<()>>
    where
        C: TimerCallback + 'static,
    {
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name("sessmux-timer".into())
            .spawn(move || timer_loop(&shared, &*callback))
    }

    /// Stop the timer thread after its current callback returns.
    pub fn shutdown(&self) {
        self.shared.state.lock().running = false;
        self.shared.cond.notify_all();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn timer_loop(shared: &SchedShared, callback: &dyn TimerCallback) {
    let mut state = shared.state.lock();
    while state.running {
        let fired = state.take_expired(Instant::now());
        if !fired.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for action in fired {
                    callback.on_timer(action);
                }
            });
            continue;
        }

        match state.next_deadline() {
            Some(deadline) => {
                shared.cond.wait_until(&mut state, deadline);
            }
            None => shared.cond.wait(&mut state),
        }
    }
    debug!("timer thread exiting");
}
