//! Readiness tracking for callback-style I/O.
//!
//! An endpoint registers a [`Target`] and flips its read/write flags from
//! whatever thread its completions arrive on. A worker thread blocks in
//! [`Selector::select`] until one of the requested targets becomes ready,
//! which is how `select()`-style blocking is emulated on top of a host API
//! that never blocks.

#[allow(unused_imports)]
use {
    crate::error::{Error, Result, TrapBug},
    log::{debug, error, info, log, trace, warn},
};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Compensates for a host platform bug where a timed condition wait could
/// report a timeout before the deadline. Harmless on a correct host; kept
/// switchable so it can be disabled there.
pub(crate) const PREMATURE_WAKE_RETRY: bool = true;
const PREMATURE_WAKE_PAUSE: Duration = Duration::from_millis(100);

/// Pseudo-descriptor identifying the signal endpoint's target. Out of the
/// issuance range of real descriptors.
pub const SIGNAL_ID: i32 = -1;

struct TargetState {
    id: i32,
    read: AtomicBool,
    write: AtomicBool,
}

struct Shared {
    // Incremented under the lock on every notification. A waiter that
    // observes a change knows a real notification arrived, as opposed to a
    // spurious wakeup.
    seq: Mutex<u64>,
    cond: Condvar,
    targets: Mutex<Vec<Weak<TargetState>>>,
    #[cfg(test)]
    notifications: std::sync::atomic::AtomicUsize,
}

impl Shared {
    fn notify(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq = seq.wrapping_add(1);
        #[cfg(test)]
        self.notifications.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
    }
}

/// Blocks a waiter until one of a requested set of [`Target`]s is ready.
pub struct Selector {
    shared: Arc<Shared>,
}

impl Selector {
    pub fn new() -> Self {
        Selector {
            shared: Arc::new(Shared {
                seq: Mutex::new(0),
                cond: Condvar::new(),
                targets: Mutex::new(Vec::new()),
                #[cfg(test)]
                notifications: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a new [`Target`] for an endpoint. The caller owns it; the
    /// selector keeps a registration for the target's lifetime. `id` is an
    /// opaque identifier, by convention the descriptor number.
    pub fn new_target(&self, id: i32) -> Target {
        let state = Arc::new(TargetState {
            id,
            read: AtomicBool::new(false),
            // Defaults to writable. Many targets never gate on writes.
            write: AtomicBool::new(true),
        });
        self.shared.targets.lock().unwrap().push(Arc::downgrade(&state));
        Target { state, shared: self.shared.clone() }
    }

    /// Returns the ids of the requested targets that are ready, waiting if
    /// none are. Without a timeout the wait lasts until the next
    /// notification, after which whatever is ready (possibly nothing) is
    /// reported. With a timeout the wait is repeated until a target becomes
    /// ready or the deadline passes, whichever is first.
    pub fn select(
        &self,
        read_targets: &[&Target],
        write_targets: &[&Target],
        timeout: Option<Duration>,
    ) -> Vec<i32> {
        // The absolute deadline is computed before taking the lock, so lock
        // contention does not extend the wait.
        let deadline = timeout.map(|t| Instant::now() + t);

        let read: Vec<&TargetState> =
            read_targets.iter().map(|t| t.state.as_ref()).collect();
        let write: Vec<&TargetState> =
            write_targets.iter().map(|t| t.state.as_ref()).collect();

        let mut seq = self.shared.seq.lock().unwrap();

        let ready = has_data(&read, &write);
        if !ready.is_empty() {
            return ready;
        }

        let Some(deadline) = deadline else {
            // Wait for one notification, then report whatever is ready.
            let waited_from = *seq;
            while *seq == waited_from {
                seq = self.shared.cond.wait(seq).unwrap();
            }
            return has_data(&read, &write);
        };

        loop {
            let now = Instant::now();
            let timed_out = if now >= deadline {
                true
            } else {
                let (guard, res) =
                    self.shared.cond.wait_timeout(seq, deadline - now).unwrap();
                seq = guard;
                res.timed_out()
            };

            let ready = has_data(&read, &write);
            if !ready.is_empty() {
                return ready;
            }
            if timed_out {
                if Instant::now() >= deadline || !PREMATURE_WAKE_RETRY {
                    return ready;
                }
                // Timed out before the wall-clock deadline. Pause and retry.
                drop(seq);
                std::thread::sleep(PREMATURE_WAKE_PAUSE);
                seq = self.shared.seq.lock().unwrap();
            }
        }
    }

    /// Like [`select`](Self::select), but considers every registered target
    /// for both readiness kinds.
    pub fn select_all(&self, timeout: Option<Duration>) -> Vec<i32> {
        let states: Vec<Arc<TargetState>> = self
            .shared
            .targets
            .lock()
            .unwrap()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let deadline = timeout.map(|t| Instant::now() + t);
        let refs: Vec<&TargetState> = states.iter().map(Arc::as_ref).collect();

        let mut seq = self.shared.seq.lock().unwrap();
        let ready = has_data(&refs, &refs);
        if !ready.is_empty() {
            return ready;
        }
        let Some(deadline) = deadline else {
            let waited_from = *seq;
            while *seq == waited_from {
                seq = self.shared.cond.wait(seq).unwrap();
            }
            return has_data(&refs, &refs);
        };
        loop {
            let now = Instant::now();
            let timed_out = if now >= deadline {
                true
            } else {
                let (guard, res) =
                    self.shared.cond.wait_timeout(seq, deadline - now).unwrap();
                seq = guard;
                res.timed_out()
            };
            let ready = has_data(&refs, &refs);
            if !ready.is_empty() {
                return ready;
            }
            if timed_out {
                if Instant::now() >= deadline || !PREMATURE_WAKE_RETRY {
                    return ready;
                }
                drop(seq);
                std::thread::sleep(PREMATURE_WAKE_PAUSE);
                seq = self.shared.seq.lock().unwrap();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn notification_count(&self) -> usize {
        self.shared.notifications.load(Ordering::Relaxed)
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        // Every target must be deregistered before the selector goes away.
        let live = self
            .shared
            .targets
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count();
        debug_assert_eq!(live, 0, "selector dropped with {live} live targets");
    }
}

fn has_data(read: &[&TargetState], write: &[&TargetState]) -> Vec<i32> {
    let mut ready = Vec::new();
    for t in read {
        if t.read.load(Ordering::SeqCst) && !ready.contains(&t.id) {
            ready.push(t.id);
        }
    }
    for t in write {
        if t.write.load(Ordering::SeqCst) && !ready.contains(&t.id) {
            ready.push(t.id);
        }
    }
    ready
}

/// Per-endpoint readiness record. The owning endpoint calls
/// [`update_read`](Target::update_read) or
/// [`update_write`](Target::update_write) whenever availability changes,
/// from any thread. Only a rising edge notifies the selector; repeating the
/// current state sends nothing.
pub struct Target {
    state: Arc<TargetState>,
    shared: Arc<Shared>,
}

impl Target {
    pub fn id(&self) -> i32 {
        self.state.id
    }

    pub fn update_read(&self, has_data: bool) {
        if self.state.read.swap(has_data, Ordering::SeqCst) != has_data && has_data {
            self.shared.notify();
        }
    }

    pub fn update_write(&self, has_data: bool) {
        if self.state.write.swap(has_data, Ordering::SeqCst) != has_data && has_data {
            self.shared.notify();
        }
    }

    pub fn has_read_data(&self) -> bool {
        self.state.read.load(Ordering::SeqCst)
    }

    pub fn has_write_data(&self) -> bool {
        self.state.write.load(Ordering::SeqCst)
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        let mut targets = self.shared.targets.lock().unwrap();
        targets.retain(|w| {
            w.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, &self.state))
        });
    }
}
