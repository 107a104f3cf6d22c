//! MPP Service Node
//!
//! One service fronts one physical codec block. It keeps the FIFO of tasks
//! waiting for the block and the single-flight gate that decides which task
//! owns it.
//!
//! # Gate
//!
//! The gate is the `current` slot. It is free when empty; [`wait_to_run`]
//! spins until it is free and then fills it. [`done`] and [`abort`] empty it.
//! Releasing on behalf of a task that is not current does nothing, so a late
//! or repeated release can never let two tasks onto the hardware.
//!
//! [`wait_to_run`]: MppService::wait_to_run
//! [`done`]: MppService::done
//! [`abort`]: MppService::abort

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::task::Task;

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Tasks handed to the hardware.
    pub dispatched: u64,
    /// Tasks that finished normally.
    pub completed: u64,
    /// Tasks dropped by abort, error status or dispatch failure.
    pub aborted: u64,
    /// Dispatch attempts deferred because the device was not powered.
    pub power_deferrals: u64,
    /// Tasks currently queued.
    pub pending: usize,
}

pub struct MppService {
    pending: Mutex<VecDeque<Arc<Task>>>,
    current: Mutex<Option<Arc<Task>>>,
    dispatched: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    power_deferrals: AtomicU64,
}

impl MppService {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            dispatched: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            power_deferrals: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Pending Queue
    // ========================================================================

    pub fn push_pending(&self, task: Arc<Task>) {
        self.pending.lock().push_back(task);
    }

    /// Put a task back at the head so it is the next one dispatched.
    pub fn requeue_front(&self, task: Arc<Task>) {
        self.pending.lock().push_front(task);
    }

    /// Oldest pending task, `None` when there is nothing to run.
    pub fn get_pending_task(&self) -> Option<Arc<Task>> {
        self.pending.lock().pop_front()
    }

    /// Drop `task` from the queue. Returns `false` if it was not queued.
    pub fn remove_pending(&self, task: &Arc<Task>) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|t| Arc::ptr_eq(t, task)) {
            Some(pos) => {
                pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ========================================================================
    // Gate
    // ========================================================================

    /// Block until the hardware is free, then record `task` as running.
    ///
    /// No timeout of its own: progress relies on the current task reaching
    /// [`done`](Self::done) or [`abort`](Self::abort).
    pub fn wait_to_run(&self, task: &Arc<Task>) {
        loop {
            if self.try_run(task) {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Non-blocking [`wait_to_run`](Self::wait_to_run).
    pub fn try_run(&self, task: &Arc<Task>) -> bool {
        let mut current = self.current.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(task.clone());
        true
    }

    /// Whether some task holds the gate.
    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn get_cur_task(&self) -> Option<Arc<Task>> {
        self.current.lock().clone()
    }

    pub fn is_current(&self, task: &Arc<Task>) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, task))
    }

    /// Release the gate held by `task`. Returns `false` (and leaves the gate
    /// alone) if `task` is not the current task.
    pub fn done(&self, task: &Arc<Task>) -> bool {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(cur) if Arc::ptr_eq(cur, task) => {
                *current = None;
                true
            }
            _ => {
                klog!(Warn, "[MPP] done for task {} which is not running", task.id());
                false
            }
        }
    }

    /// Release the gate on the abort path.
    ///
    /// With `Some(task)` this behaves like [`done`](Self::done). With `None`
    /// the gate is forced free whoever holds it, for recovery after the
    /// running task was already lost.
    pub fn abort(&self, task: Option<&Arc<Task>>) -> bool {
        let mut current = self.current.lock();
        match (task, current.as_ref()) {
            (Some(task), Some(cur)) if !Arc::ptr_eq(cur, task) => false,
            (_, None) => false,
            _ => {
                *current = None;
                true
            }
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub(crate) fn note_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_power_deferral(&self) {
        self.power_deferrals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            power_deferrals: self.power_deferrals.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

impl Default for MppService {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Weak;
    use core::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn task(id: u32) -> Arc<Task> {
        Arc::new(Task::new(id, 1, Weak::new(), Box::new(())))
    }

    #[test]
    fn test_pending_is_fifo() {
        let service = MppService::new();
        assert!(service.get_pending_task().is_none());

        for id in 1..=3 {
            service.push_pending(task(id));
        }
        let first = service.get_pending_task().unwrap();
        assert_eq!(first.id(), 1);
        service.requeue_front(first);

        let order: alloc::vec::Vec<_> =
            core::iter::from_fn(|| service.get_pending_task()).map(|t| t.id()).collect();
        assert_eq!(order, [1, 2, 3]);
    }

    #[test]
    fn test_remove_pending() {
        let service = MppService::new();
        let a = task(1);
        let b = task(2);
        service.push_pending(a.clone());
        service.push_pending(b.clone());

        assert!(service.remove_pending(&a));
        assert!(!service.remove_pending(&a));
        assert_eq!(service.pending_count(), 1);
        assert_eq!(service.get_pending_task().unwrap().id(), 2);
    }

    #[test]
    fn test_done_only_releases_current() {
        let service = MppService::new();
        let a = task(1);
        let b = task(2);

        assert!(!service.is_running());
        service.wait_to_run(&a);
        assert!(service.is_running());
        assert!(!service.try_run(&b));

        assert!(!service.done(&b));
        assert!(service.is_current(&a));
        assert!(service.done(&a));
        assert!(!service.is_running());

        // Repeated release does not over-signal.
        assert!(!service.done(&a));
        assert!(service.try_run(&b));
        assert!(!service.try_run(&a));
    }

    #[test]
    fn test_abort_without_task_forces_release() {
        let service = MppService::new();
        let a = task(1);
        service.wait_to_run(&a);

        assert!(!service.abort(Some(&task(9))));
        assert!(service.is_running());
        assert!(service.abort(None));
        assert!(!service.is_running());
        assert!(!service.abort(None));
    }

    fn blocked_waiter_released_by(release: fn(&MppService, &Arc<Task>)) {
        let service = Arc::new(MppService::new());
        let first = task(1);
        let second = task(2);
        service.wait_to_run(&first);

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let service = service.clone();
            let acquired = acquired.clone();
            let second = second.clone();
            thread::spawn(move || {
                service.wait_to_run(&second);
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        release(&service, &first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(service.is_current(&second));
    }

    #[test]
    fn test_done_unblocks_waiter() {
        blocked_waiter_released_by(|service, task| {
            service.done(task);
        });
    }

    #[test]
    fn test_abort_unblocks_waiter() {
        blocked_waiter_released_by(|service, task| {
            service.abort(Some(task));
        });
    }

    #[test]
    fn test_stats() {
        let service = MppService::new();
        service.push_pending(task(1));
        service.note_dispatched();
        service.note_power_deferral();
        let stats = service.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.power_deferrals, 1);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.pending, 1);
    }
}
