//! Ordered Completion Work Queue
//!
//! The interrupt handler never harvests results itself; it queues the task
//! here and a worker thread later calls [`WorkQueue::run_pending`]. Items run
//! one at a time in queue order.
//!
//! [`WorkQueue::cancel_sync`] is the only way to cancel: it removes a queued
//! item, or waits for a running one to return. A caller about to free a
//! task uses it to make sure no worker still touches that task.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::task::{Task, TaskId};

/// `running` value while no item executes. Task ids start at 1.
const NO_WORK: TaskId = 0;

pub struct WorkQueue {
    name: &'static str,
    queued: Mutex<VecDeque<Arc<Task>>>,
    /// Id of the item being executed. Only written with `queued` held.
    running: AtomicU32,
    /// Held by the single active worker.
    worker: Mutex<()>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            queued: Mutex::new(VecDeque::new()),
            running: AtomicU32::new(NO_WORK),
            worker: Mutex::new(()),
        }
    }

    /// Queue completion work for `task`. Returns `false` if it is already
    /// queued.
    pub fn queue(&self, task: Arc<Task>) -> bool {
        let mut queued = self.queued.lock();
        if queued.iter().any(|t| Arc::ptr_eq(t, &task)) {
            return false;
        }
        queued.push_back(task);
        true
    }

    pub fn is_queued(&self, task: &Arc<Task>) -> bool {
        self.queued.lock().iter().any(|t| Arc::ptr_eq(t, task))
    }

    /// Worker side: run every queued item through `f`, oldest first.
    ///
    /// Returns the number of items run. If another worker is already
    /// draining the queue this returns 0 immediately.
    pub fn run_pending(&self, mut f: impl FnMut(&Arc<Task>)) -> usize {
        let Some(_worker) = self.worker.try_lock() else {
            return 0;
        };

        let mut count = 0;
        loop {
            let task = {
                let mut queued = self.queued.lock();
                let Some(task) = queued.pop_front() else {
                    break;
                };
                self.running.store(task.id(), Ordering::Release);
                task
            };

            f(&task);
            self.running.store(NO_WORK, Ordering::Release);
            count += 1;
        }

        if count > 0 {
            klog!(Trace, "[MPP] {}: ran {} work items", self.name, count);
        }
        count
    }

    /// Cancel work for `task` and wait until no worker runs it.
    ///
    /// Returns `true` if the item was still queued and has been removed,
    /// `false` if it was running (and has now finished) or was never queued.
    /// Must not be called from inside the item being cancelled.
    pub fn cancel_sync(&self, task: &Arc<Task>) -> bool {
        {
            let mut queued = self.queued.lock();
            if let Some(pos) = queued.iter().position(|t| Arc::ptr_eq(t, task)) {
                queued.remove(pos);
                return true;
            }
            if self.running.load(Ordering::Acquire) != task.id() {
                return false;
            }
        }

        while self.running.load(Ordering::Acquire) == task.id() {
            core::hint::spin_loop();
        }
        false
    }

    pub fn len(&self) -> usize {
        self.queued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Weak;
    use alloc::vec::Vec;
    use core::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn task(id: u32) -> Arc<Task> {
        Arc::new(Task::new(id, 1, Weak::new(), Box::new(())))
    }

    #[test]
    fn test_runs_in_order_once() {
        let wq = WorkQueue::new("test");
        let a = task(1);
        assert!(wq.queue(a.clone()));
        assert!(!wq.queue(a.clone()));
        assert!(wq.queue(task(2)));

        let mut seen = Vec::new();
        assert_eq!(wq.run_pending(|t| seen.push(t.id())), 2);
        assert_eq!(seen, [1, 2]);
        assert!(wq.is_empty());
        assert_eq!(wq.run_pending(|_| {}), 0);
    }

    #[test]
    fn test_cancel_queued_item() {
        let wq = WorkQueue::new("test");
        let a = task(1);
        wq.queue(a.clone());
        assert!(wq.cancel_sync(&a));
        assert!(!wq.is_queued(&a));
        assert!(!wq.cancel_sync(&a));
        assert_eq!(wq.run_pending(|_| panic!("cancelled item ran")), 0);
    }

    #[test]
    fn test_cancel_waits_for_running_item() {
        let wq = Arc::new(WorkQueue::new("test"));
        let a = task(1);
        wq.queue(a.clone());

        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let wq = wq.clone();
            let started = started.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                wq.run_pending(|_| {
                    started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(50));
                    finished.store(true, Ordering::SeqCst);
                })
            })
        };

        while !started.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        assert!(!wq.cancel_sync(&a));
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(worker.join().unwrap(), 1);
    }
}
