//! MPP Session
//!
//! A session is one client's handle on a device. It tracks the tasks it
//! submitted that have not completed yet (`pending`) and the completed tasks
//! whose results have not been collected (`done`). The completed list is
//! bounded by `MppConfig::done_queue_capacity`; results arriving while it is
//! full are dropped and counted in [`Session::dropped_results`].

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::device::MppDevice;
use crate::task::{Task, TaskId, TaskState};
use crate::{MppError, MppResult};

pub type SessionId = u32;

/// Outcome of one task as seen by its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task: TaskId,
    pub output: MppResult<Vec<u8>>,
}

pub struct Session {
    id: SessionId,
    device: Arc<MppDevice>,
    pending: Mutex<Vec<Arc<Task>>>,
    done: Mutex<VecDeque<Arc<Task>>>,
    done_capacity: usize,
    dropped_results: AtomicU64,
    run_count: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    /// Open a session on `device`.
    pub fn open(device: &Arc<MppDevice>) -> Arc<Self> {
        let id = device.next_session_id();
        klog!(Debug, "[MPP] {}: session {} opened", device.name(), id);
        Arc::new(Self {
            id,
            device: device.clone(),
            pending: Mutex::new(Vec::new()),
            done: Mutex::new(VecDeque::new()),
            done_capacity: device.config().done_queue_capacity,
            dropped_results: AtomicU64::new(0),
            run_count: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &Arc<MppDevice> {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `request` for the hardware.
    pub fn submit(self: &Arc<Self>, request: &[u8]) -> MppResult<TaskId> {
        if self.is_closed() {
            return Err(MppError::SessionClosed);
        }
        self.device.submit(self, request)
    }

    /// Collect the oldest completed result, if any.
    ///
    /// The task's payload goes back to the driver once its result has been
    /// read.
    pub fn poll_result(&self) -> Option<TaskResult> {
        let task = self.done.lock().pop_front()?;

        let output = match task.error() {
            Some(err) => Err(err),
            None => self.device.ops().result(&task),
        };
        self.device.release_task(&task);
        task.set_state(TaskState::Freed);

        Some(TaskResult {
            task: task.id(),
            output,
        })
    }

    /// Spin until a result is available.
    ///
    /// Fails with [`MppError::NoTask`] when nothing is outstanding and with
    /// [`MppError::SessionClosed`] once the session is closed.
    pub fn wait_result(&self) -> MppResult<TaskResult> {
        loop {
            if let Some(result) = self.poll_result() {
                return Ok(result);
            }
            if self.is_closed() {
                return Err(MppError::SessionClosed);
            }
            {
                let pending = self.pending.lock();
                if pending.is_empty() && self.done.lock().is_empty() {
                    return Err(MppError::NoTask);
                }
            }
            core::hint::spin_loop();
        }
    }

    /// Close the session.
    ///
    /// Queued tasks are withdrawn, a task of this session that is on the
    /// hardware is aborted, and uncollected results are released. Returns the
    /// number of tasks discarded. Further submits fail with
    /// [`MppError::SessionClosed`].
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let pending = core::mem::take(&mut *self.pending.lock());
        let mut discarded = pending
            .iter()
            .filter(|task| self.device.discard(task))
            .count();

        let done: Vec<_> = self.done.lock().drain(..).collect();
        for task in &done {
            self.device.release_task(task);
            task.set_state(TaskState::Freed);
        }
        discarded += done.len();

        klog!(
            Debug,
            "[MPP] {}: session {} closed, {} tasks discarded",
            self.device.name(),
            self.id,
            discarded
        );
        discarded
    }

    /// Tasks submitted and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Results waiting to be collected.
    pub fn done_count(&self) -> usize {
        self.done.lock().len()
    }

    /// Results lost because the completed list was full.
    pub fn dropped_results(&self) -> u64 {
        self.dropped_results.load(Ordering::Relaxed)
    }

    /// Tasks of this session currently on the hardware.
    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::Acquire)
    }

    pub(crate) fn admit(&self) {
        self.run_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire(&self) {
        let _ = self
            .run_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn push_pending(&self, task: Arc<Task>) {
        self.pending.lock().push(task);
    }

    /// Move `task` from pending to done.
    pub(crate) fn complete(&self, task: &Arc<Task>) {
        let stored = {
            let mut pending = self.pending.lock();
            pending.retain(|t| !Arc::ptr_eq(t, task));

            let mut done = self.done.lock();
            if self.is_closed() || done.len() >= self.done_capacity {
                false
            } else {
                done.push_back(task.clone());
                true
            }
        };

        if !stored {
            if !self.is_closed() {
                self.dropped_results.fetch_add(1, Ordering::Relaxed);
                klog!(
                    Warn,
                    "[MPP] {}: session {} result queue full, task {} dropped",
                    self.device.name(),
                    self.id,
                    task.id()
                );
            }
            self.device.release_task(task);
            task.set_state(TaskState::Freed);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pending", &self.pending_count())
            .field("done", &self.done_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::testing::codec_device;
    use crate::MppConfig;
    use std::thread;

    fn complete_one(device: &MppDevice) {
        device.try_run().unwrap();
        assert!(device.irq(0));
        assert_eq!(device.run_work(), 1);
    }

    #[test]
    fn test_submit_and_poll() {
        let (codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);

        let id = session.submit(&[7]).unwrap();
        assert_eq!(session.pending_count(), 1);
        assert!(session.poll_result().is_none());

        complete_one(&device);
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.run_count(), 0);

        let result = session.poll_result().unwrap();
        assert_eq!(result.task, id);
        assert_eq!(result.output, Ok(alloc::vec![7, 0]));
        assert_eq!(codec.freed(), 1);
    }

    #[test]
    fn test_run_count_tracks_hardware_occupancy() {
        let (_codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);

        session.submit(&[1]).unwrap();
        assert_eq!(session.run_count(), 0);
        device.try_run().unwrap();
        assert_eq!(session.run_count(), 1);
        assert!(device.irq(0));
        assert_eq!(session.run_count(), 1);
        device.run_work();
        assert_eq!(session.run_count(), 0);

        let id = session.submit(&[2]).unwrap();
        device.try_run().unwrap();
        assert_eq!(session.run_count(), 1);
        assert_eq!(device.abort(), Some(id));
        assert_eq!(session.run_count(), 0);
    }

    #[test]
    fn test_rejects_bad_request() {
        let (_codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);
        assert_eq!(session.submit(&[]), Err(MppError::InvalidArgument));
        assert_eq!(session.pending_count(), 0);
        assert_eq!(device.service().pending_count(), 0);
    }

    #[test]
    fn test_done_queue_overflow_drops_results() {
        let config = MppConfig {
            done_queue_capacity: 2,
            ..MppConfig::default()
        };
        let (codec, device) = codec_device(config);
        let session = Session::open(&device);

        for label in 1..=3 {
            session.submit(&[label]).unwrap();
        }
        for _ in 0..3 {
            complete_one(&device);
        }

        assert_eq!(session.done_count(), 2);
        assert_eq!(session.dropped_results(), 1);
        assert_eq!(codec.freed(), 1);

        let labels: Vec<u8> = core::iter::from_fn(|| session.poll_result())
            .map(|r| r.output.unwrap()[0])
            .collect();
        assert_eq!(labels, [1, 2]);
    }

    #[test]
    fn test_wait_result_errors() {
        let (_codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);
        assert_eq!(session.wait_result(), Err(MppError::NoTask));

        session.close();
        assert_eq!(session.wait_result(), Err(MppError::SessionClosed));
        assert_eq!(session.submit(&[1]), Err(MppError::SessionClosed));
    }

    #[test]
    fn test_wait_result_across_threads() {
        let (_codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);
        let id = session.submit(&[5]).unwrap();

        let worker = {
            let device = device.clone();
            thread::spawn(move || complete_one(&device))
        };

        let result = session.wait_result().unwrap();
        worker.join().unwrap();
        assert_eq!(result.task, id);
        assert_eq!(result.output, Ok(alloc::vec![5, 0]));
    }

    #[test]
    fn test_close_discards_queued_and_completed() {
        let (codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);
        let other = Session::open(&device);

        session.submit(&[1]).unwrap();
        complete_one(&device);
        session.submit(&[2]).unwrap();
        session.submit(&[3]).unwrap();
        other.submit(&[4]).unwrap();

        assert_eq!(session.close(), 3);
        assert_eq!(session.close(), 0);
        assert_eq!(codec.freed(), 3);
        assert_eq!(device.service().pending_count(), 1);

        complete_one(&device);
        assert_eq!(other.poll_result().unwrap().output, Ok(alloc::vec![4, 0]));
    }

    #[test]
    fn test_close_aborts_own_running_task() {
        let (codec, device) = codec_device(MppConfig::default());
        let session = Session::open(&device);
        let other = Session::open(&device);

        session.submit(&[1]).unwrap();
        other.submit(&[2]).unwrap();
        device.try_run().unwrap();
        assert!(device.service().is_running());

        assert_eq!(session.close(), 1);
        assert!(!device.service().is_running());
        assert_eq!(codec.resets(), 1);

        complete_one(&device);
        assert_eq!(other.poll_result().unwrap().output, Ok(alloc::vec![2, 0]));
        assert_eq!(codec.overlaps(), 0);
    }
}
