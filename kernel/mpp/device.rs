//! MPP Device Core
//!
//! Ties a codec driver, its power reference, its translation unit and the
//! service node together and drives tasks through their lifecycle.
//!
//! # Dispatch
//!
//! [`MppDevice::try_run`] pops the oldest pending task and blocks on the
//! service gate. Popping and waiting happen under the `dispatch` lock, so
//! concurrent dispatchers still hand the hardware out in submission order.
//!
//! # Completion
//!
//! [`MppDevice::irq`] only latches the status and queues the task on the
//! work queue. [`MppDevice::run_work`] (worker context) harvests the
//! registers, drops the power reference, releases the gate and delivers the
//! task to its session.
//!
//! # Recovery
//!
//! [`MppDevice::abort`] pulls the running task off the hardware, waits for
//! its completion work to be cancelled, resets the block and only then
//! releases the gate. The reset detaches the translation unit from its
//! domain around the codec reset and reattaches it afterwards.
//! [`MppDevice::abort_task`] names the task it means to abort, so a caller
//! holding a stale task cannot take down its successor. Session close and
//! [`MppDevice::check_timeout`], the watchdog, go through it.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use sysmmu::{Domain, SysMmu};

use crate::ops::{AlwaysOn, MppDevOps, PowerDomain};
use crate::service::MppService;
use crate::session::{Session, SessionId};
use crate::task::{Task, TaskId, TaskState};
use crate::workqueue::WorkQueue;
use crate::{MppConfig, MppError, MppResult};

struct IommuBinding {
    domain: Arc<Domain>,
    client: Arc<SysMmu>,
}

/// Running task the watchdog is timing.
#[derive(Clone, Copy)]
struct Watch {
    task: TaskId,
    since_ms: u64,
}

pub struct MppDevice {
    name: String,
    ops: Arc<dyn MppDevOps>,
    power: Arc<dyn PowerDomain>,
    iommu: Option<IommuBinding>,
    config: MppConfig,
    service: MppService,
    work: WorkQueue,
    /// Serializes pop + gate acquisition.
    dispatch: Mutex<()>,
    watch: Mutex<Option<Watch>>,
    next_task_id: AtomicU32,
    next_session_id: AtomicU32,
    resets: AtomicU64,
}

impl MppDevice {
    pub fn new(name: &str, ops: Arc<dyn MppDevOps>, config: MppConfig) -> Self {
        Self {
            name: String::from(name),
            ops,
            power: Arc::new(AlwaysOn),
            iommu: None,
            config,
            service: MppService::new(),
            work: WorkQueue::new("mpp_done"),
            dispatch: Mutex::new(()),
            watch: Mutex::new(None),
            next_task_id: AtomicU32::new(1),
            next_session_id: AtomicU32::new(1),
            resets: AtomicU64::new(0),
        }
    }

    pub fn with_power(mut self, power: Arc<dyn PowerDomain>) -> Self {
        self.power = power;
        self
    }

    /// Put the codec behind `client` and attach it to `domain`.
    pub fn with_iommu(mut self, domain: Arc<Domain>, client: Arc<SysMmu>) -> MppResult<Self> {
        domain.attach_device(&client)?;
        self.iommu = Some(IommuBinding { domain, client });
        Ok(self)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn config(&self) -> &MppConfig {
        &self.config
    }

    #[inline]
    pub fn service(&self) -> &MppService {
        &self.service
    }

    /// Hardware resets performed so far.
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    pub(crate) fn ops(&self) -> &dyn MppDevOps {
        self.ops.as_ref()
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Submission and Dispatch
    // ========================================================================

    /// Turn `request` into a task and queue it on `session` and the service.
    pub fn submit(&self, session: &Arc<Session>, request: &[u8]) -> MppResult<TaskId> {
        let data = self.ops.alloc_task(session, request)?;
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(Task::new(id, session.id(), Arc::downgrade(session), data));

        session.push_pending(task.clone());
        task.set_state(TaskState::Pending);
        self.service.push_pending(task);

        klog!(Trace, "[MPP] {}: task {} queued by session {}", self.name, id, session.id());
        Ok(id)
    }

    /// Dispatch the oldest pending task.
    ///
    /// Blocks while another task owns the hardware. Returns `Ok(None)` when
    /// nothing is queued. If the block is not powered the task goes back to
    /// the head of the queue and [`MppError::PowerUnavailable`] is returned;
    /// after `power_retry_limit` deferrals the task is failed instead.
    pub fn try_run(&self) -> MppResult<Option<TaskId>> {
        let _dispatch = self.dispatch.lock();

        let Some(task) = self.service.get_pending_task() else {
            return Ok(None);
        };
        self.service.wait_to_run(&task);

        if !self.power.get_if_in_use() {
            self.service.abort(Some(&task));
            self.service.note_power_deferral();
            let retries = task.note_power_retry();

            if retries > self.config.power_retry_limit {
                klog!(
                    Error,
                    "[MPP] {}: task {} dropped after {} power deferrals",
                    self.name,
                    task.id(),
                    retries
                );
                if task.transition(&[TaskState::Pending], TaskState::Aborted) {
                    task.set_error(MppError::PowerUnavailable);
                    self.release_task(&task);
                    self.service.note_aborted();
                    self.deliver(&task);
                }
            } else if task.state() == TaskState::Pending {
                klog!(Warn, "[MPP] {}: not powered, task {} deferred", self.name, task.id());
                self.service.requeue_front(task);
            }
            return Err(MppError::PowerUnavailable);
        }

        // Counted before the task becomes visible as running, so an abort
        // racing with the start retires a count that is already there.
        if let Some(session) = task.session() {
            session.admit();
        }
        if !task.transition(&[TaskState::Pending], TaskState::Running) {
            // Withdrawn by a session close while we waited for the gate.
            self.retire(&task);
            self.power.put();
            self.service.done(&task);
            return Ok(None);
        }

        let started = self.ops.prepare(&task).and_then(|()| self.ops.run(&task));
        if let Err(err) = started {
            klog!(Error, "[MPP] {}: task {} failed to start: {}", self.name, task.id(), err);
            if task.transition(&[TaskState::Running], TaskState::Aborted) {
                task.set_error(err);
                self.power.put();
                self.release_task(&task);
                self.retire(&task);
                self.service.done(&task);
                self.service.note_aborted();
                self.deliver(&task);
            }
            return Err(err);
        }

        self.service.note_dispatched();
        klog!(Trace, "[MPP] {}: task {} running", self.name, task.id());
        Ok(Some(task.id()))
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Interrupt entry: latch `status` and defer completion.
    ///
    /// Returns `false` when no task is running on the hardware.
    pub fn irq(&self, status: u32) -> bool {
        let Some(task) = self.service.get_cur_task() else {
            klog!(Warn, "[MPP] {}: interrupt with no task, status {:#x}", self.name, status);
            return false;
        };
        if !task.transition(&[TaskState::Running], TaskState::Finishing) {
            klog!(Warn, "[MPP] {}: interrupt for task {} in {:?}", self.name, task.id(), task.state());
            return false;
        }

        task.set_irq_status(status);
        self.work.queue(task);
        true
    }

    /// Worker entry: complete every task queued by [`irq`](Self::irq).
    pub fn run_work(&self) -> usize {
        self.work.run_pending(|task| self.complete_work(task))
    }

    fn complete_work(&self, task: &Arc<Task>) {
        if !task.transition(&[TaskState::Finishing], TaskState::Done) {
            klog!(Debug, "[MPP] {}: task {} aborted before completion", self.name, task.id());
            return;
        }
        self.retire(task);

        let status = task.irq_status();
        let result = if self.ops.is_error_status(status) {
            Err(MppError::Hardware(status as i32))
        } else {
            self.ops.finish(task)
        };

        match result {
            Ok(()) => {
                self.power.put();
                self.service.done(task);
                self.service.note_completed();
            }
            Err(err) => {
                klog!(
                    Error,
                    "[MPP] {}: task {} failed ({}), status {:#x}",
                    self.name,
                    task.id(),
                    err,
                    status
                );
                task.set_error(err);
                task.set_state(TaskState::Aborted);
                self.reset_hw();
                self.power.put();
                self.release_task(task);
                self.service.done(task);
                self.service.note_aborted();
            }
        }
        self.deliver(task);
    }

    // ========================================================================
    // Abort and Reset
    // ========================================================================

    /// Abort the running task and reset the hardware.
    ///
    /// Returns the aborted task, or `None` when nothing was running (the
    /// hardware is still reset) or the task completed first (nothing is
    /// done).
    pub fn abort(&self) -> Option<TaskId> {
        let Some(task) = self.service.get_cur_task() else {
            klog!(Warn, "[MPP] {}: abort with no running task, resetting", self.name);
            self.reset_hw();
            return None;
        };

        self.abort_task(&task).then(|| task.id())
    }

    /// Abort `task` if it is still the one on the hardware.
    ///
    /// Returns `false` without touching the hardware when `task` already
    /// completed, was aborted by someone else, or never ran.
    pub fn abort_task(&self, task: &Arc<Task>) -> bool {
        let won = task.transition(&[TaskState::Running, TaskState::Finishing], TaskState::Aborted);
        self.work.cancel_sync(task);
        if !won {
            klog!(Debug, "[MPP] {}: task {} not running, abort skipped", self.name, task.id());
            return false;
        }

        klog!(Warn, "[MPP] {}: aborting task {}", self.name, task.id());
        task.set_error(MppError::Aborted);
        self.reset_hw();
        self.power.put();
        self.release_task(task);
        self.retire(task);
        self.service.abort(Some(task));
        self.service.note_aborted();
        self.deliver(task);
        true
    }

    /// Reset the codec block with its translation unit detached.
    ///
    /// Callers must own the hardware (hold the gate, or know it is idle).
    pub fn reset(&self) -> MppResult<()> {
        self.resets.fetch_add(1, Ordering::Relaxed);

        if let Some(iommu) = &self.iommu {
            iommu.domain.detach_device(&iommu.client);
        }
        let result = self.ops.reset();
        if let Some(iommu) = &self.iommu {
            iommu.domain.attach_device(&iommu.client)?;
        }
        result
    }

    fn reset_hw(&self) {
        match self.reset() {
            Ok(()) => klog!(Info, "[MPP] {}: hardware reset", self.name),
            Err(err) => klog!(Error, "[MPP] {}: reset failed: {}", self.name, err),
        }
    }

    /// Watchdog tick.
    ///
    /// The first tick that sees a task running starts its clock; a later
    /// tick at least `task_timeout_ms` after that aborts it. Returns the
    /// aborted task.
    pub fn check_timeout(&self, now_ms: u64) -> Option<TaskId> {
        let Some(task) = self.service.get_cur_task() else {
            *self.watch.lock() = None;
            return None;
        };

        let expired = {
            let mut watch = self.watch.lock();
            match *watch {
                Some(w) if w.task == task.id() => {
                    now_ms.saturating_sub(w.since_ms) >= self.config.task_timeout_ms
                }
                _ => {
                    *watch = Some(Watch {
                        task: task.id(),
                        since_ms: now_ms,
                    });
                    false
                }
            }
        };
        if !expired {
            return None;
        }

        klog!(
            Warn,
            "[MPP] {}: task {} timed out after {}ms",
            self.name,
            task.id(),
            self.config.task_timeout_ms
        );
        *self.watch.lock() = None;
        self.abort_task(&task).then(|| task.id())
    }

    // ========================================================================
    // Task Retirement
    // ========================================================================

    /// Give the payload back to the driver. Safe to call more than once.
    pub(crate) fn release_task(&self, task: &Task) {
        if let Some(data) = task.take_data() {
            self.ops.free_task(data);
        }
    }

    /// Drop `task` from its session's count of tasks on the hardware.
    fn retire(&self, task: &Task) {
        if let Some(session) = task.session() {
            session.retire();
        }
    }

    fn deliver(&self, task: &Arc<Task>) {
        match task.session() {
            Some(session) => session.complete(task),
            None => {
                self.release_task(task);
                task.set_state(TaskState::Freed);
            }
        }
    }

    /// Withdraw `task` on behalf of a closing session.
    pub(crate) fn discard(&self, task: &Arc<Task>) -> bool {
        self.service.remove_pending(task);

        if self.abort_task(task) {
            return true;
        }
        if task.transition(&[TaskState::Created, TaskState::Pending], TaskState::Aborted) {
            task.set_error(MppError::Aborted);
            self.release_task(task);
            task.set_state(TaskState::Freed);
            return true;
        }
        false
    }
}

impl Drop for MppDevice {
    fn drop(&mut self) {
        if let Some(iommu) = self.iommu.take() {
            iommu.domain.detach_device(&iommu.client);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
