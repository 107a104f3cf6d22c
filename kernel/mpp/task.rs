//! MPP Task

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::session::{Session, SessionId};
use crate::MppError;

pub type TaskId = u32;

/// Driver-private task payload, created by `MppDevOps::alloc_task`.
pub type TaskData = Box<dyn Any + Send>;

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    /// Queued on its session and on the service.
    Pending,
    /// Holds the service gate; hardware programmed.
    Running,
    /// Interrupt taken, completion work queued.
    Finishing,
    /// Result delivered to the session.
    Done,
    /// Dropped by timeout, error status, reset or session close.
    Aborted,
    /// Payload returned to the driver.
    Freed,
}

/// One unit of hardware work.
pub struct Task {
    id: TaskId,
    session_id: SessionId,
    session: Weak<Session>,
    state: Mutex<TaskState>,
    irq_status: AtomicU32,
    power_retries: AtomicU32,
    error: Mutex<Option<MppError>>,
    data: Mutex<Option<TaskData>>,
}

impl Task {
    pub(crate) fn new(id: TaskId, session_id: SessionId, session: Weak<Session>, data: TaskData) -> Self {
        Self {
            id,
            session_id,
            session,
            state: Mutex::new(TaskState::Created),
            irq_status: AtomicU32::new(0),
            power_retries: AtomicU32::new(0),
            error: Mutex::new(None),
            data: Mutex::new(Some(data)),
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Interrupt status latched when the task finished on hardware.
    pub fn irq_status(&self) -> u32 {
        self.irq_status.load(Ordering::Acquire)
    }

    /// Failure recorded by the abort path, if any.
    pub fn error(&self) -> Option<MppError> {
        *self.error.lock()
    }

    /// Run `f` on the payload if it is still present and of type `T`.
    pub fn with_data<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.data.lock();
        let data: &mut (dyn Any + Send) = slot.as_deref_mut()?;
        data.downcast_mut::<T>().map(f)
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Completion and abort race for the same task; whichever wins the
    /// transition owns the rest of its lifecycle.
    pub(crate) fn transition(&self, from: &[TaskState], to: TaskState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            *state = to;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    pub(crate) fn set_irq_status(&self, status: u32) {
        self.irq_status.store(status, Ordering::Release);
    }

    pub(crate) fn set_error(&self, err: MppError) {
        *self.error.lock() = Some(err);
    }

    pub(crate) fn take_data(&self) -> Option<TaskData> {
        self.data.lock().take()
    }

    /// Count one power deferral, returning the new total.
    pub(crate) fn note_power_retry(&self) -> u32 {
        self.power_retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("session", &self.session_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(1, 7, Weak::new(), Box::new(41u32))
    }

    #[test]
    fn test_transition_only_from_listed_states() {
        let task = task();
        assert!(!task.transition(&[TaskState::Running], TaskState::Finishing));
        assert!(task.transition(&[TaskState::Created], TaskState::Pending));
        assert!(task.transition(&[TaskState::Pending, TaskState::Running], TaskState::Aborted));
        assert!(!task.transition(&[TaskState::Pending, TaskState::Running], TaskState::Aborted));
        assert_eq!(task.state(), TaskState::Aborted);
    }

    #[test]
    fn test_payload_access() {
        let task = task();
        let bumped = task.with_data(|v: &mut u32| {
            *v += 1;
            *v
        });
        assert_eq!(bumped, Some(42));
        assert_eq!(task.with_data(|_: &mut u64| ()), None);

        assert!(task.take_data().is_some());
        assert_eq!(task.with_data(|v: &mut u32| *v), None);
        assert!(task.session().is_none());
    }
}
