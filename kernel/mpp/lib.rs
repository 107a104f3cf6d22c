//! Multi-format Processor (MPP) Task Scheduling
//!
//! Serializes access to one hardware codec block across any number of
//! sessions. Every submitted task walks the same state machine:
//!
//! ```text
//! Created -> Pending -> Running -> Finishing -> Done -> Freed
//!               \          \          /
//!                +---------> Aborted -+-------------> Freed
//! ```
//!
//! # Components
//!
//! - [`MppService`]: FIFO of pending tasks plus the single-flight gate
//! - [`Task`]: one unit of hardware work and its driver-private payload
//! - [`Session`]: a client's view, with pending and completed lists
//! - [`WorkQueue`]: ordered deferred-completion queue with synchronous cancel
//! - [`MppDevice`]: dispatch, interrupt hand-off, completion, abort/reset and
//!   the timeout watchdog
//! - [`MppDevOps`]: what a concrete codec driver implements
//!
//! # Lock Ordering
//!
//! ```text
//! MppDevice::dispatch  ->  MppService::current
//! Session::pending     ->  Session::done
//! ```
//!
//! `MppService::pending`, `WorkQueue::queued` and the per-task locks are
//! leaves. Driver callbacks are never invoked with a session or service lock
//! held.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

use core::fmt;

use sysmmu::SysMmuError;

pub mod device;
pub mod ops;
pub mod service;
pub mod session;
pub mod task;
pub mod workqueue;

#[cfg(test)]
mod testing;

pub use device::MppDevice;
pub use ops::{AlwaysOn, MppDevOps, PowerDomain};
pub use service::{MppService, ServiceStats};
pub use session::{Session, SessionId, TaskResult};
pub use task::{Task, TaskData, TaskId, TaskState};
pub use workqueue::WorkQueue;

// ============================================================================
// Errors
// ============================================================================

/// MPP errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MppError {
    OutOfMemory,
    InvalidArgument,
    /// Device not powered at dispatch; the task stays queued.
    PowerUnavailable,
    Busy,
    /// Nothing submitted, or nothing left to wait for.
    NoTask,
    /// Task was aborted by a timeout, reset or session close.
    Aborted,
    /// Driver or hardware reported a failure status.
    Hardware(i32),
    SessionClosed,
    Iommu(SysMmuError),
}

impl MppError {
    /// Whether the same request may succeed if simply retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PowerUnavailable | Self::Busy)
    }
}

impl From<SysMmuError> for MppError {
    fn from(err: SysMmuError) -> Self {
        match err {
            SysMmuError::OutOfMemory => Self::OutOfMemory,
            other => Self::Iommu(other),
        }
    }
}

impl fmt::Display for MppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::PowerUnavailable => f.write_str("device not powered"),
            Self::Busy => f.write_str("device busy"),
            Self::NoTask => f.write_str("no task"),
            Self::Aborted => f.write_str("task aborted"),
            Self::Hardware(code) => write!(f, "hardware error {}", code),
            Self::SessionClosed => f.write_str("session closed"),
            Self::Iommu(err) => write!(f, "iommu: {}", err),
        }
    }
}

pub type MppResult<T> = Result<T, MppError>;

// ============================================================================
// Configuration
// ============================================================================

/// Per-device scheduling knobs.
#[derive(Debug, Clone, Copy)]
pub struct MppConfig {
    /// Completed results a session buffers before new ones are dropped.
    pub done_queue_capacity: usize,
    /// Budget for one running task before the watchdog aborts it.
    pub task_timeout_ms: u64,
    /// Power-unavailable deferrals a task survives before it is failed.
    pub power_retry_limit: u32,
}

impl Default for MppConfig {
    fn default() -> Self {
        Self {
            done_queue_capacity: 20,
            task_timeout_ms: 500,
            power_retry_limit: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(MppError::PowerUnavailable.is_retryable());
        assert!(MppError::Busy.is_retryable());
        assert!(!MppError::Aborted.is_retryable());
        assert!(!MppError::Hardware(-5).is_retryable());
    }

    #[test]
    fn test_iommu_errors_convert() {
        assert_eq!(MppError::from(SysMmuError::OutOfMemory), MppError::OutOfMemory);
        assert_eq!(
            MppError::from(SysMmuError::Busy),
            MppError::Iommu(SysMmuError::Busy)
        );
    }
}
