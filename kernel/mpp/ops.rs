//! Codec Driver Interface
//!
//! A concrete codec (H.264/HEVC decoder, JPEG engine, ...) plugs into the
//! scheduler by implementing [`MppDevOps`]. The scheduler calls it at fixed
//! points of the task state machine:
//!
//! | Call | When | Context |
//! |------|------|---------|
//! | `alloc_task` | submit | submitting thread |
//! | `prepare` | after the gate is taken | dispatcher |
//! | `run` | after `prepare` succeeded | dispatcher |
//! | `finish` | completion work | worker |
//! | `result` | session polls the result | session owner |
//! | `free_task` | result consumed, dropped or aborted | any |
//! | `reset` | abort / error status / watchdog | any, gate held |

use alloc::vec::Vec;

use crate::session::Session;
use crate::task::{Task, TaskData};
use crate::MppResult;

pub trait MppDevOps: Send + Sync {
    /// Parse a user request into a driver-private payload.
    fn alloc_task(&self, session: &Session, request: &[u8]) -> MppResult<TaskData>;

    /// Last chance to refuse a task before the hardware is touched.
    fn prepare(&self, _task: &Task) -> MppResult<()> {
        Ok(())
    }

    /// Program the registers and start the hardware.
    fn run(&self, task: &Task) -> MppResult<()>;

    /// Harvest registers into the payload after the interrupt.
    fn finish(&self, task: &Task) -> MppResult<()>;

    /// Produce the bytes handed back to the session.
    fn result(&self, task: &Task) -> MppResult<Vec<u8>>;

    /// Release the payload.
    fn free_task(&self, data: TaskData) {
        drop(data);
    }

    /// Hardware-specific reset sequence.
    fn reset(&self) -> MppResult<()>;

    /// Whether an interrupt status means the hardware failed the task.
    fn is_error_status(&self, _status: u32) -> bool {
        false
    }
}

/// Runtime power reference for the codec block.
pub trait PowerDomain: Send + Sync {
    /// Take a reference only if the block is already powered.
    fn get_if_in_use(&self) -> bool;
    /// Drop a reference taken by `get_if_in_use`.
    fn put(&self);
}

/// Block that is always powered.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOn;

impl PowerDomain for AlwaysOn {
    fn get_if_in_use(&self) -> bool {
        true
    }

    fn put(&self) {}
}
