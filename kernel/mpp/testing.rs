//! Fake codec and power domain shared by the unit tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::ops::{MppDevOps, PowerDomain};
use crate::session::Session;
use crate::task::{Task, TaskData};
use crate::{MppConfig, MppDevice, MppError, MppResult};

/// Interrupt status bit the fake codec reports as a decode error.
pub const ERROR_STATUS: u32 = 0x8000_0000;

struct FakeTask {
    label: u8,
    regs: Vec<u8>,
}

/// Codec that records dispatch order and flags overlapping runs.
#[derive(Default)]
pub struct FakeCodec {
    busy: AtomicBool,
    overlaps: AtomicUsize,
    order: Mutex<Vec<u8>>,
    resets: AtomicUsize,
    freed: AtomicUsize,
    fail_prepare: AtomicBool,
}

impl FakeCodec {
    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Labels of dispatched tasks, in `run` order.
    pub fn order(&self) -> Vec<u8> {
        self.order.lock().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }
}

impl MppDevOps for FakeCodec {
    fn alloc_task(&self, _session: &Session, request: &[u8]) -> MppResult<TaskData> {
        let &label = request.first().ok_or(MppError::InvalidArgument)?;
        Ok(Box::new(FakeTask {
            label,
            regs: Vec::new(),
        }))
    }

    fn prepare(&self, _task: &Task) -> MppResult<()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(MppError::Hardware(-5));
        }
        Ok(())
    }

    fn run(&self, task: &Task) -> MppResult<()> {
        let label = task
            .with_data(|t: &mut FakeTask| t.label)
            .ok_or(MppError::NoTask)?;
        self.order.lock().push(label);
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn finish(&self, task: &Task) -> MppResult<()> {
        let status = task.irq_status();
        task.with_data(|t: &mut FakeTask| t.regs = vec![t.label, status as u8])
            .ok_or(MppError::NoTask)?;
        self.busy.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn result(&self, task: &Task) -> MppResult<Vec<u8>> {
        task.with_data(|t: &mut FakeTask| t.regs.clone())
            .ok_or(MppError::NoTask)
    }

    fn free_task(&self, data: TaskData) {
        self.freed.fetch_add(1, Ordering::SeqCst);
        drop(data);
    }

    fn reset(&self) -> MppResult<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_error_status(&self, status: u32) -> bool {
        status & ERROR_STATUS != 0
    }
}

/// Power domain that can be switched off, counting outstanding references.
pub struct FlakyPower {
    available: AtomicBool,
    refs: AtomicI64,
}

impl FlakyPower {
    pub fn new(available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            refs: AtomicI64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// References taken and not yet put.
    pub fn outstanding(&self) -> i64 {
        self.refs.load(Ordering::SeqCst)
    }
}

impl PowerDomain for FlakyPower {
    fn get_if_in_use(&self) -> bool {
        if !self.available.load(Ordering::SeqCst) {
            return false;
        }
        self.refs.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn put(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Device over a fresh [`FakeCodec`] with an always-on power domain.
pub fn codec_device(config: MppConfig) -> (Arc<FakeCodec>, Arc<MppDevice>) {
    let codec = Arc::new(FakeCodec::default());
    let device = Arc::new(MppDevice::new("fake", codec.clone(), config));
    (codec, device)
}
