//! Simulated translation unit for host-side tests.
//!
//! [`SimRegisters`] behaves like the real register window as far as the
//! driver can observe: `MMU_STATUS` reports blocked after `CTRL_BLOCK`,
//! `INT_CLEAR` clears `INT_STATUS` bits, and flush writes are recorded so
//! tests can check which entries were invalidated.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::fault::FaultKind;
use crate::hw::*;
use crate::Iova;

const NUM_REGS: usize = REG_WINDOW_SIZE / 4;

/// In-memory register window.
pub struct SimRegisters {
    regs: [AtomicU32; NUM_REGS],
    /// Refuse to report blocked, to exercise the bounded spin.
    stuck: AtomicBool,
    flushed_entries: Mutex<Vec<Iova>>,
    full_flushes: AtomicUsize,
    enables: AtomicUsize,
    disables: AtomicUsize,
    blocks: AtomicUsize,
    status_reads: AtomicUsize,
}

impl SimRegisters {
    /// Fresh unit reporting major version `version`.
    pub fn new(version: u32) -> Self {
        let sim = Self {
            regs: core::array::from_fn(|_| AtomicU32::new(0)),
            stuck: AtomicBool::new(false),
            flushed_entries: Mutex::new(Vec::new()),
            full_flushes: AtomicUsize::new(0),
            enables: AtomicUsize::new(0),
            disables: AtomicUsize::new(0),
            blocks: AtomicUsize::new(0),
            status_reads: AtomicUsize::new(0),
        };
        sim.regs[REG_MMU_VERSION / 4].store(version << VERSION_SHIFT, Ordering::Relaxed);
        sim
    }

    fn reg(&self, offset: usize) -> &AtomicU32 {
        &self.regs[offset / 4]
    }

    /// Latch a fault of `kind` at `iova`.
    pub fn raise_fault(&self, kind: FaultKind, iova: Iova) {
        if let (Some(bit), Some(addr_reg)) = (kind.status_bit(), kind.addr_register()) {
            self.reg(addr_reg).store(iova, Ordering::SeqCst);
            self.reg(REG_INT_STATUS).fetch_or(bit, Ordering::SeqCst);
        }
    }

    /// Set raw `INT_STATUS` bits, including ones no fault kind owns.
    pub fn raise_raw_status(&self, bits: u32) {
        self.reg(REG_INT_STATUS).fetch_or(bits, Ordering::SeqCst);
    }

    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }

    pub fn int_status(&self) -> u32 {
        self.reg(REG_INT_STATUS).load(Ordering::SeqCst)
    }

    pub fn ctrl(&self) -> u32 {
        self.reg(REG_MMU_CTRL).load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.ctrl() == CTRL_ENABLE
    }

    pub fn pt_base(&self) -> u32 {
        self.reg(REG_PT_BASE_ADDR).load(Ordering::SeqCst)
    }

    /// Addresses written to `MMU_FLUSH_ENTRY`, oldest first.
    pub fn flushed_entries(&self) -> Vec<Iova> {
        self.flushed_entries.lock().clone()
    }

    pub fn full_flushes(&self) -> usize {
        self.full_flushes.load(Ordering::SeqCst)
    }

    /// Transitions into `CTRL_ENABLE` from the disabled state.
    pub fn enables(&self) -> usize {
        self.enables.load(Ordering::SeqCst)
    }

    /// Writes of `CTRL_DISABLE`.
    pub fn disables(&self) -> usize {
        self.disables.load(Ordering::SeqCst)
    }

    /// Writes of `CTRL_BLOCK`.
    pub fn blocks(&self) -> usize {
        self.blocks.load(Ordering::SeqCst)
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads.load(Ordering::SeqCst)
    }
}

impl RegisterBank for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        if offset == REG_MMU_STATUS {
            self.status_reads.fetch_add(1, Ordering::SeqCst);
            let blocked = self.ctrl() == CTRL_BLOCK && !self.stuck.load(Ordering::SeqCst);
            return if blocked { STATUS_BLOCKED } else { 0 };
        }
        self.reg(offset).load(Ordering::SeqCst)
    }

    fn write32(&self, offset: usize, value: u32) {
        match offset {
            REG_MMU_CTRL => {
                let prev = self.reg(REG_MMU_CTRL).swap(value, Ordering::SeqCst);
                match value {
                    CTRL_ENABLE if prev == CTRL_DISABLE => {
                        self.enables.fetch_add(1, Ordering::SeqCst);
                    }
                    CTRL_DISABLE => {
                        self.disables.fetch_add(1, Ordering::SeqCst);
                    }
                    CTRL_BLOCK => {
                        self.blocks.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
            REG_MMU_FLUSH => {
                if value & FLUSH_TRIGGER != 0 {
                    self.full_flushes.fetch_add(1, Ordering::SeqCst);
                }
            }
            REG_MMU_FLUSH_ENTRY => {
                if value & FLUSH_TRIGGER != 0 {
                    self.flushed_entries.lock().push(value & !FLUSH_TRIGGER);
                }
            }
            REG_INT_CLEAR => {
                self.reg(REG_INT_STATUS).fetch_and(!value, Ordering::SeqCst);
            }
            REG_MMU_STATUS | REG_INT_STATUS | REG_MMU_VERSION => {}
            _ => self.reg(offset).store(value, Ordering::SeqCst),
        }
    }
}

/// Clock that counts its gate state.
#[derive(Default)]
pub struct SimClock {
    enabled: AtomicU32,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding enables.
    pub fn enable_count(&self) -> u32 {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl Clock for SimClock {
    fn enable(&self) {
        self.enabled.fetch_add(1, Ordering::SeqCst);
    }

    fn disable(&self) {
        let _ = self
            .enabled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}
