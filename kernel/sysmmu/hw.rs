//! System MMU Register Interface
//!
//! The translation unit is programmed through a small memory-mapped register
//! window. Drivers never touch raw pointers directly; they go through
//! [`RegisterBank`], which has a volatile MMIO implementation for real
//! hardware and a simulated one (see `sim`) for host tests.
//!
//! # Registers
//!
//! | Offset | Name | Access |
//! |--------|------|--------|
//! | 0x000 | MMU_CTRL | R/W |
//! | 0x008 | MMU_STATUS | RO |
//! | 0x00C | MMU_FLUSH | WO |
//! | 0x010 | MMU_FLUSH_ENTRY | WO |
//! | 0x014 | PT_BASE_ADDR | R/W |
//! | 0x018 | INT_STATUS | RO |
//! | 0x01C | INT_CLEAR | WO |
//! | 0x024 | PAGE_FAULT_ADDR | RO |
//! | 0x028 | AW_FAULT_ADDR | RO |
//! | 0x02C | AR_FAULT_ADDR | RO |
//! | 0x030 | DEFAULT_SLAVE_ADDR | RO |
//! | 0x034 | MMU_VERSION | RO |

use core::ptr::{read_volatile, write_volatile};

// ============================================================================
// Register Offsets
// ============================================================================

pub const REG_MMU_CTRL: usize = 0x000;
pub const REG_MMU_STATUS: usize = 0x008;
pub const REG_MMU_FLUSH: usize = 0x00C;
pub const REG_MMU_FLUSH_ENTRY: usize = 0x010;
pub const REG_PT_BASE_ADDR: usize = 0x014;
pub const REG_INT_STATUS: usize = 0x018;
pub const REG_INT_CLEAR: usize = 0x01C;
pub const REG_PAGE_FAULT_ADDR: usize = 0x024;
pub const REG_AW_FAULT_ADDR: usize = 0x028;
pub const REG_AR_FAULT_ADDR: usize = 0x02C;
pub const REG_DEFAULT_SLAVE_ADDR: usize = 0x030;
pub const REG_MMU_VERSION: usize = 0x034;

/// Size of the register window.
pub const REG_WINDOW_SIZE: usize = 0x040;

// ============================================================================
// Control / Status Values
// ============================================================================

/// Translation on.
pub const CTRL_ENABLE: u32 = 0x5;
/// Translation on, new transactions held.
pub const CTRL_BLOCK: u32 = 0x7;
/// Translation off (bypass).
pub const CTRL_DISABLE: u32 = 0x0;

/// MMU_STATUS: unit is blocked.
pub const STATUS_BLOCKED: u32 = 1 << 0;

/// Write to MMU_FLUSH / MMU_FLUSH_ENTRY to start invalidation.
pub const FLUSH_TRIGGER: u32 = 0x1;

/// MMU_VERSION: major version in bits [31:28].
pub const VERSION_SHIFT: u32 = 28;

// ============================================================================
// Collaborator Traits
// ============================================================================

/// 32-bit register window of one translation unit.
pub trait RegisterBank: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
}

/// A gateable clock feeding the translation unit.
pub trait Clock: Send + Sync {
    fn enable(&self);
    fn disable(&self);
}

// ============================================================================
// MMIO Implementation
// ============================================================================

/// Register bank backed by a mapped MMIO window.
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped register window of at
    /// least [`REG_WINDOW_SIZE`] bytes that stays mapped for the lifetime of
    /// this value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline]
    fn reg(&self, offset: usize) -> usize {
        debug_assert!(offset + 4 <= REG_WINDOW_SIZE, "register offset out of window");
        self.base + offset
    }
}

impl RegisterBank for MmioRegisters {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `new` contract guarantees the window is mapped.
        unsafe { read_volatile(self.reg(offset) as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: `new` contract guarantees the window is mapped.
        unsafe { write_volatile(self.reg(offset) as *mut u32, value) }
    }
}
