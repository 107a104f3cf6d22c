//! Exynos-style System MMU Driver
//!
//! Translates 32-bit I/O virtual addresses issued by media bus masters
//! (codec, scaler, camera) into physical addresses through a two-level page
//! table, the way the CPU MMU does for programs.
//!
//! # Components
//!
//! - [`pgtable`]: descriptor encoding, index math, software walk
//! - [`slab`]: bounded pools for level-1 (16KB) and level-2 (1KB) tables
//! - [`Domain`]: one I/O address space (its page table plus attached units)
//! - [`SysMmu`]: one translation unit instance with activation counting, TLB
//!   maintenance and the fault interrupt path
//! - [`fault`]: fault decoding and handler plumbing
//! - [`hw`]: register map and the [`RegisterBank`]/[`Clock`] seams
//!
//! # Lock Ordering
//!
//! ```text
//! Domain::clients  ->  SysMmu::state  ->  Domain::fault_handler
//! Domain::tables   ->  TablePool::inner
//! ```
//!
//! `Domain::tables` and `Domain::clients` are never held together. Unmap
//! drops the table lock before it walks the client list to invalidate TLBs.
//! The fault path only `try_lock`s the tables while dumping, and calls fault
//! handlers after releasing `SysMmu::state`, so a handler may re-enter the
//! domain.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

pub mod client;
pub mod domain;
pub mod fault;
pub mod hw;
pub mod pgtable;
pub mod slab;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use client::{EnableOutcome, SysMmu};
pub use domain::{AttachOutcome, Domain, DomainStats};
pub use fault::{FaultError, FaultHandler, FaultInfo, FaultKind, FaultOutcome, FaultResult};
pub use hw::{Clock, MmioRegisters, RegisterBank};
pub use pgtable::PageSize;
pub use slab::TablePool;

/// I/O virtual address as issued by a bus master.
pub type Iova = u32;

/// Physical address as seen by the translation unit.
pub type PhysAddr = u32;

/// Domain identifier, unique per [`SysMmuContext`].
pub type DomainId = u32;

/// Status polls allowed before a block request is abandoned.
pub const DEFAULT_BLOCK_SPIN_LIMIT: u32 = 120;

// ============================================================================
// Errors
// ============================================================================

/// System MMU errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysMmuError {
    /// Table pool or heap exhausted.
    OutOfMemory,
    /// Range already mapped, or blocked by a mapping of another size.
    AddressInUse,
    /// Size is not one of the supported page sizes.
    InvalidSize,
    /// Address not aligned to the requested page size.
    Misaligned,
    /// Unit already active on a different page table.
    Busy,
    /// Client has no translation unit.
    NoDevice,
    /// Unit did not acknowledge a block request in time.
    HardwareTimeout,
    /// Domain was poisoned by an unhandled fault.
    DomainFaulted,
    /// Domain was torn down.
    Destroyed,
}

impl fmt::Display for SysMmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of page-table memory",
            Self::AddressInUse => "address range already mapped",
            Self::InvalidSize => "unsupported mapping size",
            Self::Misaligned => "address not aligned to mapping size",
            Self::Busy => "translation unit serves another page table",
            Self::NoDevice => "no translation unit",
            Self::HardwareTimeout => "translation unit did not block",
            Self::DomainFaulted => "domain poisoned by unhandled fault",
            Self::Destroyed => "domain destroyed",
        };
        f.write_str(msg)
    }
}

pub type SysMmuResult<T> = Result<T, SysMmuError>;

// ============================================================================
// Protection
// ============================================================================

bitflags::bitflags! {
    /// Access rights requested for a mapping.
    ///
    /// The descriptor format has no permission bits, so every mapping is
    /// readable and writable by the device. The flags are accepted for API
    /// compatibility and traced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Table memory layout and hardware timing knobs.
#[derive(Debug, Clone, Copy)]
pub struct SysMmuConfig {
    /// Physical base of the level-1 table region (16KB aligned).
    pub lv1_base: PhysAddr,
    /// Maximum number of live domains.
    pub lv1_capacity: usize,
    /// Physical base of the level-2 table region (1KB aligned).
    pub lv2_base: PhysAddr,
    /// Maximum number of level-2 tables across all domains.
    pub lv2_capacity: usize,
    pub block_spin_limit: u32,
}

impl Default for SysMmuConfig {
    fn default() -> Self {
        Self {
            lv1_base: 0x6000_0000,
            lv1_capacity: 16,
            lv2_base: 0x6100_0000,
            lv2_capacity: 1024,
            block_spin_limit: DEFAULT_BLOCK_SPIN_LIMIT,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Driver-wide state: table pools and domain numbering.
///
/// Replaces the global caches a kernel driver would keep; every domain holds
/// an `Arc` to the context it was carved from.
pub struct SysMmuContext {
    config: SysMmuConfig,
    lv1_pool: TablePool,
    lv2_pool: TablePool,
    next_domain_id: AtomicU32,
}

impl SysMmuContext {
    pub fn new(config: SysMmuConfig) -> SysMmuResult<Arc<Self>> {
        let lv1_pool = TablePool::new(
            "lv1",
            config.lv1_base,
            pgtable::LV1TABLE_SIZE,
            config.lv1_capacity,
        )?;
        let lv2_pool = TablePool::new(
            "lv2",
            config.lv2_base,
            pgtable::LV2TABLE_SIZE,
            config.lv2_capacity,
        )?;

        klog_always!(
            "[SYSMMU] context ready: {} domains, {} lv2 tables",
            config.lv1_capacity,
            config.lv2_capacity
        );

        Ok(Arc::new(Self {
            config,
            lv1_pool,
            lv2_pool,
            next_domain_id: AtomicU32::new(1),
        }))
    }

    #[inline]
    pub fn config(&self) -> &SysMmuConfig {
        &self.config
    }

    /// Create an empty address space.
    pub fn domain_init(self: &Arc<Self>) -> SysMmuResult<Arc<Domain>> {
        Domain::new(self)
    }

    /// Create a translation-unit instance using this context's timing.
    pub fn new_client(&self, name: &str, banks: alloc::vec::Vec<Arc<dyn RegisterBank>>) -> SysMmu {
        SysMmu::new(name, banks).with_block_spin_limit(self.config.block_spin_limit)
    }

    #[inline]
    pub(crate) fn lv1_pool(&self) -> &TablePool {
        &self.lv1_pool
    }

    #[inline]
    pub(crate) fn lv2_pool(&self) -> &TablePool {
        &self.lv2_pool
    }

    pub(crate) fn next_domain_id(&self) -> DomainId {
        self.next_domain_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Level-1 tables currently owned by live domains.
    pub fn lv1_tables_in_use(&self) -> usize {
        self.lv1_pool.in_use()
    }

    /// Level-2 tables currently owned by live domains.
    pub fn lv2_tables_in_use(&self) -> usize {
        self.lv2_pool.in_use()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimRegisters;
    use alloc::vec;

    #[test]
    fn test_new_client_uses_context_spin_limit() {
        let ctx = SysMmuContext::new(SysMmuConfig {
            block_spin_limit: 7,
            ..SysMmuConfig::default()
        })
        .unwrap();
        let regs = Arc::new(SimRegisters::new(3));
        let client = ctx.new_client("mscl", vec![regs.clone() as Arc<dyn RegisterBank>]);
        assert_eq!(client.name(), "mscl");

        client.enable_with_pgtable(0x6000_0000).unwrap();
        regs.set_stuck(true);
        assert_eq!(client.flush_tlb_all(), Err(SysMmuError::HardwareTimeout));
        assert_eq!(regs.status_reads(), 7);
    }
}
