//! Page Table Memory Pools
//!
//! Page tables live in a physical region the translation unit can walk. A
//! [`TablePool`] hands out fixed-stride, naturally aligned slots of that
//! region the way a slab cache hands out objects: level-1 tables come from a
//! 16KB-stride pool, level-2 tables from a 1KB-stride pool. The pool only
//! tracks ownership of physical slots; the owning domain keeps the table
//! contents.
//!
//! Pools are bounded, so table exhaustion surfaces as
//! [`SysMmuError::OutOfMemory`] exactly where the slab allocator would fail.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::{PhysAddr, SysMmuError, SysMmuResult};

struct PoolInner {
    used: Vec<bool>,
    in_use: usize,
    /// Where the next free-slot search starts.
    hint: usize,
}

/// Bounded allocator of naturally aligned physical table slots.
pub struct TablePool {
    name: &'static str,
    base: PhysAddr,
    stride: u32,
    inner: Mutex<PoolInner>,
}

impl TablePool {
    /// Create a pool of `capacity` slots of `stride` bytes starting at `base`.
    ///
    /// `stride` must be a power of two, `base` aligned to it, and the whole
    /// region must fit in the 32-bit physical address space.
    pub fn new(name: &'static str, base: PhysAddr, stride: u32, capacity: usize) -> SysMmuResult<Self> {
        if !stride.is_power_of_two() || base & (stride - 1) != 0 || base == 0 {
            return Err(SysMmuError::Misaligned);
        }
        let span = (capacity as u64)
            .checked_mul(stride as u64)
            .ok_or(SysMmuError::InvalidSize)?;
        if base as u64 + span > u32::MAX as u64 + 1 {
            return Err(SysMmuError::InvalidSize);
        }

        Ok(Self {
            name,
            base,
            stride,
            inner: Mutex::new(PoolInner {
                used: vec![false; capacity],
                in_use: 0,
                hint: 0,
            }),
        })
    }

    /// Pool name for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Allocate one slot.
    pub fn alloc(&self) -> SysMmuResult<PhysAddr> {
        let mut inner = self.inner.lock();
        let capacity = inner.used.len();
        let start = inner.hint;

        for step in 0..capacity {
            let idx = (start + step) % capacity;
            if !inner.used[idx] {
                inner.used[idx] = true;
                inner.in_use += 1;
                inner.hint = (idx + 1) % capacity;
                return Ok(self.base + idx as u32 * self.stride);
            }
        }

        klog!(Warn, "[SYSMMU] {}: pool exhausted ({} slots)", self.name, capacity);
        Err(SysMmuError::OutOfMemory)
    }

    /// Return a slot obtained from [`alloc`](Self::alloc).
    ///
    /// Freeing an address that does not belong to this pool, or an already
    /// free slot, is logged and ignored.
    pub fn free(&self, phys: PhysAddr) {
        let Some(idx) = self.index_of(phys) else {
            klog!(Error, "[SYSMMU] {}: free of foreign address {:#010x}", self.name, phys);
            return;
        };

        let mut inner = self.inner.lock();
        if !inner.used[idx] {
            klog!(Error, "[SYSMMU] {}: double free of {:#010x}", self.name, phys);
            return;
        }
        inner.used[idx] = false;
        inner.in_use -= 1;
    }

    /// Number of slots currently allocated.
    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.inner.lock().used.len()
    }

    fn index_of(&self, phys: PhysAddr) -> Option<usize> {
        if phys < self.base || (phys - self.base) & (self.stride - 1) != 0 {
            return None;
        }
        let idx = ((phys - self.base) / self.stride) as usize;
        (idx < self.capacity()).then_some(idx)
    }
}

// ============================================================================
// Tests
// ============================================================================
