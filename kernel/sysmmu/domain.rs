//! I/O Address Space ("domain")
//!
//! A [`Domain`] owns one level-1 table, the level-2 tables hanging off it,
//! and the list of translation units currently walking it.
//!
//! # Free-slot Counters
//!
//! Every level-1 slot carries a count of free level-2 entries. The count is
//! 256 when a level-2 table is freshly allocated, drops by 1 per small page
//! and by 16 per large page, and rises again on unmap. A section may only
//! replace a page descriptor whose counter is back at 256; the now unused
//! level-2 table is released at that point. Otherwise level-2 tables live
//! until the domain is destroyed.
//!
//! # Poisoning
//!
//! An unresolved translation fault marks the domain dead. Mapping, unmapping
//! and attaching are refused from then on; lookups return 0. The domain can
//! still be destroyed.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, AtomicU8, Ordering};
use spin::{Mutex, RwLock};

use crate::client::{EnableOutcome, SysMmu};
use crate::fault::{FaultError, FaultHandler, FaultInfo, FaultResult};
use crate::pgtable::*;
use crate::slab::TablePool;
use crate::{DomainId, Iova, PhysAddr, Prot, SysMmuContext, SysMmuError, SysMmuResult};

const STATE_LIVE: u8 = 0;
const STATE_FAULTED: u8 = 1;
const STATE_DESTROYED: u8 = 2;

/// Result of a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Unit enabled on this domain's table.
    Attached,
    /// Unit was already serving this table; its activation count went up.
    AlreadyAttached,
    /// Client has no translation unit; nothing to program.
    NoHardware,
}

/// Snapshot of domain bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    pub id: DomainId,
    pub pgtable: PhysAddr,
    /// Bytes currently mapped.
    pub mapped_bytes: u64,
    /// Level-2 tables owned.
    pub lv2_tables: usize,
    /// Page-table write flushes issued.
    pub flushes: u64,
    /// Attached translation units.
    pub clients: usize,
    pub faulted: bool,
}

// ============================================================================
// Page Tables
// ============================================================================

/// Table contents, guarded by the domain's table lock.
struct PageTables {
    lv1: Box<[Lv1Entry]>,
    /// Free level-2 entries per level-1 slot.
    lv2entcnt: Box<[u16]>,
    /// Level-2 tables keyed by level-1 index.
    lv2: BTreeMap<usize, Box<[Lv2Entry]>>,
    mapped_bytes: u64,
    flushes: u64,
}

fn try_alloc_table<T: Clone>(len: usize, value: T) -> SysMmuResult<Box<[T]>> {
    let mut table = Vec::new();
    table
        .try_reserve_exact(len)
        .map_err(|_| SysMmuError::OutOfMemory)?;
    table.resize(len, value);
    Ok(table.into_boxed_slice())
}

impl PageTables {
    fn new() -> SysMmuResult<Self> {
        Ok(Self {
            lv1: try_alloc_table(NUM_LV1ENTRIES, Lv1Entry::fault())?,
            lv2entcnt: try_alloc_table(NUM_LV1ENTRIES, 0)?,
            lv2: BTreeMap::new(),
            mapped_bytes: 0,
            flushes: 0,
        })
    }

    /// Make table writes visible to the walker.
    #[inline]
    fn flush(&mut self) {
        fence(Ordering::SeqCst);
        self.flushes += 1;
    }

    fn set_section(&mut self, pool: &TablePool, iova: Iova, paddr: PhysAddr) -> SysMmuResult<()> {
        let idx = lv1ent_offset(iova);

        match self.lv1[idx].kind() {
            Lv1Kind::Section => return Err(SysMmuError::AddressInUse),
            Lv1Kind::Page => {
                if self.lv2entcnt[idx] as usize != NUM_LV2ENTRIES {
                    return Err(SysMmuError::AddressInUse);
                }
                self.lv2.remove(&idx);
                pool.free(self.lv1[idx].lv2_base());
                self.lv2entcnt[idx] = 0;
            }
            Lv1Kind::Fault => {}
        }

        self.lv1[idx] = Lv1Entry::section(paddr);
        self.flush();
        Ok(())
    }

    /// Install a level-2 table under `idx` if the slot is still a fault.
    fn ensure_lv2(&mut self, pool: &TablePool, idx: usize) -> SysMmuResult<()> {
        match self.lv1[idx].kind() {
            Lv1Kind::Section => Err(SysMmuError::AddressInUse),
            Lv1Kind::Page => Ok(()),
            Lv1Kind::Fault => {
                let pa = pool.alloc()?;
                let table = match try_alloc_table(NUM_LV2ENTRIES, Lv2Entry::fault()) {
                    Ok(table) => table,
                    Err(e) => {
                        pool.free(pa);
                        return Err(e);
                    }
                };
                self.lv2.insert(idx, table);
                self.lv1[idx] = Lv1Entry::page(pa);
                self.lv2entcnt[idx] = NUM_LV2ENTRIES as u16;
                self.flush();
                Ok(())
            }
        }
    }

    fn set_page(
        &mut self,
        pool: &TablePool,
        iova: Iova,
        paddr: PhysAddr,
        pgsize: PageSize,
    ) -> SysMmuResult<()> {
        let idx = lv1ent_offset(iova);
        self.ensure_lv2(pool, idx)?;

        let Some(table) = self.lv2.get_mut(&idx) else {
            klog!(Error, "[SYSMMU] lv1 slot {} has no level-2 table", idx);
            return Err(SysMmuError::AddressInUse);
        };

        let (entry, count) = match pgsize {
            PageSize::Large => (Lv2Entry::large(paddr), SPAGES_PER_LPAGE),
            _ => (Lv2Entry::small(paddr), 1),
        };
        let first = lv2ent_offset(iova);

        for i in 0..count {
            if !table[first + i].is_fault() {
                table[first..first + i].fill(Lv2Entry::fault());
                return Err(SysMmuError::AddressInUse);
            }
            table[first + i] = entry;
        }

        self.lv2entcnt[idx] -= count as u16;
        self.flush();
        Ok(())
    }

    /// Clear whatever maps `iova` and return the size of that mapping.
    ///
    /// Unmapped addresses report the size of the hole at the level where the
    /// walk stopped: 1MB for a level-1 fault, 4KB for a level-2 fault.
    fn clear(&mut self, iova: Iova) -> u32 {
        let idx = lv1ent_offset(iova);

        let size = match self.lv1[idx].kind() {
            Lv1Kind::Fault => return SECT_SIZE,
            Lv1Kind::Section => {
                self.lv1[idx] = Lv1Entry::fault();
                SECT_SIZE
            }
            Lv1Kind::Page => {
                let Some(table) = self.lv2.get_mut(&idx) else {
                    return SPAGE_SIZE;
                };
                let slot = lv2ent_offset(iova);
                match table[slot].kind() {
                    Lv2Kind::Fault => return SPAGE_SIZE,
                    Lv2Kind::Small => {
                        table[slot] = Lv2Entry::fault();
                        self.lv2entcnt[idx] += 1;
                        SPAGE_SIZE
                    }
                    Lv2Kind::Large => {
                        let first = slot & !(SPAGES_PER_LPAGE - 1);
                        table[first..first + SPAGES_PER_LPAGE].fill(Lv2Entry::fault());
                        self.lv2entcnt[idx] += SPAGES_PER_LPAGE as u16;
                        LPAGE_SIZE
                    }
                }
            }
        };

        self.mapped_bytes -= size as u64;
        self.flush();
        size
    }

    fn lookup(&self, iova: Iova) -> (Lv1Entry, Option<Lv2Entry>) {
        let idx = lv1ent_offset(iova);
        let lv1 = self.lv1[idx];
        let lv2 = if lv1.is_page() {
            self.lv2.get(&idx).map(|table| table[lv2ent_offset(iova)])
        } else {
            None
        };
        (lv1, lv2)
    }
}

// ============================================================================
// Domain
// ============================================================================

/// One I/O virtual address space.
pub struct Domain {
    id: DomainId,
    ctx: Arc<SysMmuContext>,
    /// Physical address of the level-1 table.
    pgtable: PhysAddr,
    tables: Mutex<PageTables>,
    clients: Mutex<Vec<Arc<SysMmu>>>,
    fault_handler: RwLock<Option<Arc<dyn FaultHandler>>>,
    state: AtomicU8,
}

impl Domain {
    /// Allocate an empty address space from `ctx`'s pools.
    pub fn new(ctx: &Arc<SysMmuContext>) -> SysMmuResult<Arc<Self>> {
        let pgtable = ctx.lv1_pool().alloc()?;
        let mut tables = match PageTables::new() {
            Ok(tables) => tables,
            Err(e) => {
                ctx.lv1_pool().free(pgtable);
                return Err(e);
            }
        };
        tables.flush();

        let id = ctx.next_domain_id();
        klog!(Debug, "[SYSMMU] domain {}: pgtable {:#010x}", id, pgtable);

        Ok(Arc::new(Self {
            id,
            ctx: ctx.clone(),
            pgtable,
            tables: Mutex::new(tables),
            clients: Mutex::new(Vec::new()),
            fault_handler: RwLock::new(None),
            state: AtomicU8::new(STATE_LIVE),
        }))
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Physical address of the level-1 table.
    #[inline]
    pub fn pgtable(&self) -> PhysAddr {
        self.pgtable
    }

    pub fn is_faulted(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FAULTED
    }

    fn ensure_live(&self) -> SysMmuResult<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_LIVE => Ok(()),
            STATE_FAULTED => Err(SysMmuError::DomainFaulted),
            _ => Err(SysMmuError::Destroyed),
        }
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Map one page of `size` bytes (4KB, 64KB or 1MB).
    ///
    /// Both addresses must be aligned to `size`. Nothing is mapped if any
    /// part of the range is already in use.
    pub fn map(&self, iova: Iova, paddr: PhysAddr, size: usize, prot: Prot) -> SysMmuResult<()> {
        self.ensure_live()?;

        let pgsize = PageSize::from_bytes(size).ok_or(SysMmuError::InvalidSize)?;
        if (iova | paddr) & !pgsize.mask() != 0 {
            return Err(SysMmuError::Misaligned);
        }

        let mut tables = self.tables.lock();
        let result = match pgsize {
            PageSize::Section => tables.set_section(self.ctx.lv2_pool(), iova, paddr),
            _ => tables.set_page(self.ctx.lv2_pool(), iova, paddr, pgsize),
        };

        match result {
            Ok(()) => {
                tables.mapped_bytes += size as u64;
                klog!(
                    Trace,
                    "[SYSMMU] domain {}: map {:#010x} -> {:#010x} ({:#x}, {:?})",
                    self.id,
                    iova,
                    paddr,
                    size,
                    prot
                );
            }
            Err(e) => {
                klog!(
                    Debug,
                    "[SYSMMU] domain {}: map {:#010x} ({:#x}) failed: {}",
                    self.id,
                    iova,
                    size,
                    e
                );
            }
        }
        result
    }

    /// Unmap whatever covers `iova` and return the size actually removed.
    ///
    /// `size` is a hint; the mapping granularity found in the table wins.
    /// Every attached unit has its TLB entry for `iova` invalidated
    /// afterwards, even when nothing was mapped.
    pub fn unmap(&self, iova: Iova, size: usize) -> SysMmuResult<usize> {
        self.ensure_live()?;

        let unmapped = self.tables.lock().clear(iova) as usize;
        if unmapped > size {
            klog!(
                Trace,
                "[SYSMMU] domain {}: unmap {:#010x} removed {:#x} (asked {:#x})",
                self.id,
                iova,
                unmapped,
                size
            );
        }

        self.invalidate_clients(iova);
        Ok(unmapped)
    }

    /// Map `size` bytes using the largest page size each step allows.
    ///
    /// On failure the part already mapped is unmapped again.
    pub fn map_range(&self, iova: Iova, paddr: PhysAddr, size: usize, prot: Prot) -> SysMmuResult<()> {
        if size == 0 {
            return Err(SysMmuError::InvalidSize);
        }
        if (iova | paddr | size as u32) & !SPAGE_MASK != 0 {
            return Err(SysMmuError::Misaligned);
        }
        let limit = u32::MAX as u64 + 1;
        if iova as u64 + size as u64 > limit || paddr as u64 + size as u64 > limit {
            return Err(SysMmuError::InvalidSize);
        }

        let mut mapped = 0usize;
        while mapped < size {
            let cur_iova = iova + mapped as u32;
            let cur_paddr = paddr + mapped as u32;
            let step = PageSize::best_fit(cur_iova, cur_paddr, size - mapped)
                .ok_or(SysMmuError::Misaligned)?
                .bytes() as usize;

            if let Err(e) = self.map(cur_iova, cur_paddr, step, prot) {
                if mapped > 0 {
                    let _ = self.unmap_range(iova, mapped);
                }
                return Err(e);
            }
            mapped += step;
        }
        Ok(())
    }

    /// Unmap everything in `[iova, iova + size)` and return the bytes covered.
    ///
    /// A mapping straddling the end of the range is removed whole, so the
    /// result can exceed `size`.
    pub fn unmap_range(&self, iova: Iova, size: usize) -> SysMmuResult<usize> {
        let end = iova as u64 + size as u64;
        if end > u32::MAX as u64 + 1 {
            return Err(SysMmuError::InvalidSize);
        }
        let mut cur = iova as u64;

        while cur < end {
            let unmapped = self.unmap(cur as u32, (end - cur) as usize)? as u64;
            cur = (cur & !(unmapped - 1)) + unmapped;
        }
        Ok((cur - iova as u64) as usize)
    }

    /// Software walk. Returns 0 when `iova` is not mapped.
    pub fn iova_to_phys(&self, iova: Iova) -> PhysAddr {
        if self.ensure_live().is_err() {
            return 0;
        }
        let (lv1, lv2) = self.tables.lock().lookup(iova);
        translate(lv1, lv2, iova)
    }

    /// Free level-2 entries under `iova`'s level-1 slot, `None` when the slot
    /// holds no level-2 table.
    pub fn lv2_free_entries(&self, iova: Iova) -> Option<usize> {
        let tables = self.tables.lock();
        let idx = lv1ent_offset(iova);
        tables.lv1[idx]
            .is_page()
            .then(|| tables.lv2entcnt[idx] as usize)
    }

    fn invalidate_clients(&self, iova: Iova) {
        for client in self.clients.lock().iter() {
            if let Err(e) = client.invalidate_entry(iova) {
                klog!(
                    Warn,
                    "[SYSMMU] {}: invalidate {:#010x} failed: {}",
                    client.name(),
                    iova,
                    e
                );
            }
        }
    }

    // ========================================================================
    // Attach / Detach
    // ========================================================================

    /// Point `client`'s translation unit at this domain.
    pub fn attach_device(self: &Arc<Self>, client: &Arc<SysMmu>) -> SysMmuResult<AttachOutcome> {
        self.ensure_live()?;

        if !client.has_hardware() {
            klog!(Debug, "[SYSMMU] {}: no translation unit, attach skipped", client.name());
            return Ok(AttachOutcome::NoHardware);
        }

        let mut clients = self.clients.lock();
        let outcome = match client.enable(self.pgtable, Some(Arc::downgrade(self))) {
            Ok(outcome) => outcome,
            Err(e) => {
                klog!(
                    Error,
                    "[SYSMMU] {}: attach to domain {} failed: {}",
                    client.name(),
                    self.id,
                    e
                );
                return Err(e);
            }
        };

        if !clients.iter().any(|c| Arc::ptr_eq(c, client)) {
            clients.push(client.clone());
        }

        klog!(
            Debug,
            "[SYSMMU] {}: attached to domain {} (pgtable {:#010x})",
            client.name(),
            self.id,
            self.pgtable
        );

        Ok(match outcome {
            EnableOutcome::Enabled => AttachOutcome::Attached,
            EnableOutcome::AlreadyEnabled => AttachOutcome::AlreadyAttached,
        })
    }

    /// Drop one activation of `client`; it leaves the domain when the unit
    /// actually turns off. Detaching a client that is not attached is a
    /// no-op.
    pub fn detach_device(&self, client: &Arc<SysMmu>) {
        let mut clients = self.clients.lock();
        let Some(pos) = clients.iter().position(|c| Arc::ptr_eq(c, client)) else {
            klog!(Debug, "[SYSMMU] {}: not attached to domain {}", client.name(), self.id);
            return;
        };

        if clients[pos].disable() {
            clients.remove(pos);
            klog!(Debug, "[SYSMMU] {}: detached from domain {}", client.name(), self.id);
        } else {
            klog!(
                Debug,
                "[SYSMMU] {}: still in use ({} activations)",
                client.name(),
                client.activations()
            );
        }
    }

    /// Attached translation units.
    pub fn clients(&self) -> Vec<Arc<SysMmu>> {
        self.clients.lock().clone()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Force every attached unit off and return all table memory.
    ///
    /// Idempotent; also run when the last reference is dropped.
    pub fn destroy(&self) {
        if self.state.swap(STATE_DESTROYED, Ordering::AcqRel) == STATE_DESTROYED {
            return;
        }

        let clients = core::mem::take(&mut *self.clients.lock());
        for client in &clients {
            while client.is_active() {
                if client.disable() {
                    break;
                }
            }
        }

        let mut tables = self.tables.lock();
        let mut freed = 0usize;
        for idx in 0..NUM_LV1ENTRIES {
            let ent = tables.lv1[idx];
            if ent.is_page() {
                self.ctx.lv2_pool().free(ent.lv2_base());
                freed += 1;
            }
            tables.lv1[idx] = Lv1Entry::fault();
        }
        tables.lv2.clear();
        tables.mapped_bytes = 0;
        self.ctx.lv1_pool().free(self.pgtable);

        klog!(
            Debug,
            "[SYSMMU] domain {}: destroyed ({} clients, {} lv2 tables)",
            self.id,
            clients.len(),
            freed
        );
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Install the handler consulted first for faults in this domain.
    pub fn set_fault_handler(&self, handler: Arc<dyn FaultHandler>) {
        *self.fault_handler.write() = Some(handler);
    }

    pub(crate) fn report_fault(&self, info: &FaultInfo<'_>) -> FaultResult {
        let handler = self.fault_handler.read().clone();
        match handler {
            Some(handler) => handler.handle_fault(info),
            None => Err(FaultError::NoHandler),
        }
    }

    /// Dump the walk for the faulting address and poison the domain.
    pub(crate) fn fail_on_fault(&self, info: &FaultInfo<'_>) {
        klog_force!(
            "[SYSMMU] {} occurred at {:#010x} by {} (page table base: {:#010x})",
            info.kind,
            info.iova,
            info.client,
            info.pgtable
        );

        match self.tables.try_lock() {
            Some(tables) => {
                let (lv1, lv2) = tables.lookup(info.iova);
                klog_force!("[SYSMMU]   lv1 entry: {:#010x}", lv1.raw());
                if let Some(lv2) = lv2 {
                    klog_force!("[SYSMMU]   lv2 entry: {:#010x}", lv2.raw());
                }
            }
            None => klog_force!("[SYSMMU]   page table busy, walk skipped"),
        }

        self.poison();
    }

    /// Mark the domain dead. No-op once destroyed.
    pub fn poison(&self) {
        if self
            .state
            .compare_exchange(STATE_LIVE, STATE_FAULTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            klog_force!("[SYSMMU] domain {}: unrecoverable fault, address space poisoned", self.id);
        }
    }

    pub fn stats(&self) -> DomainStats {
        let clients = self.clients.lock().len();
        let tables = self.tables.lock();
        DomainStats {
            id: self.id,
            pgtable: self.pgtable,
            mapped_bytes: tables.mapped_bytes,
            lv2_tables: tables.lv2.len(),
            flushes: tables.flushes,
            clients,
            faulted: self.is_faulted(),
        }
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ============================================================================
// Tests
// ============================================================================
