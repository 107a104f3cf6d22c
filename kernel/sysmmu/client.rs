//! System MMU Instance ("client")
//!
//! One [`SysMmu`] fronts the translation unit(s) sitting in front of one bus
//! master. It may own zero register banks (a master that shares a domain but
//! has no unit of its own), one bank, or several banks programmed in
//! lockstep.
//!
//! # Activation Counting
//!
//! Enabling is reference counted: several users may enable the same unit as
//! long as they all ask for the same level-1 table. Only the first enable
//! touches the hardware, only the last disable turns it off.
//!
//! # Locking
//!
//! `state` is a reader/writer lock. TLB invalidation and register dumps take
//! it for read so independent invalidations proceed in parallel;
//! enable/disable take it for write. The fault interrupt only snapshots it
//! and releases it before any handler runs.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::RwLock;

use crate::domain::Domain;
use crate::fault::{FaultError, FaultHandler, FaultInfo, FaultKind, FaultOutcome};
use crate::hw::*;
use crate::pgtable::SPAGE_MASK;
use crate::{Iova, PhysAddr, SysMmuError, SysMmuResult, DEFAULT_BLOCK_SPIN_LIMIT};

/// Result of a successful enable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// First activation; hardware was programmed.
    Enabled,
    /// Already active on the same table; only the count moved.
    AlreadyEnabled,
}

struct ClientState {
    activations: u32,
    /// Level-1 table programmed into the unit, 0 while inactive.
    pgtable: PhysAddr,
    domain: Option<Weak<Domain>>,
}

/// One translation-unit instance.
pub struct SysMmu {
    name: String,
    banks: Vec<Arc<dyn RegisterBank>>,
    /// Unit clock followed by the bus master's clock.
    clocks: [Option<Arc<dyn Clock>>; 2],
    state: RwLock<ClientState>,
    fault_handler: RwLock<Option<Arc<dyn FaultHandler>>>,
    block_spin_limit: u32,
}

impl SysMmu {
    /// Create an inactive instance over `banks`.
    pub fn new(name: &str, banks: Vec<Arc<dyn RegisterBank>>) -> Self {
        Self {
            name: String::from(name),
            banks,
            clocks: [None, None],
            state: RwLock::new(ClientState {
                activations: 0,
                pgtable: 0,
                domain: None,
            }),
            fault_handler: RwLock::new(None),
            block_spin_limit: DEFAULT_BLOCK_SPIN_LIMIT,
        }
    }

    /// Attach the unit clock and, optionally, the master's clock.
    pub fn with_clocks(mut self, clk: Arc<dyn Clock>, master: Option<Arc<dyn Clock>>) -> Self {
        self.clocks = [Some(clk), master];
        self
    }

    /// Override how many status polls a block request may take.
    pub fn with_block_spin_limit(mut self, limit: u32) -> Self {
        self.block_spin_limit = limit;
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any translation unit backs this client.
    #[inline]
    pub fn has_hardware(&self) -> bool {
        !self.banks.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().activations > 0
    }

    pub fn activations(&self) -> u32 {
        self.state.read().activations
    }

    /// Level-1 table currently programmed, 0 while inactive.
    pub fn pgtable(&self) -> PhysAddr {
        self.state.read().pgtable
    }

    /// Major hardware version of the first bank, read while active.
    pub fn version(&self) -> Option<u32> {
        let state = self.state.read();
        if state.activations == 0 {
            return None;
        }
        self.banks
            .first()
            .map(|bank| bank.read32(REG_MMU_VERSION) >> VERSION_SHIFT)
    }

    /// Install a handler consulted when the domain has none.
    pub fn set_fault_handler(&self, handler: Arc<dyn FaultHandler>) {
        *self.fault_handler.write() = Some(handler);
    }

    // ========================================================================
    // Enable / Disable
    // ========================================================================

    /// Enable translation through `pgtable` without a domain.
    ///
    /// For masters that manage their own table and only need the unit turned
    /// on. Follows the same counting rules as a domain attach.
    pub fn enable_with_pgtable(&self, pgtable: PhysAddr) -> SysMmuResult<EnableOutcome> {
        self.enable(pgtable, None)
    }

    pub(crate) fn enable(
        &self,
        pgtable: PhysAddr,
        domain: Option<Weak<Domain>>,
    ) -> SysMmuResult<EnableOutcome> {
        if !self.has_hardware() {
            return Err(SysMmuError::NoDevice);
        }

        let mut state = self.state.write();
        state.activations += 1;

        if state.activations > 1 {
            if state.pgtable != pgtable {
                state.activations -= 1;
                klog!(
                    Error,
                    "[SYSMMU] {}: already serving pgtable {:#010x}, refusing {:#010x}",
                    self.name,
                    state.pgtable,
                    pgtable
                );
                return Err(SysMmuError::Busy);
            }
            klog!(Debug, "[SYSMMU] {}: already enabled ({})", self.name, state.activations);
            return Ok(EnableOutcome::AlreadyEnabled);
        }

        for clk in self.clocks.iter().flatten() {
            clk.enable();
        }

        state.pgtable = pgtable;
        for bank in &self.banks {
            Self::set_ptbase(bank.as_ref(), pgtable);
            bank.write32(REG_MMU_CTRL, CTRL_ENABLE);
        }
        state.domain = domain;

        klog!(Debug, "[SYSMMU] {}: enabled with pgtable {:#010x}", self.name, pgtable);
        Ok(EnableOutcome::Enabled)
    }

    /// Drop one activation.
    ///
    /// Returns `true` once the unit is actually off (the last activation went
    /// away, or it was not active to begin with), `false` while other users
    /// still hold it.
    pub fn disable(&self) -> bool {
        let mut state = self.state.write();

        if state.activations == 0 {
            klog!(Warn, "[SYSMMU] {}: disable of inactive unit", self.name);
            return true;
        }

        state.activations -= 1;
        if state.activations > 0 {
            klog!(Debug, "[SYSMMU] {}: still active ({})", self.name, state.activations);
            return false;
        }

        for bank in &self.banks {
            bank.write32(REG_MMU_CTRL, CTRL_DISABLE);
        }
        for clk in self.clocks.iter().rev().flatten() {
            clk.disable();
        }

        state.pgtable = 0;
        state.domain = None;

        klog!(Debug, "[SYSMMU] {}: disabled", self.name);
        true
    }

    // ========================================================================
    // TLB Maintenance
    // ========================================================================

    /// Invalidate the cached translation of one page.
    ///
    /// Skipped while inactive. Banks that refuse to block are left alone and
    /// reported through the returned error once the remaining banks are done.
    pub fn invalidate_entry(&self, iova: Iova) -> SysMmuResult<()> {
        self.with_each_blocked_bank(|bank| {
            bank.write32(REG_MMU_FLUSH_ENTRY, (iova & SPAGE_MASK) | FLUSH_TRIGGER);
        })
    }

    /// Invalidate every cached translation.
    pub fn flush_tlb_all(&self) -> SysMmuResult<()> {
        self.with_each_blocked_bank(|bank| {
            bank.write32(REG_MMU_FLUSH, FLUSH_TRIGGER);
        })
    }

    fn with_each_blocked_bank(&self, op: impl Fn(&dyn RegisterBank)) -> SysMmuResult<()> {
        let state = self.state.read();
        if state.activations == 0 {
            klog!(Trace, "[SYSMMU] {}: disabled, skipping TLB maintenance", self.name);
            return Ok(());
        }

        let mut result = Ok(());
        for bank in &self.banks {
            if self.block(bank.as_ref()) {
                op(bank.as_ref());
                Self::unblock(bank.as_ref());
            } else {
                result = Err(SysMmuError::HardwareTimeout);
            }
        }
        result
    }

    // ========================================================================
    // Fault Interrupt
    // ========================================================================

    /// Service a fault interrupt.
    ///
    /// Decodes the first bank with a pending status, asks the domain's
    /// handler (then this client's handler) to resolve it, and clears the
    /// status bit on success. An unresolved fault poisons the domain and is
    /// returned as [`FaultOutcome::Fatal`]. The bank is unblocked on every
    /// path.
    ///
    /// Handlers run with no client lock held, so they may map, unmap and
    /// attach through the domain.
    pub fn handle_irq(&self) -> FaultOutcome {
        let (pgtable, domain) = {
            let state = self.state.read();
            if state.activations == 0 {
                klog!(Warn, "[SYSMMU] {}: fault interrupt while disabled", self.name);
            }
            (state.pgtable, state.domain.as_ref().and_then(Weak::upgrade))
        };

        let pending = self.banks.iter().find_map(|bank| {
            let status = bank.read32(REG_INT_STATUS);
            (status != 0).then_some((bank.as_ref(), status))
        });
        let Some((bank, status)) = pending else {
            klog!(Warn, "[SYSMMU] {}: spurious fault interrupt", self.name);
            return FaultOutcome::Spurious;
        };

        if !self.block(bank) {
            klog!(Warn, "[SYSMMU] {}: could not hold translation during fault", self.name);
        }

        let kind = FaultKind::from_status(status);
        let iova = kind.addr_register().map_or(0, |reg| bank.read32(reg));
        let info = FaultInfo {
            client: &self.name,
            iova,
            kind,
            pgtable,
        };

        let mut result = match &domain {
            Some(domain) => domain.report_fault(&info),
            None => Err(FaultError::NoHandler),
        };
        if result == Err(FaultError::NoHandler) {
            let handler = self.fault_handler.read().clone();
            if let Some(handler) = handler {
                result = handler.handle_fault(&info);
            }
        }

        let outcome = match (result, kind.status_bit()) {
            (Ok(()), Some(bit)) => {
                bank.write32(REG_INT_CLEAR, bit);
                klog!(Debug, "[SYSMMU] {}: {} at {:#010x} handled", self.name, kind, iova);
                FaultOutcome::Handled { kind, iova }
            }
            (result, _) => {
                klog_force!(
                    "[SYSMMU] {}: {} at {:#010x} not handled ({:?}), status {:#x}",
                    self.name,
                    kind,
                    iova,
                    result,
                    status
                );
                match &domain {
                    Some(domain) => domain.fail_on_fault(&info),
                    None => klog_force!("[SYSMMU] {}: no domain attached", self.name),
                }
                FaultOutcome::Fatal { kind, iova }
            }
        };

        Self::unblock(bank);
        outcome
    }

    // ========================================================================
    // Register Sequences
    // ========================================================================

    fn set_ptbase(bank: &dyn RegisterBank, pgtable: PhysAddr) {
        bank.write32(REG_PT_BASE_ADDR, pgtable);
        bank.write32(REG_MMU_FLUSH, FLUSH_TRIGGER);
    }

    /// Hold new transactions. Bounded by `block_spin_limit` status polls;
    /// on timeout the unit is released again and `false` returned.
    fn block(&self, bank: &dyn RegisterBank) -> bool {
        bank.write32(REG_MMU_CTRL, CTRL_BLOCK);

        for _ in 0..self.block_spin_limit {
            if bank.read32(REG_MMU_STATUS) & STATUS_BLOCKED != 0 {
                return true;
            }
            core::hint::spin_loop();
        }

        Self::unblock(bank);
        klog!(Warn, "[SYSMMU] {}: block request timed out", self.name);
        false
    }

    fn unblock(bank: &dyn RegisterBank) {
        bank.write32(REG_MMU_CTRL, CTRL_ENABLE);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultResult;
    use crate::sim::{SimClock, SimRegisters};

    fn unit() -> (Arc<SimRegisters>, SysMmu) {
        let regs = Arc::new(SimRegisters::new(3));
        let client = SysMmu::new("fimc0", alloc::vec![regs.clone() as Arc<dyn RegisterBank>]);
        (regs, client)
    }

    #[test]
    fn test_enable_programs_hardware_once() {
        let (regs, client) = unit();
        let clk = Arc::new(SimClock::new());
        let client = client.with_clocks(clk.clone(), None);

        assert_eq!(client.enable_with_pgtable(0x6000_0000), Ok(EnableOutcome::Enabled));
        assert_eq!(client.enable_with_pgtable(0x6000_0000), Ok(EnableOutcome::AlreadyEnabled));
        assert_eq!(regs.pt_base(), 0x6000_0000);
        assert!(regs.is_enabled());
        assert_eq!(regs.enables(), 1);
        assert_eq!(clk.enable_count(), 1);
        assert_eq!(client.version(), Some(3));

        assert!(!client.disable());
        assert!(regs.is_enabled());
        assert!(client.disable());
        assert!(!regs.is_enabled());
        assert_eq!(clk.enable_count(), 0);
        assert_eq!(client.pgtable(), 0);
    }

    #[test]
    fn test_enable_with_other_table_rolls_back() {
        let (_regs, client) = unit();
        client.enable_with_pgtable(0x6000_0000).unwrap();
        assert_eq!(client.enable_with_pgtable(0x6000_4000), Err(SysMmuError::Busy));
        assert_eq!(client.activations(), 1);
        assert_eq!(client.pgtable(), 0x6000_0000);
    }

    #[test]
    fn test_no_hardware_cannot_enable() {
        let client = SysMmu::new("virtual", Vec::new());
        assert!(!client.has_hardware());
        assert_eq!(client.enable_with_pgtable(0x6000_0000), Err(SysMmuError::NoDevice));
    }

    #[test]
    fn test_invalidate_entry_requires_active() {
        let (regs, client) = unit();
        client.invalidate_entry(0x1000_0000).unwrap();
        assert!(regs.flushed_entries().is_empty());

        client.enable_with_pgtable(0x6000_0000).unwrap();
        client.invalidate_entry(0x1000_1234).unwrap();
        assert_eq!(regs.flushed_entries(), alloc::vec![0x1000_1000]);
        assert_eq!(regs.blocks(), 1);
        assert!(regs.is_enabled());
    }

    #[test]
    fn test_block_timeout_is_bounded() {
        let (regs, client) = unit();
        let client = client.with_block_spin_limit(120);
        client.enable_with_pgtable(0x6000_0000).unwrap();
        regs.set_stuck(true);

        assert_eq!(client.flush_tlb_all(), Err(SysMmuError::HardwareTimeout));
        assert_eq!(regs.status_reads(), 120);
        assert_eq!(regs.full_flushes(), 1); // only the one from enable
        assert!(regs.is_enabled());
    }

    #[test]
    fn test_irq_without_domain_uses_client_handler() {
        let (regs, client) = unit();
        client.enable_with_pgtable(0x6000_0000).unwrap();
        client.set_fault_handler(Arc::new(|info: &FaultInfo<'_>| -> FaultResult {
            assert_eq!(info.pgtable, 0x6000_0000);
            Ok(())
        }));

        regs.raise_fault(FaultKind::ArMultiHit, 0x2000_0000);
        assert_eq!(
            client.handle_irq(),
            FaultOutcome::Handled {
                kind: FaultKind::ArMultiHit,
                iova: 0x2000_0000
            }
        );
        assert_eq!(regs.int_status(), 0);
        assert!(regs.is_enabled());
    }

    #[test]
    fn test_irq_unhandled_is_fatal_and_unblocks() {
        let (regs, client) = unit();
        client.enable_with_pgtable(0x6000_0000).unwrap();
        regs.raise_fault(FaultKind::PageFault, 0x3000_0000);

        assert_eq!(
            client.handle_irq(),
            FaultOutcome::Fatal {
                kind: FaultKind::PageFault,
                iova: 0x3000_0000
            }
        );
        assert_ne!(regs.int_status(), 0);
        assert!(regs.is_enabled());
    }

    #[test]
    fn test_irq_spurious() {
        let (_regs, client) = unit();
        client.enable_with_pgtable(0x6000_0000).unwrap();
        assert_eq!(client.handle_irq(), FaultOutcome::Spurious);
    }

    #[test]
    fn test_unknown_status_bit_is_fatal() {
        let (regs, client) = unit();
        client.enable_with_pgtable(0x6000_0000).unwrap();
        client.set_fault_handler(Arc::new(|_: &FaultInfo<'_>| -> FaultResult { Ok(()) }));
        regs.raise_raw_status(1 << 9);

        assert!(matches!(
            client.handle_irq(),
            FaultOutcome::Fatal {
                kind: FaultKind::Unknown,
                ..
            }
        ));
    }
}
