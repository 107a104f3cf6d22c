//! System MMU Fault Decoding and Reporting
//!
//! When a translation fails the unit raises an interrupt, latches one bit per
//! fault kind in `INT_STATUS` and records the faulting address in a
//! kind-specific register. The interrupt path (see `SysMmu::handle_irq`)
//! decodes the lowest pending bit with [`FaultKind::from_status`], asks the
//! registered [`FaultHandler`]s to resolve the fault and clears the bit only
//! if one of them succeeded.
//!
//! # Policy
//!
//! - A resolved fault is transparent: the bit is cleared and the unit resumes.
//! - An unresolved fault means a device touched memory nobody mapped for it.
//!   The owning address space is declared dead (see `Domain::poison`), the
//!   full page-table path is dumped with `klog_force!`, and the interrupt
//!   path reports [`FaultOutcome::Fatal`] to its caller.

use core::fmt;

use crate::hw::{REG_AR_FAULT_ADDR, REG_AW_FAULT_ADDR, REG_DEFAULT_SLAVE_ADDR, REG_PAGE_FAULT_ADDR};
use crate::{Iova, PhysAddr};

/// Number of architected fault kinds (one `INT_STATUS` bit each).
pub const NUM_FAULT_KINDS: u32 = 8;

// ============================================================================
// Fault Kinds
// ============================================================================

/// Translation fault classification, in `INT_STATUS` bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    PageFault,
    ArMultiHit,
    AwMultiHit,
    BusError,
    ArSecurityProtection,
    ArAccessProtection,
    AwSecurityProtection,
    AwAccessProtection,
    /// Interrupt with no recognisable status bit.
    Unknown,
}

impl FaultKind {
    const ALL: [FaultKind; NUM_FAULT_KINDS as usize] = [
        Self::PageFault,
        Self::ArMultiHit,
        Self::AwMultiHit,
        Self::BusError,
        Self::ArSecurityProtection,
        Self::ArAccessProtection,
        Self::AwSecurityProtection,
        Self::AwAccessProtection,
    ];

    /// Decode the lowest pending bit of an `INT_STATUS` value.
    pub fn from_status(status: u32) -> Self {
        if status == 0 {
            return Self::Unknown;
        }
        Self::ALL
            .get(status.trailing_zeros() as usize)
            .copied()
            .unwrap_or(Self::Unknown)
    }

    /// `INT_STATUS` / `INT_CLEAR` bit, `None` for [`FaultKind::Unknown`].
    pub fn status_bit(self) -> Option<u32> {
        Self::ALL.iter().position(|&k| k == self).map(|i| 1 << i)
    }

    /// Register holding the faulting address for this kind.
    pub fn addr_register(self) -> Option<usize> {
        match self {
            Self::PageFault => Some(REG_PAGE_FAULT_ADDR),
            Self::ArMultiHit | Self::ArSecurityProtection | Self::ArAccessProtection => {
                Some(REG_AR_FAULT_ADDR)
            }
            Self::AwMultiHit | Self::AwSecurityProtection | Self::AwAccessProtection => {
                Some(REG_AW_FAULT_ADDR)
            }
            Self::BusError => Some(REG_DEFAULT_SLAVE_ADDR),
            Self::Unknown => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PageFault => "PAGE FAULT",
            Self::ArMultiHit => "AR MULTI-HIT FAULT",
            Self::AwMultiHit => "AW MULTI-HIT FAULT",
            Self::BusError => "BUS ERROR",
            Self::ArSecurityProtection => "AR SECURITY PROTECTION FAULT",
            Self::ArAccessProtection => "AR ACCESS PROTECTION FAULT",
            Self::AwSecurityProtection => "AW SECURITY PROTECTION FAULT",
            Self::AwAccessProtection => "AW ACCESS PROTECTION FAULT",
            Self::Unknown => "UNKNOWN FAULT",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Everything a handler gets to see about one fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo<'a> {
    /// Name of the translation unit that faulted.
    pub client: &'a str,
    /// Faulting I/O virtual address.
    pub iova: Iova,
    pub kind: FaultKind,
    /// Level-1 table the unit was walking.
    pub pgtable: PhysAddr,
}

/// Why a handler did not resolve a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Handler declines; the next handler in line is consulted.
    NoHandler,
    /// Handler looked at the fault and could not fix it.
    Unresolved(i32),
}

pub type FaultResult = Result<(), FaultError>;

/// Consumer callback invoked from the fault interrupt path.
///
/// Implementations run with the faulting unit blocked but no client or domain
/// lock held. They may map or unmap in the domain and attach further clients.
/// Detaching the faulting client is not allowed.
pub trait FaultHandler: Send + Sync {
    fn handle_fault(&self, info: &FaultInfo<'_>) -> FaultResult;
}

impl<F> FaultHandler for F
where
    F: Fn(&FaultInfo<'_>) -> FaultResult + Send + Sync,
{
    fn handle_fault(&self, info: &FaultInfo<'_>) -> FaultResult {
        self(info)
    }
}

/// Result of one pass through the fault interrupt path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// No unit behind this client had a pending interrupt.
    Spurious,
    /// A handler resolved the fault and the status bit was cleared.
    Handled { kind: FaultKind, iova: Iova },
    /// Nobody resolved the fault; the address space is dead.
    Fatal { kind: FaultKind, iova: Iova },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_decode_lowest_bit() {
        assert_eq!(FaultKind::from_status(0x1), FaultKind::PageFault);
        assert_eq!(FaultKind::from_status(0x8), FaultKind::BusError);
        assert_eq!(FaultKind::from_status(0x8 | 0x80), FaultKind::BusError);
        assert_eq!(FaultKind::from_status(0x80), FaultKind::AwAccessProtection);
        assert_eq!(FaultKind::from_status(0x100), FaultKind::Unknown);
        assert_eq!(FaultKind::from_status(0), FaultKind::Unknown);
    }

    #[test]
    fn test_status_bits_round_trip() {
        for bit in 0..NUM_FAULT_KINDS {
            let kind = FaultKind::from_status(1 << bit);
            assert_eq!(kind.status_bit(), Some(1 << bit));
        }
        assert_eq!(FaultKind::Unknown.status_bit(), None);
    }

    #[test]
    fn test_addr_registers() {
        assert_eq!(FaultKind::PageFault.addr_register(), Some(REG_PAGE_FAULT_ADDR));
        assert_eq!(FaultKind::ArMultiHit.addr_register(), Some(REG_AR_FAULT_ADDR));
        assert_eq!(FaultKind::AwAccessProtection.addr_register(), Some(REG_AW_FAULT_ADDR));
        assert_eq!(FaultKind::BusError.addr_register(), Some(REG_DEFAULT_SLAVE_ADDR));
        assert_eq!(FaultKind::Unknown.addr_register(), None);
    }

    #[test]
    fn test_closure_handler() {
        let handler = |info: &FaultInfo<'_>| {
            if info.kind == FaultKind::PageFault {
                Ok(())
            } else {
                Err(FaultError::Unresolved(-14))
            }
        };
        let info = FaultInfo {
            client: "test",
            iova: 0x1000,
            kind: FaultKind::BusError,
            pgtable: 0,
        };
        assert_eq!(handler.handle_fault(&info), Err(FaultError::Unresolved(-14)));
    }
}
