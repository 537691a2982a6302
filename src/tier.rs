// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware acceleration tiers.
//!
//! The same guest-visible APIC behavior is produced by three structurally
//! different paths: full software emulation, hardware posted-interrupt
//! acceptance with software priority bookkeeping, or direct guest ownership
//! of the physical APIC. The tier additionally decides which guest accesses
//! are expected to reach the emulator at all; the boundary adapter consults
//! these predicates before forwarding a read or write.

use crate::defs::ApicRegister;

/// The acceleration tier of a virtual APIC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApicTier {
    /// Full software emulation of IRR/ISR/PPR on every access and interrupt.
    Basic,
    /// Hardware posted-interrupt acceptance. Pending interrupts live in a
    /// hardware-scanned bitmap; the software layer retains priority
    /// bookkeeping and pulls or pushes state only at access boundaries.
    Advanced,
    /// The guest owns the physical APIC directly. Nothing is emulated; any
    /// accept or access reaching this layer is a misconfiguration.
    PassThrough,
}

impl ApicTier {
    /// Whether a faulting MMIO read of `register` should be forwarded to the
    /// register file.
    pub fn mmio_read_allowed(&self, _register: ApicRegister) -> bool {
        match self {
            // All APIC-access faults are decoded in software.
            ApicTier::Basic => true,
            // The virtual-APIC page satisfies reads without a fault; a fault
            // arriving anyway is stale or misconfigured.
            ApicTier::Advanced => false,
            ApicTier::PassThrough => false,
        }
    }

    /// Whether a faulting MMIO write of `register` should be forwarded.
    pub fn mmio_write_allowed(&self, _register: ApicRegister) -> bool {
        match self {
            ApicTier::Basic => true,
            ApicTier::Advanced => false,
            ApicTier::PassThrough => false,
        }
    }

    /// Whether an X2APIC MSR read of `register` should be forwarded.
    pub fn msr_read_allowed(&self, register: ApicRegister) -> bool {
        match self {
            ApicTier::Basic => true,
            // The current count is hardware-owned and must be revalidated
            // against the emulated timer; CMCI is never virtualized.
            ApicTier::Advanced => {
                matches!(register, ApicRegister::LVT_CMCI | ApicRegister::TIMER_CCR)
            }
            ApicTier::PassThrough => false,
        }
    }

    /// Whether an X2APIC MSR write of `register` should be forwarded.
    pub fn msr_write_allowed(&self, register: ApicRegister) -> bool {
        match self {
            ApicTier::Basic => true,
            ApicTier::Advanced => matches!(
                register,
                ApicRegister::ICR0 | ApicRegister::LVT_CMCI | ApicRegister::SELF_IPI
            ),
            ApicTier::PassThrough => false,
        }
    }
}
