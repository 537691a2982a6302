// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual local APIC emulation for x86 hypervisors.
//!
//! Each processor's APIC is a [`Vlapic`], owned by the vCPU that runs the
//! processor. The APICs of a VM are tied together by a [`VlapicSet`], which
//! routes interprocessor interrupts, message-signaled interrupts from
//! devices, and local interrupt lines to the right destination APICs.
//!
//! A vCPU interacts with its own APIC through [`Vlapic::access`], passing an
//! [`ApicClient`] implementation that handles the effects that leave the
//! APIC: waking other processors, broadcasting EOIs to the IO-APIC, and
//! reading the time base. Cross-processor requests are accepted wait-free
//! into shared state and pulled into the owner's register file the next time
//! it calls [`Vlapic::scan`].
//!
//! Three acceleration tiers are supported, selected per APIC via
//! [`ApicTier`]: full software emulation, hardware-posted interrupts with
//! software-assisted register faults, and pass-through to a physical APIC
//! owned by the guest.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod access;
mod apic;
mod bitmap;
pub mod defs;
mod tier;
mod timer;

pub use access::ApicClient;
pub use access::MsrError;
pub use access::VlapicAccess;
pub use apic::ApicWork;
pub use apic::InvalidApicBase;
pub use apic::Stats;
pub use apic::Vlapic;
pub use bitmap::VectorBitmap;
pub use tier::ApicTier;
pub use timer::HostTimer;
pub use timer::ReferenceTime;
pub use timer::TIMER_FREQUENCY;

use crate::apic::SharedState;
use crate::defs::DeliveryMode;
use crate::defs::Icr;
use crate::defs::Lvt;
use crate::defs::MsiAddress;
use crate::defs::MsiData;
use crate::defs::X2ApicLogicalId;
use crate::defs::XApicClusterLogicalId;
use parking_lot::RwLock;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The entry point of a processor started via the INIT-SIPI protocol with
/// the given vector.
pub const fn startup_entry(vector: u8) -> u64 {
    vector as u64 * 0x1000
}

/// A virtual processor index, as distinct from the APIC ID.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpIndex(u32);

impl VpIndex {
    /// The index of the bootstrap processor.
    pub const BSP: Self = Self(0);

    /// Wraps a raw index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw index.
    pub const fn index(&self) -> u32 {
        self.0
    }

    /// Returns whether this is the bootstrap processor.
    pub const fn is_bsp(&self) -> bool {
        self.0 == Self::BSP.0
    }
}

/// Identity of a processor being added to a [`VlapicSet`].
#[derive(Debug, Copy, Clone)]
pub struct ApicVpInfo {
    /// The processor's index.
    pub vp_index: VpIndex,
    /// The processor's APIC ID.
    pub apic_id: u32,
}

/// How the platform's legacy interrupt wire is routed to LINT0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WireMode {
    /// LINT0 is not connected; assertions are dropped.
    #[default]
    Null,
    /// LINT0 acts as the processor INTR pin: assertions deliver EXTINT work
    /// directly, bypassing the LVT.
    Intr,
    /// LINT0 is delivered through the LVT_LINT0 register.
    Lapic,
}

/// The set of virtual processors matched by a destination, as a bitmap of
/// [`VpIndex`] values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DestinationMask {
    bits: Vec<u64>,
}

impl DestinationMask {
    pub(crate) fn set(&mut self, vp: VpIndex) {
        let word = vp.index() as usize / 64;
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1 << (vp.index() % 64);
    }

    /// Returns whether `vp` is in the set.
    pub fn contains(&self, vp: VpIndex) -> bool {
        self.bits
            .get(vp.index() as usize / 64)
            .is_some_and(|w| w & (1 << (vp.index() % 64)) != 0)
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Iterates the matched processors in index order.
    pub fn iter(&self) -> impl Iterator<Item = VpIndex> + '_ {
        self.bits.iter().enumerate().flat_map(|(word, &bits)| {
            (0..64)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| VpIndex::new((word * 64 + bit) as u32))
        })
    }
}

/// The target of an interrupt message.
#[derive(Debug, Copy, Clone)]
pub(crate) enum Destination {
    Physical(u32),
    Logical(u32),
    Broadcast,
    AllExcept(u32),
}

impl Destination {
    pub fn from_icr(icr: Icr, x2apic: bool) -> Self {
        let mda = if x2apic {
            icr.x2apic_mda()
        } else {
            icr.xapic_mda().into()
        };
        Self::new(icr.destination_mode_logical(), mda, x2apic)
    }

    pub fn new(logical: bool, destination: u32, x2apic: bool) -> Self {
        if logical {
            Self::Logical(destination)
        } else if destination == !0 || (!x2apic && destination == 0xff) {
            Self::Broadcast
        } else {
            Self::Physical(destination)
        }
    }
}

/// The startup state of a processor, tracked for the INIT-SIPI protocol.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) enum StartupState {
    #[default]
    Running,
    WaitForSipi {
        sipis_remaining: u8,
    },
}

/// Per-APIC routing state, readable by any vCPU sending an interrupt.
#[derive(Debug)]
pub(crate) struct ApicSlot {
    pub logical_id: u8,
    pub hardware_enabled: bool,
    pub software_enabled: bool,
    pub cluster_mode: bool,
    pub x2apic_enabled: bool,
    pub tier: ApicTier,
    pub startup: StartupState,
    pub lint: [Lvt; 2],
    pub shared: Option<Arc<SharedState>>,
}

impl Default for ApicSlot {
    fn default() -> Self {
        Self {
            logical_id: 0,
            hardware_enabled: false,
            software_enabled: false,
            cluster_mode: false,
            x2apic_enabled: false,
            tier: ApicTier::Basic,
            startup: StartupState::Running,
            lint: [Lvt::new(); 2],
            shared: None,
        }
    }
}

impl ApicSlot {
    /// Accepts a fixed-class interrupt into the slot's shared state, waking
    /// the owner if needed.
    fn request_interrupt(
        &self,
        delivery_mode: DeliveryMode,
        vector: u8,
        level_triggered: bool,
        wake: &mut impl FnMut(VpIndex),
    ) {
        if !self.hardware_enabled {
            return;
        }
        if self.tier == ApicTier::PassThrough {
            // The guest owns the physical APIC; nothing routed here should
            // reach the emulator.
            tracing::warn!(
                ?delivery_mode,
                vector,
                "dropping interrupt for pass-through apic"
            );
            return;
        }
        let Some(shared) = &self.shared else { return };
        if shared.request_interrupt(self.software_enabled, delivery_mode, vector, level_triggered)
        {
            wake(shared.vp_index);
        }
    }
}

#[derive(Debug)]
pub(crate) struct GlobalState {
    pub x2apic_capable: bool,
    pub pass_through: bool,
    pub tsc_frequency: u64,
    pub mutable: RwLock<MutableGlobalState>,
}

#[derive(Debug, Default)]
pub(crate) struct MutableGlobalState {
    /// The number of APICs in x2apic mode.
    pub x2apic_enabled: usize,
    /// The number of xapic APICs in logical cluster mode.
    pub logical_cluster_mode: usize,
    pub wire_mode: WireMode,
    pub by_apic_id: Vec<ApicSlot>,
    /// APIC ID by vp index; `!0` for indexes with no APIC.
    pub by_index: Vec<u32>,
}

impl MutableGlobalState {
    /// Calls `f` for each slot matched by `destination`, in APIC ID order.
    fn for_each_destination<'a>(
        &'a self,
        destination: &Destination,
        mut f: impl FnMut(u32, &'a ApicSlot),
    ) {
        match *destination {
            Destination::Physical(id) => {
                if let Some(slot) = self.by_apic_id.get(id as usize) {
                    f(id, slot);
                }
            }
            Destination::Logical(mda) => {
                if self.x2apic_enabled == 0 && self.logical_cluster_mode == 0 {
                    // Everything is in flat mode.
                    for (id, slot) in self.by_apic_id.iter().enumerate() {
                        if slot.logical_id & mda as u8 != 0 {
                            f(id as u32, slot);
                        }
                    }
                } else {
                    for (id, slot) in self.by_apic_id.iter().enumerate() {
                        if self.logical_matches(id as u32, slot, mda) {
                            f(id as u32, slot);
                        }
                    }
                }
            }
            Destination::Broadcast => {
                for (id, slot) in self.by_apic_id.iter().enumerate() {
                    f(id as u32, slot);
                }
            }
            Destination::AllExcept(source) => {
                for (id, slot) in self.by_apic_id.iter().enumerate() {
                    if id as u32 != source {
                        f(id as u32, slot);
                    }
                }
            }
        }
    }

    fn logical_matches(&self, id: u32, slot: &ApicSlot, mda: u32) -> bool {
        if slot.x2apic_enabled {
            // The x2apic logical ID is derived from the APIC ID: a 16-bit
            // cluster and a one-hot bit within it. A cluster of !0 is
            // broadcast.
            let mda = X2ApicLogicalId::from(mda);
            let cluster = (id >> 4) as u16;
            let bit = 1u16 << (id & 0xf);
            (mda.cluster_id() == !0 || mda.cluster_id() == cluster) && mda.logical_id() & bit != 0
        } else if slot.cluster_mode {
            // A cluster of 0xf is broadcast.
            let mda = XApicClusterLogicalId::from(mda as u8);
            let logical = XApicClusterLogicalId::from(slot.logical_id);
            (mda.cluster_id() == 0xf || mda.cluster_id() == logical.cluster_id())
                && mda.logical_id() & logical.logical_id() != 0
        } else {
            slot.logical_id & mda as u8 != 0
        }
    }
}

impl GlobalState {
    /// Routes an interrupt message to the matching APICs.
    pub fn request_interrupt(
        &self,
        destination: Destination,
        delivery_mode: DeliveryMode,
        vector: u8,
        level_triggered: bool,
        mut wake: impl FnMut(VpIndex),
    ) {
        match delivery_mode {
            DeliveryMode::INIT | DeliveryMode::SIPI => {
                self.request_startup(destination, delivery_mode, vector, &mut wake);
            }
            DeliveryMode::SMI => {
                tracing::warn!("smi requested, not supported");
            }
            DeliveryMode::LOWEST_PRIORITY => {
                let mutable = self.mutable.read();
                // Arbitrate by the destinations' processor priorities, as
                // published in their shared state. Ties go to the lowest
                // matching APIC ID.
                let mut lowest: Option<(u32, &ApicSlot)> = None;
                mutable.for_each_destination(&destination, |_, slot| {
                    if !slot.hardware_enabled || !slot.software_enabled {
                        return;
                    }
                    let Some(shared) = &slot.shared else { return };
                    let ppr = shared.ppr.load(Ordering::Relaxed);
                    if lowest.map_or(true, |(best, _)| ppr < best) {
                        lowest = Some((ppr, slot));
                    }
                });
                if let Some((_, slot)) = lowest {
                    slot.request_interrupt(
                        DeliveryMode::FIXED,
                        vector,
                        level_triggered,
                        &mut wake,
                    );
                } else {
                    tracing::debug!(vector, "lowest-priority interrupt with no destination");
                }
            }
            _ => {
                let mutable = self.mutable.read();
                mutable.for_each_destination(&destination, |_, slot| {
                    slot.request_interrupt(delivery_mode, vector, level_triggered, &mut wake);
                });
            }
        }
    }

    /// Advances the INIT-SIPI startup protocol of the destination APICs.
    fn request_startup(
        &self,
        destination: Destination,
        delivery_mode: DeliveryMode,
        vector: u8,
        wake: &mut impl FnMut(VpIndex),
    ) {
        let mut mutable = self.mutable.write();
        let mutable = &mut *mutable;
        let mut targets = Vec::new();
        mutable.for_each_destination(&destination, |id, _| targets.push(id));
        for id in targets {
            let slot = &mut mutable.by_apic_id[id as usize];
            if !slot.hardware_enabled {
                continue;
            }
            let Some(shared) = slot.shared.clone() else {
                continue;
            };
            match delivery_mode {
                DeliveryMode::INIT => {
                    slot.startup = StartupState::WaitForSipi { sipis_remaining: 1 };
                    if shared.request_interrupt(
                        slot.software_enabled,
                        DeliveryMode::INIT,
                        vector,
                        false,
                    ) {
                        wake(shared.vp_index);
                    }
                }
                DeliveryMode::SIPI => match slot.startup {
                    StartupState::WaitForSipi { sipis_remaining } => {
                        let remaining = sipis_remaining.saturating_sub(1);
                        if remaining == 0 {
                            slot.startup = StartupState::Running;
                            if shared.request_interrupt(
                                slot.software_enabled,
                                DeliveryMode::SIPI,
                                vector,
                                false,
                            ) {
                                wake(shared.vp_index);
                            }
                        } else {
                            slot.startup = StartupState::WaitForSipi {
                                sipis_remaining: remaining,
                            };
                        }
                    }
                    StartupState::Running => {
                        tracing::debug!(apic_id = id, "sipi to running processor ignored");
                    }
                },
                _ => unreachable!(),
            }
        }
    }
}

/// Builder for a [`VlapicSet`].
pub struct VlapicSetBuilder {
    x2apic_capable: bool,
    pass_through: bool,
    tsc_frequency: u64,
}

impl VlapicSetBuilder {
    /// Sets whether the guest can put APICs into x2apic mode.
    pub fn x2apic_capable(mut self, capable: bool) -> Self {
        self.x2apic_capable = capable;
        self
    }

    /// Gives the guest direct ownership of the physical APICs. Added APICs
    /// start in [`ApicTier::PassThrough`].
    pub fn pass_through(mut self, pass_through: bool) -> Self {
        self.pass_through = pass_through;
        self
    }

    /// Sets the guest TSC frequency, used to convert TSC deadlines to
    /// reference time.
    pub fn tsc_frequency(mut self, hz: u64) -> Self {
        assert_ne!(hz, 0);
        self.tsc_frequency = hz;
        self
    }

    /// Builds the set.
    pub fn build(self) -> VlapicSet {
        VlapicSet {
            global: Arc::new(GlobalState {
                x2apic_capable: self.x2apic_capable,
                pass_through: self.pass_through,
                tsc_frequency: self.tsc_frequency,
                mutable: Default::default(),
            }),
        }
    }
}

/// The virtual APICs of a VM.
#[derive(Debug, Clone)]
pub struct VlapicSet {
    global: Arc<GlobalState>,
}

impl VlapicSet {
    /// Returns a builder with x2apic and pass-through disabled and a 1GHz
    /// TSC.
    pub fn builder() -> VlapicSetBuilder {
        VlapicSetBuilder {
            x2apic_capable: false,
            pass_through: false,
            tsc_frequency: 1_000_000_000,
        }
    }

    /// The APIC timer's base frequency, before the divide configuration
    /// register is applied.
    pub fn frequency(&self) -> u64 {
        TIMER_FREQUENCY
    }

    /// Adds an APIC for the given processor, returning it for the vCPU to
    /// own.
    ///
    /// Panics if the APIC ID is already in use.
    pub fn add_apic(&self, vp: &ApicVpInfo) -> Vlapic {
        let shared = Arc::new(SharedState::new(vp.vp_index));
        {
            let mut mutable = self.global.mutable.write();
            if mutable.by_apic_id.len() <= vp.apic_id as usize {
                mutable
                    .by_apic_id
                    .resize_with(vp.apic_id as usize + 1, Default::default);
            }
            let slot = &mut mutable.by_apic_id[vp.apic_id as usize];
            assert!(slot.shared.is_none(), "duplicate apic id {:#x}", vp.apic_id);
            slot.shared = Some(shared.clone());
            if mutable.by_index.len() <= vp.vp_index.index() as usize {
                mutable.by_index.resize(vp.vp_index.index() as usize + 1, !0);
            }
            mutable.by_index[vp.vp_index.index() as usize] = vp.apic_id;
        }
        let tier = if self.global.pass_through {
            ApicTier::PassThrough
        } else {
            ApicTier::Basic
        };
        Vlapic::new(shared, self.global.clone(), vp, tier)
    }

    /// Delivers a message-signaled interrupt, calling `wake` for each
    /// processor that needs to scan.
    pub fn request_interrupt(&self, address: u64, data: u32, wake: impl FnMut(VpIndex)) {
        let address = MsiAddress::from(address as u32);
        let data = MsiData::from(data);
        self.receive_interrupt(
            address.destination_mode_logical(),
            address.virt_destination().into(),
            DeliveryMode(data.delivery_mode()),
            data.vector(),
            data.trigger_mode_level(),
            wake,
        );
    }

    /// Delivers an interrupt message that has already been decoded, e.g. by
    /// an IO-APIC redirection entry.
    pub fn receive_interrupt(
        &self,
        logical_destination: bool,
        destination: u32,
        delivery_mode: DeliveryMode,
        vector: u8,
        level_triggered: bool,
        wake: impl FnMut(VpIndex),
    ) {
        let x2apic = self.global.mutable.read().x2apic_enabled > 0;
        self.global.request_interrupt(
            Destination::new(logical_destination, destination, x2apic),
            delivery_mode,
            vector,
            level_triggered,
            wake,
        );
    }

    /// Computes the processors a destination would match, without delivering
    /// anything.
    pub fn calc_destination(&self, logical_destination: bool, destination: u32) -> DestinationMask {
        let mutable = self.global.mutable.read();
        let x2apic = mutable.x2apic_enabled > 0;
        let mut mask = DestinationMask::default();
        mutable.for_each_destination(
            &Destination::new(logical_destination, destination, x2apic),
            |_, slot| {
                if slot.hardware_enabled {
                    if let Some(shared) = &slot.shared {
                        mask.set(shared.vp_index);
                    }
                }
            },
        );
        mask
    }

    /// Sets the routing of the legacy interrupt wire to LINT0.
    pub fn set_wire_mode(&self, wire_mode: WireMode) {
        self.global.mutable.write().wire_mode = wire_mode;
    }

    /// The current routing of the legacy interrupt wire.
    pub fn wire_mode(&self) -> WireMode {
        self.global.mutable.read().wire_mode
    }

    /// Asserts a local interrupt line (edge only).
    pub fn lint(&self, vp_index: VpIndex, lint_index: usize, wake: impl FnOnce(VpIndex)) {
        let mutable = self.global.mutable.read();
        let Some(slot) = mutable
            .by_index
            .get(vp_index.index() as usize)
            .and_then(|&apic_id| mutable.by_apic_id.get(apic_id as usize))
        else {
            tracing::warn!(vp = vp_index.index(), "lint for unknown processor");
            return;
        };
        let Some(shared) = &slot.shared else { return };

        if lint_index == 0 {
            match mutable.wire_mode {
                WireMode::Null => return,
                WireMode::Intr => {
                    // The wire acts as the INTR pin, bypassing the LVT. The
                    // vector comes from the PIC at injection time.
                    if shared.request_interrupt(
                        slot.software_enabled,
                        DeliveryMode::EXTINT,
                        0,
                        false,
                    ) {
                        wake(vp_index);
                    }
                    return;
                }
                WireMode::Lapic => {}
            }
        }

        if !slot.hardware_enabled {
            return;
        }
        let lvt = slot.lint[lint_index];
        if lvt.masked() {
            return;
        }
        if lvt.trigger_mode_level() {
            tracing::warn!(lint_index, "level-triggered lint not supported");
            return;
        }
        if shared.request_interrupt(
            slot.software_enabled,
            DeliveryMode(lvt.delivery_mode()),
            lvt.vector(),
            false,
        ) {
            wake(vp_index);
        }
    }
}
