// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-vCPU virtual APIC: register file, priority engine, and the
//! interrupt acceptance/delivery state machine.

use crate::bitmap::SharedBitmap;
use crate::bitmap::VectorBitmap;
use crate::bitmap::BANKS;
use crate::defs::ApicBase;
use crate::defs::ApicVersion;
use crate::defs::DeliveryMode;
use crate::defs::Esr;
use crate::defs::Lvt;
use crate::defs::Svr;
use crate::defs::APIC_BASE_PAGE;
use crate::tier::ApicTier;
use crate::timer::ApicTimer;
use crate::timer::HostTimer;
use crate::ApicVpInfo;
use crate::GlobalState;
use crate::VpIndex;
use bitfield_struct::bitfield;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The priority class of a vector or priority register value.
pub(crate) fn priority(v: u8) -> u8 {
    v >> 4
}

/// In-service vectors, kept as a stack: interrupts are only delivered at a
/// strictly higher priority class than the current top, and EOI pops in
/// reverse order, so at most one vector per class is in service.
#[derive(Debug)]
pub(crate) struct InServiceStack(Vec<u8>);

impl InServiceStack {
    fn new() -> Self {
        Self(Vec::with_capacity(16))
    }

    pub fn push(&mut self, v: u8) {
        assert!(v >= 16);
        assert!(self.0.len() < 16);
        assert!(priority(self.top().unwrap_or(0)) < priority(v));

        self.0.push(v);
    }

    pub fn to_bitmap(&self) -> VectorBitmap {
        let mut bits = VectorBitmap::new();
        for &v in &self.0 {
            bits.set(v);
        }
        bits
    }

    /// Rebuilds the stack from a bitmap, keeping at most one vector per
    /// priority class and skipping the first (invalid) class.
    pub fn load_from_bitmap(&mut self, bits: &VectorBitmap) {
        self.clear();
        for class in 1..16u8 {
            let mut top = None;
            for offset in 0..16 {
                let v = class << 4 | offset;
                if bits.test(v) {
                    top = Some(v);
                }
            }
            if let Some(v) = top {
                self.push(v);
            }
        }
    }

    pub fn top(&self) -> Option<u8> {
        self.0.last().copied()
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.0.pop()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// State shared with other vCPUs: the multi-producer side of interrupt
/// acceptance. Everything here is reachable while a remote vCPU holds the
/// set's slot table lock for read.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub vp_index: VpIndex,
    /// Newly requested vectors, not yet pulled into the owner's IRR.
    pub new_irr: SharedBitmap,
    /// Trigger mode of each newly requested vector; published before the
    /// request bit.
    pub tmr: SharedBitmap,
    /// Error-status bits latched by remote senders, drained by the owner.
    pub esr: AtomicU32,
    /// Snapshot of the owner's PPR, for lowest-priority arbitration.
    pub ppr: AtomicU32,
    /// Pending non-fixed work (INIT, SIPI, NMI, EXTINT, error).
    pub work: AtomicU32,
}

#[bitfield(u32)]
pub(crate) struct WorkFlags {
    init: bool,
    sipi: bool,
    sipi_vector: u8,
    extint: bool,
    nmi: bool,
    error: bool,
    #[bits(19)]
    _rsvd: u32,
}

impl SharedState {
    pub fn new(vp_index: VpIndex) -> Self {
        Self {
            vp_index,
            new_irr: SharedBitmap::default(),
            tmr: SharedBitmap::default(),
            esr: AtomicU32::new(0),
            ppr: AtomicU32::new(0),
            work: AtomicU32::new(0),
        }
    }

    #[must_use]
    fn set_work(&self, f: impl Fn(WorkFlags) -> WorkFlags) -> bool {
        let old = self
            .work
            .fetch_update(Ordering::Release, Ordering::Relaxed, |w| {
                Some(f(WorkFlags::from(w)).into())
            })
            .unwrap();
        old == 0
    }

    /// Accepts an interrupt on behalf of this vCPU. Returns true if the vCPU
    /// should be woken up to scan.
    #[must_use]
    pub fn request_interrupt(
        &self,
        software_enabled: bool,
        delivery_mode: DeliveryMode,
        vector: u8,
        level_triggered: bool,
    ) -> bool {
        tracing::trace!(
            software_enabled,
            ?delivery_mode,
            vector,
            level_triggered,
            vp = self.vp_index.index(),
            "interrupt"
        );

        match delivery_mode {
            DeliveryMode::FIXED | DeliveryMode::LOWEST_PRIORITY => {
                if vector < 16 {
                    // Dropped before ever reaching IRR; the owner latches the
                    // error and fires its error LVT.
                    self.esr.fetch_or(
                        Esr::new().with_received_illegal_vector(true).into(),
                        Ordering::Relaxed,
                    );
                    return self.set_work(|w| w.with_error(true));
                }
                if !software_enabled {
                    return false;
                }
                self.tmr.assign(vector, level_triggered);
                self.new_irr.set(vector)
            }
            DeliveryMode::NMI => self.set_work(|w| w.with_nmi(true)),
            DeliveryMode::INIT => self.set_work(|w| w.with_init(true)),
            DeliveryMode::SIPI => {
                self.set_work(|w| w.with_sipi(true).with_sipi_vector(vector))
            }
            DeliveryMode::EXTINT => self.set_work(|w| w.with_extint(true)),
            _ => false,
        }
    }
}

/// Work to do as a result of [`Vlapic::scan`] or [`Vlapic::flush`].
#[derive(Debug, Default)]
pub struct ApicWork {
    /// An INIT interrupt was requested.
    ///
    /// Reset the vCPU's execution state, call [`Vlapic::init_reset`], and
    /// park it waiting for SIPI.
    pub init: bool,
    /// The INIT-SIPI protocol completed with the given vector.
    ///
    /// Launch the vCPU with its entry point set to
    /// [`startup_entry`](crate::startup_entry) of the vector.
    pub sipi: Option<u8>,
    /// An EXTINT interrupt was requested.
    ///
    /// When the processor is ready for injection, query the PIC for the
    /// vector and inject the interrupt.
    pub extint: bool,
    /// An NMI was requested.
    pub nmi: bool,
    /// A fixed interrupt was requested.
    ///
    /// Call [`Vlapic::acknowledge_interrupt`] after it has been injected.
    pub interrupt: Option<u8>,
}

/// An error writing the APIC base MSR.
#[derive(Debug, Error)]
pub enum InvalidApicBase {
    /// Invalid x2apic state.
    #[error("invalid x2apic state")]
    InvalidX2Apic,
    /// Can't disable x2apic without reset.
    #[error("can't disable x2apic without reset")]
    CantDisableX2Apic,
}

/// Per-APIC event counters.
#[derive(Debug, Default)]
pub struct Stats {
    /// EOIs received via register write or virtualized fault.
    pub eoi: u64,
    /// EOIs that retired a level-triggered vector.
    pub eoi_level: u64,
    /// EOIs with no vector in service.
    pub spurious_eoi: u64,
    /// Fixed interrupts delivered to the processor.
    pub interrupt: u64,
    /// Timer expirations that raised the timer LVT.
    pub timer_fired: u64,
    /// NMIs delivered.
    pub nmi: u64,
    /// External interrupts delivered.
    pub extint: u64,
    /// INIT requests delivered.
    pub init: u64,
    /// SIPI requests delivered.
    pub sipi: u64,
    /// IPIs sent to self.
    pub self_ipi: u64,
    /// IPIs sent with a broadcast shorthand or destination.
    pub broadcast_ipi: u64,
    /// IPIs sent to other processors.
    pub other_ipi: u64,
    /// Error LVT interrupts raised.
    pub error_lvt: u64,
    /// Requests pushed directly into hardware-managed state.
    pub posted_push: u64,
    /// Times hardware-managed state was folded back into software state.
    pub posted_pull: u64,
}

/// An individual virtual APIC for a processor.
#[derive(Debug)]
pub struct Vlapic {
    pub(crate) shared: Arc<SharedState>,
    pub(crate) global: Arc<GlobalState>,

    pub(crate) apic_base: u64,
    pub(crate) id: u32,
    pub(crate) version: u32,
    pub(crate) tpr: u32,
    pub(crate) ldr: u32,
    pub(crate) cluster_mode: bool,
    pub(crate) svr: u32,
    pub(crate) isr: InServiceStack,
    pub(crate) irr: VectorBitmap,
    pub(crate) tmr: VectorBitmap,
    pub(crate) next_irr: Option<u8>,
    pub(crate) esr: u32,
    pub(crate) icr: u64,
    pub(crate) lvt_cmci: u32,
    pub(crate) lvt_timer: u32,
    pub(crate) lvt_thermal: u32,
    pub(crate) lvt_pmc: u32,
    pub(crate) lvt_lint: [u32; 2],
    pub(crate) lvt_error: u32,
    pub(crate) timer: ApicTimer,
    pub(crate) tier: ApicTier,
    pub(crate) needs_posted_sync: bool,
    pub(crate) scan_irr: bool,

    pub(crate) stats: Stats,
}

impl Vlapic {
    pub(crate) fn new(
        shared: Arc<SharedState>,
        global: Arc<GlobalState>,
        vp: &ApicVpInfo,
        tier: ApicTier,
    ) -> Self {
        let mut apic = Self {
            shared,
            global,
            apic_base: 0,
            id: vp.apic_id,
            version: ApicVersion::new()
                .with_version(0x14)
                .with_max_lvt_entry(6)
                .into(),
            tpr: 0,
            ldr: 0,
            cluster_mode: false,
            svr: 0,
            isr: InServiceStack::new(),
            irr: VectorBitmap::new(),
            tmr: VectorBitmap::new(),
            next_irr: None,
            esr: 0,
            icr: 0,
            lvt_cmci: 0,
            lvt_timer: 0,
            lvt_thermal: 0,
            lvt_pmc: 0,
            lvt_lint: [0; 2],
            lvt_error: 0,
            timer: ApicTimer::new(),
            tier,
            needs_posted_sync: false,
            scan_irr: false,
            stats: Stats::default(),
        };
        apic.reset();
        apic
    }

    /// The vCPU index owning this APIC.
    pub fn vp_index(&self) -> VpIndex {
        self.shared.vp_index
    }

    /// Event counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Gets the APIC base MSR.
    pub fn apic_base(&self) -> u64 {
        self.apic_base
    }

    /// Gets the APIC base address, if the APIC is enabled and in xapic mode.
    pub fn base_address(&self) -> Option<u64> {
        if self.xapic_enabled() {
            Some((ApicBase::from(self.apic_base).base_page() as u64) << 12)
        } else {
            None
        }
    }

    /// Sets the APIC base MSR.
    pub fn set_apic_base(&mut self, apic_base: u64) -> Result<(), InvalidApicBase> {
        assert!(
            self.tier != ApicTier::Advanced,
            "posted state must be local before setting the APIC base"
        );
        self.set_apic_base_inner(apic_base)
    }

    /// The caller must ensure that posted APIC state is local.
    pub(crate) fn set_apic_base_inner(&mut self, apic_base: u64) -> Result<(), InvalidApicBase> {
        let current = ApicBase::from(self.apic_base);

        // Only allow changing the enable and x2apic enable bits.
        let new = ApicBase::from(apic_base);
        let new = current.with_enable(new.enable()).with_x2apic(new.x2apic());

        tracing::debug!(
            ?current,
            ?new,
            apic_base,
            vp = self.shared.vp_index.index(),
            "update apic base"
        );

        if new.x2apic() && (!new.enable() || !self.global.x2apic_capable) {
            return Err(InvalidApicBase::InvalidX2Apic);
        }

        if current.x2apic() && new.enable() && !new.x2apic() {
            // Leaving x2apic requires going through a reset or disable.
            return Err(InvalidApicBase::CantDisableX2Apic);
        }

        if current.enable() && !new.enable() {
            self.reset_registers();
        }

        self.apic_base = new.into();
        self.update_slot();
        Ok(())
    }

    pub(crate) fn hardware_enabled(&self) -> bool {
        ApicBase::from(self.apic_base).enable()
    }

    pub(crate) fn xapic_enabled(&self) -> bool {
        self.hardware_enabled() && !self.x2apic_enabled()
    }

    pub(crate) fn x2apic_enabled(&self) -> bool {
        ApicBase::from(self.apic_base).x2apic()
    }

    pub(crate) fn software_enabled(&self) -> bool {
        Svr::from(self.svr).enable()
    }

    /// Sets the masked bit in an LVT if the APIC is software disabled.
    pub(crate) fn effective_lvt(&self, lvt: u32) -> u32 {
        let mut lvt = Lvt::from(lvt);
        if !self.software_enabled() {
            lvt.set_masked(true);
        }
        lvt.into()
    }

    /// The task-priority register. Also reachable via CR8 on the owning vCPU.
    pub fn tpr(&self) -> u32 {
        self.tpr
    }

    /// Sets the task-priority register.
    pub fn set_tpr(&mut self, value: u32) {
        self.tpr = value & 0xff;
        self.update_ppr_snapshot();
    }

    /// The processor-priority register: TPR if its class is at least the
    /// class of the top in-service vector, otherwise that vector's class.
    pub fn ppr(&self) -> u32 {
        let isr_top = self.isr.top().unwrap_or(0);
        if priority(self.tpr as u8) >= priority(isr_top) {
            self.tpr
        } else {
            (isr_top & 0xf0).into()
        }
    }

    fn update_ppr_snapshot(&mut self) {
        self.shared.ppr.store(self.ppr(), Ordering::Relaxed);
    }

    /// Scans for pending interrupts and evaluates the timer, arming the host
    /// countdown for the next deadline.
    pub fn scan(&mut self, timer: &mut impl HostTimer, scan_irr: bool) -> ApicWork {
        if !self.hardware_enabled() {
            return Default::default();
        }

        if let Some(next) = self.timer.next_deadline() {
            let now = timer.now();
            if !next.is_after(now) {
                self.evaluate_timer(now);
            }
            match self.timer.next_deadline() {
                Some(next) => timer.arm(next),
                None => timer.cancel(),
            }
        }

        let mut r = self.flush();
        if scan_irr || self.scan_irr {
            self.pull_irr();
        }
        if self.tier != ApicTier::Advanced {
            r.interrupt = self.next_irr();
        }

        r
    }

    fn evaluate_timer(&mut self, now: crate::ReferenceTime) {
        if self.timer.evaluate(now) {
            let lvt = Lvt::from(self.lvt_timer);
            if !lvt.masked() {
                // Self-targeted accept through the normal path.
                if self.shared.request_interrupt(
                    self.software_enabled(),
                    DeliveryMode::FIXED,
                    lvt.vector(),
                    false,
                ) {
                    self.scan_irr = true;
                }
                self.stats.timer_fired += 1;
            }
        }
    }

    pub(crate) fn next_irr(&self) -> Option<u8> {
        if !self.software_enabled() {
            return None;
        }
        let vector = self.next_irr?;
        if priority(vector) > priority(self.ppr() as u8) {
            Some(vector)
        } else {
            None
        }
    }

    /// Flushes non-fixed work as in [`Self::scan`], but does not poll the
    /// timer or IRR.
    pub fn flush(&mut self) -> ApicWork {
        if self.shared.work.load(Ordering::Relaxed) == 0 {
            return Default::default();
        }

        let mut r = ApicWork::default();
        let work = WorkFlags::from(self.shared.work.swap(0, Ordering::SeqCst));
        if work.error() {
            // The error bits stay pending in shared state until the guest
            // writes ESR to latch them.
            self.fire_error_interrupt();
        }
        if work.init() {
            self.stats.init += 1;
            r.init = true;
        }
        if work.sipi() {
            self.stats.sipi += 1;
            r.sipi = Some(work.sipi_vector());
        }
        if work.nmi() {
            self.stats.nmi += 1;
            r.nmi = true;
        }
        if work.extint() {
            self.stats.extint += 1;
            r.extint = true;
        }

        r
    }

    /// Requests the error LVT vector on this vCPU, from the owner's context.
    pub(crate) fn fire_error_interrupt(&mut self) {
        let lvt = Lvt::from(self.lvt_error);
        if !lvt.masked() && lvt.vector() >= 16 && self.software_enabled() {
            self.irr.set(lvt.vector());
            self.tmr.clear(lvt.vector());
            self.needs_posted_sync = true;
            self.recompute_next_irr();
            self.stats.error_lvt += 1;
        }
    }

    /// Acknowledges the interrupt returned by `scan`, moving it from pending
    /// to in service.
    pub fn acknowledge_interrupt(&mut self, vector: u8) {
        assert!(self.tier != ApicTier::Advanced);
        assert_eq!(Some(vector), self.next_irr);
        self.irr.clear(vector);
        self.recompute_next_irr();
        self.isr.push(vector);
        self.update_ppr_snapshot();
        self.stats.interrupt += 1;
    }

    /// Pops the top in-service vector, recomputing PPR. Returns the vector
    /// and whether it was level-triggered (requiring an EOI broadcast).
    pub(crate) fn pop_in_service(&mut self) -> Option<(u8, bool)> {
        let vector = self.isr.pop()?;
        self.update_ppr_snapshot();
        Some((vector, self.tmr.test(vector)))
    }

    pub(crate) fn recompute_next_irr(&mut self) {
        self.next_irr = self.irr.find_highest();
    }

    /// Reads all remotely requested vectors into the local IRR. Two bitmaps
    /// are kept so that a second instance of a vector arriving while the
    /// first is being injected is not lost.
    pub(crate) fn pull_irr(&mut self) {
        for bank in 0..BANKS {
            // Read the request word first, with acquire ordering, so that the
            // trigger-mode bit associated with each request is correct.
            let irr = self.shared.new_irr.take_word(bank);
            if irr == 0 {
                continue;
            }
            let tmr = self.shared.tmr.load_word(bank);
            if Svr::from(self.svr).enable() {
                *self.irr.word_mut(bank) |= irr;
                let local_tmr = self.tmr.word_mut(bank);
                *local_tmr = (*local_tmr & !irr) | (tmr & irr);
                self.needs_posted_sync = true;
            }
        }
        self.recompute_next_irr();
        self.scan_irr = false;
    }

    /// The current acceleration tier.
    pub fn tier(&self) -> ApicTier {
        self.tier
    }

    /// Enters the posted-interrupt tier. Local pending state is pushed to the
    /// hardware-scanned page at the next [`Self::push_posted`].
    pub fn enable_posted_mode(&mut self) {
        assert!(
            self.tier == ApicTier::Basic,
            "posted mode requires software emulation to hand off from"
        );
        self.tier = ApicTier::Advanced;
        self.needs_posted_sync = true;
    }

    /// Leaves the posted-interrupt tier, accumulating IRR and ISR from the
    /// hardware-scanned page.
    pub fn disable_posted_mode(&mut self, irr: &[u32; BANKS], isr: &[u32; BANKS]) {
        self.accumulate_from_posted(irr, isr);
        self.tier = ApicTier::Basic;
    }

    pub(crate) fn accumulate_from_posted(&mut self, irr: &[u32; BANKS], isr: &[u32; BANKS]) {
        assert!(self.tier == ApicTier::Advanced);

        let mut local_isr = self.isr.to_bitmap();
        for bank in 0..BANKS {
            *self.irr.word_mut(bank) |= irr[bank];
            *local_isr.word_mut(bank) |= isr[bank];
        }
        self.isr.load_from_bitmap(&local_isr);
        self.update_ppr_snapshot();
        self.recompute_next_irr();
        self.needs_posted_sync = true;
    }

    /// Hands pending state to the posted-interrupt page, calling `update`
    /// with new IRR and ISR bits and the current TMR. `update` is not called
    /// if there is nothing to push.
    pub fn push_posted(&mut self, update: impl FnOnce(&[u32; BANKS], &[u32; BANKS], &[u32; BANKS])) {
        if self.needs_posted_sync && self.tier == ApicTier::Advanced && self.software_enabled() {
            let irr = self.irr.words();
            let isr = self.isr.to_bitmap().words();
            let tmr = self.tmr.words();
            update(&irr, &isr, &tmr);
            self.irr.clear_all();
            self.isr.clear();
            self.recompute_next_irr();
            self.update_ppr_snapshot();
            self.stats.posted_push += 1;
            self.needs_posted_sync = false;
        }
    }

    /// Returns true if it is safe to set an IRR bit directly in the posted
    /// page rather than through [`SharedState`].
    pub fn can_post_irr(&self) -> bool {
        self.tier == ApicTier::Advanced && self.software_enabled()
    }

    /// Power-on reset: clears everything, including the APIC base MSR and any
    /// pending requests.
    pub fn reset(&mut self) {
        assert!(self.tier != ApicTier::Advanced);

        self.apic_base = ApicBase::new()
            .with_base_page(APIC_BASE_PAGE)
            .with_bsp(self.shared.vp_index.is_bsp())
            .with_enable(true)
            .into();

        self.reset_registers();
        // Drop any pending requests.
        self.shared.work.store(0, Ordering::Relaxed);
        self.shared.esr.store(0, Ordering::Relaxed);
        self.shared.new_irr.clear_all();
        self.shared.tmr.clear_all();
    }

    /// INIT reset: reinitializes the register file but preserves the APIC ID
    /// and the base MSR (including the enabled-mode bits).
    pub fn init_reset(&mut self) {
        assert!(self.tier != ApicTier::Advanced);
        self.reset_registers();
    }

    fn reset_registers(&mut self) {
        let Self {
            shared: _,
            global: _,
            apic_base: _,
            id: _,
            version: _,
            tpr,
            ldr,
            cluster_mode,
            svr,
            isr,
            irr,
            tmr,
            next_irr,
            esr,
            icr,
            lvt_cmci,
            lvt_timer,
            lvt_thermal,
            lvt_pmc,
            lvt_lint,
            lvt_error,
            timer,
            tier: _,
            needs_posted_sync,
            scan_irr,
            stats: _,
        } = self;

        *tpr = 0;
        *ldr = 0;
        *cluster_mode = false;
        *svr = 0xff;
        isr.clear();
        irr.clear_all();
        tmr.clear_all();
        *next_irr = None;
        *esr = 0;
        *icr = 0;
        *needs_posted_sync = false;
        *scan_irr = false;
        for lvt in [lvt_cmci, lvt_timer, lvt_thermal, lvt_pmc, lvt_error]
            .into_iter()
            .chain(lvt_lint)
        {
            *lvt = Lvt::new().with_masked(true).into();
        }
        timer.reset();
        self.update_ppr_snapshot();
        self.update_slot();
    }

    pub(crate) fn update_slot(&self) {
        let mut mutable = self.global.mutable.write();
        let mutable = &mut *mutable;
        let slot = &mut mutable.by_apic_id[self.id as usize];
        slot.lint = self.lvt_lint.map(Lvt::from);
        slot.logical_id = (self.ldr >> 24) as u8;
        slot.hardware_enabled = self.hardware_enabled();
        slot.software_enabled = self.software_enabled();
        slot.tier = self.tier;

        mutable.x2apic_enabled -= slot.x2apic_enabled as usize;
        let apic_base = ApicBase::from(self.apic_base);
        slot.x2apic_enabled = apic_base.enable() && apic_base.x2apic();
        mutable.x2apic_enabled += slot.x2apic_enabled as usize;

        mutable.logical_cluster_mode -= slot.cluster_mode as usize;
        slot.cluster_mode = self.cluster_mode;
        mutable.logical_cluster_mode += slot.cluster_mode as usize;
    }

    pub(crate) fn id_register(&self) -> u32 {
        if self.x2apic_enabled() {
            self.id
        } else {
            self.id << 24
        }
    }

    pub(crate) fn ldr_register(&self) -> u32 {
        if self.x2apic_enabled() {
            // Derived read-only: fixed 16/16 cluster split of the APIC ID.
            crate::defs::X2ApicLogicalId::new()
                .with_cluster_id((self.id >> 4) as u16)
                .with_logical_id(1 << (self.id & 0xf))
                .into()
        } else {
            self.ldr
        }
    }
}

impl Drop for Vlapic {
    fn drop(&mut self) {
        let mut mutable = self.global.mutable.write();
        let mutable = &mut *mutable;
        let slot = &mut mutable.by_apic_id[self.id as usize];
        mutable.x2apic_enabled -= slot.x2apic_enabled as usize;
        mutable.logical_cluster_mode -= slot.cluster_mode as usize;
        slot.shared = None;
        slot.hardware_enabled = false;
        slot.software_enabled = false;
        slot.x2apic_enabled = false;
        slot.cluster_mode = false;
    }
}

#[cfg(test)]
mod tests {
    use super::priority;
    use super::InServiceStack;
    use crate::bitmap::VectorBitmap;

    #[test]
    fn in_service_stack_orders_by_class() {
        let mut isr = InServiceStack::new();
        isr.push(0x30);
        isr.push(0x51);
        assert_eq!(isr.top(), Some(0x51));
        assert_eq!(isr.pop(), Some(0x51));
        assert_eq!(isr.top(), Some(0x30));
    }

    #[test]
    #[should_panic]
    fn in_service_stack_rejects_same_class() {
        let mut isr = InServiceStack::new();
        isr.push(0x30);
        isr.push(0x31);
    }

    #[test]
    fn load_from_bitmap_keeps_one_per_class() {
        let mut bits = VectorBitmap::new();
        bits.set(0x30);
        bits.set(0x35);
        bits.set(0x82);
        let mut isr = InServiceStack::new();
        isr.load_from_bitmap(&bits);
        assert_eq!(isr.top(), Some(0x82));
        let restored = isr.to_bitmap();
        assert!(restored.test(0x35));
        assert!(!restored.test(0x30));
        assert_eq!(restored.count(), 2);
    }

    #[test]
    fn load_from_bitmap_covers_top_class() {
        let mut bits = VectorBitmap::new();
        bits.set(0xf5);
        bits.set(0x23);
        let mut isr = InServiceStack::new();
        isr.load_from_bitmap(&bits);
        assert_eq!(isr.top(), Some(0xf5));
        assert_eq!(isr.to_bitmap().count(), 2);
    }

    #[test]
    fn priority_is_high_nibble() {
        assert_eq!(priority(0x4f), 4);
        assert_eq!(priority(0x0f), 0);
    }
}
