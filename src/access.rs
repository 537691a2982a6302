// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The boundary adapter: decodes MMIO and MSR accesses arriving from VM-exit
//! handling into register-file operations, and hosts the VM-exit entry
//! points for virtualized EOI, self IPI, and TPR-threshold faults.

use crate::apic::Vlapic;
use crate::defs::ApicRegister;
use crate::defs::Dcr;
use crate::defs::DeliveryMode;
use crate::defs::DestinationShorthand;
use crate::defs::Dfr;
use crate::defs::Esr;
use crate::defs::Icr;
use crate::defs::Lvt;
use crate::defs::Svr;
use crate::defs::TimerMode;
use crate::defs::X2APIC_MSR_BASE;
use crate::defs::X2APIC_MSR_END;
use crate::defs::X86X_MSR_APIC_BASE;
use crate::defs::X86X_MSR_TSC_DEADLINE;
use crate::tier::ApicTier;
use crate::timer::ReferenceTime;
use crate::Destination;
use crate::VpIndex;
use std::time::Duration;
use thiserror::Error;

const ICR_LOW_MASK: Icr = Icr::new()
    .with_vector(!0)
    .with_delivery_mode(0b111)
    .with_destination_mode_logical(true)
    .with_level_assert(true)
    .with_trigger_mode_level(true)
    .with_destination_shorthand(0b11);

const ICR_XAPIC_MASK: Icr = ICR_LOW_MASK.with_xapic_mda(!0);
const ICR_X2APIC_MASK: Icr = ICR_LOW_MASK.with_x2apic_mda(!0);

/// An error accessing an MSR, to be surfaced as a fault to the guest.
#[derive(Debug, Error)]
pub enum MsrError {
    /// The MSR is not handled by this layer.
    #[error("unknown msr")]
    Unknown,
    /// The MSR is known but the access is invalid; inject #GP.
    #[error("invalid msr access")]
    InvalidAccess,
}

/// The client to pass to [`Vlapic::access`], handling requests that leave
/// this vCPU's APIC.
pub trait ApicClient {
    /// Ensure the processor at `vp_index` calls `scan` soon. For the posted
    /// tier this sends the cross-core notification vector when the target is
    /// running on another physical core.
    fn wake(&mut self, vp_index: VpIndex);

    /// Broadcast the EOI of a level-triggered vector to the IO-APIC.
    fn eoi(&mut self, vector: u8);

    /// Returns the current reference time.
    fn now(&mut self) -> ReferenceTime;

    /// Returns the current guest TSC value.
    fn tsc(&mut self) -> u64;

    /// Returns the guest TSC offset: guest TSC = host TSC + offset.
    fn tsc_offset(&mut self) -> u64;

    /// Programs the physical TSC-deadline facility (pass-through only).
    fn set_host_tsc_deadline(&mut self, deadline: u64);

    /// Retrieve the posted IRR and ISR state, clearing it in the
    /// hardware-scanned page.
    fn pull_posted(&mut self) -> ([u32; 8], [u32; 8]);
}

/// Access to a virtual APIC.
pub struct VlapicAccess<'a, T> {
    apic: &'a mut Vlapic,
    client: &'a mut T,
}

impl Vlapic {
    /// Returns an object to access APIC registers.
    pub fn access<'a, T: ApicClient>(&'a mut self, client: &'a mut T) -> VlapicAccess<'a, T> {
        VlapicAccess { apic: self, client }
    }
}

fn is_valid_apic_access(address: u64) -> bool {
    // Any aligned access is valid.
    if address & 0xf == 0 {
        return true;
    }
    // Allow high byte accesses for some registers. Not architectural, but
    // some guests rely on it.
    if address & 0xf == 3 {
        return matches!(
            ApicRegister((address >> 4) as u8),
            ApicRegister::ID | ApicRegister::LDR | ApicRegister::DFR
        );
    }
    false
}

impl<T: ApicClient> VlapicAccess<'_, T> {
    /// Reads from the APIC MMIO page.
    pub fn mmio_read(&mut self, address: u64, data: &mut [u8]) {
        let register = ApicRegister((address >> 4) as u8);
        if !self.apic.xapic_enabled()
            || !is_valid_apic_access(address)
            || !self.apic.tier().mmio_read_allowed(register)
        {
            tracing::warn!(
                address,
                len = data.len(),
                enabled = self.apic.hardware_enabled(),
                x2apic = self.apic.x2apic_enabled(),
                tier = ?self.apic.tier(),
                "invalid apic read"
            );
            data.fill(!0);
            return;
        }

        let value = self.read_register(register).unwrap_or(0);

        let offset = address as usize & 3;
        data.fill(0);
        let len = data.len().min(4 - offset);
        let data = &mut data[..len];
        data.copy_from_slice(&value.to_ne_bytes()[offset..offset + data.len()]);
    }

    /// Writes to the APIC MMIO page.
    pub fn mmio_write(&mut self, address: u64, data: &[u8]) {
        let register = ApicRegister((address >> 4) as u8);
        if !self.apic.xapic_enabled()
            || !is_valid_apic_access(address)
            || !self.apic.tier().mmio_write_allowed(register)
        {
            tracing::warn!(
                address,
                len = data.len(),
                enabled = self.apic.hardware_enabled(),
                x2apic = self.apic.x2apic_enabled(),
                tier = ?self.apic.tier(),
                "invalid apic write"
            );
            return;
        }

        let mut value = [0; 4];
        let offset = address as usize & 3;
        let data = &data[..data.len().min(4 - offset)];
        value[offset..offset + data.len()].copy_from_slice(data);

        self.write_register(register, u32::from_ne_bytes(value));
    }

    /// Reads from the APIC base MSR, the TSC-deadline MSR, or an X2APIC MSR.
    pub fn msr_read(&mut self, msr: u32) -> Result<u64, MsrError> {
        let v = match msr {
            X86X_MSR_APIC_BASE => self.apic.apic_base(),
            X86X_MSR_TSC_DEADLINE => self.apic.timer.tsc_deadline(),
            X2APIC_MSR_BASE..=X2APIC_MSR_END if self.apic.x2apic_enabled() => {
                let register = ApicRegister((msr - X2APIC_MSR_BASE) as u8);
                if !self.apic.tier().msr_read_allowed(register) {
                    return Err(MsrError::InvalidAccess);
                }
                if register == ApicRegister::ICR0 {
                    // ICR is a 64-bit register in X2APIC.
                    self.apic.icr
                } else {
                    self.read_register(register)
                        .ok_or(MsrError::InvalidAccess)?
                        .into()
                }
            }
            _ => return Err(MsrError::Unknown),
        };
        Ok(v)
    }

    /// Writes to the APIC base MSR, the TSC-deadline MSR, or an X2APIC MSR.
    pub fn msr_write(&mut self, msr: u32, value: u64) -> Result<(), MsrError> {
        match msr {
            X86X_MSR_APIC_BASE => {
                // The APIC may be disabled by this, so IRR/ISR must be local.
                self.ensure_state_local();
                if let Err(err) = self.apic.set_apic_base_inner(value) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "invalid apic base write"
                    );
                }
            }
            X86X_MSR_TSC_DEADLINE => self.write_tsc_deadline(value),
            X2APIC_MSR_BASE..=X2APIC_MSR_END if self.apic.x2apic_enabled() => {
                let register = ApicRegister((msr - X2APIC_MSR_BASE) as u8);
                if !self.apic.tier().msr_write_allowed(register) {
                    return Err(MsrError::InvalidAccess);
                }
                if register == ApicRegister::ICR0 {
                    // ICR is a 64-bit register in X2APIC.
                    self.apic.icr = value & u64::from(ICR_X2APIC_MASK);
                    self.handle_ipi(Icr::from(self.apic.icr));
                } else if !self.write_register(register, value as u32) {
                    return Err(MsrError::InvalidAccess);
                }
            }
            _ => return Err(MsrError::Unknown),
        }
        Ok(())
    }

    fn write_tsc_deadline(&mut self, value: u64) {
        if self.apic.tier() == ApicTier::PassThrough {
            // The guest owns the physical APIC; forward the deadline,
            // translated for the VM's time-base offset.
            let mut host = value.wrapping_sub(self.client.tsc_offset());
            if value != 0 && host == 0 {
                // Zero is the disarm encoding; never forward it for an armed
                // deadline.
                host = 1;
            }
            self.client.set_host_tsc_deadline(host);
        } else {
            let fire = (value != 0).then(|| {
                let delta = value.saturating_sub(self.client.tsc());
                let nanos =
                    (delta as u128 * 1_000_000_000 / self.apic.global.tsc_frequency as u128) as u64;
                self.client.now().wrapping_add(Duration::from_nanos(nanos))
            });
            self.apic.timer.set_tsc_deadline(value, fire);
        }
    }

    /// Handles a virtualized-EOI fault from the accelerated tier: hardware
    /// completed a level-triggered vector and this layer owes the IO-APIC a
    /// broadcast.
    pub fn virtual_eoi(&mut self, vector: u8) {
        self.apic.stats.eoi += 1;
        self.apic.stats.eoi_level += 1;
        self.apic.tmr.clear(vector);
        self.client.eoi(vector);
        self.apic.scan_irr = true;
    }

    /// Handles a self-IPI fault (X2APIC SELF_IPI MSR or equivalent
    /// virtualization assist).
    pub fn self_ipi(&mut self, vector: u8) {
        self.apic.stats.self_ipi += 1;
        if self.apic.shared.request_interrupt(
            self.apic.software_enabled(),
            DeliveryMode::FIXED,
            vector,
            false,
        ) {
            self.apic.scan_irr = true;
        }
    }

    /// Handles a TPR-below-threshold fault: re-evaluates pending state and
    /// returns the vector now ready for injection, if any.
    pub fn tpr_below_threshold(&mut self) -> Option<u8> {
        self.ensure_state_local();
        self.apic.pull_irr();
        self.apic.next_irr()
    }

    fn eoi(&mut self) {
        self.ensure_state_local();
        if let Some((vector, level)) = self.apic.pop_in_service() {
            tracing::trace!(vector, "eoi");
            self.apic.stats.eoi += 1;
            // If this was a level-triggered interrupt, notify the IO-APIC.
            if level {
                self.client.eoi(vector);
                self.apic.stats.eoi_level += 1;
            }
            // A lower-priority pending vector may now be deliverable.
            self.apic.scan_irr = true;
        } else {
            tracing::warn!("eoi when no interrupts in service");
            self.apic.stats.spurious_eoi += 1;
        }
    }

    fn read_register(&mut self, register: ApicRegister) -> Option<u32> {
        let value = match register {
            ApicRegister::ID => self.apic.id_register(),
            ApicRegister::VERSION => self.apic.version,
            ApicRegister::TPR => self.apic.tpr(),
            ApicRegister::PPR => {
                self.ensure_state_local();
                self.apic.ppr()
            }
            ApicRegister::LDR => self.apic.ldr_register(),
            ApicRegister::DFR if !self.apic.x2apic_enabled() => {
                if self.apic.cluster_mode {
                    Dfr::CLUSTERED_MODE.0
                } else {
                    Dfr::FLAT_MODE.0
                }
            }
            ApicRegister::SVR => self.apic.svr,
            reg if (ApicRegister::ISR0..=ApicRegister::ISR7).contains(&reg) => {
                self.ensure_state_local();
                let index = (reg.0 - ApicRegister::ISR0.0) as usize;
                self.apic.isr.to_bitmap().word(index)
            }
            reg if (ApicRegister::TMR0..=ApicRegister::TMR7).contains(&reg) => {
                self.apic.pull_irr();
                let index = (reg.0 - ApicRegister::TMR0.0) as usize;
                self.apic.tmr.word(index)
            }
            reg if (ApicRegister::IRR0..=ApicRegister::IRR7).contains(&reg) => {
                self.ensure_state_local();
                self.apic.pull_irr();
                let index = (reg.0 - ApicRegister::IRR0.0) as usize;
                self.apic.irr.word(index)
            }
            ApicRegister::ESR => self.apic.esr,
            ApicRegister::ICR0 if !self.apic.x2apic_enabled() => self.apic.icr as u32,
            ApicRegister::ICR1 if !self.apic.x2apic_enabled() => (self.apic.icr >> 32) as u32,
            ApicRegister::LVT_CMCI => self.apic.lvt_cmci,
            ApicRegister::LVT_TIMER => self.apic.lvt_timer,
            ApicRegister::LVT_THERMAL => self.apic.lvt_thermal,
            ApicRegister::LVT_PMC => self.apic.lvt_pmc,
            ApicRegister::LVT_LINT0 => self.apic.lvt_lint[0],
            ApicRegister::LVT_LINT1 => self.apic.lvt_lint[1],
            ApicRegister::LVT_ERROR => self.apic.lvt_error,
            ApicRegister::TIMER_ICR => self.apic.timer.initial_count(),
            ApicRegister::TIMER_CCR => {
                let now = self.client.now();
                self.apic.timer.current_count(now)
            }
            ApicRegister::TIMER_DCR => self.apic.timer.divider(),
            register => {
                tracing::warn!(?register, "unimplemented apic register read");
                return None;
            }
        };
        Some(value)
    }

    fn write_register(&mut self, register: ApicRegister, value: u32) -> bool {
        match register {
            ApicRegister::TPR => {
                self.apic.set_tpr(value & 0xff);
            }
            ApicRegister::EOI => {
                if self.apic.x2apic_enabled() && value != 0 {
                    return false;
                }
                self.eoi();
            }
            ApicRegister::LDR if !self.apic.x2apic_enabled() => {
                self.apic.ldr = value & 0xff000000;
                self.apic.update_slot();
            }
            ApicRegister::DFR if !self.apic.x2apic_enabled() => {
                self.apic.cluster_mode = cluster_mode(value);
                self.apic.update_slot();
            }
            ApicRegister::SVR => {
                // The APIC may be software disabled by this, so posted state
                // must be local and requested interrupts accumulated first.
                self.ensure_state_local();
                self.apic.pull_irr();
                self.apic.svr = value & u32::from(Svr::new().with_vector(0xff).with_enable(true));
                if !self.apic.software_enabled() {
                    // Mask all the LVTs.
                    for lvt in [
                        &mut self.apic.lvt_cmci,
                        &mut self.apic.lvt_timer,
                        &mut self.apic.lvt_thermal,
                        &mut self.apic.lvt_pmc,
                        &mut self.apic.lvt_error,
                    ]
                    .into_iter()
                    .chain(&mut self.apic.lvt_lint)
                    {
                        *lvt = Lvt::from(*lvt).with_masked(true).into();
                    }
                }
                self.apic.update_slot();
            }
            ApicRegister::ESR => {
                if self.apic.x2apic_enabled() && value != 0 {
                    return false;
                }
                // Latch the hidden pending-error register into the readable
                // ESR.
                self.apic.esr = self
                    .apic
                    .shared
                    .esr
                    .swap(0, std::sync::atomic::Ordering::Relaxed);
            }
            ApicRegister::ICR0 if !self.apic.x2apic_enabled() => {
                self.apic.icr = (value as u64 | (self.apic.icr & 0xffffffff_00000000))
                    & u64::from(ICR_XAPIC_MASK);

                self.handle_ipi(self.apic.icr.into());
            }
            ApicRegister::ICR1 if !self.apic.x2apic_enabled() => {
                self.apic.icr = (((value as u64) << 32) | self.apic.icr & 0xffffffff)
                    & u64::from(ICR_XAPIC_MASK);
            }
            ApicRegister::LVT_CMCI => {
                self.apic.lvt_cmci = self.apic.effective_lvt(
                    value
                        & u32::from(
                            Lvt::new()
                                .with_vector(0xff)
                                .with_delivery_mode(0b111)
                                .with_masked(true),
                        ),
                );
            }
            ApicRegister::LVT_TIMER => {
                self.apic.lvt_timer = self.apic.effective_lvt(
                    value
                        & u32::from(
                            Lvt::new()
                                .with_vector(0xff)
                                .with_masked(true)
                                .with_timer_mode(0b11),
                        ),
                );
                // Changing mode while armed disarms any pending expiration.
                self.apic
                    .timer
                    .set_mode(TimerMode(Lvt::from(self.apic.lvt_timer).timer_mode()));
            }
            ApicRegister::LVT_THERMAL => {
                self.apic.lvt_thermal = self.apic.effective_lvt(
                    value
                        & u32::from(
                            Lvt::new()
                                .with_vector(0xff)
                                .with_delivery_mode(0b111)
                                .with_masked(true),
                        ),
                );
            }
            ApicRegister::LVT_PMC => {
                self.apic.lvt_pmc = self.apic.effective_lvt(
                    value
                        & u32::from(
                            Lvt::new()
                                .with_vector(0xff)
                                .with_delivery_mode(0b111)
                                .with_masked(true),
                        ),
                );
            }
            reg @ (ApicRegister::LVT_LINT0 | ApicRegister::LVT_LINT1) => {
                let index = if reg == ApicRegister::LVT_LINT0 { 0 } else { 1 };
                self.apic.lvt_lint[index] = self.apic.effective_lvt(
                    value
                        & u32::from(
                            Lvt::new()
                                .with_vector(0xff)
                                .with_input_pin_polarity(true)
                                .with_trigger_mode_level(true)
                                .with_delivery_mode(0b111)
                                .with_masked(true),
                        ),
                );
                self.apic.update_slot();
            }
            ApicRegister::LVT_ERROR => {
                self.apic.lvt_error = self.apic.effective_lvt(
                    value & u32::from(Lvt::new().with_vector(0xff).with_masked(true)),
                );
            }
            ApicRegister::TIMER_ICR => {
                let now = self.client.now();
                self.apic.timer.set_initial_count(value, now);
            }
            ApicRegister::TIMER_DCR => {
                let now = self.client.now();
                let value = value & u32::from(Dcr::new().with_value_low(0b11).with_value_high(0b1));
                self.apic.timer.set_divider(value, now);
            }
            ApicRegister::SELF_IPI if self.apic.x2apic_enabled() => {
                self.self_ipi(value as u8);
            }
            // Read-only registers. Writes are ignored via MMIO but fault in
            // X2APIC mode.
            ApicRegister::ID
            | ApicRegister::VERSION
            | ApicRegister::APR
            | ApicRegister::PPR
            | ApicRegister::RRD
            | ApicRegister::TIMER_CCR => {
                if self.apic.x2apic_enabled() {
                    return false;
                }
                tracing::trace!(?register, "write to read-only apic register ignored");
            }
            reg if (ApicRegister::ISR0..=ApicRegister::IRR7).contains(&reg) => {
                if self.apic.x2apic_enabled() {
                    return false;
                }
                tracing::trace!(?register, "write to read-only apic register ignored");
            }
            register => {
                tracing::warn!(?register, "unimplemented apic register write");
                return false;
            }
        }
        true
    }

    fn ensure_state_local(&mut self) {
        if self.apic.tier() == ApicTier::Advanced {
            let (irr, isr) = self.client.pull_posted();
            self.apic.accumulate_from_posted(&irr, &isr);
            self.apic.stats.posted_pull += 1;
        }
    }

    fn handle_ipi(&mut self, icr: Icr) {
        tracing::trace!(?icr, vp = self.apic.vp_index().index(), "ipi");

        let delivery_mode = DeliveryMode(icr.delivery_mode());
        match delivery_mode {
            DeliveryMode::FIXED | DeliveryMode::LOWEST_PRIORITY => {
                if delivery_mode == DeliveryMode::LOWEST_PRIORITY && self.apic.x2apic_enabled() {
                    // Lowest priority IPIs are not allowed via x2apic.
                    return;
                }
                if icr.vector() < 16 {
                    // Pends on the sender; the IPI is never sent.
                    self.apic.shared.esr.fetch_or(
                        Esr::new().with_send_illegal_vector(true).into(),
                        std::sync::atomic::Ordering::Relaxed,
                    );
                    self.apic.fire_error_interrupt();
                    return;
                }
            }
            DeliveryMode::NMI => {}
            DeliveryMode::INIT => {
                // Only the assertion edge matters; de-asserts are ignored.
                if !icr.level_assert() {
                    return;
                }
            }
            DeliveryMode::SIPI => {}
            DeliveryMode::SMI => {
                tracing::warn!(vp = self.apic.vp_index().index(), "smi ipi unsupported");
                return;
            }
            DeliveryMode::EXTINT => {
                // Not allowed as an IPI.
                return;
            }
            _ => return,
        }

        match DestinationShorthand(icr.destination_shorthand()) {
            DestinationShorthand::NONE => {
                let destination = Destination::from_icr(icr, self.apic.x2apic_enabled());
                match destination {
                    Destination::Physical(_) | Destination::Logical(_) => {
                        self.apic.stats.other_ipi += 1
                    }
                    Destination::Broadcast | Destination::AllExcept(_) => {
                        self.apic.stats.broadcast_ipi += 1
                    }
                }
                self.apic.global.request_interrupt(
                    destination,
                    delivery_mode,
                    icr.vector(),
                    false,
                    |vp| self.client.wake(vp),
                );
            }
            DestinationShorthand::SELF => {
                match delivery_mode {
                    DeliveryMode::FIXED | DeliveryMode::NMI => {
                        self.apic.stats.self_ipi += 1;
                        if self.apic.shared.request_interrupt(
                            self.apic.software_enabled(),
                            delivery_mode,
                            icr.vector(),
                            icr.trigger_mode_level(),
                        ) {
                            self.apic.scan_irr = true;
                        }
                    }
                    _ => {
                        // Self-targeted INIT/SIPI is architecturally invalid.
                        tracing::warn!(?delivery_mode, "ignoring self-targeted ipi");
                    }
                }
            }
            DestinationShorthand::ALL_INCLUDING_SELF => {
                self.apic.stats.broadcast_ipi += 1;
                self.apic.global.request_interrupt(
                    Destination::Broadcast,
                    delivery_mode,
                    icr.vector(),
                    false,
                    |vp| self.client.wake(vp),
                );
            }
            DestinationShorthand::ALL_EXCLUDING_SELF => {
                self.apic.stats.broadcast_ipi += 1;
                self.apic.global.request_interrupt(
                    Destination::AllExcept(self.apic.id),
                    delivery_mode,
                    icr.vector(),
                    false,
                    |vp| self.client.wake(vp),
                );
            }
            _ => unreachable!(),
        }
    }
}

pub(crate) fn cluster_mode(value: u32) -> bool {
    // Model values other than flat (0b1111) are reserved; treat them all as
    // cluster mode.
    Dfr(value | 0x0fff_ffff) != Dfr::FLAT_MODE
}
