// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end interrupt flows through a set of virtual APICs.

use std::time::Duration;
use vlapic::defs::ApicRegister;
use vlapic::defs::DeliveryMode;
use vlapic::defs::Esr;
use vlapic::defs::Icr;
use vlapic::startup_entry;
use vlapic::ApicClient;
use vlapic::ApicTier;
use vlapic::ApicVpInfo;
use vlapic::ApicWork;
use vlapic::HostTimer;
use vlapic::ReferenceTime;
use vlapic::Vlapic;
use vlapic::VlapicAccess;
use vlapic::VlapicSet;
use vlapic::VpIndex;
use vlapic::WireMode;

#[derive(Default)]
struct TestClient {
    now: u64,
    tsc: u64,
    eois: Vec<u8>,
    wakes: Vec<VpIndex>,
    host_tsc_deadline: Option<u64>,
}

impl ApicClient for TestClient {
    fn wake(&mut self, vp_index: VpIndex) {
        self.wakes.push(vp_index);
    }

    fn eoi(&mut self, vector: u8) {
        self.eois.push(vector);
    }

    fn now(&mut self) -> ReferenceTime {
        ReferenceTime::from_100ns(self.now)
    }

    fn tsc(&mut self) -> u64 {
        self.tsc
    }

    fn tsc_offset(&mut self) -> u64 {
        0
    }

    fn set_host_tsc_deadline(&mut self, deadline: u64) {
        self.host_tsc_deadline = Some(deadline);
    }

    fn pull_posted(&mut self) -> ([u32; 8], [u32; 8]) {
        ([0; 8], [0; 8])
    }
}

#[derive(Default)]
struct TestTimer {
    now: u64,
    armed: Option<ReferenceTime>,
}

impl HostTimer for TestTimer {
    fn now(&mut self) -> ReferenceTime {
        ReferenceTime::from_100ns(self.now)
    }

    fn arm(&mut self, deadline: ReferenceTime) {
        self.armed = Some(deadline);
    }

    fn cancel(&mut self) {
        self.armed = None;
    }
}

struct TestVp {
    apic: Vlapic,
    client: TestClient,
    timer: TestTimer,
}

impl TestVp {
    fn access(&mut self) -> VlapicAccess<'_, TestClient> {
        self.apic.access(&mut self.client)
    }

    fn scan(&mut self) -> ApicWork {
        self.apic.scan(&mut self.timer, true)
    }

    fn advance(&mut self, duration: Duration) {
        let units = duration.as_nanos() as u64 / 100;
        self.client.now += units;
        self.timer.now += units;
    }

    fn write_reg(&mut self, register: ApicRegister, value: u32) {
        let address = self.apic.base_address().unwrap() + ((register.0 as u64) << 4);
        self.access().mmio_write(address, &value.to_ne_bytes());
    }

    fn read_reg(&mut self, register: ApicRegister) -> u32 {
        let address = self.apic.base_address().unwrap() + ((register.0 as u64) << 4);
        let mut data = [0; 4];
        self.access().mmio_read(address, &mut data);
        u32::from_ne_bytes(data)
    }

    fn enable_software(&mut self) {
        self.write_reg(ApicRegister::SVR, 0x1ff);
    }

    fn send_icr(&mut self, icr: Icr) {
        let value = u64::from(icr);
        self.write_reg(ApicRegister::ICR1, (value >> 32) as u32);
        self.write_reg(ApicRegister::ICR0, value as u32);
    }
}

fn make_set(count: u32) -> (VlapicSet, Vec<TestVp>) {
    let set = VlapicSet::builder()
        .x2apic_capable(true)
        .tsc_frequency(1_000_000_000)
        .build();
    let vps = (0..count)
        .map(|index| TestVp {
            apic: set.add_apic(&ApicVpInfo {
                vp_index: VpIndex::new(index),
                apic_id: index,
            }),
            client: TestClient::default(),
            timer: TestTimer::default(),
        })
        .collect();
    (set, vps)
}

fn deliver_fixed(set: &VlapicSet, apic_id: u32, vector: u8, level: bool) {
    set.receive_interrupt(false, apic_id, DeliveryMode::FIXED, vector, level, |_| ());
}

#[test]
fn fixed_interrupt_delivery_and_eoi() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x80, false);
    let work = vp.scan();
    assert_eq!(work.interrupt, Some(0x80));
    vp.apic.acknowledge_interrupt(0x80);

    // Acknowledged interrupts do not show up again.
    assert_eq!(vp.scan().interrupt, None);

    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.scan().interrupt, None);
    // Edge-triggered EOIs are not broadcast.
    assert_eq!(vp.client.eois, Vec::<u8>::new());
}

#[test]
fn duplicate_request_collapses() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x80, false);
    deliver_fixed(&set, 0, 0x80, false);
    assert_eq!(vp.scan().interrupt, Some(0x80));
    vp.apic.acknowledge_interrupt(0x80);
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.scan().interrupt, None);
}

#[test]
fn ppr_tracks_tpr_and_in_service() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x85, false);
    assert_eq!(vp.scan().interrupt, Some(0x85));
    vp.apic.acknowledge_interrupt(0x85);
    // PPR takes the in-service class when it exceeds TPR.
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0x80);

    vp.write_reg(ApicRegister::TPR, 0x92);
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0x92);

    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0x92);
    vp.write_reg(ApicRegister::TPR, 0);
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0);
}

#[test]
fn tpr_blocks_equal_or_lower_class() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    vp.write_reg(ApicRegister::TPR, 0x40);
    deliver_fixed(&set, 0, 0x45, false);
    assert_eq!(vp.scan().interrupt, None);

    vp.write_reg(ApicRegister::TPR, 0x3f);
    assert_eq!(vp.scan().interrupt, Some(0x45));
}

#[test]
fn higher_class_preempts_in_service() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x41, false);
    assert_eq!(vp.scan().interrupt, Some(0x41));
    vp.apic.acknowledge_interrupt(0x41);

    // The same class is blocked by PPR; a higher class is not.
    deliver_fixed(&set, 0, 0x4f, false);
    assert_eq!(vp.scan().interrupt, None);
    deliver_fixed(&set, 0, 0x51, false);
    assert_eq!(vp.scan().interrupt, Some(0x51));
    vp.apic.acknowledge_interrupt(0x51);

    // EOI pops in reverse order; 0x4f stays blocked until 0x41 completes.
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0x40);
    assert_eq!(vp.scan().interrupt, None);
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.scan().interrupt, Some(0x4f));
}

#[test]
fn level_triggered_eoi_broadcasts_once() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x90, true);
    assert_eq!(vp.scan().interrupt, Some(0x90));
    vp.apic.acknowledge_interrupt(0x90);
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.client.eois, vec![0x90]);

    // A second EOI with nothing in service broadcasts nothing.
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.client.eois, vec![0x90]);
}

#[test]
fn flat_logical_destination_matches_multiple() {
    let (set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
    }
    vps[0].write_reg(ApicRegister::LDR, 0x02 << 24);
    vps[1].write_reg(ApicRegister::LDR, 0x01 << 24);

    let mask = set.calc_destination(true, 0x03);
    assert!(mask.contains(VpIndex::new(0)));
    assert!(mask.contains(VpIndex::new(1)));
    assert!(!mask.contains(VpIndex::new(2)));

    set.receive_interrupt(true, 0x03, DeliveryMode::FIXED, 0x33, false, |_| ());
    assert_eq!(vps[0].scan().interrupt, Some(0x33));
    assert_eq!(vps[1].scan().interrupt, Some(0x33));
}

#[test]
fn xapic_cluster_destinations() {
    let (set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
        vp.write_reg(ApicRegister::DFR, 0x0fff_ffff);
    }
    vps[0].write_reg(ApicRegister::LDR, 0x21 << 24);
    vps[1].write_reg(ApicRegister::LDR, 0x22 << 24);

    // Cluster 2, bit 0: the first processor only.
    let mask = set.calc_destination(true, 0x21);
    assert!(mask.contains(VpIndex::new(0)));
    assert!(!mask.contains(VpIndex::new(1)));

    // Both bits of cluster 2.
    let mask = set.calc_destination(true, 0x23);
    assert!(mask.contains(VpIndex::new(0)));
    assert!(mask.contains(VpIndex::new(1)));

    // A cluster with no members.
    assert!(set.calc_destination(true, 0x31).is_empty());

    // Cluster 0xf matches every cluster; the bit mask still selects.
    let mask = set.calc_destination(true, 0xf2);
    assert!(!mask.contains(VpIndex::new(0)));
    assert!(mask.contains(VpIndex::new(1)));

    set.receive_interrupt(true, 0x22, DeliveryMode::FIXED, 0x47, false, |_| ());
    assert_eq!(vps[0].scan().interrupt, None);
    assert_eq!(vps[1].scan().interrupt, Some(0x47));
}

#[test]
fn x2apic_logical_destinations() {
    let (set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
        let base = vp.apic.apic_base();
        vp.access().msr_write(0x1b, base | (1 << 10)).unwrap();
    }

    // The derived logical IDs are cluster 0, bits 1 and 2.
    let mask = set.calc_destination(true, 0x2);
    assert!(!mask.contains(VpIndex::new(0)));
    assert!(mask.contains(VpIndex::new(1)));

    // The 16-bit cluster must match exactly.
    assert!(set.calc_destination(true, (1 << 16) | 0x2).is_empty());

    // A cluster of !0 is broadcast.
    let mask = set.calc_destination(true, 0xffff_0000 | 0x1);
    assert!(mask.contains(VpIndex::new(0)));
    assert!(!mask.contains(VpIndex::new(1)));

    let icr = Icr::new()
        .with_vector(0x66)
        .with_destination_mode_logical(true)
        .with_level_assert(true)
        .with_x2apic_mda(0x3);
    vps[0].access().msr_write(0x830, icr.into()).unwrap();
    assert_eq!(vps[0].scan().interrupt, Some(0x66));
    assert_eq!(vps[1].scan().interrupt, Some(0x66));
}

#[test]
fn lowest_priority_picks_lowest_ppr() {
    let (set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
        vp.write_reg(ApicRegister::LDR, 0x01 << 24);
    }
    vps[0].write_reg(ApicRegister::TPR, 0x80);

    set.receive_interrupt(true, 0x01, DeliveryMode::LOWEST_PRIORITY, 0x44, false, |_| ());
    assert_eq!(vps[0].scan().interrupt, None);
    assert_eq!(vps[1].scan().interrupt, Some(0x44));
}

#[test]
fn init_sipi_launches_once() {
    let (_set, mut vps) = make_set(2);
    vps[0].enable_software();

    let init = Icr::new()
        .with_delivery_mode(DeliveryMode::INIT.0)
        .with_level_assert(true)
        .with_xapic_mda(1);
    vps[0].send_icr(init);
    let work = vps[1].scan();
    assert!(work.init);
    assert_eq!(work.sipi, None);
    vps[1].apic.init_reset();

    // INIT de-assert is a no-op.
    vps[0].send_icr(init.with_level_assert(false));
    assert!(!vps[1].scan().init);

    let sipi = Icr::new()
        .with_vector(0x10)
        .with_delivery_mode(DeliveryMode::SIPI.0)
        .with_level_assert(true)
        .with_xapic_mda(1);
    vps[0].send_icr(sipi);
    assert_eq!(vps[1].scan().sipi, Some(0x10));
    assert_eq!(startup_entry(0x10), 0x10000);

    // The second SIPI finds the processor running and is dropped.
    vps[0].send_icr(sipi);
    assert_eq!(vps[1].scan().sipi, None);
}

#[test]
fn nmi_shorthand_excludes_self() {
    let (_set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
    }
    let nmi = Icr::new()
        .with_delivery_mode(DeliveryMode::NMI.0)
        .with_level_assert(true)
        .with_destination_shorthand(3); // all excluding self
    vps[0].send_icr(nmi);
    assert!(!vps[0].scan().nmi);
    assert!(vps[1].scan().nmi);
}

#[test]
fn illegal_vector_pends_error() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();
    vp.write_reg(ApicRegister::LVT_ERROR, 0xe0);

    deliver_fixed(&set, 0, 5, false);
    // The error LVT fires on the receiver.
    assert_eq!(vp.scan().interrupt, Some(0xe0));

    // Writing ESR latches the pending bits for reading.
    assert_eq!(vp.read_reg(ApicRegister::ESR), 0);
    vp.write_reg(ApicRegister::ESR, 0);
    assert_eq!(
        vp.read_reg(ApicRegister::ESR),
        u32::from(Esr::new().with_received_illegal_vector(true))
    );
}

#[test]
fn illegal_vector_ipi_pends_on_sender() {
    let (_set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
    }
    let icr = Icr::new()
        .with_vector(3)
        .with_delivery_mode(DeliveryMode::FIXED.0)
        .with_level_assert(true)
        .with_xapic_mda(1);
    vps[0].send_icr(icr);
    assert_eq!(vps[1].scan().interrupt, None);

    vps[0].write_reg(ApicRegister::ESR, 0);
    assert_eq!(
        vps[0].read_reg(ApicRegister::ESR),
        u32::from(Esr::new().with_send_illegal_vector(true))
    );
}

#[test]
fn one_shot_timer_fires_once() {
    let (_set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();
    vp.write_reg(ApicRegister::LVT_TIMER, 0x70);
    vp.write_reg(ApicRegister::TIMER_DCR, 0b1011); // divide by 1
    vp.write_reg(ApicRegister::TIMER_ICR, 100);

    // Not due yet; the host timer is armed for the deadline.
    assert_eq!(vp.scan().interrupt, None);
    assert!(vp.timer.armed.is_some());

    vp.advance(Duration::from_nanos(500));
    assert_eq!(vp.scan().interrupt, Some(0x70));
    assert_eq!(vp.timer.armed, None);
    vp.apic.acknowledge_interrupt(0x70);
    vp.write_reg(ApicRegister::EOI, 0);

    vp.advance(Duration::from_nanos(1000));
    assert_eq!(vp.scan().interrupt, None);
    assert_eq!(vp.apic.stats().timer_fired, 1);
}

#[test]
fn masked_timer_lvt_swallows_expiration() {
    let (_set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();
    vp.write_reg(ApicRegister::LVT_TIMER, 0x70 | (1 << 16));
    vp.write_reg(ApicRegister::TIMER_DCR, 0b1011);
    vp.write_reg(ApicRegister::TIMER_ICR, 100);

    vp.advance(Duration::from_nanos(500));
    assert_eq!(vp.scan().interrupt, None);
    assert_eq!(vp.apic.stats().timer_fired, 0);
}

#[test]
fn x2apic_icr_and_self_ipi() {
    let (_set, mut vps) = make_set(2);
    for vp in &mut vps {
        vp.enable_software();
        let base = vp.apic.apic_base();
        vp.access().msr_write(0x1b, base | (1 << 10)).unwrap();
    }

    // The x2apic LDR is derived from the APIC ID: cluster 0, bit 1.
    assert_eq!(vps[1].access().msr_read(0x80d).unwrap(), 2);

    let icr = Icr::new()
        .with_vector(0x55)
        .with_level_assert(true)
        .with_x2apic_mda(1);
    vps[0].access().msr_write(0x830, icr.into()).unwrap();
    assert_eq!(vps[1].scan().interrupt, Some(0x55));

    vps[0].access().msr_write(0x83f, 0x60).unwrap();
    assert_eq!(vps[0].scan().interrupt, Some(0x60));
}

#[test]
fn mmio_rejects_unaligned_access() {
    let (_set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    let base = vp.apic.base_address().unwrap();
    let mut data = [0; 4];
    vp.access().mmio_read(base + 0x84, &mut data);
    assert_eq!(data, [!0; 4]);
}

#[test]
fn software_disabled_apic_drops_fixed_interrupts() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    // SVR enable is clear at reset.
    deliver_fixed(&set, 0, 0x80, false);
    assert_eq!(vp.scan().interrupt, None);
    // NMIs are delivered regardless.
    set.receive_interrupt(false, 0, DeliveryMode::NMI, 0, false, |_| ());
    assert!(vp.scan().nmi);
}

#[test]
fn lint0_wire_modes() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    // Disconnected by default.
    set.lint(VpIndex::new(0), 0, |_| ());
    assert!(!vp.scan().extint);

    set.set_wire_mode(WireMode::Intr);
    set.lint(VpIndex::new(0), 0, |_| ());
    assert!(vp.scan().extint);

    // Routed through the LVT, which is masked at reset.
    set.set_wire_mode(WireMode::Lapic);
    set.lint(VpIndex::new(0), 0, |_| ());
    let work = vp.scan();
    assert!(!work.extint);
    assert_eq!(work.interrupt, None);

    vp.write_reg(ApicRegister::LVT_LINT0, 0x77);
    set.lint(VpIndex::new(0), 0, |_| ());
    assert_eq!(vp.scan().interrupt, Some(0x77));
}

#[test]
fn tpr_threshold_fault_reports_pending_vector() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    vp.write_reg(ApicRegister::TPR, 0x60);
    deliver_fixed(&set, 0, 0x50, false);
    assert_eq!(vp.scan().interrupt, None);

    vp.write_reg(ApicRegister::TPR, 0x20);
    assert_eq!(vp.access().tpr_below_threshold(), Some(0x50));
}

#[test]
fn virtual_eoi_broadcasts_level_vector() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x90, true);
    assert_eq!(vp.scan().interrupt, Some(0x90));

    // Hardware completed the interrupt; only the broadcast is owed.
    vp.access().virtual_eoi(0x90);
    assert_eq!(vp.client.eois, vec![0x90]);
    assert_eq!(vp.apic.stats().eoi_level, 1);
}

#[test]
fn posted_tier_round_trip() {
    let (set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();

    deliver_fixed(&set, 0, 0x60, false);
    assert_eq!(vp.scan().interrupt, Some(0x60));

    vp.apic.enable_posted_mode();
    assert_eq!(vp.apic.tier(), ApicTier::Advanced);
    // The posted tier delivers through hardware, not through scan.
    assert_eq!(vp.scan().interrupt, None);

    let mut posted_irr = [0; 8];
    vp.apic.push_posted(|irr, isr, _tmr| {
        posted_irr = *irr;
        assert_eq!(*isr, [0; 8]);
    });
    assert_ne!(posted_irr[3] & (1 << (0x60 % 32)), 0);

    vp.apic.disable_posted_mode(&posted_irr, &[0; 8]);
    assert_eq!(vp.apic.tier(), ApicTier::Basic);
    assert_eq!(vp.scan().interrupt, Some(0x60));
    vp.apic.acknowledge_interrupt(0x60);
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.scan().interrupt, None);
}

#[test]
fn posted_isr_survives_tier_exit() {
    let (_set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();
    vp.apic.enable_posted_mode();

    // Hardware delivered a top-class vector while posted; fold it back in.
    let mut isr = [0u32; 8];
    isr[7] = 1 << (0xf5 % 32);
    vp.apic.disable_posted_mode(&[0; 8], &isr);

    assert_eq!(vp.read_reg(ApicRegister::PPR), 0xf0);
    vp.write_reg(ApicRegister::EOI, 0);
    assert_eq!(vp.read_reg(ApicRegister::PPR), 0);
}

#[test]
fn tsc_deadline_fires_via_reference_time() {
    let (_set, mut vps) = make_set(1);
    let vp = &mut vps[0];
    vp.enable_software();
    // Timer mode bits select TSC deadline.
    vp.write_reg(ApicRegister::LVT_TIMER, 0x70 | (0b10 << 17));

    vp.client.tsc = 1000;
    // 1GHz TSC: 1000 ticks from now is 1us.
    vp.access().msr_write(0x6e0, 2000).unwrap();
    assert_eq!(vp.scan().interrupt, None);

    vp.advance(Duration::from_micros(1));
    vp.client.tsc = 2000;
    assert_eq!(vp.scan().interrupt, Some(0x70));

    // The deadline reads back as zero once it has fired.
    assert_eq!(vp.access().msr_read(0x6e0).unwrap(), 0);
}

#[test]
fn pass_through_forwards_tsc_deadline() {
    let set = VlapicSet::builder().pass_through(true).build();
    let mut vp = TestVp {
        apic: set.add_apic(&ApicVpInfo {
            vp_index: VpIndex::new(0),
            apic_id: 0,
        }),
        client: TestClient::default(),
        timer: TestTimer::default(),
    };
    assert_eq!(vp.apic.tier(), ApicTier::PassThrough);
    vp.client.tsc = 500;
    vp.access().msr_write(0x6e0, 12345).unwrap();
    assert_eq!(vp.client.host_tsc_deadline, Some(12345));
}
