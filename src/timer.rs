// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! APIC timer emulation: one-shot, periodic, and TSC-deadline modes, backed
//! by a host countdown facility.
//!
//! The timer keeps an absolute fire time on the reference clock rather than
//! counting down. The current count register is computed lazily from the
//! remaining time, and expiration is evaluated from the owning vCPU's scan
//! path, so a host timer callback that lost a race with a cancellation
//! observes a cleared fire time and does nothing.

use crate::defs::Dcr;
use crate::defs::TimerMode;
use std::time::Duration;

/// Nanoseconds per APIC timer tick (200MHz).
pub(crate) const NANOS_PER_TICK: u64 = 5;
/// The frequency of the APIC timer clock.
pub const TIMER_FREQUENCY: u64 = 1_000_000_000 / NANOS_PER_TICK;

/// A wrapping timestamp on the VM's monotonic reference clock, in 100ns
/// units.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReferenceTime(u64);

impl ReferenceTime {
    /// Wraps a raw 100ns tick count.
    pub const fn from_100ns(n: u64) -> Self {
        Self(n)
    }

    /// The raw 100ns tick count.
    pub fn as_100ns(&self) -> u64 {
        self.0
    }

    /// Returns the time `d` after `self`.
    pub fn wrapping_add(self, d: Duration) -> Self {
        Self(self.0.wrapping_add(d.as_nanos() as u64 / 100))
    }

    /// Returns the duration since `t`, or `None` if `t` is later than `self`.
    pub fn checked_sub(self, t: Self) -> Option<Duration> {
        let delta = self.0.wrapping_sub(t.0);
        if (delta as i64) >= 0 {
            Some(Duration::from_nanos(delta * 100))
        } else {
            None
        }
    }

    /// Returns whether `self` is after `t`, in the wrapping sense.
    pub fn is_after(self, t: Self) -> bool {
        (self.0.wrapping_sub(t.0) as i64) > 0
    }

    /// Returns whether `self` is before `t`, in the wrapping sense.
    pub fn is_before(self, t: Self) -> bool {
        (self.0.wrapping_sub(t.0) as i64) < 0
    }
}

/// The host countdown facility the vCPU's run loop supplies to
/// [`Vlapic::scan`](crate::Vlapic::scan). Arming is fire-and-forget: the
/// facility wakes the vCPU at or after the deadline, and the wakeup re-enters
/// `scan` to evaluate expiration.
pub trait HostTimer {
    /// The current reference time.
    fn now(&mut self) -> ReferenceTime;

    /// Arms the backing timer to wake this vCPU at `deadline`.
    fn arm(&mut self, deadline: ReferenceTime);

    /// Cancels any armed wakeup. A stale wakeup after this is harmless.
    fn cancel(&mut self);
}

/// Per-vCPU timer state.
#[derive(Debug)]
pub(crate) struct ApicTimer {
    mode: TimerMode,
    initial_count: u32,
    dcr: u32,
    divider_shift: u8,
    fire_time: Option<ReferenceTime>,
    period: Option<Duration>,
    tsc_deadline: u64,
}

fn ticks_to_duration(ticks: u64) -> Duration {
    Duration::from_nanos(ticks * NANOS_PER_TICK)
}

impl ApicTimer {
    pub fn new() -> Self {
        Self {
            mode: TimerMode::ONE_SHOT,
            initial_count: 0,
            dcr: 0,
            divider_shift: Dcr::new().divider_shift(),
            fire_time: None,
            period: None,
            tsc_deadline: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Applies the mode bits of the timer LVT. Changing mode while armed
    /// disarms any pending expiration.
    pub fn set_mode(&mut self, mode: TimerMode) {
        if mode != self.mode {
            self.mode = mode;
            self.fire_time = None;
            self.period = None;
            self.tsc_deadline = 0;
        }
    }

    pub fn initial_count(&self) -> u32 {
        self.initial_count
    }

    /// Programs the initial count, arming the timer at
    /// `now + (count << divider_shift)` ticks. A count of zero disarms.
    /// Ignored in TSC-deadline mode.
    pub fn set_initial_count(&mut self, value: u32, now: ReferenceTime) {
        if self.mode == TimerMode::TSC_DEADLINE {
            return;
        }
        self.initial_count = value;
        if value == 0 {
            self.fire_time = None;
            self.period = None;
            return;
        }
        let interval = ticks_to_duration((value as u64) << self.divider_shift);
        self.fire_time = Some(now.wrapping_add(interval));
        self.period = (self.mode == TimerMode::PERIODIC).then_some(interval);
    }

    /// The raw divide configuration register value.
    pub fn divider(&self) -> u32 {
        self.dcr
    }

    /// Applies a new divide configuration, rescaling any remaining count so
    /// the counts still outstanding elapse at the new rate.
    pub fn set_divider(&mut self, value: u32, now: ReferenceTime) {
        let old_shift = self.divider_shift;
        self.dcr = value;
        self.divider_shift = Dcr::from(value).divider_shift();
        if let Some(fire) = self.fire_time {
            if self.mode != TimerMode::TSC_DEADLINE {
                let remaining_ticks = fire
                    .checked_sub(now)
                    .map_or(0, |d| d.as_nanos() as u64 / NANOS_PER_TICK);
                let counts = remaining_ticks >> old_shift;
                self.fire_time =
                    Some(now.wrapping_add(ticks_to_duration(counts << self.divider_shift)));
            }
        }
        if self.period.is_some() {
            self.period = Some(ticks_to_duration(
                (self.initial_count as u64) << self.divider_shift,
            ));
        }
    }

    /// The lazily computed current count: `max(0, fire_time - now)` in ticks,
    /// scaled down by the divider. Zero when disarmed or in TSC-deadline
    /// mode.
    pub fn current_count(&self, now: ReferenceTime) -> u32 {
        if self.mode == TimerMode::TSC_DEADLINE {
            return 0;
        }
        let Some(fire) = self.fire_time else { return 0 };
        let Some(remaining) = fire.checked_sub(now) else {
            return 0;
        };
        let ticks = remaining.as_nanos() as u64 / NANOS_PER_TICK;
        (ticks >> self.divider_shift).try_into().unwrap_or(u32::MAX)
    }

    /// Arms or disarms the deadline. `raw` is the guest's programmed TSC
    /// deadline (zero disarms); `fire` is that deadline converted to
    /// reference time by the caller. Ignored outside TSC-deadline mode.
    pub fn set_tsc_deadline(&mut self, raw: u64, fire: Option<ReferenceTime>) {
        if self.mode != TimerMode::TSC_DEADLINE {
            return;
        }
        self.tsc_deadline = raw;
        self.fire_time = if raw != 0 { fire } else { None };
        self.period = None;
    }

    pub fn tsc_deadline(&self) -> u64 {
        self.tsc_deadline
    }

    /// Evaluates expiration at `now`. Returns true if the timer fired since
    /// the last evaluation; periodic timers re-arm, catching up past missed
    /// intervals, and one-shot/deadline timers clear their fire time so a
    /// stale wakeup cannot fire again.
    pub fn evaluate(&mut self, now: ReferenceTime) -> bool {
        let Some(fire) = self.fire_time else {
            return false;
        };
        if fire.is_after(now) {
            return false;
        }
        match self.period {
            Some(period) => {
                let behind = now.checked_sub(fire).unwrap_or(Duration::ZERO);
                let missed = behind.as_nanos() as u64 / period.as_nanos().max(1) as u64;
                self.fire_time = Some(fire.wrapping_add(Duration::from_nanos(
                    period.as_nanos() as u64 * (missed + 1),
                )));
            }
            None => {
                self.fire_time = None;
                self.tsc_deadline = 0;
            }
        }
        true
    }

    /// The next wakeup the vCPU should arm its host timer for.
    pub fn next_deadline(&self) -> Option<ReferenceTime> {
        self.fire_time
    }
}

#[cfg(test)]
mod tests {
    use super::ApicTimer;
    use super::ReferenceTime;
    use super::NANOS_PER_TICK;
    use crate::defs::Dcr;
    use crate::defs::TimerMode;

    fn at(ticks: u64) -> ReferenceTime {
        ReferenceTime::from_100ns(ticks * NANOS_PER_TICK / 100)
    }

    /// Divide value 0b111 selects divide-by-1.
    fn divide_by_1() -> u32 {
        Dcr::new().with_value_low(0b11).with_value_high(0b1).into()
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let mut timer = ApicTimer::new();
        timer.set_divider(divide_by_1(), at(0));
        timer.set_initial_count(1000, at(0));
        assert!(!timer.evaluate(at(980)));
        assert!(timer.evaluate(at(1000)));
        assert_eq!(timer.next_deadline(), None);
        // A stale wakeup after expiration is a no-op.
        assert!(!timer.evaluate(at(2000)));
    }

    #[test]
    fn current_count_is_lazy() {
        let mut timer = ApicTimer::new();
        timer.set_divider(divide_by_1(), at(0));
        timer.set_initial_count(1000, at(0));
        assert_eq!(timer.current_count(at(0)), 1000);
        assert_eq!(timer.current_count(at(400)), 600);
        assert_eq!(timer.current_count(at(5000)), 0);
    }

    #[test]
    fn divider_scales_count() {
        let mut timer = ApicTimer::new();
        // The reset divide value of zero selects divide-by-2.
        timer.set_divider(0, at(0));
        timer.set_initial_count(500, at(0));
        assert_eq!(timer.current_count(at(0)), 500);
        assert_eq!(timer.current_count(at(500)), 250);
        assert!(timer.evaluate(at(1000)));
    }

    #[test]
    fn periodic_rearms_with_catch_up() {
        let mut timer = ApicTimer::new();
        timer.set_divider(divide_by_1(), at(0));
        timer.set_mode(TimerMode::PERIODIC);
        timer.set_initial_count(100, at(0));
        assert!(timer.evaluate(at(100)));
        assert_eq!(timer.next_deadline(), Some(at(200)));
        // Far behind: catches up past all missed intervals.
        assert!(timer.evaluate(at(520)));
        assert_eq!(timer.next_deadline(), Some(at(600)));
    }

    #[test]
    fn mode_change_disarms() {
        let mut timer = ApicTimer::new();
        timer.set_divider(divide_by_1(), at(0));
        timer.set_initial_count(1000, at(0));
        assert!(timer.next_deadline().is_some());
        timer.set_mode(TimerMode::TSC_DEADLINE);
        assert_eq!(timer.next_deadline(), None);
        // Classic count writes are ignored in deadline mode.
        timer.set_initial_count(1000, at(0));
        assert_eq!(timer.next_deadline(), None);
        assert_eq!(timer.current_count(at(0)), 0);
    }

    #[test]
    fn tsc_deadline_zero_disarms() {
        let mut timer = ApicTimer::new();
        timer.set_mode(TimerMode::TSC_DEADLINE);
        timer.set_tsc_deadline(0x1000, Some(at(500)));
        assert_eq!(timer.tsc_deadline(), 0x1000);
        timer.set_tsc_deadline(0, None);
        assert_eq!(timer.next_deadline(), None);
        assert_eq!(timer.tsc_deadline(), 0);
    }
}
