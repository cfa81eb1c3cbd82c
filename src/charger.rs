//! MP2639A battery-charger supervisor.
//!
//! Samples a noisy `/CHG` line at 4 Hz and classifies its waveform into one
//! of four states using a 7-slot circular buffer, since the pin alone can
//! only ever read high or low but the hardware encodes a third ("blinking")
//! state in a 1 Hz toggle on that line. Also enforces a long-cycle
//! charge/pause duty cycle that is not part of the MP2639A's own behavior
//! but matches observed firmware history (see [`CHARGE_TIMEOUT_SAMPLES`]).

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_time::Instant;

use crate::error::PbResult;
use crate::init_busy::init_busy_down;
use crate::os::{Status, Timer};

/// Sample period: 4 Hz.
pub const SAMPLE_PERIOD_MS: u64 = 250;

/// `1 h / 250 ms`: after this many consecutive charging samples, force a
/// pause. Calibrated against a specific firmware version; see `DESIGN.md`.
pub const CHARGE_TIMEOUT_SAMPLES: u32 = 14_400;

/// How long to force `Discharging` once [`CHARGE_TIMEOUT_SAMPLES`] is hit.
pub const CHARGE_PAUSE_MS: u64 = 30_000;

const SAMPLE_COUNT: usize = 7;

/// Reported charger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum ChargerStatus {
    Discharging = 0,
    Charging = 1,
    Complete = 2,
    Fault = 3,
}

impl ChargerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChargerStatus::Charging,
            2 => ChargerStatus::Complete,
            3 => ChargerStatus::Fault,
            _ => ChargerStatus::Discharging,
        }
    }
}

/// USB Battery Charging Detection classification, as reported by the USB
/// BCD sub-state-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum UsbBcd {
    None = 0,
    StandardDownstream = 1,
    ChargingDownstream = 2,
    DedicatedCharging = 3,
    Nonstandard = 4,
}

/// Current-limit class applied to the ISET PWM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentLimit {
    NoLimit,
    StdMax,
    Charging,
}

fn limit_for_bcd(bcd: UsbBcd) -> (bool, CurrentLimit) {
    match bcd {
        UsbBcd::None => (false, CurrentLimit::NoLimit),
        UsbBcd::StandardDownstream => (true, CurrentLimit::StdMax),
        _ => (true, CurrentLimit::Charging),
    }
}

/// Drives the MODE and ISET lines. Implemented once per board.
pub trait ChargerOutputs {
    /// Asserts or deasserts charging, applying `limit` when `enable` is true.
    fn set_enabled(&mut self, enable: bool, limit: CurrentLimit);
    /// Reads the (possibly resistor-ladder-derived) `/CHG` signal, already
    /// inverted so that `true` means "charging" rather than pin-logic-low.
    fn read_chg(&mut self) -> bool;
    /// Reads the raw current-sense ADC channel.
    fn read_current_adc(&mut self) -> PbResult<u16>;
}

static STATUS: AtomicU8 = AtomicU8::new(ChargerStatus::Discharging as u8);
static USB_BCD: AtomicU8 = AtomicU8::new(UsbBcd::None as u8);

/// Reported status. Safe to call from anywhere; never blocks.
pub fn status() -> ChargerStatus {
    ChargerStatus::from_u8(STATUS.load(Ordering::Acquire))
}

/// Callback from the USB subsystem: selects the current-limit duty cycle on
/// the next 250 ms tick.
pub fn set_usb_type(bcd: UsbBcd) {
    USB_BCD.store(bcd as u8, Ordering::Release);
}

/// Empirically determined scaling from the raw ADC reading to milliamps.
fn scale_current_ma(raw: u16) -> i32 {
    ((raw as u32 * 35_116) >> 16) as i32 - 123
}

/// Reads the current-sense channel and applies [`scale_current_ma`].
pub fn current_now(outputs: &mut impl ChargerOutputs) -> PbResult<i32> {
    outputs.read_current_adc().map(scale_current_ma)
}

/// Pure sampling/classification core, separated from the `/CHG` pin and ADC
/// so it can be driven with a scripted sample sequence in tests.
pub struct Supervisor {
    samples: [bool; SAMPLE_COUNT],
    index: usize,
    charge_count: u32,
    mode_pin_is_low: bool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub const fn new() -> Self {
        Self { samples: [false; SAMPLE_COUNT], index: 0, charge_count: 0, mode_pin_is_low: false }
    }

    fn count_transitions(&self) -> u32 {
        let mut transitions = (self.samples[0] != self.samples[SAMPLE_COUNT - 1]) as u32;
        for i in 1..SAMPLE_COUNT {
            transitions += (self.samples[i] != self.samples[i - 1]) as u32;
        }
        transitions
    }

    /// Applies one 250 ms tick's worth of sampling. Returns the resulting
    /// status and whether the long-cycle pause should now be entered.
    fn tick(&mut self, enabled: bool, chg_sample: bool) -> (ChargerStatus, bool) {
        self.mode_pin_is_low = enabled;
        self.samples[self.index] = chg_sample;

        let status = if self.mode_pin_is_low {
            self.charge_count += 1;
            if self.count_transitions() > 2 {
                ChargerStatus::Fault
            } else if self.samples[self.index] {
                ChargerStatus::Charging
            } else if self.charge_count > 2 {
                ChargerStatus::Complete
            } else {
                ChargerStatus::Discharging
            }
        } else {
            self.charge_count = 0;
            ChargerStatus::Discharging
        };

        self.index = (self.index + 1) % SAMPLE_COUNT;

        let pause = self.charge_count > CHARGE_TIMEOUT_SAMPLES;
        if pause {
            self.charge_count = 0;
        }
        (status, pause)
    }
}

/// Top-level supervisor process. A board wires a concrete
/// [`ChargerOutputs`] implementation into [`run`]'s single call site.
pub struct ChargerProcess<O: ChargerOutputs> {
    outputs: O,
    core: Supervisor,
    timer: Timer,
    phase: Phase,
    decremented_init_busy: bool,
}

enum Phase {
    Sampling,
    Pausing,
}

impl<O: ChargerOutputs> ChargerProcess<O> {
    pub const fn new(outputs: O) -> Self {
        Self {
            outputs,
            core: Supervisor::new(),
            timer: Timer::new(),
            phase: Phase::Sampling,
            decremented_init_busy: false,
        }
    }

    /// Advances the supervisor by one poll. Call repeatedly from a
    /// [`crate::os::Process`] entry function.
    pub fn step(&mut self, now: Instant) -> Status {
        if !self.decremented_init_busy {
            self.outputs.set_enabled(false, CurrentLimit::NoLimit);
            self.decremented_init_busy = true;
            init_busy_down();
            self.timer.set_ms(now, SAMPLE_PERIOD_MS);
            return Status::Again;
        }

        if !self.timer.is_expired(now) {
            return Status::Again;
        }

        match self.phase {
            Phase::Sampling => {
                let bcd = UsbBcd::from_u8(USB_BCD.load(Ordering::Acquire));
                let (enable, limit) = limit_for_bcd(bcd);
                self.outputs.set_enabled(enable, limit);

                let chg_sample = self.outputs.read_chg();
                let (status, pause) = self.core.tick(enable, chg_sample);
                STATUS.store(status as u8, Ordering::Release);

                if pause {
                    STATUS.store(ChargerStatus::Discharging as u8, Ordering::Release);
                    self.outputs.set_enabled(false, CurrentLimit::NoLimit);
                    self.phase = Phase::Pausing;
                    self.timer.set_ms(now, CHARGE_PAUSE_MS);
                } else {
                    self.timer.set_ms(now, SAMPLE_PERIOD_MS);
                }
            }
            Phase::Pausing => {
                self.phase = Phase::Sampling;
                self.timer.set_ms(now, SAMPLE_PERIOD_MS);
            }
        }

        Status::Again
    }
}

impl UsbBcd {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => UsbBcd::StandardDownstream,
            2 => UsbBcd::ChargingDownstream,
            3 => UsbBcd::DedicatedCharging,
            4 => UsbBcd::Nonstandard,
            _ => UsbBcd::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_high_chg_is_discharging_while_charging_until_charge_count_builds() {
        let mut sup = Supervisor::new();
        let (status, _) = sup.tick(true, false);
        assert_eq!(status, ChargerStatus::Discharging);
    }

    #[test]
    fn three_consecutive_low_samples_report_complete() {
        let mut sup = Supervisor::new();
        sup.tick(true, false);
        sup.tick(true, false);
        let (status, _) = sup.tick(true, false);
        assert_eq!(status, ChargerStatus::Complete);
    }

    #[test]
    fn steady_asserted_chg_reports_charging() {
        let mut sup = Supervisor::new();
        let (status, _) = sup.tick(true, true);
        assert_eq!(status, ChargerStatus::Charging);
    }

    #[test]
    fn mode_pin_disabled_forces_discharging_and_resets_charge_count() {
        let mut sup = Supervisor::new();
        sup.tick(true, true);
        sup.tick(true, true);
        sup.tick(true, true);
        let (status, _) = sup.tick(false, false);
        assert_eq!(status, ChargerStatus::Discharging);
        assert_eq!(sup.charge_count, 0);
    }

    /// Property: a 1 Hz blink at 4 Hz sampling is detected as `Fault` within
    /// 7 samples and stays `Fault` while the blinking continues.
    #[test]
    fn blinking_chg_signal_is_detected_as_fault_within_one_buffer_cycle() {
        let mut sup = Supervisor::new();
        let pattern = [false, true, false, true, false, true, false];
        let mut last = ChargerStatus::Discharging;
        for &sample in pattern.iter() {
            let (status, _) = sup.tick(true, sample);
            last = status;
        }
        assert_eq!(last, ChargerStatus::Fault);

        // Keeps reporting fault as long as the blink continues.
        let (status, _) = sup.tick(true, !pattern[pattern.len() - 1]);
        assert_eq!(status, ChargerStatus::Fault);
    }

    /// Property: after `CHARGE_TIMEOUT_SAMPLES` consecutive charging
    /// samples, the supervisor requests a forced pause.
    #[test]
    fn long_charge_cycle_eventually_forces_a_pause() {
        let mut sup = Supervisor::new();
        let mut paused = false;
        for _ in 0..CHARGE_TIMEOUT_SAMPLES {
            let (_, pause) = sup.tick(true, true);
            if pause {
                paused = true;
                break;
            }
        }
        assert!(paused, "expected a forced pause within {CHARGE_TIMEOUT_SAMPLES} samples");
        assert_eq!(sup.charge_count, 0, "charge_count must reset once paused");
    }

    #[test]
    fn current_scaling_matches_empirical_formula() {
        assert_eq!(scale_current_ma(0), -123);
        assert_eq!(scale_current_ma(65_535), 35_115 - 123);
    }

    #[test]
    fn limit_selection_follows_bcd_classification() {
        assert_eq!(limit_for_bcd(UsbBcd::None), (false, CurrentLimit::NoLimit));
        assert_eq!(limit_for_bcd(UsbBcd::StandardDownstream), (true, CurrentLimit::StdMax));
        assert_eq!(limit_for_bcd(UsbBcd::ChargingDownstream), (true, CurrentLimit::Charging));
        assert_eq!(limit_for_bcd(UsbBcd::DedicatedCharging), (true, CurrentLimit::Charging));
        assert_eq!(limit_for_bcd(UsbBcd::Nonstandard), (true, CurrentLimit::Charging));
    }
}
