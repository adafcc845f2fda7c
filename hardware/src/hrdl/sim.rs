//! Simulated HRDL backend.
//!
//! Stands in for the vendor library on machines without a data logger. The
//! simulation keeps a table of up to [`MAX_UNITS`] units (handle `0` is
//! reserved for "no device") and produces pseudo-random 31-bit non-negative
//! counts from a deterministically seeded xoshiro128++ generator.
//!
//! Timing follows the nominal plan: a drain blocks on the backend's
//! [`Clock`] until `samples * sample_interval` has elapsed since the last
//! `run` or drain. With a [`ManualClock`](crate::clock::ManualClock) the
//! wait is instantaneous.

use std::time::Duration;

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro128PlusPlus;
use tracing::{debug, trace};

use super::{
    BlockMethod, ConversionTime, Handle, HrdlBackend, InfoKind, Mains, OpenStatus, Range,
    MAX_CHANNELS,
};
use crate::clock::{Clock, SystemClock};

/// Maximum number of simulated units.
pub const MAX_UNITS: usize = 16;

/// Default generator state, as four little-endian 32-bit words.
pub const DEFAULT_SEED: [u32; 4] = [0xdeadbeef, 0xcafed00d, 0xfead1234, 0x12345678];

const MAX_HANDLE: usize = MAX_UNITS + 1;

#[derive(Debug, Clone, Default)]
struct SimUnit {
    is_open: bool,
    opening_async: bool,
    open_time: i64,
    channels: [bool; MAX_CHANNELS as usize + 1],
    num_active_channels: i16,
    sample_interval_ms: i32,
    prev_sample_time: i64,
    last_run_time: i64,
    samples_to_take: i32,
    last_error: String,
}

impl SimUnit {
    fn reset(&mut self, now: i64, opening_async: bool) {
        *self = SimUnit {
            is_open: true,
            opening_async,
            open_time: now,
            ..SimUnit::default()
        };
    }
}

/// Simulated HRDL backend.
pub struct SimHrdl<C: Clock = SystemClock> {
    units: Vec<SimUnit>,
    available_units: usize,
    rng: Xoshiro128PlusPlus,
    clock: C,
}

impl SimHrdl<SystemClock> {
    /// Simulation with all [`MAX_UNITS`] units available, default seed, real time.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for SimHrdl<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> SimHrdl<C> {
    /// Simulation driven by `clock`, with the default seed.
    pub fn with_clock(clock: C) -> Self {
        let mut seed = [0u8; 16];
        for (chunk, word) in seed.chunks_exact_mut(4).zip(DEFAULT_SEED) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self {
            units: vec![SimUnit::default(); MAX_HANDLE],
            available_units: MAX_UNITS,
            rng: Xoshiro128PlusPlus::from_seed(seed),
            clock,
        }
    }

    /// Reseed the value generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Xoshiro128PlusPlus::seed_from_u64(seed);
        self
    }

    /// Limit the number of units that can be opened. `0` simulates an
    /// unplugged logger.
    pub fn with_available_units(mut self, units: usize) -> Self {
        self.available_units = units.min(MAX_UNITS);
        self
    }

    /// The clock driving this simulation.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn unit(&self, handle: Handle) -> Option<&SimUnit> {
        let idx = usize::try_from(handle.0).ok()?;
        if idx == 0 || idx >= MAX_HANDLE {
            return None;
        }
        self.units.get(idx).filter(|u| u.is_open)
    }

    fn unit_mut(&mut self, handle: Handle) -> Option<&mut SimUnit> {
        let idx = usize::try_from(handle.0).ok()?;
        if idx == 0 || idx >= MAX_HANDLE {
            return None;
        }
        self.units.get_mut(idx).filter(|u| u.is_open)
    }

    fn claim_free_unit(&mut self, opening_async: bool) -> Option<Handle> {
        let now = self.clock.now_ms();
        let idx = (1..=self.available_units).find(|&i| !self.units[i].is_open)?;
        self.units[idx].reset(now, opening_async);
        Some(Handle(idx as i16))
    }

    fn next_value(&mut self) -> i32 {
        (self.rng.next_u32() / 2) as i32
    }

    /// Wait out the nominal block duration and work out how many samples the
    /// caller gets. Returns `(samples, prev_sample_time, last_run_time, channels)`.
    fn wait_for_samples(
        &mut self,
        handle: Handle,
        n_samples: i32,
        capacity_values: usize,
    ) -> Option<(usize, i64, i64, usize)> {
        let unit = self.unit(handle)?;
        let interval = i64::from(unit.sample_interval_ms);
        let channels = usize::try_from(unit.num_active_channels).ok()?;
        if interval <= 0 || channels == 0 || n_samples <= 0 {
            return Some((0, unit.prev_sample_time, unit.last_run_time, channels));
        }

        let requested = i64::from(unit.samples_to_take.max(1));
        let prev = unit.prev_sample_time;
        let last_run = unit.last_run_time;

        let due = prev + requested * interval;
        let now = self.clock.now_ms();
        if now < due {
            self.clock.sleep(Duration::from_millis((due - now) as u64));
        }

        let elapsed = self.clock.now_ms() - prev;
        let ready = if let Some(unit) = self.unit(handle) {
            if unit.samples_to_take > 0 {
                i64::from(unit.samples_to_take)
            } else {
                elapsed / interval
            }
        } else {
            return None;
        };

        let samples = ready
            .min(i64::from(n_samples))
            .min((capacity_values / channels) as i64)
            .max(0) as usize;
        Some((samples, prev, last_run, channels))
    }

    fn finish_drain(&mut self, handle: Handle) {
        let now = self.clock.now_ms();
        if let Some(unit) = self.unit_mut(handle) {
            unit.prev_sample_time = now;
        }
    }
}

impl<C: Clock> HrdlBackend for SimHrdl<C> {
    fn open_unit(&mut self) -> OpenStatus {
        match self.claim_free_unit(false) {
            Some(handle) => {
                debug!("Simulated HRDL unit opened with handle {}", handle.0);
                OpenStatus::Opened(handle)
            }
            None => OpenStatus::NoDevice,
        }
    }

    fn open_unit_async(&mut self) -> bool {
        self.claim_free_unit(true).is_some()
    }

    fn open_unit_progress(&mut self) -> (Option<Handle>, u8) {
        let pending = self
            .units
            .iter_mut()
            .enumerate()
            .skip(1)
            .find(|(_, u)| u.is_open && u.opening_async);
        match pending {
            Some((idx, unit)) => {
                unit.opening_async = false;
                (Some(Handle(idx as i16)), 100)
            }
            None => (None, 100),
        }
    }

    fn unit_info(&self, handle: Handle, kind: InfoKind) -> String {
        if kind == InfoKind::DriverVersion {
            return "1.0.0.1".to_string();
        }
        let Some(unit) = self.unit(handle) else {
            return String::new();
        };
        match kind {
            InfoKind::DriverVersion => "1.0.0.1".to_string(),
            InfoKind::UsbVersion => "1.1".to_string(),
            InfoKind::HardwareVersion => "1".to_string(),
            InfoKind::VariantInfo => "24".to_string(),
            InfoKind::BatchAndSerial => "CMY02/116".to_string(),
            InfoKind::CalDate => "09Sep05".to_string(),
            InfoKind::KernelDriverVersion => "1234".to_string(),
            InfoKind::Error => unit.last_error.clone(),
            InfoKind::Settings => format!(
                "{} channels, {} ms interval, opened at {}",
                unit.num_active_channels, unit.sample_interval_ms, unit.open_time
            ),
        }
    }

    fn min_max_adc_counts(&self, handle: Handle, channel: i16) -> Option<(i32, i32)> {
        self.unit(handle)?;
        if !(1..=MAX_CHANNELS).contains(&channel) {
            return None;
        }
        Some((-i32::MAX, i32::MAX))
    }

    fn set_analog_in_channel(
        &mut self,
        handle: Handle,
        channel: i16,
        enabled: bool,
        _range: Range,
        single_ended: bool,
    ) -> bool {
        let Some(unit) = self.unit_mut(handle) else {
            return false;
        };

        if !(1..=MAX_CHANNELS).contains(&channel) {
            unit.last_error = format!("channel {channel} out of range");
            return false;
        }

        let idx = channel as usize;
        if !single_ended {
            // Differential inputs pair an odd channel with the even one above it.
            if channel % 2 != 1 || channel + 1 > MAX_CHANNELS {
                unit.last_error = format!("channel {channel} cannot start a differential pair");
                return false;
            }
            if unit.channels[idx + 1] {
                unit.last_error = format!("channel {} already enabled", channel + 1);
                return false;
            }
        }

        let was_active = unit.channels[idx];
        unit.channels[idx] = enabled;
        unit.num_active_channels += i16::from(enabled) - i16::from(was_active);
        trace!("Simulated channel {channel} enabled={enabled}");
        true
    }

    fn set_interval(
        &mut self,
        handle: Handle,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> bool {
        let Some(unit) = self.unit_mut(handle) else {
            return false;
        };
        let budget = i32::from(unit.num_active_channels) * conversion_time.millis();
        if sample_interval_ms <= 0 || budget > sample_interval_ms {
            unit.last_error = format!(
                "interval {sample_interval_ms} ms shorter than conversion budget {budget} ms"
            );
            return false;
        }
        unit.sample_interval_ms = sample_interval_ms;
        true
    }

    fn set_mains(&mut self, handle: Handle, _mains: Mains) -> bool {
        self.unit(handle).is_some()
    }

    fn run(&mut self, handle: Handle, n_values: i32, method: BlockMethod) -> bool {
        let now = self.clock.now_ms();
        let Some(unit) = self.unit_mut(handle) else {
            return false;
        };
        unit.samples_to_take = if method == BlockMethod::Block {
            n_values
        } else {
            0
        };
        unit.prev_sample_time = now;
        unit.last_run_time = now;
        true
    }

    fn ready(&self, handle: Handle) -> bool {
        let Some(unit) = self.unit(handle) else {
            return false;
        };
        let elapsed = self.clock.now_ms() - unit.prev_sample_time;
        let interval = i64::from(unit.sample_interval_ms);
        if unit.samples_to_take > 0 {
            i64::from(unit.samples_to_take) * interval <= elapsed
        } else {
            interval <= elapsed
        }
    }

    fn stop(&mut self, handle: Handle) {
        if let Some(unit) = self.unit_mut(handle) {
            unit.samples_to_take = 0;
        }
    }

    fn get_values(&mut self, handle: Handle, values: &mut [i32], n_samples: i32) -> (i32, bool) {
        let Some((samples, _, _, channels)) =
            self.wait_for_samples(handle, n_samples, values.len())
        else {
            return (0, false);
        };

        for value in values.iter_mut().take(samples * channels) {
            *value = self.next_value();
        }
        self.finish_drain(handle);
        (samples as i32, false)
    }

    fn get_times_and_values(
        &mut self,
        handle: Handle,
        times: &mut [i32],
        values: &mut [i32],
        n_samples: i32,
    ) -> (i32, bool) {
        let capacity = values.len().min(times.len().saturating_mul(
            self.unit(handle)
                .map(|u| u.num_active_channels.max(0) as usize)
                .unwrap_or(0),
        ));
        let Some((samples, prev, last_run, channels)) =
            self.wait_for_samples(handle, n_samples, capacity)
        else {
            return (0, false);
        };
        let interval = self
            .unit(handle)
            .map(|u| i64::from(u.sample_interval_ms))
            .unwrap_or(0);

        for (k, time) in times.iter_mut().take(samples).enumerate() {
            *time = (prev + k as i64 * interval - last_run) as i32;
        }
        for value in values.iter_mut().take(samples * channels) {
            *value = self.next_value();
        }
        self.finish_drain(handle);
        (samples as i32, false)
    }

    fn enabled_channel_count(&self, handle: Handle) -> Option<i16> {
        self.unit(handle).map(|u| u.num_active_channels)
    }

    fn close_unit(&mut self, handle: Handle) -> bool {
        match self.unit_mut(handle) {
            Some(unit) => {
                unit.is_open = false;
                debug!("Simulated HRDL unit {} closed", handle.0);
                true
            }
            None => false,
        }
    }
}
