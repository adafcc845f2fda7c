//! Owned HRDL unit with state tracking.

use std::fmt;

use tracing::{debug, info, warn};

use super::{
    BlockMethod, ConversionTime, Drain, Handle, HrdlBackend, HrdlError, HrdlResult, InfoKind,
    Mains, OpenStatus, Range, Variant, MAX_CHANNELS,
};
use crate::data_logger::DataLogger;

/// Lifecycle state of an [`HrdlUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Closed,
    Open,
    Configured,
    Armed,
    Ready,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Closed => "closed",
            UnitState::Open => "open",
            UnitState::Configured => "configured",
            UnitState::Armed => "armed",
            UnitState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// An open HRDL unit.
///
/// Owns its backend and handle. The unit is closed on drop; [`close`](Self::close)
/// may also be called explicitly any number of times.
pub struct HrdlUnit<B: HrdlBackend> {
    backend: B,
    handle: Handle,
    variant: Variant,
    state: UnitState,
    active_channels: Vec<i16>,
    /// Odd channels enabled as the first half of a differential pair.
    differential: Vec<i16>,
    interval_set: bool,
}

/// An asynchronous open in progress. See [`HrdlUnit::open_async`].
pub struct PendingOpen<B: HrdlBackend> {
    backend: B,
}

/// Result of polling a [`PendingOpen`].
pub enum OpenPoll<B: HrdlBackend> {
    /// Still opening; carries the progress in percent.
    Pending(PendingOpen<B>, u8),
    Ready(HrdlUnit<B>),
}

impl<B: HrdlBackend> PendingOpen<B> {
    /// Poll the vendor library for open progress.
    ///
    /// # Errors
    ///
    /// Returns [`HrdlError::NoDevice`] if the open completed without a handle.
    pub fn poll(mut self) -> HrdlResult<OpenPoll<B>> {
        match self.backend.open_unit_progress() {
            (_, progress) if progress < 100 => Ok(OpenPoll::Pending(self, progress)),
            (Some(handle), _) if handle.0 > 0 => {
                HrdlUnit::from_handle(self.backend, handle).map(OpenPoll::Ready)
            }
            (Some(_), _) => Err(HrdlError::OpenFailed(
                self.backend.unit_info(Handle::INVALID, InfoKind::Error),
            )),
            (None, _) => Err(HrdlError::NoDevice),
        }
    }
}

impl<B: HrdlBackend> HrdlUnit<B> {
    /// Open the first available unit on `backend`.
    ///
    /// # Errors
    ///
    /// - [`HrdlError::NoDevice`] when no unit is attached
    /// - [`HrdlError::OpenFailed`] when a unit exists but fails initialisation
    /// - [`HrdlError::UnexpectedVariant`] for variant info other than `20`/`24`
    pub fn open(mut backend: B) -> HrdlResult<Self> {
        match backend.open_unit() {
            OpenStatus::Opened(handle) => Self::from_handle(backend, handle),
            OpenStatus::NoDevice => Err(HrdlError::NoDevice),
            OpenStatus::Failed => {
                let detail = backend.unit_info(Handle::INVALID, InfoKind::Error);
                Err(HrdlError::OpenFailed(detail))
            }
        }
    }

    /// Start opening a unit without blocking; poll the result until ready.
    pub fn open_async(mut backend: B) -> HrdlResult<PendingOpen<B>> {
        if backend.open_unit_async() {
            Ok(PendingOpen { backend })
        } else {
            Err(HrdlError::NoDevice)
        }
    }

    fn from_handle(mut backend: B, handle: Handle) -> HrdlResult<Self> {
        let variant_info = backend.unit_info(handle, InfoKind::VariantInfo);
        let Some(variant) = Variant::from_info(&variant_info) else {
            backend.close_unit(handle);
            return Err(HrdlError::UnexpectedVariant(variant_info));
        };
        debug!("Opened HRDL unit {} ({:?})", handle.0, variant);

        Ok(Self {
            backend,
            handle,
            variant,
            state: UnitState::Open,
            active_channels: Vec::new(),
            differential: Vec::new(),
            interval_set: false,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Borrow the backend, e.g. to reach a simulation's clock.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Number of analog input channels on this variant.
    pub fn num_channels(&self) -> i16 {
        self.variant.num_channels()
    }

    /// Enabled channels in ascending order.
    pub fn active_channels(&self) -> &[i16] {
        &self.active_channels
    }

    /// Query one unit information string. Returns `""` once closed.
    pub fn info(&self, kind: InfoKind) -> String {
        if self.state == UnitState::Closed && kind != InfoKind::DriverVersion {
            return String::new();
        }
        self.backend.unit_info(self.handle, kind)
    }

    /// All descriptive information strings (driver version through kernel
    /// driver version), in vendor order.
    pub fn device_info(&self) -> Vec<(InfoKind, String)> {
        use strum::IntoEnumIterator;
        InfoKind::iter()
            .filter(|k| k.is_descriptive())
            .map(|k| (k, self.info(k)))
            .collect()
    }

    /// Log the device information table.
    pub fn log_device_info(&self) {
        info!("Device Information");
        info!("==================");
        for (kind, value) in self.device_info() {
            if kind == InfoKind::VariantInfo {
                info!("{} ADC-{}", kind.description(), value);
            } else {
                info!("{} {}", kind.description(), value);
            }
        }
        info!("==================");
    }

    fn ensure_open(&self) -> HrdlResult<()> {
        if self.state == UnitState::Closed {
            Err(HrdlError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> HrdlResult<()> {
        match self.state {
            UnitState::Closed => Err(HrdlError::Closed),
            UnitState::Open | UnitState::Configured => Ok(()),
            state => Err(HrdlError::InvalidState { operation, state }),
        }
    }

    fn check_channel(&self, channel: i16) -> HrdlResult<()> {
        let max = self.num_channels().min(MAX_CHANNELS);
        if (1..=max).contains(&channel) {
            Ok(())
        } else {
            Err(HrdlError::ChannelOutOfRange { channel, max })
        }
    }

    fn refresh_configured(&mut self) {
        if !self.active_channels.is_empty() && self.interval_set {
            self.state = UnitState::Configured;
        }
    }

    /// Minimum and maximum ADC counts for `channel`.
    pub fn min_max_counts(&self, channel: i16) -> HrdlResult<(i32, i32)> {
        self.ensure_open()?;
        self.check_channel(channel)?;
        self.backend
            .min_max_adc_counts(self.handle, channel)
            .ok_or(HrdlError::MinMaxUnavailable(channel))
    }

    /// Enable or disable an analog input.
    ///
    /// A differential input (`single_ended == false`) occupies an odd channel
    /// and the even channel above it; the partner must not already be enabled,
    /// and stays unavailable while the pair is active.
    pub fn set_channel(
        &mut self,
        channel: i16,
        enabled: bool,
        range: Range,
        single_ended: bool,
    ) -> HrdlResult<()> {
        self.ensure_idle("configure a channel")?;
        self.check_channel(channel)?;

        if !single_ended {
            let partner = channel + 1;
            if channel % 2 != 1 || partner > self.num_channels() {
                return Err(HrdlError::ChannelRejected {
                    channel,
                    detail: "differential inputs must start on an odd channel".to_string(),
                });
            }
            if self.active_channels.contains(&partner) {
                return Err(HrdlError::ChannelRejected {
                    channel,
                    detail: format!("channel {partner} is already enabled"),
                });
            }
        } else if enabled && channel % 2 == 0 && self.differential.contains(&(channel - 1)) {
            return Err(HrdlError::ChannelRejected {
                channel,
                detail: format!(
                    "channel {channel} is paired with differential channel {}",
                    channel - 1
                ),
            });
        }

        if !self
            .backend
            .set_analog_in_channel(self.handle, channel, enabled, range, single_ended)
        {
            return Err(HrdlError::ChannelRejected {
                channel,
                detail: self.info(InfoKind::Error),
            });
        }

        match (enabled, self.active_channels.binary_search(&channel)) {
            (true, Err(pos)) => self.active_channels.insert(pos, channel),
            (false, Ok(pos)) => {
                self.active_channels.remove(pos);
            }
            _ => {}
        }
        self.differential.retain(|&c| c != channel);
        if enabled && !single_ended {
            self.differential.push(channel);
        }
        debug!("Channel {channel} enabled={enabled} range={range:?}");
        self.refresh_configured();
        Ok(())
    }

    /// Set the sample interval and per-channel conversion time.
    ///
    /// # Errors
    ///
    /// [`HrdlError::TimingBudget`] when `active_channels * conversion_time`
    /// exceeds the interval; the device is not touched in that case.
    pub fn set_interval(
        &mut self,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> HrdlResult<()> {
        self.ensure_idle("set the sample interval")?;

        let channels = self.active_channels.len();
        let budget = channels as i64 * i64::from(conversion_time.millis());
        if sample_interval_ms <= 0 || budget > i64::from(sample_interval_ms) {
            return Err(HrdlError::TimingBudget {
                channels,
                conversion_ms: conversion_time.millis(),
                interval_ms: sample_interval_ms,
            });
        }

        if !self
            .backend
            .set_interval(self.handle, sample_interval_ms, conversion_time)
        {
            return Err(HrdlError::IntervalRejected(self.info(InfoKind::Settings)));
        }
        self.interval_set = true;
        self.refresh_configured();
        Ok(())
    }

    /// Select the mains frequency to reject.
    pub fn set_mains(&mut self, mains: Mains) -> HrdlResult<()> {
        self.ensure_idle("set mains rejection")?;
        if self.backend.set_mains(self.handle, mains) {
            Ok(())
        } else {
            Err(HrdlError::MainsRejected(self.info(InfoKind::Error)))
        }
    }

    /// Arm an acquisition of `n_samples` samples.
    pub fn run(&mut self, n_samples: i32, method: BlockMethod) -> HrdlResult<()> {
        self.ensure_idle("arm a block")?;
        if self.active_channels.is_empty() || !self.interval_set {
            return Err(HrdlError::InvalidState {
                operation: "arm a block",
                state: self.state,
            });
        }
        if !self.backend.run(self.handle, n_samples, method) {
            return Err(HrdlError::RunRejected(self.info(InfoKind::Settings)));
        }
        self.state = UnitState::Armed;
        Ok(())
    }

    /// Poll whether the armed block has completed.
    pub fn ready(&mut self) -> HrdlResult<bool> {
        match self.state {
            UnitState::Closed => Err(HrdlError::Closed),
            UnitState::Ready => Ok(true),
            UnitState::Armed => {
                let ready = self.backend.ready(self.handle);
                if ready {
                    self.state = UnitState::Ready;
                }
                Ok(ready)
            }
            state => Err(HrdlError::InvalidState {
                operation: "poll readiness",
                state,
            }),
        }
    }

    fn ensure_drainable(&self, needed: usize, got: usize) -> HrdlResult<()> {
        match self.state {
            UnitState::Closed => return Err(HrdlError::Closed),
            UnitState::Armed | UnitState::Ready => {}
            state => {
                return Err(HrdlError::InvalidState {
                    operation: "drain values",
                    state,
                })
            }
        }
        if got < needed {
            return Err(HrdlError::BufferTooSmall { needed, got });
        }
        Ok(())
    }

    /// Drain `n_samples` samples into `values`, blocking until the block has
    /// elapsed. `values` must hold `n_samples * active_channels` entries,
    /// interleaved by sample then channel.
    pub fn get_values(&mut self, values: &mut [i32], n_samples: i32) -> HrdlResult<Drain> {
        let needed = n_samples.max(0) as usize * self.active_channels.len();
        self.ensure_drainable(needed, values.len())?;

        let (count, overflow) = self
            .backend
            .get_values(self.handle, &mut values[..needed], n_samples);
        self.state = UnitState::Open;
        if overflow {
            warn!("HRDL reported input overflow during block");
        }
        Ok(Drain {
            samples: count.max(0) as usize,
            overflow,
        })
    }

    /// Drain like [`get_values`](Self::get_values) and fill `times` with each
    /// sample's nominal offset in milliseconds from the most recent `run`.
    pub fn get_times_and_values(
        &mut self,
        times: &mut [i32],
        values: &mut [i32],
        n_samples: i32,
    ) -> HrdlResult<Drain> {
        let samples = n_samples.max(0) as usize;
        let needed = samples * self.active_channels.len();
        self.ensure_drainable(needed, values.len())?;
        if times.len() < samples {
            return Err(HrdlError::BufferTooSmall {
                needed: samples,
                got: times.len(),
            });
        }

        let (count, overflow) = self.backend.get_times_and_values(
            self.handle,
            &mut times[..samples],
            &mut values[..needed],
            n_samples,
        );
        self.state = UnitState::Open;
        Ok(Drain {
            samples: count.max(0) as usize,
            overflow,
        })
    }

    /// Abort an armed acquisition.
    pub fn stop(&mut self) -> HrdlResult<()> {
        self.ensure_open()?;
        self.backend.stop(self.handle);
        if matches!(self.state, UnitState::Armed | UnitState::Ready) {
            self.state = UnitState::Open;
        }
        Ok(())
    }

    /// Number of enabled channels as reported by the device.
    pub fn enabled_channel_count(&self) -> HrdlResult<i16> {
        self.ensure_open()?;
        self.backend
            .enabled_channel_count(self.handle)
            .ok_or(HrdlError::Closed)
    }

    /// Close the unit. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == UnitState::Closed {
            return;
        }
        self.backend.close_unit(self.handle);
        self.state = UnitState::Closed;
        self.active_channels.clear();
        self.differential.clear();
        info!("Closed HRDL unit {}", self.handle.0);
    }
}

impl<B: HrdlBackend> Drop for HrdlUnit<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: HrdlBackend> DataLogger for HrdlUnit<B> {
    fn num_channels(&self) -> i16 {
        HrdlUnit::num_channels(self)
    }

    fn set_mains(&mut self, mains: Mains) -> HrdlResult<()> {
        HrdlUnit::set_mains(self, mains)
    }

    fn set_channel(
        &mut self,
        channel: i16,
        enabled: bool,
        range: Range,
        single_ended: bool,
    ) -> HrdlResult<()> {
        HrdlUnit::set_channel(self, channel, enabled, range, single_ended)
    }

    fn set_interval(
        &mut self,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> HrdlResult<()> {
        HrdlUnit::set_interval(self, sample_interval_ms, conversion_time)
    }

    fn min_max_counts(&self, channel: i16) -> HrdlResult<(i32, i32)> {
        HrdlUnit::min_max_counts(self, channel)
    }

    fn active_channels(&self) -> &[i16] {
        HrdlUnit::active_channels(self)
    }

    fn run(&mut self, n_samples: i32, method: BlockMethod) -> HrdlResult<()> {
        HrdlUnit::run(self, n_samples, method)
    }

    fn ready(&mut self) -> HrdlResult<bool> {
        HrdlUnit::ready(self)
    }

    fn get_values(&mut self, values: &mut [i32], n_samples: i32) -> HrdlResult<Drain> {
        HrdlUnit::get_values(self, values, n_samples)
    }

    fn close(&mut self) {
        HrdlUnit::close(self)
    }
}

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::hrdl::SimHrdl;

    fn open_unit() -> HrdlUnit<SimHrdl<ManualClock>> {
        HrdlUnit::open(SimHrdl::with_clock(ManualClock::new(0))).unwrap()
    }

    fn configure(unit: &mut HrdlUnit<SimHrdl<ManualClock>>) {
        for ch in [16, 13, 15, 14] {
            unit.set_channel(ch, true, Range::Mv2500, true).unwrap();
        }
        unit.set_interval(3000, ConversionTime::Ms660).unwrap();
    }

    #[test]
    fn test_open_reports_no_device() {
        let sim = SimHrdl::with_clock(ManualClock::new(0)).with_available_units(0);
        let err = HrdlUnit::open(sim).err().unwrap();
        assert_eq!(err, HrdlError::NoDevice);
        assert_eq!(err.to_string(), "No device found");
    }

    #[test]
    fn test_open_reads_variant() {
        let unit = open_unit();
        assert_eq!(unit.variant(), Variant::Adc24);
        assert_eq!(unit.num_channels(), 16);
        assert_eq!(unit.state(), UnitState::Open);
    }

    #[test]
    fn test_async_open_polls_to_ready() {
        let pending = HrdlUnit::open_async(SimHrdl::with_clock(ManualClock::new(0))).unwrap();
        match pending.poll().unwrap() {
            OpenPoll::Ready(unit) => assert_eq!(unit.handle(), Handle(1)),
            OpenPoll::Pending(_, progress) => panic!("still pending at {progress}%"),
        }
    }

    #[test]
    fn test_device_info_table() {
        let unit = open_unit();
        let info = unit.device_info();
        assert_eq!(info.len(), 7);
        assert_eq!(info[0], (InfoKind::DriverVersion, "1.0.0.1".to_string()));
        assert_eq!(info[3], (InfoKind::VariantInfo, "24".to_string()));
    }

    #[test]
    fn test_active_channels_stay_sorted() {
        let mut unit = open_unit();
        configure(&mut unit);
        assert_eq!(unit.active_channels(), &[13, 14, 15, 16]);
        assert_eq!(unit.enabled_channel_count().unwrap(), 4);
        assert_eq!(unit.state(), UnitState::Configured);
    }

    #[test]
    fn test_channel_out_of_range() {
        let mut unit = open_unit();
        let err = unit.set_channel(17, true, Range::Mv2500, true).unwrap_err();
        assert_eq!(
            err,
            HrdlError::ChannelOutOfRange {
                channel: 17,
                max: 16
            }
        );
    }

    #[test]
    fn test_differential_partner_already_enabled() {
        let mut unit = open_unit();
        unit.set_channel(6, true, Range::Mv2500, true).unwrap();
        assert!(matches!(
            unit.set_channel(5, true, Range::Mv2500, false),
            Err(HrdlError::ChannelRejected { channel: 5, .. })
        ));
        assert!(matches!(
            unit.set_channel(6, true, Range::Mv2500, false),
            Err(HrdlError::ChannelRejected { channel: 6, .. })
        ));
        unit.set_channel(1, true, Range::Mv2500, false).unwrap();
    }

    #[test]
    fn test_differential_partner_cannot_be_enabled_single_ended() {
        let mut unit = open_unit();
        unit.set_channel(5, true, Range::Mv2500, false).unwrap();
        assert!(matches!(
            unit.set_channel(6, true, Range::Mv2500, true),
            Err(HrdlError::ChannelRejected { channel: 6, .. })
        ));
        assert_eq!(unit.active_channels(), &[5]);

        // Releasing the pair frees the partner.
        unit.set_channel(5, false, Range::Mv2500, false).unwrap();
        unit.set_channel(6, true, Range::Mv2500, true).unwrap();
        assert_eq!(unit.active_channels(), &[6]);
    }

    #[test]
    fn test_timing_budget_is_checked_before_device() {
        let mut unit = open_unit();
        for ch in 13..=16 {
            unit.set_channel(ch, true, Range::Mv2500, true).unwrap();
        }
        let err = unit.set_interval(2000, ConversionTime::Ms660).unwrap_err();
        assert_eq!(
            err,
            HrdlError::TimingBudget {
                channels: 4,
                conversion_ms: 660,
                interval_ms: 2000
            }
        );
        assert_eq!(unit.state(), UnitState::Open);
    }

    #[test]
    fn test_run_requires_configuration() {
        let mut unit = open_unit();
        assert!(matches!(
            unit.run(4, BlockMethod::Block),
            Err(HrdlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_block_cycle_walks_state_machine() {
        let mut unit = open_unit();
        configure(&mut unit);

        unit.run(4, BlockMethod::Block).unwrap();
        assert_eq!(unit.state(), UnitState::Armed);
        assert!(!unit.ready().unwrap());

        unit.backend().clock().advance(std::time::Duration::from_secs(12));
        assert!(unit.ready().unwrap());
        assert_eq!(unit.state(), UnitState::Ready);

        let mut values = [0i32; 16];
        let drained = unit.get_values(&mut values, 4).unwrap();
        assert_eq!(drained.samples, 4);
        assert!(!drained.overflow);
        assert_eq!(unit.state(), UnitState::Open);

        // Configuration persists; the next block can be armed straight away.
        unit.run(4, BlockMethod::Block).unwrap();
        assert_eq!(unit.state(), UnitState::Armed);
    }

    #[test]
    fn test_configuration_rejected_while_armed() {
        let mut unit = open_unit();
        configure(&mut unit);
        unit.run(4, BlockMethod::Block).unwrap();
        assert!(matches!(
            unit.set_mains(Mains::SixtyHertz),
            Err(HrdlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_drain_checks_buffer_size() {
        let mut unit = open_unit();
        configure(&mut unit);
        unit.run(4, BlockMethod::Block).unwrap();
        let mut values = [0i32; 15];
        assert_eq!(
            unit.get_values(&mut values, 4).unwrap_err(),
            HrdlError::BufferTooSmall { needed: 16, got: 15 }
        );
    }

    #[test]
    fn test_times_and_values() {
        let mut unit = open_unit();
        configure(&mut unit);
        unit.run(4, BlockMethod::Block).unwrap();
        let mut times = [0i32; 4];
        let mut values = [0i32; 16];
        let drained = unit.get_times_and_values(&mut times, &mut values, 4).unwrap();
        assert_eq!(drained.samples, 4);
        assert_eq!(times, [0, 3000, 6000, 9000]);
    }

    #[test]
    fn test_min_max_counts() {
        let unit = open_unit();
        assert_eq!(unit.min_max_counts(13).unwrap(), (-i32::MAX, i32::MAX));
        assert!(unit.min_max_counts(0).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut unit = open_unit();
        configure(&mut unit);
        unit.close();
        unit.close();
        assert_eq!(unit.state(), UnitState::Closed);
        assert_eq!(unit.min_max_counts(13).unwrap_err(), HrdlError::Closed);
        assert_eq!(unit.run(4, BlockMethod::Block).unwrap_err(), HrdlError::Closed);
        assert_eq!(unit.info(InfoKind::VariantInfo), "");
    }

    #[test]
    fn test_stop_disarms() {
        let mut unit = open_unit();
        configure(&mut unit);
        unit.run(4, BlockMethod::Block).unwrap();
        unit.stop().unwrap();
        assert_eq!(unit.state(), UnitState::Open);
    }
}
