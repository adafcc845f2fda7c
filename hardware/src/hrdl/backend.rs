//! Raw handle-based HRDL capability set.

use super::{BlockMethod, ConversionTime, Handle, InfoKind, Mains, OpenStatus, Range};

/// The vendor library's capability set, one method per `HRDL*` entry point.
///
/// Methods report failure the way the vendor library does (a `false` status or
/// a zero count) and leave interpretation to [`HrdlUnit`](super::HrdlUnit),
/// which queries [`InfoKind::Error`] / [`InfoKind::Settings`] for the reason.
///
/// Drain methods count in *samples*: one sample is one value per enabled
/// channel, so `values` must hold `n_samples * enabled_channels` entries.
pub trait HrdlBackend {
    /// Open the first free unit.
    fn open_unit(&mut self) -> OpenStatus;

    /// Begin opening a unit in the background. Returns `false` if no unit is free.
    fn open_unit_async(&mut self) -> bool;

    /// Poll an asynchronous open. Returns the handle once known and the
    /// progress in percent; progress below 100 means the open is pending.
    fn open_unit_progress(&mut self) -> (Option<Handle>, u8);

    /// Informational string. Unknown kinds and closed handles yield `""`.
    fn unit_info(&self, handle: Handle, kind: InfoKind) -> String;

    /// Minimum and maximum ADC counts for a channel.
    fn min_max_adc_counts(&self, handle: Handle, channel: i16) -> Option<(i32, i32)>;

    fn set_analog_in_channel(
        &mut self,
        handle: Handle,
        channel: i16,
        enabled: bool,
        range: Range,
        single_ended: bool,
    ) -> bool;

    fn set_interval(
        &mut self,
        handle: Handle,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> bool;

    fn set_mains(&mut self, handle: Handle, mains: Mains) -> bool;

    /// Arm an acquisition of `n_values` samples.
    fn run(&mut self, handle: Handle, n_values: i32, method: BlockMethod) -> bool;

    /// True once the armed acquisition has data available.
    fn ready(&self, handle: Handle) -> bool;

    /// Abort an armed acquisition.
    fn stop(&mut self, handle: Handle);

    /// Drain up to `n_samples` samples into `values`.
    ///
    /// Returns `(samples_returned, overflow)`.
    fn get_values(&mut self, handle: Handle, values: &mut [i32], n_samples: i32) -> (i32, bool);

    /// Drain like [`get_values`](Self::get_values) and write one time stamp
    /// per sample, in milliseconds relative to the most recent `run`.
    fn get_times_and_values(
        &mut self,
        handle: Handle,
        times: &mut [i32],
        values: &mut [i32],
        n_samples: i32,
    ) -> (i32, bool);

    fn enabled_channel_count(&self, handle: Handle) -> Option<i16>;

    /// Release the unit. Returns `false` for handles that were not open.
    fn close_unit(&mut self, handle: Handle) -> bool;
}
