//! Data logger interface trait for acquisition workflows.

use crate::hrdl::{BlockMethod, ConversionTime, Drain, HrdlResult, Mains, Range};

/// Interface for a multi-channel data logger.
///
/// Abstracts the ADC hardware for testability in the configuration and
/// acquisition workflows. [`HrdlUnit`](crate::hrdl::HrdlUnit) implements it
/// for every HRDL backend.
pub trait DataLogger {
    /// Number of analog input channels the device provides.
    fn num_channels(&self) -> i16;

    /// Select the mains frequency to reject.
    fn set_mains(&mut self, mains: Mains) -> HrdlResult<()>;

    /// Enable or disable one analog input channel.
    fn set_channel(
        &mut self,
        channel: i16,
        enabled: bool,
        range: Range,
        single_ended: bool,
    ) -> HrdlResult<()>;

    /// Set the sample interval and per-channel conversion time.
    fn set_interval(
        &mut self,
        sample_interval_ms: i32,
        conversion_time: ConversionTime,
    ) -> HrdlResult<()>;

    /// Minimum and maximum ADC counts for a channel.
    fn min_max_counts(&self, channel: i16) -> HrdlResult<(i32, i32)>;

    /// Enabled channels in ascending order. Drained samples carry one value
    /// per active channel in this order.
    fn active_channels(&self) -> &[i16];

    /// Arm a block of `n_samples` samples.
    fn run(&mut self, n_samples: i32, method: BlockMethod) -> HrdlResult<()>;

    /// Whether the armed block has completed.
    fn ready(&mut self) -> HrdlResult<bool>;

    /// Drain `n_samples` samples into `values`.
    fn get_values(&mut self, values: &mut [i32], n_samples: i32) -> HrdlResult<Drain>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}
