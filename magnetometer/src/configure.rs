//! One-shot data logger setup for the fluxgate head.
//!
//! Runs the startup sequence against any [`DataLogger`]: mains rejection,
//! channel activation, timing budget, sample interval, then the per-channel
//! counts-to-volts scaling used by the calibration step.

use hardware::hrdl::{ConversionTime, HrdlError, Mains, Range};
use hardware::DataLogger;
use thiserror::Error;
use tracing::{debug, info};

/// Data logger inputs wired to Bx, By, Bz and the temperature sensor.
///
/// The device returns samples in ascending channel order, so this order is
/// also the order of values in every drained sample.
pub const CANONICAL_CHANNELS: [i16; 4] = [13, 14, 15, 16];

/// Input range used on every channel.
pub const CHANNEL_RANGE: Range = Range::Mv2500;

/// Timing and filtering of one acquisition block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub sample_interval_ms: i32,
    pub samples_per_block: usize,
    pub conversion_time: ConversionTime,
    /// Mains frequency to reject; `None` leaves the device default in place.
    pub mains: Option<Mains>,
}

impl Default for BlockPlan {
    fn default() -> Self {
        Self {
            sample_interval_ms: 3000,
            samples_per_block: 4,
            conversion_time: ConversionTime::Ms660,
            mains: Some(Mains::FiftyHertz),
        }
    }
}

impl BlockPlan {
    /// Check that `channels` conversions fit in one sample interval.
    pub fn check_budget(&self, channels: usize) -> Result<(), HrdlError> {
        let conversion_ms = self.conversion_time.millis();
        let needed = channels as i64 * i64::from(conversion_ms);
        if self.sample_interval_ms <= 0 || needed > i64::from(self.sample_interval_ms) {
            return Err(HrdlError::TimingBudget {
                channels,
                conversion_ms,
                interval_ms: self.sample_interval_ms,
            });
        }
        Ok(())
    }

    /// Nominal duration of a full block in milliseconds.
    pub fn block_duration_ms(&self) -> i64 {
        self.samples_per_block as i64 * i64::from(self.sample_interval_ms)
    }
}

/// Per-channel factor converting ADC counts to volts, in active channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingTable {
    counts_to_volts: Vec<f64>,
}

impl ScalingTable {
    pub fn new(counts_to_volts: Vec<f64>) -> Self {
        Self { counts_to_volts }
    }

    /// Same factor on `channels` channels.
    pub fn uniform(channels: usize, counts_to_volts: f64) -> Self {
        Self::new(vec![counts_to_volts; channels])
    }

    pub fn factors(&self) -> &[f64] {
        &self.counts_to_volts
    }

    pub fn len(&self) -> usize {
        self.counts_to_volts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts_to_volts.is_empty()
    }
}

/// Errors raised while configuring the data logger.
#[derive(Error, Debug)]
pub enum ConfigureError {
    #[error(transparent)]
    Device(#[from] HrdlError),

    #[error("No channels to activate")]
    NoChannels,

    #[error("Channel {channel} reports non-positive maximum count {max}")]
    InvalidMaxCounts { channel: i16, max: i32 },
}

/// Configure `logger` for `channels` according to `plan`.
///
/// Stops at the first failure. On success every requested channel is enabled
/// single-ended at ±2500 mV, the sample interval is set, and the returned
/// table holds `2.5 / max_counts` for each active channel.
///
/// # Errors
///
/// - [`ConfigureError::NoChannels`] when `channels` is empty
/// - [`ConfigureError::Device`] for any device rejection, including
///   [`HrdlError::TimingBudget`] when the conversions do not fit the interval
/// - [`ConfigureError::InvalidMaxCounts`] if the device reports a maximum
///   count that cannot be used as a divisor
pub fn configure_datalogger<D: DataLogger + ?Sized>(
    logger: &mut D,
    channels: &[i16],
    plan: &BlockPlan,
) -> Result<ScalingTable, ConfigureError> {
    if channels.is_empty() {
        return Err(ConfigureError::NoChannels);
    }

    if let Some(mains) = plan.mains {
        info!("Setting mains noise rejection.");
        logger.set_mains(mains)?;
    }

    for &channel in channels {
        logger.set_channel(channel, true, CHANNEL_RANGE, true)?;
    }

    plan.check_budget(logger.active_channels().len())?;
    logger.set_interval(plan.sample_interval_ms, plan.conversion_time)?;

    let mut counts_to_volts = Vec::with_capacity(logger.active_channels().len());
    for &channel in logger.active_channels() {
        let (_, max) = logger.min_max_counts(channel)?;
        if max <= 0 {
            return Err(ConfigureError::InvalidMaxCounts { channel, max });
        }
        let factor = CHANNEL_RANGE.full_scale_volts() / f64::from(max);
        debug!("Channel {channel}: {factor:e} V/count");
        counts_to_volts.push(factor);
    }

    Ok(ScalingTable::new(counts_to_volts))
}
