//! Block acquisition loop.
//!
//! Each iteration arms the data logger for one block, pumps the broker while
//! the block fills, drains and calibrates it, and publishes one record per
//! sample:
//!
//! ```text
//! run(4, Block) -> block_start = now
//!   while !ready: pump broker, sleep
//! get_values -> calibrate -> publish block_start + i * interval, i = 0..4
//! heartbeat
//! ```
//!
//! Samples are stamped from the plan, not from when they were observed, so
//! records within a block are exactly one sample interval apart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use hardware::hrdl::{BlockMethod, HrdlError};
use hardware::mqtt::{MqttError, QoS};
use hardware::{Clock, DataLogger};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::{calibrate_block, CalibrationError, CHANNELS};
use crate::configure::{BlockPlan, ScalingTable};
use crate::heartbeat::{Heartbeat, DEFAULT_HEARTBEAT_MS};
use crate::publisher::Publisher;
use crate::record::MagnetometerMessage;

/// Default MQTT topic for published records.
pub const DEFAULT_TOPIC: &str = "Magnetometer";

/// Sleep between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Settings of the acquisition loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub plan: BlockPlan,
    pub topic: String,
    /// Treat a device overflow as fatal instead of publishing with a warning.
    pub strict_overflow: bool,
    pub heartbeat_ms: i64,
    pub poll_interval: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            plan: BlockPlan::default(),
            topic: DEFAULT_TOPIC.to_string(),
            strict_overflow: false,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Errors that stop the acquisition loop.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Device(#[from] HrdlError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error("Broker error: {0}")]
    Broker(#[from] MqttError),

    #[error("Expected {expected} active channels, data logger has {got}")]
    ChannelCount { expected: usize, got: usize },

    #[error("Expected {expected} readings from the data logger, got {got}")]
    SampleCount { expected: usize, got: usize },

    #[error("Input overflow in block starting at {block_start}")]
    Overflow { block_start: i64 },
}

/// Result of a single [`Acquisition::run_block`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block was drained and every sample published.
    Published { block_start: i64 },
    /// Shutdown was requested while waiting; the block was discarded.
    Interrupted,
}

/// The acquisition loop and the resources it owns.
pub struct Acquisition<D: DataLogger, P: Publisher, C: Clock> {
    logger: D,
    publisher: P,
    clock: C,
    scaling: ScalingTable,
    config: AcquisitionConfig,
    raw: Vec<i32>,
    calibrated: Vec<f64>,
    heartbeat: Heartbeat,
    blocks: u64,
}

impl<D: DataLogger, P: Publisher, C: Clock> Acquisition<D, P, C> {
    /// Take ownership of a configured logger and a connected publisher.
    ///
    /// Block buffers are allocated here and reused for every block.
    ///
    /// # Errors
    ///
    /// [`AcquisitionError::ChannelCount`] unless both the logger and the
    /// scaling table cover exactly four channels.
    pub fn new(
        logger: D,
        publisher: P,
        clock: C,
        scaling: ScalingTable,
        config: AcquisitionConfig,
    ) -> Result<Self, AcquisitionError> {
        let active = logger.active_channels().len();
        if active != CHANNELS {
            return Err(AcquisitionError::ChannelCount {
                expected: CHANNELS,
                got: active,
            });
        }
        if scaling.len() != CHANNELS {
            return Err(CalibrationError::ChannelCount(scaling.len()).into());
        }

        let len = config.plan.samples_per_block * CHANNELS;
        let heartbeat = Heartbeat::new(config.heartbeat_ms);
        Ok(Self {
            logger,
            publisher,
            clock,
            scaling,
            config,
            raw: vec![0; len],
            calibrated: vec![0.0; len],
            heartbeat,
            blocks: 0,
        })
    }

    pub fn logger(&self) -> &D {
        &self.logger
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Number of blocks published so far.
    pub fn blocks_published(&self) -> u64 {
        self.blocks
    }

    /// Acquire, calibrate and publish one block.
    pub fn run_block(&mut self, shutdown: &AtomicBool) -> Result<BlockOutcome, AcquisitionError> {
        let plan = self.config.plan;
        let samples = plan.samples_per_block;

        self.logger.run(samples as i32, BlockMethod::Block)?;
        let block_start = self.clock.now_ms();

        while !self.logger.ready()? {
            if shutdown.load(Ordering::SeqCst) {
                debug!("Discarding block started at {block_start}");
                return Ok(BlockOutcome::Interrupted);
            }
            self.publisher.pump()?;
            self.clock.sleep(self.config.poll_interval);
        }

        let drain = self.logger.get_values(&mut self.raw, samples as i32)?;
        if drain.samples != samples {
            return Err(AcquisitionError::SampleCount {
                expected: samples,
                got: drain.samples,
            });
        }
        if drain.overflow {
            if self.config.strict_overflow {
                return Err(AcquisitionError::Overflow { block_start });
            }
            warn!("Input overflow in block starting at {block_start}, publishing anyway");
        }

        calibrate_block(&self.raw, &self.scaling, &mut self.calibrated)?;

        let interval = i64::from(plan.sample_interval_ms);
        for (i, reading) in self.calibrated.chunks_exact(CHANNELS).enumerate() {
            let mut data = [0.0; CHANNELS];
            data.copy_from_slice(reading);
            let message = MagnetometerMessage::new(block_start + i as i64 * interval, data);
            self.publisher
                .publish(&self.config.topic, message.as_bytes(), QoS::AtMostOnce)?;
        }
        self.blocks += 1;
        debug!("Published block {} started at {block_start}", self.blocks);

        self.heartbeat.tick(self.clock.now_ms());
        Ok(BlockOutcome::Published { block_start })
    }

    /// Run blocks until `shutdown` is set or an error occurs.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), AcquisitionError> {
        info!(
            "Acquiring {} samples every {} ms on topic {:?}",
            self.config.plan.samples_per_block,
            self.config.plan.sample_interval_ms,
            self.config.topic
        );
        while !shutdown.load(Ordering::SeqCst) {
            if self.run_block(shutdown)? == BlockOutcome::Interrupted {
                break;
            }
        }
        info!("Shutdown requested, stopping acquisition");
        Ok(())
    }

    /// Close the data logger and the broker connection. Idempotent.
    pub fn close(&mut self) {
        self.logger.close();
        self.publisher.close();
    }
}

impl<D: DataLogger, P: Publisher, C: Clock> Drop for Acquisition<D, P, C> {
    fn drop(&mut self) {
        self.close();
    }
}
