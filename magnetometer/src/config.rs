//! Command line surface of the daemon.

use clap::{Parser, ValueEnum};
use hardware::hrdl::{HrdlError, Mains};
use hardware::mqtt::{MqttConfig, DEFAULT_PORT};
use thiserror::Error;

use crate::acquisition::{AcquisitionConfig, DEFAULT_POLL_INTERVAL, DEFAULT_TOPIC};
use crate::configure::{BlockPlan, CANONICAL_CHANNELS};
use crate::heartbeat::DEFAULT_HEARTBEAT_MS;

/// Data logger backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Simulated data logger producing deterministic pseudo-random counts
    Sim,
    /// Pico HRDL vendor driver
    Pico,
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(feature = "picohrdl") {
            Backend::Pico
        } else {
            Backend::Sim
        }
    }
}

/// Fluxgate magnetometer acquisition daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "magnetometer")]
#[command(about = "Sample a fluxgate magnetometer and publish calibrated readings over MQTT")]
#[command(version)]
pub struct DaemonArgs {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    pub broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub broker_port: u16,

    /// MQTT client identifier
    #[arg(long, default_value = "Magnetometer")]
    pub client_id: String,

    /// Topic the records are published on
    #[arg(long, default_value = DEFAULT_TOPIC)]
    pub topic: String,

    /// Reject 60 Hz mains noise instead of 50 Hz
    #[arg(long, conflicts_with = "no_mains_rejection")]
    pub sixty_hertz: bool,

    /// Leave the device's mains rejection setting untouched
    #[arg(long)]
    pub no_mains_rejection: bool,

    /// Interval between samples in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub sample_interval_ms: i32,

    /// Abort when the device reports an input overflow
    #[arg(long)]
    pub strict_overflow: bool,

    /// Interval between heartbeat lines in milliseconds
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_MS)]
    pub heartbeat_ms: i64,

    /// Data logger backend
    #[arg(long, value_enum, default_value_t = Backend::default())]
    pub backend: Backend,

    /// Seed for the simulated backend (default: fixed reference seed)
    #[arg(long)]
    pub sim_seed: Option<u64>,

    /// Number of units the simulated backend reports as free
    #[arg(long, default_value_t = 16)]
    pub sim_units: usize,

    /// Log verbosity (trace, debug, info, warn, error). The periodic
    /// "Process alive" heartbeat is logged at info and is hidden by warn or error
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

/// Problems found while validating the command line.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Topic must be non-empty and free of wildcards, got {0:?}")]
    InvalidTopic(String),

    #[error("Client identifier must not be empty")]
    EmptyClientId,

    #[error("Heartbeat interval must be positive, got {0} ms")]
    InvalidHeartbeat(i64),

    #[error(transparent)]
    Plan(#[from] HrdlError),
}

/// Validated daemon settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub mqtt: MqttConfig,
    pub acquisition: AcquisitionConfig,
    pub channels: Vec<i16>,
    pub backend: Backend,
    pub sim_seed: Option<u64>,
    pub sim_units: usize,
}

impl DaemonConfig {
    /// Check the settings without touching the device or the broker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let topic = &self.acquisition.topic;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(ConfigError::InvalidTopic(topic.clone()));
        }
        if self.mqtt.client_id.is_empty() {
            return Err(ConfigError::EmptyClientId);
        }
        if self.acquisition.heartbeat_ms <= 0 {
            return Err(ConfigError::InvalidHeartbeat(self.acquisition.heartbeat_ms));
        }
        self.acquisition.plan.check_budget(self.channels.len())?;
        Ok(())
    }
}

impl TryFrom<DaemonArgs> for DaemonConfig {
    type Error = ConfigError;

    fn try_from(args: DaemonArgs) -> Result<Self, Self::Error> {
        let mains = match (args.no_mains_rejection, args.sixty_hertz) {
            (true, _) => None,
            (false, true) => Some(Mains::SixtyHertz),
            (false, false) => Some(Mains::FiftyHertz),
        };
        let plan = BlockPlan {
            sample_interval_ms: args.sample_interval_ms,
            mains,
            ..BlockPlan::default()
        };

        let config = DaemonConfig {
            mqtt: MqttConfig::new(args.broker_host, args.broker_port, args.client_id),
            acquisition: AcquisitionConfig {
                plan,
                topic: args.topic,
                strict_overflow: args.strict_overflow,
                heartbeat_ms: args.heartbeat_ms,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            channels: CANONICAL_CHANNELS.to_vec(),
            backend: args.backend,
            sim_seed: args.sim_seed,
            sim_units: args.sim_units,
        };
        config.validate()?;
        Ok(config)
    }
}
