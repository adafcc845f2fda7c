//! Fluxgate magnetometer acquisition.
//!
//! The daemon samples the four magnetometer outputs (Bx, By, Bz and a
//! temperature reference) on an HRDL data logger in blocks of four samples,
//! converts counts to nT and °C, and publishes one 40-byte
//! [`MagnetometerMessage`](record::MagnetometerMessage) per sample over MQTT.
//!
//! - [`configure`] - channel activation, timing budget and scaling table
//! - [`calibration`] - counts to physical units with shared-wire correction
//! - [`acquisition`] - the arm/wait/drain/publish loop
//! - [`publisher`] - the broker seam used by the loop
//! - [`record`] - the wire record
//! - [`listener`] - decoding and daily logs for subscribers

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod configure;
pub mod heartbeat;
pub mod listener;
pub mod publisher;
pub mod record;
pub mod shutdown;

pub use acquisition::{Acquisition, AcquisitionConfig, AcquisitionError, BlockOutcome};
pub use configure::{configure_datalogger, BlockPlan, ConfigureError, ScalingTable};
pub use publisher::Publisher;
pub use record::MagnetometerMessage;
