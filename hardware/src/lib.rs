//! Device drivers for the magnetometer station.
//!
//! This crate provides the HRDL data logger facade, its simulated and
//! vendor-library backends, and a small MQTT client used to publish
//! readings. Each backend is feature-gated for optional compilation.
//!
//! # Features
//!
//! - `sim` - Simulated HRDL backend with deterministic pseudo-random counts
//! - `picohrdl` - Pico HRDL vendor library backend (links `libpicohrdl`)
//! - `mqtt` - MQTT 3.1.1 client for QoS 0 publish and subscribe
//!
//! `sim` and `mqtt` are enabled by default so the crate builds and tests
//! without any hardware or vendor SDK installed.

pub mod clock;
pub mod data_logger;
pub mod hrdl;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use clock::{Clock, SystemClock};
pub use data_logger::DataLogger;
