//! Minimal MQTT 3.1.1 client for QoS 0 publishing and subscribing.
//!
//! # Transport
//!
//! Plain TCP (default port 1883). After the initial blocking connect the
//! socket is switched to non-blocking mode, and all further I/O happens in
//! [`MqttClient::sync`], which the caller pumps from its own loop. There is
//! no background thread.
//!
//! # Reconnection
//!
//! Any socket error, broker disconnect or keepalive timeout puts the client
//! into an error state. The next `sync` opens a fresh connection, resets the
//! send and receive buffers and issues a clean-session CONNECT. Bytes queued
//! on the old connection are dropped, so a record is either sent whole on one
//! connection or not at all.
//!
//! # Example
//!
//! ```no_run
//! use hardware::mqtt::{MqttClient, MqttConfig, QoS};
//!
//! let mut client = MqttClient::connect(MqttConfig::new("localhost", 1883, "Magnetometer"))?;
//! client.publish("Magnetometer", &[0u8; 40], QoS::AtMostOnce)?;
//! client.sync()?;
//! # Ok::<(), hardware::mqtt::MqttError>(())
//! ```

mod client;
pub mod packet;

pub use client::{ClientState, Message, MqttClient, MqttConfig, DEFAULT_KEEPALIVE, DEFAULT_PORT};
pub use packet::QoS;

use thiserror::Error;

/// Errors that can occur during broker communication.
#[derive(Error, Debug)]
pub enum MqttError {
    /// Low-level I/O error (socket read/write failure).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to open a TCP connection to the broker.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker answered CONNECT with a non-zero return code.
    #[error("Connection refused by broker: {message} (code {code})")]
    ConnectionRefused { code: u8, message: &'static str },

    /// The broker closed the connection.
    #[error("Connection closed by broker")]
    ConnectionClosed,

    /// The broker did not answer in time.
    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    /// The operation needs a live connection.
    #[error("Not connected (client in error state \"{0}\")")]
    NotConnected(String),

    /// The send buffer cannot take the packet.
    #[error("Send buffer full ({needed} bytes needed, {free} free)")]
    SendBufferFull { needed: usize, free: usize },

    /// Only QoS 0 is implemented.
    #[error("QoS {0} is not supported")]
    UnsupportedQos(u8),

    /// Packet could not be encoded or decoded.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Result type for MQTT operations.
pub type MqttResult<T> = Result<T, MqttError>;
