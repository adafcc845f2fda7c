//! Binary record published for every magnetometer sample.

use bytemuck::{Pod, Zeroable};

/// One calibrated sample as sent on the wire.
///
/// 40 bytes, host byte order, no padding:
///
/// | offset | type  | field                          |
/// |--------|-------|--------------------------------|
/// | 0      | `i64` | timestamp, ms since Unix epoch |
/// | 8      | `f64` | Bx, nT                         |
/// | 16     | `f64` | By, nT                         |
/// | 24     | `f64` | Bz, nT                         |
/// | 32     | `f64` | temperature, °C                |
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C, packed)]
pub struct MagnetometerMessage {
    pub timestamp: i64,
    pub data: [f64; 4],
}

// SAFETY: MagnetometerMessage is repr(C, packed) and all fields are Pod
unsafe impl Pod for MagnetometerMessage {}
// SAFETY: MagnetometerMessage is repr(C, packed) and all fields are Zeroable
unsafe impl Zeroable for MagnetometerMessage {}

impl MagnetometerMessage {
    /// Encoded size in bytes.
    pub const SIZE: usize = 40;

    pub fn new(timestamp: i64, data: [f64; 4]) -> Self {
        Self { timestamp, data }
    }

    /// Build a record from one calibrated reading.
    ///
    /// Returns `None` unless `reading` holds exactly four values.
    pub fn from_reading(timestamp: i64, reading: &[f64]) -> Option<Self> {
        let data: [f64; 4] = reading.try_into().ok()?;
        Some(Self::new(timestamp, data))
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> [f64; 4] {
        self.data
    }

    /// Wire encoding of the record.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decode a record. Returns `None` unless `bytes` is exactly
    /// [`SIZE`](Self::SIZE) long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(std::mem::size_of::<MagnetometerMessage>(), MagnetometerMessage::SIZE);
        assert_eq!(std::mem::align_of::<MagnetometerMessage>(), 1);
    }

    #[test]
    fn test_field_offsets() {
        let msg = MagnetometerMessage::new(0x0102_0304_0506_0708, [1.5, -2.0, 3.25, 21.0]);
        let bytes = msg.as_bytes();

        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[0..8], &0x0102_0304_0506_0708i64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &1.5f64.to_ne_bytes());
        assert_eq!(&bytes[16..24], &(-2.0f64).to_ne_bytes());
        assert_eq!(&bytes[24..32], &3.25f64.to_ne_bytes());
        assert_eq!(&bytes[32..40], &21.0f64.to_ne_bytes());
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(MagnetometerMessage::from_bytes(&[0u8; 39]).is_none());
        assert!(MagnetometerMessage::from_bytes(&[0u8; 41]).is_none());
        assert!(MagnetometerMessage::from_bytes(&[]).is_none());
    }

    #[test]
    fn test_decode_unaligned_slice() {
        let msg = MagnetometerMessage::new(1_700_000_000_000, [6996.5, 1.73, -0.5, 0.0248]);
        let mut buf = vec![0u8; 41];
        buf[1..].copy_from_slice(msg.as_bytes());
        assert_eq!(MagnetometerMessage::from_bytes(&buf[1..]), Some(msg));
    }

    #[test]
    fn test_from_reading() {
        let msg = MagnetometerMessage::from_reading(42, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(msg.timestamp(), 42);
        assert_eq!(msg.data(), [1.0, 2.0, 3.0, 4.0]);
        assert!(MagnetometerMessage::from_reading(42, &[1.0, 2.0, 3.0]).is_none());
    }
}
