//! Counts to physical units for the fluxgate head.
//!
//! Each reading holds four values in channel order: Bx, By, Bz and the
//! temperature sensor. Counts are scaled to volts, the Bz potential divider is
//! undone, and the shared wire resistance is compensated by coupling every
//! channel to the sum of all four:
//!
//! ```text
//! v_i <- v_i * (1 + R) + R * (v_0 + v_1 + v_2 + v_3),   R = r_wires / r_in
//! ```
//!
//! Field channels are then reported in nT and the temperature in °C.

use thiserror::Error;

use crate::configure::ScalingTable;

/// Values per reading.
pub const CHANNELS: usize = 4;

/// Resistance of the shared return wire, in ohms.
pub const R_WIRES: f64 = 2.48;

/// ADC input resistance, in ohms.
pub const R_IN: f64 = 10_000.0;

/// Resistor divider on the Bz input.
pub const POT_DIVIDER: f64 = 3.01 / (6.98 + 3.01);

/// Fluxgate sensitivity, nT per volt.
pub const B_SCALE: f64 = 1_000_000.0 / 143.0;

/// LM35 sensitivity (10 mV/°C), °C per volt.
pub const TEMP_SCALE: f64 = 100.0;

const BZ: usize = 2;
const TEMPERATURE: usize = 3;

/// Errors from [`calibrate_block`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("Calibration needs {CHANNELS} channels, scaling table has {0}")]
    ChannelCount(usize),

    #[error("Raw block of {0} values is not a whole number of readings")]
    PartialReading(usize),

    #[error("Output holds {got} values but {needed} are required")]
    OutputTooSmall { needed: usize, got: usize },
}

/// Calibrate a single reading.
pub fn calibrate_reading(
    counts: &[i32; CHANNELS],
    counts_to_volts: &[f64; CHANNELS],
) -> [f64; CHANNELS] {
    let mut volts = [0.0; CHANNELS];
    for (v, (&c, &s)) in volts.iter_mut().zip(counts.iter().zip(counts_to_volts)) {
        *v = f64::from(c) * s;
    }
    volts[BZ] /= POT_DIVIDER;

    let ratio = R_WIRES / R_IN;
    let correction = volts.iter().sum::<f64>() * ratio;
    for v in volts.iter_mut() {
        *v = *v * (1.0 + ratio) + correction;
    }

    for v in volts.iter_mut().take(TEMPERATURE) {
        *v *= B_SCALE;
    }
    volts[TEMPERATURE] *= TEMP_SCALE;
    volts
}

/// Calibrate every reading of `raw` into `out`, returning the number of
/// readings converted.
///
/// `raw` and `out` are interleaved by sample then channel. Only the first
/// `raw.len()` entries of `out` are written.
pub fn calibrate_block(
    raw: &[i32],
    scaling: &ScalingTable,
    out: &mut [f64],
) -> Result<usize, CalibrationError> {
    let counts_to_volts: &[f64; CHANNELS] = scaling
        .factors()
        .try_into()
        .map_err(|_| CalibrationError::ChannelCount(scaling.len()))?;
    if raw.len() % CHANNELS != 0 {
        return Err(CalibrationError::PartialReading(raw.len()));
    }
    if out.len() < raw.len() {
        return Err(CalibrationError::OutputTooSmall {
            needed: raw.len(),
            got: out.len(),
        });
    }

    let mut readings = 0;
    for (counts, dest) in raw
        .chunks_exact(CHANNELS)
        .zip(out.chunks_exact_mut(CHANNELS))
    {
        let mut reading = [0i32; CHANNELS];
        reading.copy_from_slice(counts);
        dest.copy_from_slice(&calibrate_reading(&reading, counts_to_volts));
        readings += 1;
    }
    Ok(readings)
}
