//! Pico High Resolution Data Logger (ADC-20 / ADC-24) driver.
//!
//! The HRDL family are 20/24-bit USB data loggers with up to 16 single-ended
//! analog inputs. This module splits the driver into two layers:
//!
//! - [`HrdlBackend`] - the raw, handle-based capability set of the vendor
//!   library. Implemented by [`SimHrdl`] (feature `sim`) and by
//!   [`PicoHrdl`] (feature `picohrdl`, links `libpicohrdl`).
//! - [`HrdlUnit`] - an owned, open unit on top of a backend. Tracks the
//!   acquisition state machine, validates arguments and turns the vendor's
//!   status flags into [`HrdlError`]s carrying the driver's diagnostic text.
//!
//! # Acquisition state machine
//!
//! ```text
//! Closed --open--> Open --set_channel/set_interval--> Configured
//!   Configured --run--> Armed --ready()==true--> Ready --get_values--> Open
//! ```
//!
//! `close` is accepted from every state and is idempotent.
//!
//! # Example
//!
//! ```no_run
//! use hardware::hrdl::{BlockMethod, ConversionTime, HrdlUnit, Range, SimHrdl};
//!
//! let mut unit = HrdlUnit::open(SimHrdl::new())?;
//! unit.set_channel(13, true, Range::Mv2500, true)?;
//! unit.set_interval(3000, ConversionTime::Ms660)?;
//! unit.run(4, BlockMethod::Block)?;
//! while !unit.ready()? {
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! let mut values = [0i32; 4];
//! let drained = unit.get_values(&mut values, 4)?;
//! println!("{} samples, overflow={}", drained.samples, drained.overflow);
//! # Ok::<(), hardware::hrdl::HrdlError>(())
//! ```

mod backend;
mod unit;

#[cfg(feature = "picohrdl")]
mod pico;
#[cfg(feature = "sim")]
mod sim;

pub use backend::HrdlBackend;
pub use unit::{HrdlUnit, OpenPoll, PendingOpen, UnitState};

#[cfg(feature = "picohrdl")]
pub use pico::PicoHrdl;
#[cfg(feature = "sim")]
pub use sim::{SimHrdl, DEFAULT_SEED, MAX_UNITS};

use strum::{Display, EnumIter};
use thiserror::Error;

/// Highest analog input channel index on any HRDL variant.
pub const MAX_CHANNELS: i16 = 16;

/// Identifier of an open unit, as handed out by the vendor library.
///
/// `0` means "no unit found" and negative values mean "unit failed to open";
/// neither is ever wrapped in a `Handle` that reaches [`HrdlUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub i16);

impl Handle {
    /// Handle value used when querying diagnostics for a unit that failed to open.
    pub const INVALID: Handle = Handle(-1);
}

/// Result of a synchronous open attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    Opened(Handle),
    /// No unit is attached (or every unit is already open).
    NoDevice,
    /// A unit exists but failed to initialise.
    Failed,
}

/// Unit information strings available from [`HrdlBackend::unit_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, Display)]
pub enum InfoKind {
    DriverVersion,
    UsbVersion,
    HardwareVersion,
    VariantInfo,
    BatchAndSerial,
    CalDate,
    KernelDriverVersion,
    Error,
    Settings,
}

impl InfoKind {
    /// Vendor `HRDL_INFO` code.
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Fixed-width label used in the startup device table.
    pub fn description(self) -> &'static str {
        match self {
            InfoKind::DriverVersion => "Driver Version    :",
            InfoKind::UsbVersion => "USB Version       :",
            InfoKind::HardwareVersion => "Hardware Version  :",
            InfoKind::VariantInfo => "Variant Info      :",
            InfoKind::BatchAndSerial => "Batch and Serial  :",
            InfoKind::CalDate => "Calibration Date  :",
            InfoKind::KernelDriverVersion => "Kernel Driver Ver.:",
            InfoKind::Error => "Error             :",
            InfoKind::Settings => "Settings          :",
        }
    }

    /// True for the descriptive kinds shown in the device table
    /// (everything before [`InfoKind::Error`]).
    pub fn is_descriptive(self) -> bool {
        (self as i16) < (InfoKind::Error as i16)
    }
}

/// Hardware variant, decoded from the [`InfoKind::VariantInfo`] string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// ADC-20, 8 single-ended channels.
    Adc20,
    /// ADC-24, 16 single-ended channels.
    Adc24,
}

impl Variant {
    /// Decode the variant info string (`"20"` or `"24"`).
    pub fn from_info(info: &str) -> Option<Self> {
        match info.trim().parse::<i32>().ok()? {
            20 => Some(Variant::Adc20),
            24 => Some(Variant::Adc24),
            _ => None,
        }
    }

    /// Number of single-ended analog input channels.
    pub fn num_channels(self) -> i16 {
        match self {
            Variant::Adc20 => 8,
            Variant::Adc24 => 16,
        }
    }
}

/// Analog input voltage range (`HRDL_RANGE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Range {
    /// ±2500 mV
    Mv2500,
    /// ±1250 mV
    Mv1250,
    /// ±625 mV
    Mv625,
    /// ±312.5 mV
    Mv313,
    /// ±156.25 mV
    Mv156,
    /// ±78.125 mV
    Mv78,
    /// ±39.0625 mV
    Mv39,
}

impl Range {
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Full-scale input voltage in volts. Maximum ADC counts map to this value.
    pub fn full_scale_volts(self) -> f64 {
        2.5 / f64::from(1u32 << (self as u32))
    }
}

/// Per-channel conversion time (`HRDL_CONVERSION_TIME`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ConversionTime {
    Ms60,
    Ms100,
    Ms180,
    Ms340,
    Ms660,
}

impl ConversionTime {
    pub fn code(self) -> i16 {
        self as i16
    }

    /// Conversion time per channel in milliseconds.
    pub fn millis(self) -> i32 {
        match self {
            ConversionTime::Ms60 => 60,
            ConversionTime::Ms100 => 100,
            ConversionTime::Ms180 => 180,
            ConversionTime::Ms340 => 340,
            ConversionTime::Ms660 => 660,
        }
    }
}

/// Acquisition mode passed to `run` (`HRDL_BLOCK_METHOD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMethod {
    /// Capture exactly `n` samples then stop.
    Block,
    /// Keep the most recent `n` samples.
    Window,
    /// Collect continuously; `get_values` returns whatever has accumulated.
    Stream,
}

impl BlockMethod {
    pub fn code(self) -> i16 {
        match self {
            BlockMethod::Block => 0,
            BlockMethod::Window => 1,
            BlockMethod::Stream => 2,
        }
    }
}

/// Mains frequency rejected by the converter's integration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mains {
    #[default]
    FiftyHertz,
    SixtyHertz,
}

impl Mains {
    pub fn is_sixty_hertz(self) -> bool {
        self == Mains::SixtyHertz
    }
}

/// Outcome of a drain (`get_values` / `get_times_and_values`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Number of samples returned. Each sample is one value per active channel.
    pub samples: usize,
    /// The device reported an input over-range during the block.
    pub overflow: bool,
}

/// Errors reported by the HRDL driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HrdlError {
    #[error("No device found")]
    NoDevice,

    #[error("Unable to open device: {0}")]
    OpenFailed(String),

    #[error("Unexpected device type: {0:?}")]
    UnexpectedVariant(String),

    #[error("Device handle is closed")]
    Closed,

    #[error("Cannot {operation} while unit is {state}")]
    InvalidState {
        operation: &'static str,
        state: UnitState,
    },

    #[error("Channel {channel} out of range 1..={max}")]
    ChannelOutOfRange { channel: i16, max: i16 },

    #[error("Failed to activate channel {channel}: {detail}")]
    ChannelRejected { channel: i16, detail: String },

    #[error(
        "Sample interval too short to perform conversion for all channels \
         ({channels} x {conversion_ms} ms > {interval_ms} ms)"
    )]
    TimingBudget {
        channels: usize,
        conversion_ms: i32,
        interval_ms: i32,
    },

    #[error("Unable to set sampling interval: {0}")]
    IntervalRejected(String),

    #[error("Unable to set mains rejection: {0}")]
    MainsRejected(String),

    #[error("Failed to setup data block: {0}")]
    RunRejected(String),

    #[error("Failed to query min/max ADC counts for channel {0}")]
    MinMaxUnavailable(i16),

    #[error("Buffer holds {got} values but {needed} are required")]
    BufferTooSmall { needed: usize, got: usize },
}

/// Result type for HRDL operations.
pub type HrdlResult<T> = Result<T, HrdlError>;
