//! Print the identity and channel limits of an HRDL data logger.
//!
//! Opens the first available unit, logs the descriptive unit information and
//! the ADC count limits of every channel, then closes the unit.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use hardware::hrdl::{HrdlBackend, HrdlUnit};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Simulated device
    Sim,
    /// Installed Pico HRDL driver
    Pico,
}

/// Query an HRDL data logger
#[derive(Parser, Debug)]
#[command(name = "hrdl_info")]
#[command(about = "Print HRDL unit information and per-channel ADC limits")]
#[command(version)]
struct Args {
    /// Device backend to open
    #[arg(long, value_enum, default_value = "sim")]
    backend: Backend,

    /// Number of units the simulated backend reports as attached
    #[arg(long, default_value = "16")]
    sim_units: usize,
}

fn report<B: HrdlBackend>(backend: B) -> Result<()> {
    let mut unit = HrdlUnit::open(backend)?;
    unit.log_device_info();

    for channel in 1..=unit.num_channels() {
        match unit.min_max_counts(channel) {
            Ok((min, max)) => info!("Channel {channel:>2}: counts {min} .. {max}"),
            Err(e) => info!("Channel {channel:>2}: {e}"),
        }
    }

    unit.close();
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let args = Args::parse();

    match args.backend {
        #[cfg(feature = "sim")]
        Backend::Sim => report(hardware::hrdl::SimHrdl::new().with_available_units(args.sim_units)),
        #[cfg(feature = "picohrdl")]
        Backend::Pico => report(hardware::hrdl::PicoHrdl::new()),
        #[allow(unreachable_patterns)]
        other => bail!("Backend {other:?} was not compiled in"),
    }
}
