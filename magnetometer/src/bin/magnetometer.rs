//! Fluxgate magnetometer acquisition daemon.
//!
//! Opens the data logger, connects to the MQTT broker, configures the four
//! magnetometer channels and then publishes calibrated samples until SIGINT
//! or SIGTERM. Exits with code 1 on any fatal device or broker error.

use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::Parser;
use hardware::hrdl::{HrdlBackend, HrdlUnit};
use hardware::mqtt::MqttClient;
use hardware::SystemClock;
use magnetometer::config::{Backend, DaemonArgs, DaemonConfig};
use magnetometer::{configure_datalogger, shutdown, Acquisition};
use tracing::{error, info};

fn run_daemon<B: HrdlBackend>(
    backend: B,
    config: &DaemonConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut unit = HrdlUnit::open(backend)?;
    unit.log_device_info();

    let publisher = MqttClient::connect(config.mqtt.clone()).with_context(|| {
        format!(
            "Unable to connect to MQTT broker at {}",
            config.mqtt.address()
        )
    })?;

    let scaling = configure_datalogger(&mut unit, &config.channels, &config.acquisition.plan)?;
    let mut acquisition = Acquisition::new(
        unit,
        publisher,
        SystemClock,
        scaling,
        config.acquisition.clone(),
    )?;

    acquisition.run(shutdown)?;
    acquisition.close();
    info!(
        "Published {} blocks, exiting",
        acquisition.blocks_published()
    );
    Ok(())
}

fn run(config: &DaemonConfig) -> Result<()> {
    let shutdown = shutdown::install().context("Failed to install signal handlers")?;

    match config.backend {
        Backend::Sim => {
            let mut sim = hardware::hrdl::SimHrdl::new().with_available_units(config.sim_units);
            if let Some(seed) = config.sim_seed {
                sim = sim.with_seed(seed);
            }
            run_daemon(sim, config, shutdown)
        }
        #[cfg(feature = "picohrdl")]
        Backend::Pico => run_daemon(hardware::hrdl::PicoHrdl::new(), config, shutdown),
        #[cfg(not(feature = "picohrdl"))]
        Backend::Pico => anyhow::bail!("Built without the picohrdl feature, use --backend sim"),
    }
}

fn main() -> Result<()> {
    let args = DaemonArgs::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = DaemonConfig::try_from(args)?;
    info!(
        "Starting magnetometer: broker {}, topic {:?}",
        config.mqtt.address(),
        config.acquisition.topic
    );

    if let Err(e) = run(&config) {
        error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
