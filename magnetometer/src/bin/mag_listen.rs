//! Subscribe to magnetometer records and print or log them.
//!
//! Prints every record, and every sixth record the list of timestamp deltas
//! since the previous report. With `--log-dir` each record is also appended
//! to a daily `YYYY-MM-DD.txt` file.
//!
//! With `--replay` no broker is contacted: the given daily files, or every
//! daily file in the given directories, are read back and printed as JSON.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hardware::mqtt::{MqttClient, MqttConfig, DEFAULT_PORT};
use magnetometer::acquisition::DEFAULT_TOPIC;
use magnetometer::listener::{DailyLog, DeltaTracker, Sample, LISTENER_CLIENT_ID};
use magnetometer::shutdown;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Magnetometer record listener
#[derive(Parser, Debug)]
#[command(name = "mag_listen")]
#[command(about = "Print and log magnetometer records received over MQTT")]
#[command(version)]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    broker_port: u16,

    /// MQTT client identifier
    #[arg(long, default_value = LISTENER_CLIENT_ID)]
    client_id: String,

    /// Topic to subscribe to
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Append records to daily text files in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Print records as JSON objects
    #[arg(long)]
    json: bool,

    /// Read daily files (or directories of them) back and print them as JSON
    #[arg(long, value_name = "PATH", num_args = 1..)]
    replay: Vec<PathBuf>,

    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn replay_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let log = DailyLog::new(path)?;
        Ok(log
            .day_files()
            .with_context(|| format!("Failed to list {}", path.display()))?)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

fn replay(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        for file in replay_files(path)? {
            let samples = DailyLog::read_day(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            for sample in &samples {
                println!("{}", sample.to_json()?);
            }
            info!("Replayed {} samples from {}", samples.len(), file.display());
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if !args.replay.is_empty() {
        return replay(&args.replay);
    }

    let shutdown = shutdown::install().context("Failed to install signal handlers")?;
    let daily = args
        .log_dir
        .as_ref()
        .map(|dir| DailyLog::new(dir.clone()))
        .transpose()
        .context("Failed to create log directory")?;

    let config = MqttConfig::new(&args.broker_host, args.broker_port, &args.client_id);
    let mut client = MqttClient::connect(config)?;
    client.subscribe(&args.topic)?;
    info!("Listening on {:?}", args.topic);

    let mut deltas = DeltaTracker::new();
    while !shutdown.load(Ordering::SeqCst) {
        client.sync()?;

        while let Some(message) = client.take_message() {
            let sample = match Sample::decode(&message.payload) {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("Skipping message on {:?}: {e}", message.topic);
                    continue;
                }
            };

            if args.json {
                println!("{}", sample.to_json()?);
            } else {
                println!("{sample}");
            }
            if let Some(steps) = deltas.record(sample.timestamp) {
                println!("deltas: {steps:?}");
            }
            if let Some(log) = &daily {
                let path = log.append(&sample)?;
                debug!("Appended to {}", path.display());
            }
        }

        thread::sleep(POLL_INTERVAL);
    }

    info!("Received {} records", deltas.received());
    client.close();
    Ok(())
}
