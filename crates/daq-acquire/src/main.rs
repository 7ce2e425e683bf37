//! Acquisition runner.
//!
//! Loads a sensor configuration, starts one acquisition thread per sensor
//! and hands every sample to an async logging stage until the requested
//! duration elapses or Ctrl-C is pressed.
//!
//! # Usage
//!
//! ```bash
//! daq-acquire --config sensors.toml --duration 60
//! DAQ_APPLICATION__LOG_LEVEL=debug daq-acquire --config sensors.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use daq_core::clock::system_clock;
use daq_core::config::AcquisitionConfig;
use daq_core::decoder::DecoderRegistry;
use daq_core::fanout::{ClientFilter, QueueClient, SampleClient, SampleSource};
use daq_core::observability::{self, TracingConfig};
use daq_io::{AcquisitionThread, SensorReader};
use daq_pool::{Sample, SamplePool};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Samples buffered between the fan-out and the logging stage.
const QUEUE_DEPTH: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "daq-acquire")]
#[command(about = "Acquire samples from configured sensors", long_about = None)]
struct Cli {
    /// Sensor configuration file (TOML)
    #[arg(long, short)]
    config: PathBuf,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, short)]
    duration: Option<u64>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AcquisitionConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let mut tracing_config = TracingConfig::from_config(&config)?;
    if let Some(level) = &cli.log_level {
        tracing_config.level = observability::parse_log_level(level)?;
    }
    observability::init(tracing_config)?;

    if config.sensors.is_empty() {
        bail!("{} configures no sensors", cli.config.display());
    }

    let mut registry = DecoderRegistry::new();
    daq_drivers::register_builtin(&mut registry)?;
    let pool = Arc::new(SamplePool::new(config.pool.to_pool_config()));

    let mut threads = Vec::with_capacity(config.sensors.len());
    let mut sinks = Vec::with_capacity(config.sensors.len());
    for sensor in &config.sensors {
        let source = Arc::new(SampleSource::new(&sensor.name));
        let (queue, rx) = QueueClient::new(format!("{}-log", sensor.name), QUEUE_DEPTH);
        source.add_client(ClientFilter::All, Arc::clone(&queue) as Arc<dyn SampleClient>);
        sinks.push((Arc::clone(&source), queue, log_samples(sensor.name.clone(), rx)));

        let reader = SensorReader::from_config(
            sensor,
            &registry,
            Arc::clone(&pool),
            source,
            system_clock(),
        )
        .with_context(|| format!("sensor '{}'", sensor.name))?;
        threads.push(AcquisitionThread::spawn(reader)?);
    }
    info!(
        application = %config.application.name,
        sensors = threads.len(),
        "Acquisition running"
    );

    match cli.duration {
        Some(secs) => tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(secs)) => {}
            res = tokio::signal::ctrl_c() => res?,
        },
        None => tokio::signal::ctrl_c().await?,
    }
    info!("Stopping acquisition");

    let exits = tokio::task::spawn_blocking(move || {
        threads
            .into_iter()
            .map(|thread| {
                let name = thread.name().to_string();
                (name, thread.stop_and_join())
            })
            .collect::<Vec<_>>()
    })
    .await?;

    let mut failed = 0;
    for (name, exit) in exits {
        match exit {
            Ok(exit) => info!(
                sensor = %name,
                bytes = exit.stats.bytes,
                messages = exit.stats.messages,
                samples = exit.stats.samples,
                bad_checksum = exit.stats.bad_checksum,
                oversize = exit.stats.oversize,
                incomplete = exit.stats.incomplete,
                malformed = exit.stats.malformed,
                "Reader statistics"
            ),
            Err(e) => {
                failed += 1;
                error!(sensor = %name, error = %e, "Reader failed");
            }
        }
    }

    for (source, queue, task) in sinks {
        for metrics in source.client_metrics() {
            debug!(
                source = source.name(),
                client = %metrics.client,
                delivered = metrics.delivered,
                rejected = metrics.rejected,
                "Client statistics"
            );
        }
        if queue.dropped() > 0 {
            warn!(source = source.name(), dropped = queue.dropped(), "Logging stage fell behind");
        }
        // Last sender gone: the logging task drains and ends.
        let client: Arc<dyn SampleClient> = queue;
        source.remove_client(ClientFilter::All, &client);
        drop(client);
        let received = task.await?;
        debug!(source = source.name(), received, "Logging stage finished");
    }

    let stats = pool.stats();
    info!(
        allocated = stats.allocated,
        outstanding = stats.outstanding,
        free = stats.free(),
        deleted = stats.deleted,
        "Pool statistics"
    );

    if failed > 0 {
        warn!(failed, "Some readers ended with errors");
        bail!("{failed} reader(s) failed");
    }
    Ok(())
}

/// Async stage: counts samples and logs the latest one now and then.
fn log_samples(sensor: String, mut rx: mpsc::Receiver<Sample>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(sample) = rx.recv().await {
            received += 1;
            if received % 100 == 1 {
                info!(
                    sensor = %sensor,
                    id = %sample.id(),
                    timetag = sample.timetag(),
                    values = ?sample.to_f64_vec(),
                    received,
                    "Sample"
                );
            }
        }
        received
    })
}
