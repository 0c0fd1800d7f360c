//! `hwo-monitor`: run a beamline's hardware objects and log their signals.
//!
//! Builds every configured hardware object, seeds it with an initial read
//! and then logs each `valueChanged` / `stateChanged` / `valueConfirmed` /
//! `globalStateChanged` notification until interrupted.
//!
//! Only `mock://` endpoints are available here; they are backed by the
//! simulated transport and its `[devices.simulation]` tables.
//!
//! # Usage
//!
//! Validate a configuration:
//! ```bash
//! hwo-monitor check --config config/beamline.toml
//! ```
//!
//! Monitor for ten seconds with JSON logs:
//! ```bash
//! hwo-monitor --json run --config config/beamline.toml --duration-secs 10
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hwo_core::{
    Beamline, BeamlineConfig, DeviceId, HardwareObjectSignal, PollerRegistry, TransportFactory,
};
use hwo_driver_mock::MockTransportFactory;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hwo-monitor")]
#[command(about = "Poll beamline hardware objects and log their signals", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the beamline and log signals until Ctrl-C
    Run {
        /// Beamline configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Load and validate a configuration without connecting
    Check {
        /// Beamline configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run {
            config,
            duration_secs,
        } => run(&config, duration_secs.map(Duration::from_secs)).await,
        Commands::Check { config } => check(&config).map(|summary| println!("{summary}")),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn factories() -> Vec<Arc<dyn TransportFactory>> {
    vec![Arc::new(MockTransportFactory)]
}

/// Load `path` and check every device against the available transports.
fn check(path: &Path) -> Result<String> {
    let config = BeamlineConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let factories = factories();

    let mut lines = vec![format!(
        "{}: {} device(s), default interval {} ms",
        config.name,
        config.devices.len(),
        config.polling.default_interval_ms
    )];
    for device in &config.devices {
        let id = DeviceId::new(device.endpoint.as_str());
        let scheme = id
            .scheme()
            .ok_or_else(|| anyhow!("device '{}': endpoint has no scheme", device.name))?;
        let factory = factories
            .iter()
            .find(|f| f.scheme() == scheme)
            .ok_or_else(|| anyhow!("device '{}': no transport for '{scheme}://'", device.name))?;
        factory
            .validate(device.simulation.as_ref())
            .with_context(|| format!("device '{}'", device.name))?;
        lines.push(format!(
            "  {} ({:?}) {} - {} channel(s)",
            device.name,
            device.kind,
            device.endpoint,
            device.channels.len()
        ));
    }
    Ok(lines.join("\n"))
}

async fn run(path: &Path, duration: Option<Duration>) -> Result<()> {
    let config = BeamlineConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let registry = PollerRegistry::from_current()?;
    let (mut beamline, events) = Beamline::build(config, &factories(), registry).await?;
    let dispatch = tokio::spawn(events.run());

    let monitors: Vec<_> = beamline
        .objects()
        .map(|(name, object)| tokio::spawn(monitor(name.to_string(), object.subscribe())))
        .collect();

    beamline.init().await?;
    info!(
        beamline = beamline.name(),
        objects = monitors.len(),
        pollers = beamline.registry().len(),
        "Monitoring"
    );

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    beamline.shutdown();
    for monitor in monitors {
        monitor.await?;
    }
    dispatch.await?;
    Ok(())
}

/// Log every signal of one object until the object is dropped.
async fn monitor(name: String, mut signals: broadcast::Receiver<HardwareObjectSignal>) {
    loop {
        match signals.recv().await {
            Ok(signal) => log_signal(&name, &signal),
            Err(RecvError::Lagged(missed)) => {
                warn!(object = %name, missed, "Monitor fell behind, signals dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_signal(name: &str, signal: &HardwareObjectSignal) {
    match serde_json::to_string(signal) {
        Ok(json) => info!(object = %name, signal = %json, "Signal"),
        Err(e) => warn!(object = %name, error = %e, "Unserializable signal"),
    }
}
