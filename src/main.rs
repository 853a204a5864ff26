//! CLI Entry Point for tempchar
//!
//! Provides command-line access to the measurement engine:
//! - `discover` enumerates USB, GPIB and FTDI resources
//! - `connect` probes every checked device of the configuration
//! - `relay` switches the sample relays by hand
//! - `run` executes a full measurement run
//!
//! # Usage
//!
//! ```bash
//! tempchar --config config/tempchar.toml discover
//! tempchar --simulate run --name lot7 --yes
//! tempchar relay --on 3
//! ```
//!
//! Instrument command encoding, the chamber driver and the relay bit-bang
//! protocol are provided by the integrating application. This binary only
//! ships the simulated ones, so `relay` and `run` require `--simulate`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempchar::bus::{BusScanner, InstrumentProbe, Transport};
use tempchar::config::EngineConfig;
use tempchar::dialog::ConsoleDialog;
use tempchar::engine::{Collaborators, MeasurementEngine, RunOutcome};
use tempchar::logging;
use tempchar::mock::{MockBus, MockExecutor, MockProbe, MockRelayTransport, MockThermal};
use tempchar::registry::{BusSet, DeviceRegistry};
use tempchar::relay::RelayMultiplexer;
use tempchar::report::{PivotAggregator, ReportWriter};
use tempchar::settings::Category;
use tempchar::validation::Validator;
use tempchar::DeviceId;
use tracing::info;

#[derive(Parser)]
#[command(name = "tempchar")]
#[command(about = "Temperature-characteristic measurement runner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = tempchar::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of real buses
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate USB, GPIB and FTDI resources
    Discover,

    /// Probe every checked device
    Connect,

    /// Switch sample relays
    Relay {
        /// Turn this relay (1-6) on, all others off
        #[arg(long, conflicts_with = "all_off")]
        on: Option<u8>,

        /// Turn every relay off
        #[arg(long)]
        all_off: bool,
    },

    /// Execute a measurement run
    Run {
        /// Report file name without extension
        #[arg(long)]
        name: Option<String>,

        /// Accept auto-range warnings without asking
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)?;
    config.validate()?;
    logging::init_from_config(&config)?;
    info!(app = %config.application.name, config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::Discover => discover(&config, cli.simulate).await,
        Commands::Connect => connect(&config, cli.simulate).await,
        Commands::Relay { on, all_off } => relay(&config, cli.simulate, on, all_off).await,
        Commands::Run { name, yes } => run(config, cli.simulate, name, yes).await,
    }
}

/// Stands in for a transport this build has no back-end for.
#[cfg(not(all(feature = "instrument_visa", feature = "instrument_serial")))]
struct UnavailableBus(Transport);

#[cfg(not(all(feature = "instrument_visa", feature = "instrument_serial")))]
#[async_trait]
impl BusScanner for UnavailableBus {
    fn transport(&self) -> Transport {
        self.0
    }

    async fn scan(&self) -> Result<Vec<String>> {
        bail!("{} support is not compiled in", self.0)
    }
}

fn bus_set(simulate: bool) -> BusSet {
    if simulate {
        return BusSet {
            usb: Arc::new(MockBus::new(
                Transport::Usb,
                &["USB0::0x0699::0x0401::C000001::INSTR"],
            )),
            gpib: Arc::new(MockBus::new(Transport::Gpib, &["GPIB0::22::INSTR"])),
            ftdi: Arc::new(MockBus::new(Transport::Ftdi, &["FT5XKQ1"])),
        };
    }

    #[cfg(feature = "instrument_visa")]
    let (usb, gpib): (Arc<dyn BusScanner>, Arc<dyn BusScanner>) = (
        Arc::new(tempchar::bus::VisaScanner::usb()),
        Arc::new(tempchar::bus::VisaScanner::gpib()),
    );
    #[cfg(not(feature = "instrument_visa"))]
    let (usb, gpib): (Arc<dyn BusScanner>, Arc<dyn BusScanner>) = (
        Arc::new(UnavailableBus(Transport::Usb)),
        Arc::new(UnavailableBus(Transport::Gpib)),
    );

    #[cfg(feature = "instrument_serial")]
    let ftdi: Arc<dyn BusScanner> = Arc::new(tempchar::bus::FtdiSerialScanner);
    #[cfg(not(feature = "instrument_serial"))]
    let ftdi: Arc<dyn BusScanner> = Arc::new(UnavailableBus(Transport::Ftdi));

    BusSet { usb, gpib, ftdi }
}

async fn discover(config: &EngineConfig, simulate: bool) -> Result<()> {
    let mut registry = DeviceRegistry::from_entries(&config.devices)?;
    let outcome = registry.discover(&bus_set(simulate)).await;
    println!("{}", outcome);

    let found = registry.discovered();
    for (label, list) in [("USB", &found.usb), ("GPIB", &found.gpib), ("FTDI", &found.ftdi)] {
        for resource in list {
            println!("  {:<5} {}", label, resource);
        }
    }
    if !outcome.is_ok() {
        bail!("{}", outcome.message());
    }
    Ok(())
}

fn probe(simulate: bool) -> Result<Box<dyn InstrumentProbe>> {
    if simulate {
        return Ok(Box::new(MockProbe::new()));
    }
    hardware_probe()
}

#[cfg(feature = "instrument_visa")]
fn hardware_probe() -> Result<Box<dyn InstrumentProbe>> {
    Ok(Box::new(tempchar::bus::VisaProbe {
        timeout: Duration::from_secs(2),
        relay: UnavailableRelay,
    }))
}

#[cfg(not(feature = "instrument_visa"))]
fn hardware_probe() -> Result<Box<dyn InstrumentProbe>> {
    bail!("Probing requires the instrument_visa feature or --simulate")
}

/// Relay transport placeholder until the application supplies its driver.
#[cfg(feature = "instrument_visa")]
struct UnavailableRelay;

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl tempchar::relay::RelayTransport for UnavailableRelay {
    async fn open(&self, serial: &str) -> Result<Box<dyn tempchar::relay::RelaySession>> {
        bail!("No relay driver available to open '{}'", serial)
    }
}

async fn connect(config: &EngineConfig, simulate: bool) -> Result<()> {
    let registry = DeviceRegistry::from_entries(&config.devices)?;
    let probe = probe(simulate)?;
    let report = registry
        .connect_all(&Validator::new(), probe.as_ref())
        .await;

    println!("{}", report.outcome);
    for id in &report.responded {
        println!("  responded: {}", id);
    }
    if !report.outcome.is_ok() {
        bail!("{}", report.outcome.message());
    }
    Ok(())
}

fn require_simulation(simulate: bool, what: &str) -> Result<()> {
    if !simulate {
        bail!(
            "{} needs hardware drivers supplied by the integrating application; use --simulate",
            what
        );
    }
    Ok(())
}

async fn relay(config: &EngineConfig, simulate: bool, on: Option<u8>, all_off: bool) -> Result<()> {
    require_simulation(simulate, "Relay control")?;
    let registry = DeviceRegistry::from_entries(&config.devices)?;
    let serial = registry
        .slot(DeviceId::Relay)
        .map(|s| s.address.clone())
        .unwrap_or_default();
    let mux = RelayMultiplexer::new(Arc::new(MockRelayTransport::new()), serial);

    let outcome = match (on, all_off) {
        (Some(relay), _) => mux.set_exclusive(relay).await,
        (None, true) => mux.all_off().await,
        (None, false) => bail!("Nothing to do: pass --on N or --all-off"),
    };
    println!("{}", outcome);
    if !outcome.is_ok() {
        bail!("{}", outcome.message());
    }
    Ok(())
}

async fn run(config: EngineConfig, simulate: bool, name: Option<String>, yes: bool) -> Result<()> {
    require_simulation(simulate, "A measurement run")?;
    let registry = DeviceRegistry::from_entries(&config.devices)?;
    let tabs = config.tab_set();

    let collaborators = Collaborators {
        validator: Validator::new(),
        executors: vec![
            Arc::new(MockExecutor::new(Category::Sweep).with_delay(Duration::from_millis(50))),
            Arc::new(MockExecutor::new(Category::Delay).with_delay(Duration::from_millis(50))),
            Arc::new(
                MockExecutor::new(Category::Vi)
                    .with_reading("Vout", 3.3, "V")
                    .with_delay(Duration::from_millis(50)),
            ),
        ],
        relay: Arc::new(MockRelayTransport::new()),
        thermal: Arc::new(MockThermal::new().with_settle(Duration::from_millis(200))),
        aggregator: Arc::new(PivotAggregator),
        dialog: Arc::new(ConsoleDialog::new(yes)),
        writer: ReportWriter::new(config.output.directory.clone(), config.output.encoding),
    };
    let engine = Arc::new(MeasurementEngine::new(collaborators));

    let interrupter = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = interrupter.cancel();
        }
    });

    let report = engine
        .run(name.as_deref(), &registry, &tabs, &config.run, &config.debug)
        .await?;
    ctrl_c.abort();

    info!(run_id = %report.run_id, outcome = ?report.outcome, "Run returned");
    match report.outcome {
        RunOutcome::Faulted => bail!("Run {} failed", report.run_id),
        RunOutcome::Completed | RunOutcome::Cancelled => Ok(()),
    }
}
