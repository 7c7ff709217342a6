//! DSP7265 probe
//!
//! Talks to a lock-in through the same plugins a host would load, using a
//! configuration file plus `DSP7265_*` environment overrides.
//!
//! # Usage
//!
//! ```bash
//! # List serial ports usable as addresses
//! dsp7265 resources
//!
//! # Identify the instrument
//! dsp7265 --config lockin.toml id
//!
//! # Read, then set the oscillator frequency
//! dsp7265 --config lockin.toml frequency
//! dsp7265 --config lockin.toml frequency --set 1234.5
//!
//! # Read channels once
//! dsp7265 --config lockin.toml read --channels x,y,mag
//!
//! # Apply a setting
//! dsp7265 --config lockin.toml apply imode '"current mode"'
//!
//! # Try everything against the in-memory instrument
//! DSP7265_CONNECTION__ADAPTER=simulated dsp7265 read
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_core::error::{AppResult, DaqError};
use daq_driver_signal_recovery::transport::{list_resources, Connector, SystemConnector};
use daq_driver_signal_recovery::{Channel, Dsp7265Actuator, Dsp7265Config, Dsp7265Viewer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Argument Structure
// =============================================================================

/// Probe a Signal Recovery DSP7265 lock-in amplifier
#[derive(Parser, Debug)]
#[command(name = "dsp7265")]
#[command(version)]
#[command(about = "Probe a Signal Recovery DSP7265 lock-in amplifier", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Resources,
    /// Print the identification string
    Id,
    /// Read the oscillator frequency, optionally setting it first
    Frequency {
        /// New frequency in Hz
        #[arg(long)]
        set: Option<f64>,
    },
    /// Read channels once
    Read {
        /// Channels to read (x, y, mag, phase, adc1, adc2, adc3)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,
    },
    /// Apply one setting, given as JSON (bare words are taken as labels)
    Apply {
        /// Setting name, e.g. `imode`, `sensitivity`, `gain`
        name: String,
        /// Value, e.g. `'"current mode"'` or `40`
        value: String,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Command::Resources = args.command {
        for resource in list_resources() {
            println!("{}", resource);
        }
        return Ok(());
    }

    let config = Dsp7265Config::load(args.config.as_deref())?;
    info!(adapter = %config.connection.adapter, address = %config.connection.address, "Loaded configuration");

    run(args.command, config, Arc::new(SystemConnector)).await
}

/// Run one device command. The device is closed whether or not it succeeds.
async fn run(command: Command, config: Dsp7265Config, connector: Arc<dyn Connector>) -> Result<()> {
    match command {
        Command::Resources => Ok(()),
        Command::Id => {
            let actuator = Dsp7265Actuator::new(config, connector);
            let init = actuator.initialize(None).await?;
            println!("{}", init.info);
            actuator.close().await?;
            Ok(())
        }
        Command::Frequency { set } => {
            let actuator = Dsp7265Actuator::new(config, connector);
            actuator.initialize(None).await?;
            let result = async {
                if let Some(hz) = set {
                    actuator.move_absolute(hz).await?;
                }
                println!("{} Hz", actuator.read_position().await?);
                Ok::<(), DaqError>(())
            }
            .await;
            finish(result, actuator.close().await)
        }
        Command::Read { channels } => {
            let mut config = config;
            if !channels.is_empty() {
                config.channels = vec![parse_channels(&channels)?];
            }
            if config.channels.is_empty() {
                config.channels = vec![vec![Channel::X]];
            }
            let viewer = Dsp7265Viewer::new(config, connector);
            viewer.initialize(None).await?;
            let result = viewer.read_groups().await.map(|groups| {
                for group in groups {
                    for (label, data) in group.labels.iter().zip(&group.data) {
                        println!("{}.{} = {:?}", group.name, label, data);
                    }
                }
            });
            finish(result, viewer.close().await)
        }
        Command::Apply { name, value } => {
            let value = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            let actuator = Dsp7265Actuator::new(config, connector);
            actuator.initialize(None).await?;
            let result = actuator.apply_setting(&name, &value).await;
            if result.is_ok() {
                println!("{} = {}", name, value);
            }
            finish(result, actuator.close().await)
        }
    }
}

/// Report the command's outcome once the device has been closed.
///
/// The command's error wins; a close error behind it is only logged.
fn finish(result: AppResult<()>, closed: AppResult<()>) -> Result<()> {
    if let (Err(_), Err(close_err)) = (&result, &closed) {
        warn!(error = %close_err, "Close after failed command also failed");
    }
    result?;
    closed?;
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_channels(names: &[String]) -> Result<Vec<Channel>> {
    names
        .iter()
        .map(|name| {
            Channel::from_name(name.trim())
                .with_context(|| format!("unknown channel '{}'", name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_driver_signal_recovery::simulated::SimulatedConnector;
    use daq_driver_signal_recovery::ConnectionSettings;

    fn simulated() -> (Dsp7265Config, SimulatedConnector) {
        let config = Dsp7265Config {
            connection: ConnectionSettings::simulated(),
            ..Default::default()
        };
        (config, SimulatedConnector::default())
    }

    #[tokio::test]
    async fn failed_move_still_closes_instrument() {
        let (config, connector) = simulated();
        let instrument = connector.instrument().clone();

        instrument.fail_on("OF. 1234");
        let err = run(
            Command::Frequency { set: Some(1234.0) },
            config,
            Arc::new(connector),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::DeviceCommand(_))
        ));
        assert_eq!(instrument.close_calls(), 1);
    }

    #[tokio::test]
    async fn rejected_setting_still_closes_instrument() {
        let (config, connector) = simulated();
        let instrument = connector.instrument().clone();

        let err = run(
            Command::Apply {
                name: "imode".into(),
                value: "\"sideways mode\"".into(),
            },
            config,
            Arc::new(connector),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::Configuration(_))
        ));
        assert_eq!(instrument.close_calls(), 1);
    }

    #[tokio::test]
    async fn successful_read_closes_once() {
        let (config, connector) = simulated();
        let instrument = connector.instrument().clone();

        run(
            Command::Read {
                channels: vec!["x".into(), "y".into()],
            },
            config,
            Arc::new(connector),
        )
        .await
        .unwrap();

        assert_eq!(instrument.close_calls(), 1);
    }

    #[test]
    fn command_error_wins_over_close_error() {
        let err = finish(
            Err(DaqError::DeviceCommand("OF. rejected".into())),
            Err(DaqError::Connection("port gone".into())),
        )
        .unwrap_err();
        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::DeviceCommand(_))
        ));

        let err = finish(Ok(()), Err(DaqError::Connection("port gone".into()))).unwrap_err();
        assert!(matches!(DaqError::find(&err), Some(DaqError::Connection(_))));
    }
}
