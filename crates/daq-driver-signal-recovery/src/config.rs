//! Plugin configuration.
//!
//! Factories receive the device's TOML table from the host; the probe binary
//! loads the same structure with `figment`:
//!
//! 1. built-in defaults
//! 2. a TOML file
//! 3. `DSP7265_*` environment variables (`__` separates nested keys,
//!    e.g. `DSP7265_CONNECTION__ADDRESS`)
//!
//! ```toml
//! role = "primary"             # or "secondary" ("master"/"slave" accepted)
//! controller_id = "lockin"
//! channels = [["x", "y"], ["mag", "phase"]]
//!
//! [connection]
//! adapter = "prologix"         # "visa", "prologix" or "simulated"
//! address = "/dev/ttyUSB0"
//! gpib_address = 12
//!
//! [bounds]
//! enabled = true
//! min = 0.0
//! max = 250000.0
//!
//! [settings]
//! imode = "current mode"
//! sensitivity = "1.00e-06 A"
//! ```

use crate::controller::ControllerRole;
use crate::dsp7265::Channel;
use crate::settings::Setting;
use crate::transport::AdapterKind;
use daq_core::error::{AppResult, DaqError};
use daq_core::scaling::{ScalingPipeline, SoftLimits};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Prefix of the environment variables read by [`Dsp7265Config::load`].
pub const ENV_PREFIX: &str = "DSP7265_";

/// How to reach the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Transport backend
    pub adapter: AdapterKind,
    /// VISA resource, serial path, or Prologix controller port
    pub address: String,
    /// Instrument address on the GPIB bus (Prologix only)
    pub gpib_address: u8,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            address: String::new(),
            gpib_address: 12,
            baud_rate: 9600,
            timeout_ms: 3000,
        }
    }
}

impl ConnectionSettings {
    /// Settings for the in-memory instrument.
    pub fn simulated() -> Self {
        Self {
            adapter: AdapterKind::Simulated,
            ..Default::default()
        }
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration shared by the actuator and the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dsp7265Config {
    /// Whether this instance owns the connection
    pub role: ControllerRole,
    /// Key under which primaries publish their controller for secondaries
    pub controller_id: String,
    /// Transport settings (ignored by secondaries)
    pub connection: ConnectionSettings,
    /// Actuator soft bounds, host units
    pub bounds: SoftLimits,
    /// Actuator host/device transform
    pub scaling: ScalingPipeline,
    /// Initial instrument settings, by configuration key
    pub settings: BTreeMap<String, serde_json::Value>,
    /// Viewer channel groups, one list of channels per group
    pub channels: Vec<Vec<Channel>>,
}

impl Default for Dsp7265Config {
    fn default() -> Self {
        Self {
            role: ControllerRole::default(),
            controller_id: "dsp7265".to_string(),
            connection: ConnectionSettings::default(),
            bounds: SoftLimits::default(),
            scaling: ScalingPipeline::default(),
            settings: BTreeMap::new(),
            channels: Vec::new(),
        }
    }
}

impl Dsp7265Config {
    /// Parse the host-supplied TOML table.
    pub fn from_toml(value: toml::Value) -> AppResult<Self> {
        let config: Self = value
            .try_into()
            .map_err(|e| DaqError::Configuration(format!("invalid DSP7265 config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then `path` (if given), then `DSP7265_*` variables.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| DaqError::Configuration(format!("failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> AppResult<()> {
        self.scaling.validate()?;
        self.bounds.validate()?;
        if self.controller_id.trim().is_empty() {
            return Err(DaqError::Configuration("controller_id is empty".into()));
        }
        if self.role == ControllerRole::Primary
            && self.connection.adapter != AdapterKind::Simulated
            && self.connection.address.trim().is_empty()
        {
            return Err(DaqError::Configuration(format!(
                "a primary controller needs a device address for the {} adapter",
                self.connection.adapter
            )));
        }
        Ok(())
    }

    /// Initial settings parsed and sorted in application order.
    ///
    /// Unknown keys are skipped.
    pub fn initial_settings(&self) -> AppResult<Vec<Setting>> {
        let mut parsed = Vec::with_capacity(self.settings.len());
        for (name, value) in &self.settings {
            match Setting::parse(name, value)? {
                Some(setting) => parsed.push(setting),
                None => debug!(setting = %name, "Ignoring unknown setting"),
            }
        }
        parsed.sort_by_key(Setting::kind);
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp7265::InputMode;
    use crate::settings::SettingKind;

    fn table(src: &str) -> toml::Value {
        toml::Value::Table(toml::from_str(src).unwrap())
    }

    #[test]
    fn from_toml_reads_nested_tables() {
        let value = table(
            r#"
            type = "dsp7265_actuator"
            role = "master"
            controller_id = "lockin"
            channels = [["x", "y"], ["adc1"]]

            [connection]
            adapter = "Prologix"
            address = "/dev/ttyUSB0"

            [scaling]
            enabled = true
            scaling = 2.0
            offset = 0.0

            [settings]
            sensitivity = "1.00e-06 A"
            imode = "current mode"
            multiaxes = true
            "#,
        );

        let config = Dsp7265Config::from_toml(value).unwrap();
        assert_eq!(config.role, ControllerRole::Primary);
        assert_eq!(config.connection.adapter, AdapterKind::Prologix);
        assert_eq!(config.connection.gpib_address, 12);
        assert_eq!(config.channels[0], vec![Channel::X, Channel::Y]);

        let settings = config.initial_settings().unwrap();
        assert_eq!(settings.len(), 2);
        assert_eq!(settings[0], Setting::Imode(InputMode::Current));
        assert_eq!(settings[1].kind(), SettingKind::Sensitivity);
    }

    #[test]
    fn primary_without_address_is_rejected() {
        let value = table("role = \"primary\"");
        assert!(matches!(
            Dsp7265Config::from_toml(value),
            Err(DaqError::Configuration(_))
        ));

        let value = table("role = \"slave\"");
        assert_eq!(
            Dsp7265Config::from_toml(value).unwrap().role,
            ControllerRole::Secondary
        );
    }

    #[test]
    fn load_layers_file_and_environment() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "dsp7265.toml",
                r#"
                [connection]
                adapter = "visa"
                address = "ASRL/dev/ttyS0::INSTR"
                timeout_ms = 500
                "#,
            )?;
            jail.set_env("DSP7265_CONNECTION__ADDRESS", "TCPIP0::10.0.0.5::50000::SOCKET");

            let config = Dsp7265Config::load(Some(Path::new("dsp7265.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.connection.address, "TCPIP0::10.0.0.5::50000::SOCKET");
            assert_eq!(config.connection.timeout(), Duration::from_millis(500));
            assert_eq!(config.controller_id, "dsp7265");
            Ok(())
        });
    }
}
