//! DSP7265 oscillator as a one-axis actuator.
//!
//! The axis `OSC` moves the internal oscillator frequency in Hz. Positions go
//! through [`SoftLimits`] and the [`ScalingPipeline`] before reaching the
//! instrument; the last commanded target and the last confirmed position are
//! kept together in host units.
//!
//! The actuator also carries the lock-in's input configuration (input mode,
//! reference, sensitivity, ...) as a [`ParameterSet`]. Changing the input mode
//! swaps the sensitivity choices between the V and A tables, whichever path
//! the change takes (`apply_setting`, a typed `Parameter::set` or the host's
//! `set_json`).
//!
//! # Example Configuration
//!
//! ```toml
//! [[devices]]
//! id = "lockin_osc"
//! type = "dsp7265_actuator"
//! role = "primary"
//! controller_id = "lockin"
//!
//! [devices.connection]
//! adapter = "visa"
//! address = "ASRL/dev/ttyUSB0::INSTR"
//! ```

use crate::config::Dsp7265Config;
use crate::controller::{
    connect_controller, lookup_controller, ControllerRole, DeviceSession, DriverState, InitStatus,
    Initialized, SharedController,
};
use crate::dsp7265::{
    Coupling, InputDevice, InputMode, LabeledEnum, ReferenceMode, Shield, VOLTAGE_RANGE,
};
use crate::settings::{
    gain_steps, sensitivity_labels, time_constant_labels, Setting, SettingKind,
};
use crate::transport::{Connector, SystemConnector};
use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{DeviceCategory, Movable, Parameterized};
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{AppResult, DaqError};
use daq_core::observable::ParameterSet;
use daq_core::parameter::Parameter;
use daq_core::scaling::{ScalingPipeline, SoftLimits, DEFAULT_EPSILON};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Driver type of the actuator in host configuration.
pub const ACTUATOR_TYPE: &str = "dsp7265_actuator";

/// Name of the single axis.
pub const AXIS: &str = "OSC";

/// Units of the axis.
pub const UNITS: &str = "Hz";

/// Home position in Hz.
pub const HOME_FREQUENCY: f64 = 1000.0;

/// Default oscillator amplitude in volts.
pub const DEFAULT_VOLTAGE: f64 = 1e-6;

const SETTLE_POLL: Duration = Duration::from_millis(50);
const SETTLE_ATTEMPTS: u32 = 20;

// =============================================================================
// Dsp7265ActuatorFactory
// =============================================================================

/// Factory for the oscillator actuator.
///
/// Primaries publish their controller under `controller_id`; secondaries
/// built later with the same id share it.
pub struct Dsp7265ActuatorFactory;

static ACTUATOR_CAPABILITIES: &[Capability] = &[Capability::Movable, Capability::Parameterized];

impl DriverFactory for Dsp7265ActuatorFactory {
    fn driver_type(&self) -> &'static str {
        ACTUATOR_TYPE
    }

    fn name(&self) -> &'static str {
        "Signal Recovery DSP7265 Oscillator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ACTUATOR_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        Dsp7265Config::from_toml(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg = Dsp7265Config::from_toml(config).context("Invalid DSP7265 actuator config")?;
            let controller_id = cfg.controller_id.clone();
            let shared = match cfg.role {
                ControllerRole::Primary => None,
                ControllerRole::Secondary => lookup_controller(&controller_id),
            };

            let actuator = Arc::new(Dsp7265Actuator::new(cfg, Arc::new(SystemConnector)));
            actuator
                .initialize(shared)
                .await
                .with_context(|| format!("DSP7265 actuator '{}' failed to initialize", controller_id))?;
            if actuator.role() == ControllerRole::Primary {
                actuator.publish(&controller_id)?;
            }

            let bounds = actuator.bounds();
            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Actuator)
                .with_movable(actuator.clone())
                .with_parameterized(actuator)
                .with_metadata(DeviceMetadata {
                    axes: vec![AXIS.to_string()],
                    position_units: Some(UNITS.to_string()),
                    min_position: bounds.enabled.then_some(bounds.min),
                    max_position: bounds.enabled.then_some(bounds.max),
                    ..Default::default()
                }))
        })
    }
}

// =============================================================================
// Dsp7265Actuator
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct Positions {
    target: f64,
    current: f64,
}

/// Configuration tree of the actuator, kept typed for dispatch.
#[derive(Debug)]
struct ActuatorParams {
    info: Parameter<String>,
    imode: Parameter<String>,
    reference: Parameter<String>,
    fet: Parameter<String>,
    shield: Parameter<String>,
    coupling: Parameter<String>,
    time_constant: Parameter<String>,
    sensitivity: Parameter<String>,
    voltage: Parameter<f64>,
    gain: Parameter<i64>,
}

impl ActuatorParams {
    fn build(session: &Arc<DeviceSession>) -> (Self, ParameterSet) {
        let info = Parameter::new("info", String::new())
            .with_title("Info")
            .with_description("Identification reported by the instrument")
            .read_only();

        let mut imode = labeled("imode", "Input mode", InputMode::labels());
        let mut reference = labeled("reference", "Reference", ReferenceMode::labels());
        let mut fet = labeled("fet", "Voltage mode input device", InputDevice::labels());
        let mut shield = labeled("shield", "Input connector shield", Shield::labels());
        let mut coupling = labeled("coupling", "Coupling", Coupling::labels());
        let mut time_constant =
            labeled("time_constant", "Filter time constant", time_constant_labels());
        let mut sensitivity = labeled(
            "sensitivity",
            "Full-scale sensitivity",
            sensitivity_labels(InputMode::default()),
        );
        let mut voltage = Parameter::new("voltage", DEFAULT_VOLTAGE)
            .with_title("Voltage (V)")
            .with_unit("V")
            .with_range_introspectable(VOLTAGE_RANGE.0, VOLTAGE_RANGE.1);
        let mut gain = Parameter::new("gain", 0_i64)
            .with_title("Gain (dB)")
            .with_unit("dB")
            .with_steps(gain_steps());

        attach_setting_writer(&mut imode, SettingKind::Imode, session);
        attach_setting_writer(&mut reference, SettingKind::Reference, session);
        attach_setting_writer(&mut fet, SettingKind::Fet, session);
        attach_setting_writer(&mut shield, SettingKind::Shield, session);
        attach_setting_writer(&mut coupling, SettingKind::Coupling, session);
        attach_setting_writer(&mut time_constant, SettingKind::TimeConstant, session);
        attach_setting_writer(&mut sensitivity, SettingKind::Sensitivity, session);
        attach_setting_writer(&mut voltage, SettingKind::Voltage, session);
        attach_setting_writer(&mut gain, SettingKind::Gain, session);

        let dependent = sensitivity.clone();
        imode.add_change_listener(move |label: &String| {
            if let Some(mode) = InputMode::from_label(label) {
                follow_input_mode(&dependent, mode);
            }
        });

        let params = Self {
            info,
            imode,
            reference,
            fet,
            shield,
            coupling,
            time_constant,
            sensitivity,
            voltage,
            gain,
        };

        let mut set = ParameterSet::new();
        set.register(params.info.clone());
        for param in params.labeled_all() {
            set.register(param.clone());
        }
        set.register(params.voltage.clone());
        set.register(params.gain.clone());
        (params, set)
    }

    fn labeled_all(&self) -> [&Parameter<String>; 7] {
        [
            &self.imode,
            &self.reference,
            &self.fet,
            &self.shield,
            &self.coupling,
            &self.time_constant,
            &self.sensitivity,
        ]
    }

    fn labeled(&self, kind: SettingKind) -> Option<&Parameter<String>> {
        match kind {
            SettingKind::Imode => Some(&self.imode),
            SettingKind::Reference => Some(&self.reference),
            SettingKind::Fet => Some(&self.fet),
            SettingKind::Shield => Some(&self.shield),
            SettingKind::Coupling => Some(&self.coupling),
            SettingKind::TimeConstant => Some(&self.time_constant),
            SettingKind::Sensitivity => Some(&self.sensitivity),
            SettingKind::Voltage | SettingKind::Gain => None,
        }
    }
}

fn labeled(name: &str, title: &str, choices: Vec<String>) -> Parameter<String> {
    let initial = choices.first().cloned().unwrap_or_default();
    Parameter::new(name, initial)
        .with_title(title)
        .with_choices_introspectable(choices)
}

/// Swap the sensitivity limits to the table of `mode`.
///
/// The selected label is left alone, even when it is not in the new table.
fn follow_input_mode(sensitivity: &Parameter<String>, mode: InputMode) {
    sensitivity.update_choices(sensitivity_labels(mode));
    debug!(imode = mode.label(), unit = mode.unit(), "Sensitivity choices updated");
}

/// Route a parameter's writes to the instrument as a typed [`Setting`].
fn attach_setting_writer<T>(param: &mut Parameter<T>, kind: SettingKind, session: &Arc<DeviceSession>)
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + 'static,
{
    let session = session.clone();
    param.connect_to_hardware_write(move |value: T| {
        let session = session.clone();
        Box::pin(async move {
            let json = serde_json::to_value(&value)
                .map_err(|e| DaqError::Configuration(format!("{}: {}", kind.key(), e)))?;
            let setting = Setting::parse(kind.key(), &json)?.ok_or_else(|| {
                DaqError::Configuration(format!("'{}' is not a setting", kind.key()))
            })?;
            let controller = session.controller("apply a setting")?;
            setting.apply(&controller).await
        })
    });
}

/// Turn a parameter failure back into the typed error it carries.
fn into_daq_error(err: anyhow::Error) -> DaqError {
    let message = format!("{:#}", err);
    match err.downcast::<DaqError>() {
        Ok(DaqError::ParameterReadOnly | DaqError::ParameterInvalidChoice) => {
            DaqError::Configuration(message)
        }
        Ok(daq) => daq,
        Err(other) => DaqError::Configuration(other.to_string()),
    }
}

/// Oscillator frequency actuator over a (possibly shared) DSP7265.
///
/// # Lifecycle
///
/// ```text
/// new() ─► initialize() ─► move_* / apply_setting ─► close()
/// ```
///
/// Every operation other than `initialize`, `status` and `close` fails with
/// `DaqError::InvalidState` unless the actuator is `Ready`.
pub struct Dsp7265Actuator {
    config: Dsp7265Config,
    connector: Arc<dyn Connector>,
    session: Arc<DeviceSession>,
    positions: Mutex<Positions>,
    epsilon: f64,
    params: ActuatorParams,
    parameters: ParameterSet,
}

impl Debug for Dsp7265Actuator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsp7265Actuator")
            .field("role", &self.session.role())
            .field("state", &self.session.state())
            .field("positions", &*self.positions.lock())
            .finish_non_exhaustive()
    }
}

impl Dsp7265Actuator {
    /// Build an uninitialized actuator.
    pub fn new(config: Dsp7265Config, connector: Arc<dyn Connector>) -> Self {
        let session = Arc::new(DeviceSession::new(ACTUATOR_TYPE, config.role));
        let (params, parameters) = ActuatorParams::build(&session);
        Self {
            config,
            connector,
            session,
            positions: Mutex::new(Positions::default()),
            epsilon: DEFAULT_EPSILON,
            params,
            parameters,
        }
    }

    /// Role from the configuration.
    pub fn role(&self) -> ControllerRole {
        self.session.role()
    }

    /// Lifecycle state.
    pub fn state(&self) -> DriverState {
        self.session.state()
    }

    /// `{info, initialized}` of the last initialization.
    pub fn status(&self) -> InitStatus {
        self.session.status()
    }

    /// Move-done tolerance in Hz.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Soft bounds applied to every target.
    pub fn bounds(&self) -> SoftLimits {
        self.config.bounds
    }

    /// Host/device transform.
    pub fn scaling(&self) -> ScalingPipeline {
        self.config.scaling
    }

    /// Last commanded position, host units.
    pub fn target(&self) -> f64 {
        self.positions.lock().target
    }

    /// Last confirmed position, host units.
    pub fn current(&self) -> f64 {
        self.positions.lock().current
    }

    /// Connect, identify, then push the configured initial settings.
    ///
    /// A secondary needs `shared`; a primary opens its own connection and
    /// ignores it. An invalid configuration fails before anything is opened.
    /// The failure is recorded in [`status`](Self::status) and also returned.
    #[instrument(skip(self, shared), fields(role = ?self.role()), err)]
    pub async fn initialize(&self, shared: Option<SharedController>) -> AppResult<Initialized> {
        self.session.begin()?;
        if let Err(e) = self.config.validate() {
            return Err(self.session.fail(e).await);
        }
        let init = match connect_controller(
            self.role(),
            &self.config.connection,
            shared,
            self.connector.as_ref(),
        )
        .await
        {
            Ok(init) => init,
            Err(e) => return Err(self.session.fail(e).await),
        };

        self.session.ready(&init);
        self.params.info.inner().set_unchecked(init.info.clone());
        self.sync_input_mode(init.controller.imode());
        if let Err(e) = self.configure().await {
            return Err(self.session.fail(e).await);
        }
        Ok(init)
    }

    /// Mirror the controller's input mode, which a primary may already have
    /// changed before this device attached.
    fn sync_input_mode(&self, mode: InputMode) {
        self.params.imode.inner().set_unchecked(mode.label().to_string());
        follow_input_mode(&self.params.sensitivity, mode);
    }

    /// Publish this primary's controller under `id` for secondaries.
    ///
    /// The entry is withdrawn when this actuator closes.
    pub fn publish(&self, id: &str) -> AppResult<()> {
        self.session.publish(id)
    }

    async fn configure(&self) -> AppResult<()> {
        for setting in self.config.initial_settings()? {
            self.commit(setting).await?;
        }
        let position = self.read_position().await?;
        *self.positions.lock() = Positions {
            target: position,
            current: position,
        };
        info!(position, units = UNITS, "DSP7265 oscillator ready");
        Ok(())
    }

    /// Apply one named setting to the instrument and the configuration tree.
    ///
    /// Unknown names are ignored. Changing `imode` replaces the sensitivity
    /// choices but leaves the selected sensitivity label as it was.
    #[instrument(skip(self, value), fields(value = %value), err)]
    pub async fn apply_setting(&self, name: &str, value: &serde_json::Value) -> AppResult<()> {
        let Some(setting) = Setting::parse(name, value)? else {
            debug!(setting = name, "Ignoring unknown setting");
            return Ok(());
        };
        self.session.controller("apply a setting")?;
        self.commit(setting).await
    }

    async fn commit(&self, setting: Setting) -> AppResult<()> {
        let result = match setting {
            Setting::Voltage(volts) => self.params.voltage.set(volts).await,
            Setting::Gain(db) => self.params.gain.set(db).await,
            other => {
                let imode = self.session.controller("apply a setting")?.imode();
                let label = match other.display_value(imode) {
                    serde_json::Value::String(label) => label,
                    value => value.to_string(),
                };
                match self.params.labeled(other.kind()) {
                    Some(param) => param.set(label).await,
                    None => Ok(()),
                }
            }
        };
        result.map_err(into_daq_error)
    }

    /// Frequency read back from the instrument, host units.
    pub async fn read_position(&self) -> AppResult<f64> {
        let controller = self.session.controller("read position")?;
        let device = controller.frequency().await?;
        Ok(self.config.scaling.to_host(device))
    }

    /// Clamp, scale, write, then record the new target/current pair.
    ///
    /// A failed write leaves the pair unchanged.
    #[instrument(skip(self), err)]
    pub async fn move_absolute(&self, target: f64) -> AppResult<()> {
        let controller = self.session.controller("move")?;
        let target = self.config.bounds.clamp(target);
        controller
            .set_frequency(self.config.scaling.to_device(target))
            .await?;
        *self.positions.lock() = Positions {
            target,
            current: target,
        };
        Ok(())
    }

    /// Move by `delta` from the current position, clamped to the bounds.
    #[instrument(skip(self), err)]
    pub async fn move_relative(&self, delta: f64) -> AppResult<()> {
        self.session.controller("move")?;
        let current = self.current();
        let target = self.config.bounds.clamp(current + delta);
        self.move_absolute(target).await
    }

    /// Set the oscillator to the home frequency of 1 kHz.
    pub async fn move_home(&self) -> AppResult<()> {
        self.move_absolute(HOME_FREQUENCY).await
    }

    /// Close the actuator. A primary shuts the connection down, a secondary
    /// only lets go of it. Closing again is a no-op.
    #[instrument(skip(self), err)]
    pub async fn close(&self) -> AppResult<()> {
        self.session.close().await
    }
}

#[async_trait]
impl Movable for Dsp7265Actuator {
    async fn move_abs(&self, position: f64) -> Result<()> {
        Ok(self.move_absolute(position).await?)
    }

    async fn move_rel(&self, distance: f64) -> Result<()> {
        Ok(self.move_relative(distance).await?)
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.read_position().await?)
    }

    async fn wait_settled(&self) -> Result<()> {
        let target = self.target();
        for _ in 0..SETTLE_ATTEMPTS {
            let position = self.read_position().await?;
            if (position - target).abs() <= self.epsilon {
                return Ok(());
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        Err(DaqError::DeviceCommand(format!(
            "oscillator did not reach {} {} within {} {}",
            target, UNITS, self.epsilon, UNITS
        ))
        .into())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

impl Parameterized for Dsp7265Actuator {
    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::simulated::{SimulatedConnector, SimulatedTransport, SIMULATED_ID};
    use serde_json::json;

    fn config() -> Dsp7265Config {
        Dsp7265Config {
            connection: ConnectionSettings::simulated(),
            ..Default::default()
        }
    }

    async fn ready(config: Dsp7265Config) -> (Dsp7265Actuator, SimulatedTransport) {
        let connector = SimulatedConnector::default();
        let sim = connector.instrument().clone();
        let actuator = Dsp7265Actuator::new(config, Arc::new(connector));
        actuator.initialize(None).await.unwrap();
        (actuator, sim)
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = Dsp7265ActuatorFactory;
        assert_eq!(factory.driver_type(), "dsp7265_actuator");
        assert!(factory.capabilities().contains(&Capability::Movable));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = Dsp7265ActuatorFactory;
        let valid = toml::Value::Table(toml::toml! {
            role = "slave"
            controller_id = "lockin"
        });
        assert!(factory.validate(&valid).is_ok());

        let invalid = toml::Value::Table(toml::toml! {
            role = "master"
            [connection]
            adapter = "visa"
        });
        assert!(factory.validate(&invalid).is_err());
    }

    #[tokio::test]
    async fn parameters_follow_declaration_order() {
        let actuator = Dsp7265Actuator::new(config(), Arc::new(SimulatedConnector::default()));
        assert_eq!(
            actuator.parameters().names(),
            vec![
                "info",
                "imode",
                "reference",
                "fet",
                "shield",
                "coupling",
                "time_constant",
                "sensitivity",
                "voltage",
                "gain"
            ]
        );
        let voltage = actuator.parameters().get("voltage").unwrap().metadata();
        assert_eq!(voltage.max_value, Some(5.0));
        assert_eq!(actuator.params.voltage.get(), 1e-6);
    }

    #[tokio::test]
    async fn initialize_populates_info_and_position() {
        let (actuator, _sim) = ready(config()).await;
        assert_eq!(actuator.state(), DriverState::Ready);
        assert_eq!(actuator.params.info.get(), SIMULATED_ID);
        assert_eq!(actuator.status().info, SIMULATED_ID);
        assert_eq!(actuator.current(), 1000.0);
    }

    #[tokio::test]
    async fn operations_before_initialize_are_invalid_state() {
        let actuator = Dsp7265Actuator::new(config(), Arc::new(SimulatedConnector::default()));
        assert!(matches!(
            actuator.move_absolute(10.0).await,
            Err(DaqError::InvalidState { .. })
        ));
        assert!(matches!(
            actuator.apply_setting("gain", &json!(10)).await,
            Err(DaqError::InvalidState { .. })
        ));
        actuator.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_leaves_positions_stale() {
        let (actuator, sim) = ready(config()).await;
        actuator.move_absolute(2000.0).await.unwrap();
        sim.fail_on("OF. ");
        assert!(matches!(
            actuator.move_absolute(3000.0).await,
            Err(DaqError::DeviceCommand(_))
        ));
        assert_eq!(actuator.target(), 2000.0);
        assert_eq!(actuator.current(), 2000.0);
    }

    #[tokio::test]
    async fn apply_setting_updates_tree_and_instrument() {
        let (actuator, sim) = ready(config()).await;
        actuator
            .apply_setting("coupling", &json!("DC"))
            .await
            .unwrap();
        actuator.apply_setting("gain", &json!(40)).await.unwrap();
        actuator.apply_setting("multiaxes", &json!(true)).await.unwrap();

        assert_eq!(actuator.params.coupling.get(), "DC");
        assert_eq!(actuator.params.gain.get(), 40);
        assert_eq!(sim.value("CP"), Some("1".into()));
        assert_eq!(sim.value("ACGAIN"), Some("4".into()));
    }

    #[tokio::test]
    async fn rejected_choice_is_configuration_error_and_sends_nothing() {
        let (actuator, sim) = ready(config()).await;
        let sent = sim.commands().len();
        assert!(matches!(
            actuator.apply_setting("time_constant", &json!(0.3)).await,
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            actuator.apply_setting("voltage", &json!(7.5)).await,
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(sim.commands().len(), sent);
    }

    #[tokio::test]
    async fn bad_initial_setting_fails_initialization() {
        let mut cfg = config();
        cfg.settings.insert("shield".into(), json!("Open"));
        let connector = SimulatedConnector::default();
        let sim = connector.instrument().clone();
        let actuator = Dsp7265Actuator::new(cfg, Arc::new(connector));

        let err = actuator.initialize(None).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(actuator.state(), DriverState::Failed);
        assert!(!actuator.status().initialized);
        assert!(sim.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_settled_reports_unreached_target() {
        let (actuator, sim) = ready(config()).await;
        actuator.move_absolute(1500.0).await.unwrap();
        actuator.wait_settled().await.unwrap();

        sim.set_value("OF.", "1400.0");
        assert!(actuator.wait_settled().await.is_err());
        assert!(actuator.stop().await.is_ok());
    }
}
