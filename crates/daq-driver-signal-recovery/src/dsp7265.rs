//! Signal Recovery DSP7265 Lock-in Amplifier
//!
//! Reference: Model 7265 DSP Lock-in Amplifier Instruction Manual
//!
//! Protocol Overview:
//! - Format: ASCII mnemonic, optional space-separated argument, CR terminated
//! - Floating point forms end with a dot: `OF.` reads, `OF. 1000` writes
//! - Table settings take an integer index: `TC 14`, `SEN 27`, `IMODE 0`
//! - Example: `X.` returns the in-phase output in volts (or amps)
//!
//! Sensitivity indices depend on the input mode: the same `SEN n` means
//! `SENSITIVITIES[n-1] × multiplier`, where the multiplier is 1 in voltage
//! mode, 1e-6 in current mode and 1e-8 in low noise current mode. The driver
//! tracks the last input mode it set to do this translation.

use crate::transport::Transport;
use daq_core::error::{AppResult, DaqError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, instrument};

// =============================================================================
// Tables
// =============================================================================

/// Oscillator frequency range in Hz.
pub const FREQUENCY_RANGE: (f64, f64) = (0.0, 250e3);

/// Oscillator amplitude range in volts.
pub const VOLTAGE_RANGE: (f64, f64) = (0.0, 5.0);

/// AC gain steps in dB.
pub const GAINS: [i64; 10] = [0, 10, 20, 30, 40, 50, 60, 70, 80, 90];

/// Output filter time constants in seconds, indexed by `TC n`.
pub const TIME_CONSTANTS: [f64; 30] = [
    10e-6, 20e-6, 40e-6, 80e-6, 160e-6, 320e-6, 640e-6, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3,
    200e-3, 500e-3, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1e3, 2e3, 5e3, 10e3,
    20e3, 50e3, 100e3,
];

/// Full-scale sensitivities in voltage mode, indexed by `SEN n+1`.
pub const SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, 1e-6, 2e-6, 5e-6, 10e-6, 20e-6,
    50e-6, 100e-6, 200e-6, 500e-6, 1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3,
    500e-3, 1.0,
];

/// Relative tolerance when matching a value against a table entry.
const TABLE_TOLERANCE: f64 = 1e-6;

fn table_index(table: &[f64], value: f64) -> Option<usize> {
    table
        .iter()
        .position(|&entry| (entry - value).abs() <= entry.abs() * TABLE_TOLERANCE)
}

// =============================================================================
// Labeled enumerations
// =============================================================================

/// An instrument setting with a fixed set of user-facing labels and codes.
pub trait LabeledEnum: Sized + Copy + 'static {
    /// Every variant, in instrument code order.
    const ALL: &'static [Self];

    /// User-facing label.
    fn label(&self) -> &'static str;

    /// Integer code sent to the instrument.
    fn code(&self) -> u8;

    /// Variant for a label, exact match.
    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.label() == label)
    }

    /// All labels, in code order.
    fn labels() -> Vec<String> {
        Self::ALL.iter().map(|v| v.label().to_string()).collect()
    }
}

/// Input mode: voltage or one of two current regimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputMode {
    /// Voltage input, sensitivities in V
    #[default]
    #[serde(rename = "voltage mode")]
    Voltage,
    /// Current input, high bandwidth
    #[serde(rename = "current mode")]
    Current,
    /// Current input, low noise
    #[serde(rename = "low noise current mode")]
    LowNoiseCurrent,
}

impl LabeledEnum for InputMode {
    const ALL: &'static [Self] = &[
        InputMode::Voltage,
        InputMode::Current,
        InputMode::LowNoiseCurrent,
    ];

    fn label(&self) -> &'static str {
        match self {
            InputMode::Voltage => "voltage mode",
            InputMode::Current => "current mode",
            InputMode::LowNoiseCurrent => "low noise current mode",
        }
    }

    fn code(&self) -> u8 {
        match self {
            InputMode::Voltage => 0,
            InputMode::Current => 1,
            InputMode::LowNoiseCurrent => 2,
        }
    }
}

impl InputMode {
    /// Factor applied to [`SENSITIVITIES`] in this mode.
    pub fn multiplier(&self) -> f64 {
        match self {
            InputMode::Voltage => 1.0,
            InputMode::Current => 1e-6,
            InputMode::LowNoiseCurrent => 1e-8,
        }
    }

    /// Unit of the sensitivity in this mode.
    pub fn unit(&self) -> &'static str {
        match self {
            InputMode::Voltage => "V",
            InputMode::Current | InputMode::LowNoiseCurrent => "A",
        }
    }
}

/// Reference channel source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReferenceMode {
    /// Internal oscillator
    #[default]
    #[serde(rename = "internal")]
    Internal,
    /// External reference, rear panel TTL input
    #[serde(rename = "external rear")]
    ExternalRear,
    /// External reference, front panel analog input
    #[serde(rename = "external front")]
    ExternalFront,
}

impl LabeledEnum for ReferenceMode {
    const ALL: &'static [Self] = &[
        ReferenceMode::Internal,
        ReferenceMode::ExternalRear,
        ReferenceMode::ExternalFront,
    ];

    fn label(&self) -> &'static str {
        match self {
            ReferenceMode::Internal => "internal",
            ReferenceMode::ExternalRear => "external rear",
            ReferenceMode::ExternalFront => "external front",
        }
    }

    fn code(&self) -> u8 {
        match self {
            ReferenceMode::Internal => 0,
            ReferenceMode::ExternalRear => 1,
            ReferenceMode::ExternalFront => 2,
        }
    }
}

/// Voltage mode input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputDevice {
    /// Bipolar transistor input
    #[default]
    Bipolar,
    /// FET input
    #[serde(rename = "FET")]
    Fet,
}

impl LabeledEnum for InputDevice {
    const ALL: &'static [Self] = &[InputDevice::Bipolar, InputDevice::Fet];

    fn label(&self) -> &'static str {
        match self {
            InputDevice::Bipolar => "Bipolar",
            InputDevice::Fet => "FET",
        }
    }

    fn code(&self) -> u8 {
        match self {
            InputDevice::Bipolar => 0,
            InputDevice::Fet => 1,
        }
    }
}

/// Input connector shield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Shield {
    /// Shield tied to ground
    #[default]
    Grounded,
    /// Shield floating
    Floating,
}

impl LabeledEnum for Shield {
    const ALL: &'static [Self] = &[Shield::Grounded, Shield::Floating];

    fn label(&self) -> &'static str {
        match self {
            Shield::Grounded => "Grounded",
            Shield::Floating => "Floating",
        }
    }

    fn code(&self) -> u8 {
        match self {
            Shield::Grounded => 0,
            Shield::Floating => 1,
        }
    }
}

/// Input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Coupling {
    /// AC coupled
    #[default]
    #[serde(rename = "AC")]
    Ac,
    /// DC coupled
    #[serde(rename = "DC")]
    Dc,
}

impl LabeledEnum for Coupling {
    const ALL: &'static [Self] = &[Coupling::Ac, Coupling::Dc];

    fn label(&self) -> &'static str {
        match self {
            Coupling::Ac => "AC",
            Coupling::Dc => "DC",
        }
    }

    fn code(&self) -> u8 {
        match self {
            Coupling::Ac => 0,
            Coupling::Dc => 1,
        }
    }
}

/// Readable measurement channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// In-phase output
    X,
    /// Quadrature output
    Y,
    /// Magnitude
    Mag,
    /// Phase in degrees
    Phase,
    /// Auxiliary ADC input 1
    Adc1,
    /// Auxiliary ADC input 2
    Adc2,
    /// Auxiliary ADC input 3
    Adc3,
}

impl Channel {
    /// Every channel, in display order.
    pub const ALL: [Channel; 7] = [
        Channel::X,
        Channel::Y,
        Channel::Mag,
        Channel::Phase,
        Channel::Adc1,
        Channel::Adc2,
        Channel::Adc3,
    ];

    /// Label used in data bundles.
    pub fn name(&self) -> &'static str {
        match self {
            Channel::X => "x",
            Channel::Y => "y",
            Channel::Mag => "mag",
            Channel::Phase => "phase",
            Channel::Adc1 => "adc1",
            Channel::Adc2 => "adc2",
            Channel::Adc3 => "adc3",
        }
    }

    /// Channel for a label.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Query that reads this channel.
    pub fn query_command(&self) -> &'static str {
        match self {
            Channel::X => "X.",
            Channel::Y => "Y.",
            Channel::Mag => "MAG.",
            Channel::Phase => "PHA.",
            Channel::Adc1 => "ADC. 1",
            Channel::Adc2 => "ADC. 2",
            Channel::Adc3 => "ADC. 3",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Dsp7265
// =============================================================================

/// Command layer over one DSP7265 connection.
///
/// Shared between a primary and its secondaries through
/// [`SharedController`](crate::controller::SharedController). Every method
/// after [`shutdown`](Self::shutdown) fails with `DaqError::InvalidState`.
pub struct Dsp7265 {
    transport: Box<dyn Transport>,
    imode: Mutex<InputMode>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Dsp7265 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsp7265")
            .field("transport", &self.transport.describe())
            .field("imode", &*self.imode.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Dsp7265 {
    /// Wrap an open transport. The instrument is assumed in voltage mode
    /// until [`set_imode`](Self::set_imode) is called.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            imode: Mutex::new(InputMode::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Description of the underlying connection.
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, operation: &'static str) -> AppResult<()> {
        if self.is_closed() {
            return Err(DaqError::InvalidState {
                operation,
                state: "closed".to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, command: &str) -> AppResult<()> {
        self.ensure_open("write")?;
        self.transport
            .write(command)
            .await
            .map_err(|e| command_error(command, e))
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.ensure_open("query")?;
        self.transport
            .query(command)
            .await
            .map_err(|e| command_error(command, e))
    }

    async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        parse_float(command, &reply)
    }

    /// Identification string (`ID`).
    #[instrument(skip(self), err)]
    pub async fn id(&self) -> AppResult<String> {
        self.query("ID").await
    }

    /// Oscillator frequency in Hz (`OF.`).
    pub async fn frequency(&self) -> AppResult<f64> {
        self.query_f64("OF.").await
    }

    /// Set the oscillator frequency in Hz.
    #[instrument(skip(self), err)]
    pub async fn set_frequency(&self, hz: f64) -> AppResult<()> {
        check_range("frequency", hz, FREQUENCY_RANGE)?;
        self.write(&format!("OF. {}", hz)).await
    }

    /// Oscillator amplitude in volts (`OA.`).
    pub async fn voltage(&self) -> AppResult<f64> {
        self.query_f64("OA.").await
    }

    /// Set the oscillator amplitude in volts.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        check_range("voltage", volts, VOLTAGE_RANGE)?;
        self.write(&format!("OA. {}", volts)).await
    }

    /// Input mode last set through this driver.
    pub fn imode(&self) -> InputMode {
        *self.imode.lock()
    }

    /// Select the input mode (`IMODE n`).
    #[instrument(skip(self), err)]
    pub async fn set_imode(&self, mode: InputMode) -> AppResult<()> {
        self.write(&format!("IMODE {}", mode.code())).await?;
        *self.imode.lock() = mode;
        Ok(())
    }

    /// Select the reference source (`IE n`).
    #[instrument(skip(self), err)]
    pub async fn set_reference(&self, reference: ReferenceMode) -> AppResult<()> {
        self.write(&format!("IE {}", reference.code())).await
    }

    /// Select the voltage mode input device (`FET n`).
    #[instrument(skip(self), err)]
    pub async fn set_fet(&self, device: InputDevice) -> AppResult<()> {
        self.write(&format!("FET {}", device.code())).await
    }

    /// Ground or float the input shield (`FLOAT n`).
    #[instrument(skip(self), err)]
    pub async fn set_shield(&self, shield: Shield) -> AppResult<()> {
        self.write(&format!("FLOAT {}", shield.code())).await
    }

    /// Select AC or DC coupling (`CP n`).
    #[instrument(skip(self), err)]
    pub async fn set_coupling(&self, coupling: Coupling) -> AppResult<()> {
        self.write(&format!("CP {}", coupling.code())).await
    }

    /// Set the output filter time constant in seconds (`TC n`).
    ///
    /// The value must be one of [`TIME_CONSTANTS`].
    #[instrument(skip(self), err)]
    pub async fn set_time_constant(&self, seconds: f64) -> AppResult<()> {
        let index = table_index(&TIME_CONSTANTS, seconds).ok_or_else(|| {
            DaqError::DeviceCommand(format!("{} s is not a valid time constant", seconds))
        })?;
        self.write(&format!("TC {}", index)).await
    }

    /// Set the full-scale sensitivity (`SEN n`), in V or A per the input mode.
    #[instrument(skip(self), err)]
    pub async fn set_sensitivity(&self, value: f64) -> AppResult<()> {
        let mode = self.imode();
        let index = table_index(&SENSITIVITIES, value / mode.multiplier()).ok_or_else(|| {
            DaqError::DeviceCommand(format!(
                "{} {} is not a valid sensitivity in {}",
                value,
                mode.unit(),
                mode.label()
            ))
        })?;
        self.write(&format!("SEN {}", index + 1)).await
    }

    /// Set the AC gain in dB (`ACGAIN n`), a multiple of 10 up to 90.
    #[instrument(skip(self), err)]
    pub async fn set_gain(&self, db: i64) -> AppResult<()> {
        if !GAINS.contains(&db) {
            return Err(DaqError::DeviceCommand(format!(
                "gain {} dB is not one of {:?}",
                db, GAINS
            )));
        }
        self.write(&format!("ACGAIN {}", db / 10)).await
    }

    /// Read one measurement channel.
    pub async fn read_channel(&self, channel: Channel) -> AppResult<f64> {
        self.query_f64(channel.query_command()).await
    }

    /// Close the connection. Later calls are no-ops.
    #[instrument(skip(self), err)]
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(transport = %self.transport.describe(), "Closing DSP7265 connection");
        self.transport.close().await
    }
}

fn command_error(command: &str, err: DaqError) -> DaqError {
    match err {
        DaqError::DeviceCommand(_) | DaqError::InvalidState { .. } => err,
        other => DaqError::DeviceCommand(format!("'{}' failed: {}", command, other)),
    }
}

fn check_range(what: &str, value: f64, (min, max): (f64, f64)) -> AppResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(DaqError::DeviceCommand(format!(
            "{} {} out of range [{}, {}]",
            what, value, min, max
        )));
    }
    Ok(())
}

fn parse_float(command: &str, reply: &str) -> AppResult<f64> {
    reply
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .parse::<f64>()
        .map_err(|_| {
            DaqError::DeviceCommand(format!("unparsable reply to '{}': {:?}", command, reply))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedTransport;

    fn device() -> (Dsp7265, SimulatedTransport) {
        let sim = SimulatedTransport::new();
        (Dsp7265::new(Box::new(sim.clone())), sim)
    }

    #[test]
    fn tables_have_expected_sizes() {
        assert_eq!(TIME_CONSTANTS.len(), 30);
        assert_eq!(SENSITIVITIES.len(), 27);
        assert_eq!(InputMode::labels().len(), 3);
        assert_eq!(InputMode::from_label("current mode"), Some(InputMode::Current));
        assert_eq!(Channel::from_name("adc2"), Some(Channel::Adc2));
    }

    #[tokio::test]
    async fn table_commands_use_indices() {
        let (dsp, sim) = device();
        dsp.set_time_constant(0.1).await.unwrap();
        dsp.set_gain(30).await.unwrap();
        dsp.set_coupling(Coupling::Dc).await.unwrap();
        dsp.set_sensitivity(1.0).await.unwrap();
        assert_eq!(
            sim.commands(),
            vec!["TC 11", "ACGAIN 3", "CP 1", "SEN 27"]
        );
    }

    #[tokio::test]
    async fn sensitivity_follows_input_mode() {
        let (dsp, sim) = device();
        dsp.set_imode(InputMode::Current).await.unwrap();
        dsp.set_sensitivity(2e-15).await.unwrap();
        assert_eq!(sim.value("SEN"), Some("1".into()));

        let err = dsp.set_sensitivity(1.0).await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceCommand(_)));
    }

    #[tokio::test]
    async fn out_of_range_is_device_command_error() {
        let (dsp, sim) = device();
        assert!(matches!(
            dsp.set_frequency(300e3).await,
            Err(DaqError::DeviceCommand(_))
        ));
        assert!(matches!(
            dsp.set_voltage(-0.1).await,
            Err(DaqError::DeviceCommand(_))
        ));
        assert!(dsp.set_gain(15).await.is_err());
        assert!(dsp.set_time_constant(0.3).await.is_err());
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn unparsable_reply_is_device_command_error() {
        let (dsp, sim) = device();
        sim.set_value("MAG.", "?");
        assert!(matches!(
            dsp.read_channel(Channel::Mag).await,
            Err(DaqError::DeviceCommand(_))
        ));
        sim.set_value("ADC. 3", "1.5E-01\0");
        assert_eq!(dsp.read_channel(Channel::Adc3).await.unwrap(), 0.15);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (dsp, sim) = device();
        dsp.shutdown().await.unwrap();
        dsp.shutdown().await.unwrap();
        assert_eq!(sim.close_calls(), 1);
        assert!(matches!(
            dsp.frequency().await,
            Err(DaqError::InvalidState { .. })
        ));
    }
}
