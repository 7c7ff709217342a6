//! Typed settings and their translation to instrument commands.
//!
//! Host-facing settings arrive as a name plus a JSON value (a label for
//! list settings, a number for `voltage` and `gain`). [`Setting::parse`]
//! turns them into a closed set of typed commands; [`Setting::apply`]
//! sends the matching instrument command.
//!
//! Labels for numeric tables follow the `"%.2e <unit>"` convention used in
//! the host's list widgets: `"1.00e-01 s"`, `"2.00e-15 A"`.

use crate::dsp7265::{
    Coupling, Dsp7265, InputDevice, InputMode, LabeledEnum, ReferenceMode, Shield,
    SENSITIVITIES, TIME_CONSTANTS,
};
use daq_core::error::{AppResult, DaqError};
use serde_json::Value;

// =============================================================================
// Labels
// =============================================================================

/// Format `value` as `d.dde±XX <unit>`.
pub fn format_label(value: f64, unit: &str) -> String {
    let formatted = format!("{:.2e}", value);
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    if unit.is_empty() {
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        format!("{}e{}{:02} {}", mantissa, sign, exponent.abs(), unit)
    }
}

/// Labels for every time constant, in table order.
pub fn time_constant_labels() -> Vec<String> {
    TIME_CONSTANTS.iter().map(|tc| format_label(*tc, "s")).collect()
}

/// `(label, value)` pairs for the sensitivities available in `mode`.
pub fn sensitivity_table(mode: InputMode) -> Vec<(String, f64)> {
    SENSITIVITIES
        .iter()
        .map(|s| {
            let value = s * mode.multiplier();
            (format_label(value, mode.unit()), value)
        })
        .collect()
}

/// Sensitivity labels for `mode`, in table order.
pub fn sensitivity_labels(mode: InputMode) -> Vec<String> {
    sensitivity_table(mode).into_iter().map(|(l, _)| l).collect()
}

/// Gain choices in dB.
pub fn gain_steps() -> Vec<i64> {
    crate::dsp7265::GAINS.to_vec()
}

// =============================================================================
// SettingKind
// =============================================================================

/// Every setting this plugin understands, in the order they are applied
/// when a whole configuration is pushed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKind {
    /// Input mode
    Imode,
    /// Reference source
    Reference,
    /// Voltage mode input device
    Fet,
    /// Input connector shield
    Shield,
    /// Input coupling
    Coupling,
    /// Filter time constant
    TimeConstant,
    /// Full-scale sensitivity
    Sensitivity,
    /// Oscillator amplitude
    Voltage,
    /// AC gain
    Gain,
}

impl SettingKind {
    /// Canonical application order.
    pub const ALL: [SettingKind; 9] = [
        SettingKind::Imode,
        SettingKind::Reference,
        SettingKind::Fet,
        SettingKind::Shield,
        SettingKind::Coupling,
        SettingKind::TimeConstant,
        SettingKind::Sensitivity,
        SettingKind::Voltage,
        SettingKind::Gain,
    ];

    /// Configuration key.
    pub fn key(&self) -> &'static str {
        match self {
            SettingKind::Imode => "imode",
            SettingKind::Reference => "reference",
            SettingKind::Fet => "fet",
            SettingKind::Shield => "shield",
            SettingKind::Coupling => "coupling",
            SettingKind::TimeConstant => "time_constant",
            SettingKind::Sensitivity => "sensitivity",
            SettingKind::Voltage => "voltage",
            SettingKind::Gain => "gain",
        }
    }

    /// Kind for a configuration key.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.key() == key)
    }
}

// =============================================================================
// Setting
// =============================================================================

/// A validated setting change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Setting {
    /// `IMODE n`
    Imode(InputMode),
    /// `IE n`
    Reference(ReferenceMode),
    /// `FET n`
    Fet(InputDevice),
    /// `FLOAT n`
    Shield(Shield),
    /// `CP n`
    Coupling(Coupling),
    /// `TC n`, seconds
    TimeConstant(f64),
    /// `SEN n`, V or A
    Sensitivity(f64),
    /// `OA. x`, volts
    Voltage(f64),
    /// `ACGAIN n`, dB
    Gain(i64),
}

impl Setting {
    /// Parse a named setting.
    ///
    /// Returns `Ok(None)` for names this plugin does not handle, and
    /// `DaqError::Configuration` for a known name with an unusable value.
    pub fn parse(name: &str, value: &Value) -> AppResult<Option<Setting>> {
        let Some(kind) = SettingKind::from_key(name) else {
            return Ok(None);
        };

        let setting = match kind {
            SettingKind::Imode => Setting::Imode(parse_labeled(kind, value)?),
            SettingKind::Reference => Setting::Reference(parse_labeled(kind, value)?),
            SettingKind::Fet => Setting::Fet(parse_labeled(kind, value)?),
            SettingKind::Shield => Setting::Shield(parse_labeled(kind, value)?),
            SettingKind::Coupling => Setting::Coupling(parse_labeled(kind, value)?),
            SettingKind::TimeConstant => {
                Setting::TimeConstant(parse_table_value(kind, value, |label| {
                    TIME_CONSTANTS
                        .iter()
                        .copied()
                        .find(|tc| format_label(*tc, "s") == label)
                })?)
            }
            SettingKind::Sensitivity => {
                Setting::Sensitivity(parse_table_value(kind, value, sensitivity_from_label)?)
            }
            SettingKind::Voltage => Setting::Voltage(
                value
                    .as_f64()
                    .ok_or_else(|| invalid(kind, value, "expected a number"))?,
            ),
            SettingKind::Gain => Setting::Gain(parse_gain(value)?),
        };
        Ok(Some(setting))
    }

    /// The kind of this setting.
    pub fn kind(&self) -> SettingKind {
        match self {
            Setting::Imode(_) => SettingKind::Imode,
            Setting::Reference(_) => SettingKind::Reference,
            Setting::Fet(_) => SettingKind::Fet,
            Setting::Shield(_) => SettingKind::Shield,
            Setting::Coupling(_) => SettingKind::Coupling,
            Setting::TimeConstant(_) => SettingKind::TimeConstant,
            Setting::Sensitivity(_) => SettingKind::Sensitivity,
            Setting::Voltage(_) => SettingKind::Voltage,
            Setting::Gain(_) => SettingKind::Gain,
        }
    }

    /// The value as the host displays it.
    pub fn display_value(&self, imode: InputMode) -> Value {
        match self {
            Setting::Imode(v) => Value::from(v.label()),
            Setting::Reference(v) => Value::from(v.label()),
            Setting::Fet(v) => Value::from(v.label()),
            Setting::Shield(v) => Value::from(v.label()),
            Setting::Coupling(v) => Value::from(v.label()),
            Setting::TimeConstant(v) => Value::from(format_label(*v, "s")),
            Setting::Sensitivity(v) => Value::from(format_label(*v, imode.unit())),
            Setting::Voltage(v) => Value::from(*v),
            Setting::Gain(v) => Value::from(*v),
        }
    }

    /// Send the matching command to the instrument.
    pub async fn apply(&self, device: &Dsp7265) -> AppResult<()> {
        match *self {
            Setting::Imode(mode) => device.set_imode(mode).await,
            Setting::Reference(reference) => device.set_reference(reference).await,
            Setting::Fet(fet) => device.set_fet(fet).await,
            Setting::Shield(shield) => device.set_shield(shield).await,
            Setting::Coupling(coupling) => device.set_coupling(coupling).await,
            Setting::TimeConstant(seconds) => device.set_time_constant(seconds).await,
            Setting::Sensitivity(value) => device.set_sensitivity(value).await,
            Setting::Voltage(volts) => device.set_voltage(volts).await,
            Setting::Gain(db) => device.set_gain(db).await,
        }
    }
}

fn invalid(kind: SettingKind, value: &Value, reason: &str) -> DaqError {
    DaqError::Configuration(format!(
        "invalid value {} for setting '{}': {}",
        value,
        kind.key(),
        reason
    ))
}

fn parse_labeled<E: LabeledEnum>(kind: SettingKind, value: &Value) -> AppResult<E> {
    let label = value
        .as_str()
        .ok_or_else(|| invalid(kind, value, "expected a label"))?;
    E::from_label(label).ok_or_else(|| {
        invalid(
            kind,
            value,
            &format!("expected one of {:?}", E::labels()),
        )
    })
}

/// Labels resolve through `lookup`; bare numbers are taken as is.
fn parse_table_value(
    kind: SettingKind,
    value: &Value,
    lookup: impl Fn(&str) -> Option<f64>,
) -> AppResult<f64> {
    if let Some(number) = value.as_f64() {
        return Ok(number);
    }
    let label = value
        .as_str()
        .ok_or_else(|| invalid(kind, value, "expected a label or a number"))?;
    lookup(label).ok_or_else(|| invalid(kind, value, "unknown label"))
}

/// Sensitivity labels from any input mode; the unit picks the mode family.
fn sensitivity_from_label(label: &str) -> Option<f64> {
    InputMode::ALL.iter().find_map(|mode| {
        sensitivity_table(*mode)
            .into_iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    })
}

fn parse_gain(value: &Value) -> AppResult<i64> {
    let gain = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    gain.ok_or_else(|| invalid(SettingKind::Gain, value, "expected an integer in dB"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedTransport;
    use serde_json::json;

    #[test]
    fn labels_match_two_digit_exponent_format() {
        assert_eq!(format_label(2e-9, "V"), "2.00e-09 V");
        assert_eq!(format_label(1.0, "V"), "1.00e+00 V");
        assert_eq!(format_label(100e3, "s"), "1.00e+05 s");
        assert_eq!(format_label(2e-15, "A"), "2.00e-15 A");
        assert_eq!(format_label(5e-3, ""), "5.00e-03");
    }

    #[test]
    fn sensitivity_labels_cover_every_mode() {
        for mode in InputMode::ALL {
            let labels = sensitivity_labels(*mode);
            assert_eq!(labels.len(), SENSITIVITIES.len());
            assert!(labels.iter().all(|l| l.ends_with(mode.unit())));
        }
        assert_eq!(sensitivity_labels(InputMode::LowNoiseCurrent)[26], "1.00e-08 A");
        assert_eq!(time_constant_labels().len(), 30);
    }

    #[test]
    fn parse_translates_labels() {
        assert_eq!(
            Setting::parse("fet", &json!("FET")).unwrap(),
            Some(Setting::Fet(InputDevice::Fet))
        );
        assert_eq!(
            Setting::parse("shield", &json!("Floating")).unwrap(),
            Some(Setting::Shield(Shield::Floating))
        );
        assert_eq!(
            Setting::parse("time_constant", &json!("1.00e-01 s")).unwrap(),
            Some(Setting::TimeConstant(0.1))
        );
        assert_eq!(
            Setting::parse("gain", &json!("40")).unwrap(),
            Some(Setting::Gain(40))
        );
        assert!(matches!(
            Setting::parse("sensitivity", &json!("1.00e-06 A")).unwrap(),
            Some(Setting::Sensitivity(v)) if (v - 1e-6).abs() < 1e-18
        ));
    }

    #[test]
    fn unknown_name_is_ignored_and_bad_value_is_configuration_error() {
        assert_eq!(Setting::parse("multiaxes", &json!(true)).unwrap(), None);
        assert!(matches!(
            Setting::parse("coupling", &json!("XY")),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            Setting::parse("voltage", &json!("loud")),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn kinds_sort_in_application_order() {
        let mut kinds = vec![SettingKind::Sensitivity, SettingKind::Gain, SettingKind::Imode];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![SettingKind::Imode, SettingKind::Sensitivity, SettingKind::Gain]
        );
        assert_eq!(SettingKind::from_key("time_constant"), Some(SettingKind::TimeConstant));
    }

    #[tokio::test]
    async fn apply_sends_translated_commands() {
        let sim = SimulatedTransport::new();
        let dsp = Dsp7265::new(Box::new(sim.clone()));

        for (name, value) in [
            ("imode", json!("low noise current mode")),
            ("reference", json!("external front")),
            ("sensitivity", json!("1.00e-08 A")),
            ("voltage", json!(0.5)),
        ] {
            let setting = Setting::parse(name, &value).unwrap().unwrap();
            setting.apply(&dsp).await.unwrap();
        }

        assert_eq!(
            sim.commands(),
            vec!["IMODE 2", "IE 2", "SEN 27", "OA. 0.5"]
        );
    }
}
