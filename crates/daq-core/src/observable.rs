//! Observable Parameters
//!
//! Reactive values built on `tokio::sync::watch` for multi-subscriber
//! notifications. These form the configuration tree a plugin exposes to
//! the host: every setting is an `Observable` (wrapped by
//! [`Parameter`](crate::parameter::Parameter) when it drives hardware).
//!
//! # Constraint Types
//!
//! - `with_range_introspectable()` - numeric bounds, exported as `min_value`/`max_value`
//! - `with_choices_introspectable()` - enumerated labels, exported as `enum_values`
//! - `update_choices()` - replace the allowed labels at runtime
//!
//! ```rust,ignore
//! let sensitivity = Observable::new("sensitivity", "1.00e+00 V".to_string())
//!     .with_choices_introspectable(sensitivity_labels(InputMode::Voltage));
//!
//! // Input mode switched to current: the limits follow, the value does not.
//! sensitivity.update_choices(sensitivity_labels(InputMode::Current));
//! ```

use crate::error::DaqError;
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

/// Validator callback type.
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// Shared state for Observable that propagates to all clones.
///
/// Uses `parking_lot::RwLock` so metadata can be read without an async context.
struct ObservableSharedState<T> {
    metadata: ObservableMetadata,
    validator: Option<Validator<T>>,
}

// =============================================================================
// ParameterBase Trait - Generic Parameter Access
// =============================================================================

/// Type-erased access to a parameter, used by hosts that only know names.
pub trait ParameterBase: Send + Sync {
    /// Get the parameter name
    fn name(&self) -> String;

    /// Get the current value as JSON
    fn get_json(&self) -> Result<serde_json::Value>;

    /// Set the value from JSON. Validated; parameters with a hardware writer
    /// also write the instrument.
    fn set_json(&self, value: serde_json::Value) -> Result<()>;

    /// Get the metadata snapshot
    fn metadata(&self) -> ObservableMetadata;
}

/// Extension of [`ParameterBase`] that allows downcasting to the concrete type.
pub trait ParameterAny: ParameterBase {
    /// Access as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    sender: watch::Sender<T>,
    shared: Arc<RwLock<ObservableSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Observable")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Metadata for an observable parameter.
///
/// | Field | Populated By | Host widget |
/// |-------|--------------|-------------|
/// | `dtype="float"`, `min_value`, `max_value` | `with_range_introspectable()` | Slider |
/// | `dtype="int"`, `enum_values` | `Parameter<i64>::with_steps()` | ComboBox |
/// | `dtype="enum"`, `enum_values` | `with_choices_introspectable()` | ComboBox |
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Parameter name (unique within a device).
    pub name: String,

    /// Human-readable title shown next to the widget.
    pub title: Option<String>,

    /// Human-readable description for tooltips.
    pub description: Option<String>,

    /// Physical units (e.g., "Hz", "V").
    pub units: Option<String>,

    /// Whether this parameter is read-only.
    pub read_only: bool,

    /// Data type hint: "float", "int", "bool", "string" or "enum".
    #[serde(default)]
    pub dtype: String,

    /// Minimum value for numeric constraints.
    #[serde(default)]
    pub min_value: Option<f64>,

    /// Maximum value for numeric constraints.
    #[serde(default)]
    pub max_value: Option<f64>,

    /// Allowed labels for choice constraints (the parameter's limits set).
    #[serde(default)]
    pub enum_values: Vec<String>,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(ObservableSharedState {
                metadata: ObservableMetadata {
                    name: name.into(),
                    ..Default::default()
                },
                validator: None,
            })),
        }
    }

    /// Add a title to this observable.
    pub fn with_title(self, title: impl Into<String>) -> Self {
        self.shared.write().metadata.title = Some(title.into());
        self
    }

    /// Add a description to this observable.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Mark this observable as read-only.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the parameter name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Get the metadata (clone).
    pub fn metadata(&self) -> ObservableMetadata {
        self.shared.read().metadata.clone()
    }

    /// Update metadata with a closure.
    pub fn with_metadata<F>(&self, f: F)
    where
        F: FnOnce(&mut ObservableMetadata),
    {
        let mut guard = self.shared.write();
        f(&mut guard.metadata);
    }

    /// Validate a value without setting it.
    ///
    /// Returns error if the parameter is read-only or the validator rejects it.
    pub fn validate(&self, value: &T) -> Result<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(anyhow::Error::new(DaqError::ParameterReadOnly)
                .context(format!("Parameter '{}' is read-only", guard.metadata.name)));
        }
        if let Some(validator) = &guard.validator {
            validator(value)?;
        }
        Ok(())
    }

    /// Set a new value, notifying all subscribers.
    pub fn set(&self, value: T) -> Result<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set value without validation.
    ///
    /// Used for driver-populated read-only values (e.g. identification strings).
    pub fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Subscribe to value changes.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    /// Get the current value as JSON
    pub fn get_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.get())
            .map_err(|e| anyhow!("Failed to serialize parameter '{}': {}", self.name(), e))
    }

    /// Set the value from JSON
    pub fn set_json(&self, json_value: serde_json::Value) -> Result<()> {
        let value: T = serde_json::from_value(json_value).map_err(|e| {
            anyhow!(
                "Failed to deserialize parameter '{}': {}. Expected type: {}",
                self.name(),
                e,
                std::any::type_name::<T>()
            )
        })?;
        self.set(value)
    }
}

impl<T> ParameterBase for Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn name(&self) -> String {
        Observable::name(self)
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        Observable::get_json(self)
    }

    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        Observable::set_json(self, value)
    }

    fn metadata(&self) -> ObservableMetadata {
        Observable::metadata(self)
    }
}

impl<T> ParameterAny for Observable<T>
where
    T: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Type-Specific Introspectable Extensions
// =============================================================================

impl Observable<f64> {
    /// Add min/max range validation with introspectable metadata.
    ///
    /// Non-finite values are rejected as well.
    ///
    /// # Panics
    ///
    /// Panics at construction time if the bounds are non-finite or out of order.
    pub fn with_range_introspectable(self, min: f64, max: f64) -> Self {
        assert!(
            min.is_finite() && max.is_finite(),
            "Range bounds must be finite: min={}, max={}",
            min,
            max
        );
        assert!(min <= max, "min must be <= max: min={}, max={}", min, max);

        {
            let mut guard = self.shared.write();
            guard.metadata.min_value = Some(min);
            guard.metadata.max_value = Some(max);
            guard.metadata.dtype = "float".to_string();
            guard.validator = Some(Arc::new(move |value: &f64| {
                if !value.is_finite() {
                    return Err(anyhow!("Value must be finite, got {:?}", value));
                }
                if *value < min || *value > max {
                    Err(anyhow!(
                        "Value {:?} out of range [{:?}, {:?}]",
                        value,
                        min,
                        max
                    ))
                } else {
                    Ok(())
                }
            }));
        }
        self
    }
}

impl Observable<i64> {
    /// Restrict an integer to a discrete list of values (e.g. gain steps).
    pub fn with_steps_introspectable(self, steps: Vec<i64>) -> Self {
        {
            let mut guard = self.shared.write();
            guard.metadata.enum_values = steps.iter().map(i64::to_string).collect();
            guard.metadata.dtype = "int".to_string();
            guard.validator = Some(Arc::new(move |value: &i64| {
                if steps.contains(value) {
                    Ok(())
                } else {
                    Err(anyhow!("Value {} not in allowed steps {:?}", value, steps))
                }
            }));
        }
        self
    }
}

impl Observable<String> {
    /// Add choice validation with introspectable metadata.
    ///
    /// Sets `dtype = "enum"` and `enum_values`, and rejects any other label.
    pub fn with_choices_introspectable(self, choices: Vec<String>) -> Self {
        self.update_choices(choices);
        self
    }

    /// Replace the allowed choices at runtime.
    ///
    /// All clones see the new limits immediately.
    ///
    /// # Note on Current Value
    ///
    /// The current value is neither validated nor reselected. If it is not in
    /// the new list it stays selected until the next successful `set()`.
    pub fn update_choices(&self, choices: Vec<String>) {
        let mut guard = self.shared.write();
        guard.metadata.enum_values.clone_from(&choices);
        guard.metadata.dtype = "enum".to_string();
        guard.validator = Some(Arc::new(move |value: &String| {
            if choices.iter().any(|c| c == value) {
                Ok(())
            } else {
                Err(anyhow::Error::new(DaqError::ParameterInvalidChoice)
                    .context(format!("Value {:?} not in choices {:?}", value, choices)))
            }
        }));
    }

    /// Current limits set of this enum parameter.
    pub fn choices(&self) -> Vec<String> {
        self.shared.read().metadata.enum_values.clone()
    }
}

// =============================================================================
// ParameterSet - Ordered collection of parameters
// =============================================================================

/// An ordered collection of parameters for a device.
///
/// Keeps registration order so hosts render the configuration tree in the
/// order the driver declared it. Registering an existing name replaces it in
/// place.
#[derive(Default)]
pub struct ParameterSet {
    parameters: Vec<(String, Box<dyn ParameterAny>)>,
}

impl Debug for ParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSet")
            .field("names", &self.names())
            .finish()
    }
}

impl ParameterSet {
    /// Create a new empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register any parameter-like object that implements `ParameterAny`.
    pub fn register<P>(&mut self, parameter: P)
    where
        P: ParameterAny + 'static,
    {
        let name = parameter.name();
        match self.parameters.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = Box::new(parameter),
            None => self.parameters.push((name, Box::new(parameter))),
        }
    }

    /// Get a parameter by name with its concrete type.
    pub fn get_typed<P>(&self, name: &str) -> Option<&P>
    where
        P: ParameterAny + 'static,
    {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, p)| p.as_any().downcast_ref::<P>())
    }

    /// Get a parameter by name as a trait object.
    pub fn get(&self, name: &str) -> Option<&dyn ParameterBase> {
        self.parameters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.as_ref() as &dyn ParameterBase)
    }

    /// Iterate over all parameters in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn ParameterBase)> {
        self.parameters
            .iter()
            .map(|(name, param)| (name.as_str(), param.as_ref() as &dyn ParameterBase))
    }

    /// List all parameter names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.parameters.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Whether no parameter is registered.
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_choices_keeps_stale_value() {
        let obs = Observable::new("sensitivity", "1.00e+00 V".to_string())
            .with_choices_introspectable(vec!["1.00e+00 V".into(), "5.00e-01 V".into()]);

        obs.update_choices(vec!["1.00e-06 A".into()]);

        assert_eq!(obs.get(), "1.00e+00 V");
        assert_eq!(obs.choices(), vec!["1.00e-06 A".to_string()]);
        let err = obs.set("5.00e-01 V".into()).unwrap_err();
        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::ParameterInvalidChoice)
        ));
        assert!(obs.set("1.00e-06 A".into()).is_ok());
    }

    #[test]
    fn clones_share_choices() {
        let obs = Observable::new("mode", "a".to_string())
            .with_choices_introspectable(vec!["a".into(), "b".into()]);
        let clone = obs.clone();
        obs.update_choices(vec!["c".into()]);
        assert_eq!(clone.metadata().enum_values, vec!["c".to_string()]);
    }

    #[test]
    fn range_rejects_out_of_bounds_and_nan() {
        let obs = Observable::new("voltage", 1e-6).with_range_introspectable(0.0, 5.0);
        assert!(obs.set(2.5).is_ok());
        assert!(obs.set(5.5).is_err());
        assert!(obs.set(f64::NAN).is_err());
        assert_eq!(obs.get(), 2.5);
    }

    #[test]
    fn steps_validate_discrete_values() {
        let obs = Observable::new("gain", 0i64).with_steps_introspectable(vec![0, 10, 20]);
        assert!(obs.set(10).is_ok());
        assert!(obs.set(15).is_err());
    }

    #[test]
    fn read_only_rejects_set_but_not_unchecked() {
        let obs = Observable::new("info", String::new()).read_only();
        let err = obs.set("x".into()).unwrap_err();
        assert!(matches!(DaqError::find(&err), Some(DaqError::ParameterReadOnly)));
        obs.set_unchecked("7265".into());
        assert_eq!(obs.get(), "7265");
    }

    #[test]
    fn parameter_set_preserves_order() {
        let mut set = ParameterSet::new();
        set.register(Observable::new("imode", "voltage mode".to_string()));
        set.register(Observable::new("sensitivity", "1.00e+00 V".to_string()));
        set.register(Observable::new("gain", 0i64));
        assert_eq!(set.names(), vec!["imode", "sensitivity", "gain"]);

        set.register(Observable::new("imode", "current mode".to_string()));
        assert_eq!(set.len(), 3);
        assert_eq!(
            set.get("imode").and_then(|p| p.get_json().ok()),
            Some(serde_json::json!("current mode"))
        );
        assert!(set.get_typed::<Observable<i64>>("gain").is_some());
    }
}
