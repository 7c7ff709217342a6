//! Parameter<T> - hardware-connected settings
//!
//! `Parameter<T>` composes [`Observable<T>`] with an async hardware writer.
//! The observable holds the value, limits and metadata; the parameter adds
//! the side effect of pushing a validated value to the instrument.
//!
//! ```rust,ignore
//! let mut time_constant = Parameter::new("time_constant", "1.00e-01 s".to_string())
//!     .with_choices_introspectable(time_constant_labels());
//!
//! time_constant.connect_to_hardware_write(move |label| {
//!     let device = device.clone();
//!     Box::pin(async move { device.set_time_constant_label(&label).await })
//! });
//!
//! time_constant.set("1.00e+00 s".into()).await?;
//! ```
//!
//! # Data Flow
//!
//! ```text
//! param.set(value)
//!     │
//!     ├─ 1. validate (read-only, range, choices)   fails: nothing sent
//!     ├─ 2. hardware writer                         fails: value unchanged
//!     ├─ 3. publish to subscribers
//!     └─ 4. change listeners
//! ```

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::DaqError;
use crate::observable::{Observable, ObservableMetadata, ParameterAny, ParameterBase};

type HardwareWriter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), DaqError>> + Send + Sync>;
type ChangeListener<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// Parameter<T> - Hardware-connected Observable
// =============================================================================

/// Typed parameter with hardware synchronization.
///
/// ```text
/// Parameter<T>
///   ├─ inner: Observable<T>        (subscriptions, validation, metadata)
///   ├─ hardware_writer: Option<F>  (writes to device)
///   └─ change_listeners: Vec<F>    (dependent parameters, logging)
/// ```
#[derive(Clone)]
pub struct Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    inner: Observable<T>,
    hardware_writer: Option<HardwareWriter<T>>,
    change_listeners: Arc<RwLock<Vec<ChangeListener<T>>>>,
}

impl<T> Debug for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("inner", &self.inner)
            .field("value", &self.inner.get())
            .field("has_hardware_writer", &self.hardware_writer.is_some())
            .finish()
    }
}

impl<T> Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + 'static,
{
    /// Create new parameter with initial value
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            inner: Observable::new(name, initial),
            hardware_writer: None,
            change_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Set the human-readable title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.inner = self.inner.with_title(title);
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.inner = self.inner.with_description(description);
        self
    }

    /// Set unit of measurement
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.inner = self.inner.with_units(unit);
        self
    }

    /// Add a custom validator
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.inner = self.inner.with_validator(validator);
        self
    }

    /// Make parameter read-only
    pub fn read_only(mut self) -> Self {
        self.inner = self.inner.read_only();
        self
    }

    /// Connect hardware write function
    ///
    /// After calling this, `set()` writes to hardware before updating the
    /// internal value. If the write fails, the value is not updated.
    pub fn connect_to_hardware_write(
        &mut self,
        writer: impl Fn(T) -> BoxFuture<'static, Result<(), DaqError>> + Send + Sync + 'static,
    ) {
        self.hardware_writer = Some(Arc::new(writer));
    }

    /// Add change listener (called after value changes)
    ///
    /// Listeners are shared by every clone of this parameter, so a listener
    /// added here also fires when a clone held by a [`ParameterSet`] is set.
    ///
    /// [`ParameterSet`]: crate::observable::ParameterSet
    pub fn add_change_listener(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.change_listeners.write().push(Arc::new(listener));
    }

    /// Get current value
    pub fn get(&self) -> T {
        self.inner.get()
    }

    /// Set value (validates, writes to hardware if connected, notifies subscribers)
    ///
    /// Validation runs before the hardware write so an invalid value never
    /// reaches the instrument.
    pub async fn set(&self, value: T) -> Result<()> {
        self.inner.validate(&value)?;

        if let Some(writer) = &self.hardware_writer {
            writer(value.clone()).await?;
        }

        self.inner.set_unchecked(value.clone());

        let listeners = self.change_listeners.read().clone();
        for listener in listeners.iter() {
            listener(&value);
        }

        Ok(())
    }

    /// Subscribe to value changes
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.inner.subscribe()
    }

    /// Parameter name
    pub fn name(&self) -> String {
        self.inner.name()
    }

    /// Unit of measurement
    pub fn unit(&self) -> Option<String> {
        self.inner.metadata().units
    }

    /// Check if parameter is read-only
    pub fn is_read_only(&self) -> bool {
        self.inner.metadata().read_only
    }

    /// Direct access to the inner Observable
    pub fn inner(&self) -> &Observable<T> {
        &self.inner
    }
}

// =============================================================================
// Type-erased access
// =============================================================================

impl<T> ParameterBase for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn name(&self) -> String {
        self.inner.name()
    }

    fn get_json(&self) -> Result<serde_json::Value> {
        self.inner.get_json()
    }

    /// Deserialize, then [`set`](Parameter::set): validation, hardware write
    /// and listeners all run. Blocks the calling thread until the write is done.
    fn set_json(&self, value: serde_json::Value) -> Result<()> {
        let typed_value: T = serde_json::from_value(value).map_err(|e| {
            anyhow::anyhow!(
                "Failed to deserialize parameter '{}': {}. Expected type: {}",
                self.inner.name(),
                e,
                std::any::type_name::<T>()
            )
        })?;
        futures::executor::block_on(self.set(typed_value))
    }

    fn metadata(&self) -> ObservableMetadata {
        self.inner.metadata()
    }
}

impl<T> ParameterAny for Parameter<T>
where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + for<'de> Deserialize<'de> + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Type-Specific Introspectable Methods
// =============================================================================

impl Parameter<f64> {
    /// Numeric bounds, see [`Observable::with_range_introspectable`].
    pub fn with_range_introspectable(mut self, min: f64, max: f64) -> Self {
        self.inner = self.inner.with_range_introspectable(min, max);
        self
    }
}

impl Parameter<i64> {
    /// Discrete steps, see [`Observable::with_steps_introspectable`].
    pub fn with_steps(mut self, steps: Vec<i64>) -> Self {
        self.inner = self.inner.with_steps_introspectable(steps);
        self
    }
}

impl Parameter<String> {
    /// Enumerated labels, see [`Observable::with_choices_introspectable`].
    pub fn with_choices_introspectable(mut self, choices: Vec<String>) -> Self {
        self.inner = self.inner.with_choices_introspectable(choices);
        self
    }

    /// Replace the limits set without touching the current value.
    pub fn update_choices(&self, choices: Vec<String>) {
        self.inner.update_choices(choices);
    }

    /// Current limits set.
    pub fn choices(&self) -> Vec<String> {
        self.inner.choices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn set_writes_hardware_then_publishes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut param =
            Parameter::new("voltage", 1e-6).with_range_introspectable(0.0, 5.0);
        let counter = writes.clone();
        param.connect_to_hardware_write(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        param.set(2.0).await.unwrap();
        assert_eq!(param.get(), 2.0);
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        assert!(param.set(6.0).await.is_err());
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(param.get(), 2.0);
    }

    #[tokio::test]
    async fn failed_write_keeps_old_value() {
        let mut param = Parameter::new("reference", "internal".to_string())
            .with_choices_introspectable(vec!["internal".into(), "external rear".into()]);
        param.connect_to_hardware_write(|_| {
            Box::pin(async { Err(DaqError::DeviceCommand("IE rejected".into())) })
        });

        let err = param.set("external rear".into()).await.unwrap_err();
        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::DeviceCommand(_))
        ));
        assert_eq!(param.get(), "internal");
    }

    #[tokio::test]
    async fn change_listener_sees_new_value() {
        let param = Parameter::new("gain", 0i64).with_steps(vec![0, 10, 20]);
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        param.add_change_listener(move |v| sink.store(*v as usize, Ordering::SeqCst));
        param.set(20).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn set_json_writes_hardware_and_notifies_clones() {
        let writes = Arc::new(AtomicUsize::new(0));
        let mut param = Parameter::new("imode", "voltage mode".to_string())
            .with_choices_introspectable(vec!["voltage mode".into(), "current mode".into()]);
        let counter = writes.clone();
        param.connect_to_hardware_write(move |_| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        param.add_change_listener(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        let erased: Box<dyn ParameterBase> = Box::new(param.clone());
        erased
            .set_json(serde_json::json!("current mode"))
            .unwrap();
        assert!(erased.set_json(serde_json::json!("bogus mode")).is_err());
        assert!(erased.set_json(serde_json::json!(3)).is_err());

        assert_eq!(param.get(), "current mode");
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
