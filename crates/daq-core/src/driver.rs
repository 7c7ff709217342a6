//! Driver Factory and Component Types
//!
//! The plugin API a host uses to instantiate drivers from configuration.
//! A driver crate implements [`DriverFactory`]; the host calls `validate()`
//! then `build()` with the device's TOML section and receives a
//! [`DeviceComponents`] capability bag.
//!
//! ```text
//! host config [devices.lockin]   ──►  DriverFactory::validate()
//!                                 ──►  DriverFactory::build()  ──►  DeviceComponents
//!                                                                 ├─ movable
//!                                                                 ├─ channel_readable
//!                                                                 └─ parameterized
//! ```

use crate::capabilities::{ChannelReadable, DeviceCategory, Movable, Parameterized};
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags for device introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`crate::capabilities::Movable`]
    Movable,

    /// Corresponds to [`crate::capabilities::ChannelReadable`]
    ChannelReadable,

    /// Corresponds to [`crate::capabilities::Parameterized`]
    Parameterized,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Movable => "Movable",
            Self::ChannelReadable => "Channel Readable",
            Self::Parameterized => "Parameterized",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Container for capability trait objects returned by drivers.
///
/// ```rust,ignore
/// let actuator = Arc::new(Dsp7265Actuator::new(config));
///
/// let components = DeviceComponents::new()
///     .with_category(DeviceCategory::Actuator)
///     .with_movable(actuator.clone())
///     .with_parameterized(actuator);
/// ```
#[derive(Default)]
pub struct DeviceComponents {
    /// Device category for UI grouping
    pub category: Option<DeviceCategory>,

    /// Movable implementation (motion control)
    pub movable: Option<Arc<dyn Movable>>,

    /// ChannelReadable implementation (multi-channel scalars)
    pub channel_readable: Option<Arc<dyn ChannelReadable>>,

    /// Parameterized implementation (parameter registry)
    pub parameterized: Option<Arc<dyn Parameterized>>,

    /// Capability-specific metadata (units, ranges)
    pub metadata: DeviceMetadata,
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("category", &self.category)
            .field("capabilities", &self.capabilities())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl DeviceComponents {
    /// Create a new empty DeviceComponents
    pub fn new() -> Self {
        Self::default()
    }

    /// Get list of capabilities this device supports
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();

        if self.movable.is_some() {
            caps.push(Capability::Movable);
        }
        if self.channel_readable.is_some() {
            caps.push(Capability::ChannelReadable);
        }
        if self.parameterized.is_some() {
            caps.push(Capability::Parameterized);
        }

        caps
    }

    /// Set device category
    pub fn with_category(mut self, category: DeviceCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Set Movable implementation
    pub fn with_movable(mut self, m: Arc<dyn Movable>) -> Self {
        self.movable = Some(m);
        self
    }

    /// Set ChannelReadable implementation
    pub fn with_channel_readable(mut self, r: Arc<dyn ChannelReadable>) -> Self {
        self.channel_readable = Some(r);
        self
    }

    /// Set Parameterized implementation
    pub fn with_parameterized(mut self, p: Arc<dyn Parameterized>) -> Self {
        self.parameterized = Some(p);
        self
    }

    /// Set device metadata
    pub fn with_metadata(mut self, metadata: DeviceMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Capability-specific metadata for a device.
#[derive(Debug, Clone, Default)]
pub struct DeviceMetadata {
    /// For Movable devices: axis names (e.g. `["OSC"]`)
    pub axes: Vec<String>,

    /// For Movable devices: position units (e.g., "Hz")
    pub position_units: Option<String>,

    /// For Movable devices: minimum position
    pub min_position: Option<f64>,

    /// For Movable devices: maximum position
    pub max_position: Option<f64>,

    /// For ChannelReadable devices: names of the readable channels
    pub channels: Vec<String>,
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Trait for driver factories that create device instances.
///
/// Factories are registered once and live for the program's lifetime, so
/// they hold no mutable state across builds. Shared resources between
/// builds (a connection used by several logical devices) go through an
/// internally synchronized registry.
pub trait DriverFactory: Send + Sync + 'static {
    /// Driver type name used in TOML config `type` field.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name for documentation and error messages.
    fn name(&self) -> &'static str;

    /// List of capabilities this driver type provides.
    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    /// Validate configuration without instantiating.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Async instantiation of the driver.
    ///
    /// Hardware connection failures surface here as errors.
    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_name() {
        assert_eq!(Capability::Movable.name(), "Movable");
        assert_eq!(Capability::ChannelReadable.name(), "Channel Readable");
    }

    #[test]
    fn test_device_components_builder() {
        let components = DeviceComponents::new()
            .with_category(DeviceCategory::Actuator)
            .with_metadata(DeviceMetadata {
                axes: vec!["OSC".to_string()],
                position_units: Some("Hz".to_string()),
                ..Default::default()
            });

        assert_eq!(components.category, Some(DeviceCategory::Actuator));
        assert!(components.capabilities().is_empty());
        assert_eq!(components.metadata.position_units.as_deref(), Some("Hz"));
    }

    #[test]
    fn test_capability_serde() {
        let json = serde_json::to_string(&Capability::ChannelReadable).unwrap();
        assert_eq!(json, "\"channel_readable\"");

        let cap: Capability = serde_json::from_str("\"movable\"").unwrap();
        assert_eq!(cap, Capability::Movable);
    }
}
