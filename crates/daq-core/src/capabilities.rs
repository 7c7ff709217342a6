//! Atomic Hardware Capabilities
//!
//! Fine-grained capability traits a plugin implements instead of one
//! monolithic instrument trait:
//!
//! - An oscillator exposed as an actuator implements `Movable + Parameterized`
//! - A channel viewer implements `ChannelReadable + Parameterized`
//!
//! Each capability trait is async (`#[async_trait]`), `Send + Sync`, and
//! returns `anyhow::Result`. Typed [`DaqError`](crate::error::DaqError)s
//! travel inside the `anyhow::Error`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn sweep<M: Movable>(axis: &M, points: &[f64]) -> Result<()> {
//!     for &p in points {
//!         axis.move_abs(p).await?;
//!         axis.wait_settled().await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::data::ScalarGroup;
use crate::observable::ParameterSet;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// =============================================================================
// Device Category
// =============================================================================

/// Device category used by hosts to group devices in their UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    /// Motion stages and actuators (Movable)
    Actuator,
    /// 0-D viewers and detectors (ChannelReadable)
    Detector,
    /// Devices that don't fit other categories
    #[default]
    Other,
}

impl DeviceCategory {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Actuator => "Actuators",
            Self::Detector => "Detectors",
            Self::Other => "Other",
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Capability: Motion Control
///
/// Devices whose output can be driven to a position: stages, rotation
/// mounts, or an oscillator frequency treated as a one-axis actuator.
///
/// # Contract
/// - Positions are in host units (after the scaling pipeline)
/// - Targets outside the soft limits are clamped, not rejected
/// - `wait_settled()` returns once the position is within tolerance
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Move relative to current position
    async fn move_rel(&self, distance: f64) -> Result<()>;

    /// Get current position
    async fn position(&self) -> Result<f64>;

    /// Wait for motion to settle
    async fn wait_settled(&self) -> Result<()>;

    /// Stop motion immediately
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by this device")
    }
}

/// Capability: Multi-channel 0-D readout
///
/// Devices that return several named scalars per acquisition (lock-in
/// amplifiers, multimeters with auxiliary inputs).
///
/// # Contract
/// - One [`ScalarGroup`] per configured channel group
/// - Each selected channel contributes one single-element array
#[async_trait]
pub trait ChannelReadable: Send + Sync {
    /// Read every selected channel once.
    async fn read_channels(&self) -> Result<Vec<ScalarGroup>>;

    /// Abort an acquisition in progress.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: Parameter registry
///
/// Exposes the device's configuration tree so hosts can enumerate,
/// display and edit settings generically.
///
/// ```rust,ignore
/// for (name, param) in device.parameters().iter() {
///     println!("{name} = {}", param.get_json()?);
/// }
/// ```
pub trait Parameterized: Send + Sync {
    /// Get device's parameter registry
    fn parameters(&self) -> &ParameterSet;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FixedStage;

    #[async_trait]
    impl Movable for FixedStage {
        async fn move_abs(&self, _position: f64) -> Result<()> {
            Ok(())
        }
        async fn move_rel(&self, _distance: f64) -> Result<()> {
            Ok(())
        }
        async fn position(&self) -> Result<f64> {
            Ok(0.0)
        }
        async fn wait_settled(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_stop_is_unsupported() {
        let stage: Arc<dyn Movable> = Arc::new(FixedStage);
        assert!(stage.stop().await.is_err());
    }

    #[test]
    fn category_labels() {
        assert_eq!(DeviceCategory::default(), DeviceCategory::Other);
        assert_eq!(DeviceCategory::Actuator.label(), "Actuators");
    }
}
