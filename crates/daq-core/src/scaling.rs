//! Position scaling and soft bounds for actuators.
//!
//! Host-visible positions pass through a linear [`ScalingPipeline`] before
//! they reach the device:
//!
//! ```text
//! host ──clamp(SoftLimits)──► host' ──×scaling + offset──► device
//! device ──(−offset) ÷ scaling──► host
//! ```

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default move-done tolerance in host units.
pub const DEFAULT_EPSILON: f64 = 0.01;

// =============================================================================
// ScalingPipeline
// =============================================================================

/// Linear host/device transform applied uniformly to every position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingPipeline {
    /// When false both directions are the identity.
    pub enabled: bool,
    /// Multiplicative factor, host to device.
    pub scaling: f64,
    /// Additive offset in device units.
    pub offset: f64,
}

impl Default for ScalingPipeline {
    fn default() -> Self {
        Self {
            enabled: false,
            scaling: 1.0,
            offset: 0.0,
        }
    }
}

impl ScalingPipeline {
    /// Build an enabled pipeline, rejecting a zero or non-finite factor.
    pub fn new(scaling: f64, offset: f64) -> Result<Self, DaqError> {
        let pipeline = Self {
            enabled: true,
            scaling,
            offset,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Check the factor can be inverted.
    pub fn validate(&self) -> Result<(), DaqError> {
        if !self.enabled {
            return Ok(());
        }
        if self.scaling == 0.0 || !self.scaling.is_finite() || !self.offset.is_finite() {
            return Err(DaqError::Configuration(format!(
                "invalid scaling pipeline: scaling={}, offset={}",
                self.scaling, self.offset
            )));
        }
        Ok(())
    }

    /// Host units to device units.
    pub fn to_device(&self, host: f64) -> f64 {
        if self.enabled {
            host * self.scaling + self.offset
        } else {
            host
        }
    }

    /// Device units to host units.
    pub fn to_host(&self, device: f64) -> f64 {
        if self.enabled {
            (device - self.offset) / self.scaling
        } else {
            device
        }
    }
}

// =============================================================================
// SoftLimits
// =============================================================================

/// Host-side position bounds. Targets outside are clamped, never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftLimits {
    /// When false, `clamp` passes targets through.
    pub enabled: bool,
    /// Lower bound in host units.
    pub min: f64,
    /// Upper bound in host units.
    pub max: f64,
}

impl Default for SoftLimits {
    fn default() -> Self {
        Self {
            enabled: false,
            min: 0.0,
            max: 1.0,
        }
    }
}

impl SoftLimits {
    /// Enabled limits over `[min, max]`.
    pub fn new(min: f64, max: f64) -> Result<Self, DaqError> {
        let limits = Self {
            enabled: true,
            min,
            max,
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Check the bounds are ordered and finite.
    pub fn validate(&self) -> Result<(), DaqError> {
        if self.enabled && !(self.min.is_finite() && self.max.is_finite() && self.min <= self.max)
        {
            return Err(DaqError::Configuration(format!(
                "invalid bounds: min={}, max={}",
                self.min, self.max
            )));
        }
        Ok(())
    }

    /// Clamp `target` into the bounds, logging when it had to move.
    ///
    /// Never panics. Unvalidated bounds with `min > max` pin every target to
    /// `max`; a NaN bound is ignored.
    pub fn clamp(&self, target: f64) -> f64 {
        if !self.enabled {
            return target;
        }
        let clamped = target.max(self.min).min(self.max);
        if clamped != target {
            warn!(
                target_position = target,
                clamped,
                min = self.min,
                max = self.max,
                "Position out of bounds, clamped"
            );
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_pipeline_is_identity() {
        let p = ScalingPipeline::default();
        assert_eq!(p.to_device(1234.5), 1234.5);
        assert_eq!(p.to_host(1234.5), 1234.5);
    }

    #[test]
    fn pipeline_inverts() {
        let p = ScalingPipeline::new(2.0, 10.0).unwrap();
        assert_eq!(p.to_device(5.0), 20.0);
        assert!((p.to_host(p.to_device(777.7)) - 777.7).abs() < 1e-9);
    }

    #[test]
    fn zero_scaling_is_configuration_error() {
        assert!(matches!(
            ScalingPipeline::new(0.0, 1.0),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn clamp_respects_enabled_flag() {
        let limits = SoftLimits::new(0.0, 250e3).unwrap();
        assert_eq!(limits.clamp(300e3), 250e3);
        assert_eq!(limits.clamp(-1.0), 0.0);
        assert_eq!(limits.clamp(5.0), 5.0);
        assert_eq!(SoftLimits::default().clamp(-1.0), -1.0);
    }

    #[test]
    fn clamp_with_unvalidated_bounds_does_not_panic() {
        let inverted = SoftLimits {
            enabled: true,
            min: 5000.0,
            max: 100.0,
        };
        assert!(inverted.validate().is_err());
        assert_eq!(inverted.clamp(1000.0), 100.0);

        let open_low = SoftLimits {
            enabled: true,
            min: f64::NAN,
            max: 100.0,
        };
        assert!(open_low.validate().is_err());
        assert_eq!(open_low.clamp(1000.0), 100.0);
        assert_eq!(open_low.clamp(50.0), 50.0);
        assert!(SoftLimits::new(2.0, 1.0).is_err());
    }
}
