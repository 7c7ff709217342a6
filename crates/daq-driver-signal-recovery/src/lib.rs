//! Signal Recovery hardware drivers for rust-daq.
//!
//! This crate provides plugins for the Signal Recovery DSP7265 lock-in
//! amplifier:
//! - the internal oscillator as a one-axis actuator (`dsp7265_actuator`)
//! - the demodulated outputs and ADC inputs as a 0-D viewer (`dsp7265_viewer`)
//!
//! Several logical devices can share one instrument: the primary opens the
//! connection, secondaries reuse it (see [`controller`]).
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! daq-driver-signal-recovery = { path = "../daq-driver-signal-recovery" }
//! ```
//!
//! Register the factories with your device registry:
//!
//! ```rust,ignore
//! use daq_driver_signal_recovery::{Dsp7265ActuatorFactory, Dsp7265ViewerFactory};
//!
//! registry.register_factory(Box::new(Dsp7265ActuatorFactory));
//! registry.register_factory(Box::new(Dsp7265ViewerFactory));
//! ```

pub mod actuator;
pub mod config;
pub mod controller;
pub mod dsp7265;
pub mod settings;
pub mod simulated;
pub mod transport;
pub mod viewer;

pub use actuator::{Dsp7265Actuator, Dsp7265ActuatorFactory};
pub use config::{ConnectionSettings, Dsp7265Config};
pub use controller::{ControllerRole, InitStatus, SharedController};
pub use dsp7265::{Channel, Dsp7265, InputMode};
pub use viewer::{ChannelGroups, Dsp7265Viewer, Dsp7265ViewerFactory};

/// Force the linker to include this crate.
///
/// Call this function from main() to ensure the driver factories are
/// linked into the final binary and not stripped by the linker.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<Dsp7265ActuatorFactory>());
    std::hint::black_box(std::any::TypeId::of::<Dsp7265ViewerFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
