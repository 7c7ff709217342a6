//! `daq-core`
//!
//! Host-side building blocks that instrument plugins are written against.
//!
//! ## Modules
//!
//! - [`error`]: `DaqError` taxonomy (configuration / connection / device command)
//! - [`observable`] and [`parameter`]: the configuration tree, with runtime
//!   choice limits and hardware write-through
//! - [`capabilities`]: `Movable`, `ChannelReadable`, `Parameterized`
//! - [`driver`]: `DriverFactory` and the `DeviceComponents` capability bag
//! - [`scaling`]: host/device position transform and soft bounds
//! - [`data`]: labeled 0-D readings
//! - `serial` (feature `serial`): async byte-stream plumbing

pub mod capabilities;
pub mod data;
pub mod driver;
pub mod error;
pub mod observable;
pub mod parameter;
pub mod scaling;
#[cfg(feature = "serial")]
pub mod serial;

pub use anyhow::{anyhow, Result};
pub use error::{AppResult, DaqError, DriverErrorKind};
