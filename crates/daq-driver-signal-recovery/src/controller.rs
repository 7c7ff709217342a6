//! Connection ownership between logical devices.
//!
//! One physical DSP7265 can back several logical devices (the oscillator
//! actuator and one or more viewers). Exactly one of them is the
//! **primary**: it opens the transport and owns the [`SharedController`].
//! The others are **secondaries**: they receive a clone of the primary's
//! handle and never open anything themselves.
//!
//! Hosts that wire devices by hand pass the handle explicitly. Factories use
//! the process-wide registry instead: a primary registers its controller
//! under `controller_id`, a secondary looks it up under the same id.

use crate::config::ConnectionSettings;
use crate::dsp7265::Dsp7265;
use crate::transport::Connector;
use daq_core::error::{AppResult, DaqError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{error, info, instrument, warn};

/// Instrument handle shared by a primary and its secondaries.
pub type SharedController = Arc<Dsp7265>;

// =============================================================================
// Roles and lifecycle
// =============================================================================

/// Whether a logical device owns the connection or borrows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerRole {
    /// Opens and owns the connection
    #[default]
    #[serde(alias = "master", alias = "Master", alias = "Primary")]
    Primary,
    /// Borrows the primary's connection
    #[serde(alias = "slave", alias = "Slave", alias = "Secondary")]
    Secondary,
}

/// Lifecycle of a logical device.
///
/// ```text
/// Uninitialized ─► Initializing ─► Ready ─► Closed
///                       │
///                       └────────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// Constructed, not yet initialized
    #[default]
    Uninitialized,
    /// Initialization in progress
    Initializing,
    /// Connected and usable
    Ready,
    /// Initialization failed
    Failed,
    /// Closed; only another close is accepted
    Closed,
}

impl std::fmt::Display for DriverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverState::Uninitialized => "uninitialized",
            DriverState::Initializing => "initializing",
            DriverState::Ready => "ready",
            DriverState::Failed => "failed",
            DriverState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Successful initialization: the controller and its identification.
#[derive(Debug, Clone)]
pub struct Initialized {
    /// Handle to pass to secondaries
    pub controller: SharedController,
    /// Identification string reported by the instrument
    pub info: String,
}

/// Status record reported to the host after initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitStatus {
    /// Identification string, or the failure message
    pub info: String,
    /// Whether initialization succeeded
    pub initialized: bool,
}

impl InitStatus {
    /// Status record for an initialization result.
    pub fn from_result(result: &AppResult<Initialized>) -> Self {
        match result {
            Ok(init) => Self {
                info: init.info.clone(),
                initialized: true,
            },
            Err(e) => Self {
                info: e.to_string(),
                initialized: false,
            },
        }
    }
}

// =============================================================================
// Initialize
// =============================================================================

/// Connect a logical device.
///
/// A primary opens exactly one transport through `connector` and reads the
/// identification string from it. A secondary requires `shared` and never
/// touches `connector`.
///
/// # Errors
///
/// - `Configuration` when a secondary has no shared controller
/// - `Configuration` when the connection settings are unusable
/// - `Connection` when the transport cannot be opened or does not identify
#[instrument(skip(settings, shared, connector), fields(adapter = %settings.adapter))]
pub async fn connect_controller(
    role: ControllerRole,
    settings: &ConnectionSettings,
    shared: Option<SharedController>,
    connector: &dyn Connector,
) -> AppResult<Initialized> {
    let controller = match role {
        ControllerRole::Secondary => shared.ok_or_else(|| {
            DaqError::Configuration(
                "no controller has been supplied while this device is a secondary".into(),
            )
        })?,
        ControllerRole::Primary => {
            let transport = connector.open(settings).await.map_err(|e| match e {
                err @ (DaqError::Configuration(_) | DaqError::Connection(_)) => err,
                other => DaqError::Connection(other.to_string()),
            })?;
            Arc::new(Dsp7265::new(transport))
        }
    };

    let info = match controller.id().await {
        Ok(info) => info,
        Err(e) => {
            if role == ControllerRole::Primary {
                if let Err(close_err) = controller.shutdown().await {
                    warn!(error = %close_err, "Closing after failed identification also failed");
                }
            }
            return Err(DaqError::Connection(format!(
                "identification query failed: {}",
                e
            )));
        }
    };

    info!(?role, id = %info, transport = %controller.describe(), "DSP7265 connected");
    Ok(Initialized { controller, info })
}

// =============================================================================
// DeviceSession
// =============================================================================

/// Lifecycle and controller slot of one logical device.
///
/// Actuators and viewers keep one session each. Parameter writers hold an
/// `Arc` to it and resolve the controller at write time, so they fail with
/// `InvalidState` until the device is ready.
#[derive(Debug)]
pub struct DeviceSession {
    device: &'static str,
    role: ControllerRole,
    state: Mutex<DriverState>,
    controller: RwLock<Option<SharedController>>,
    status: Mutex<InitStatus>,
    published: Mutex<Option<String>>,
}

impl DeviceSession {
    /// New session in `Uninitialized`.
    pub fn new(device: &'static str, role: ControllerRole) -> Self {
        Self {
            device,
            role,
            state: Mutex::new(DriverState::Uninitialized),
            controller: RwLock::new(None),
            status: Mutex::new(InitStatus::default()),
            published: Mutex::new(None),
        }
    }

    /// Role this device was configured with.
    pub fn role(&self) -> ControllerRole {
        self.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        *self.state.lock()
    }

    /// Status record of the last initialization.
    pub fn status(&self) -> InitStatus {
        self.status.lock().clone()
    }

    /// Controller handle, only while `Ready`.
    pub fn controller(&self, operation: &'static str) -> AppResult<SharedController> {
        let state = self.state();
        if state != DriverState::Ready {
            return Err(DaqError::InvalidState {
                operation,
                state: state.to_string(),
            });
        }
        self.controller
            .read()
            .clone()
            .ok_or_else(|| DaqError::InvalidState {
                operation,
                state: state.to_string(),
            })
    }

    /// Enter `Initializing`. Allowed from `Uninitialized` and `Failed`.
    pub fn begin(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        match *state {
            DriverState::Uninitialized | DriverState::Failed => {
                *state = DriverState::Initializing;
                Ok(())
            }
            other => Err(DaqError::InvalidState {
                operation: "initialize",
                state: other.to_string(),
            }),
        }
    }

    /// Store the controller and enter `Ready`.
    pub fn ready(&self, init: &Initialized) {
        *self.controller.write() = Some(init.controller.clone());
        *self.status.lock() = InitStatus {
            info: init.info.clone(),
            initialized: true,
        };
        *self.state.lock() = DriverState::Ready;
    }

    /// Record a failed initialization and hand the error back.
    ///
    /// A primary that already opened its connection closes it again.
    pub async fn fail(&self, err: DaqError) -> DaqError {
        let controller = self.controller.write().take();
        if let (ControllerRole::Primary, Some(controller)) = (self.role, controller) {
            if let Err(close_err) = controller.shutdown().await {
                warn!(device = self.device, error = %close_err, "Closing after failed initialization also failed");
            }
        }
        error!(device = self.device, kind = %err.kind(), error = %err, "Initialization failed");
        *self.status.lock() = InitStatus {
            info: err.to_string(),
            initialized: false,
        };
        *self.state.lock() = DriverState::Failed;
        err
    }

    /// Register the controller under `id` for secondaries to find.
    ///
    /// Only a ready primary publishes. The entry is withdrawn on
    /// [`close`](Self::close).
    pub fn publish(&self, id: &str) -> AppResult<()> {
        if self.role != ControllerRole::Primary {
            return Err(DaqError::Configuration(format!(
                "only a primary can publish controller '{}'",
                id
            )));
        }
        let controller = self.controller("publish the controller")?;
        register_controller(id, controller);
        *self.published.lock() = Some(id.to_string());
        Ok(())
    }

    /// Enter `Closed`. Only a primary shuts the connection down.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) -> AppResult<()> {
        let previous = std::mem::replace(&mut *self.state.lock(), DriverState::Closed);
        if previous == DriverState::Closed {
            return Ok(());
        }
        let controller = self.controller.write().take();
        let published = self.published.lock().take();
        match (self.role, controller) {
            (ControllerRole::Primary, Some(controller)) => {
                if let Some(id) = published {
                    withdraw_controller(&id, &controller);
                }
                controller.shutdown().await
            }
            (ControllerRole::Secondary, Some(_)) => {
                info!(device = self.device, "Secondary released shared controller");
                Ok(())
            }
            (_, None) => Ok(()),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

static CONTROLLERS: OnceLock<RwLock<HashMap<String, SharedController>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, SharedController>> {
    CONTROLLERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Publish a primary's controller for secondaries.
///
/// Replaces any controller previously registered under `id`.
pub fn register_controller(id: &str, controller: SharedController) {
    let previous = registry().write().insert(id.to_string(), controller);
    if previous.is_some() {
        warn!(controller_id = id, "Replaced registered DSP7265 controller");
    } else {
        info!(controller_id = id, "Registered DSP7265 controller");
    }
}

/// Controller registered under `id`, if its connection is still open.
pub fn lookup_controller(id: &str) -> Option<SharedController> {
    registry()
        .read()
        .get(id)
        .filter(|c| !c.is_closed())
        .cloned()
}

/// Withdraw the controller registered under `id`.
pub fn remove_controller(id: &str) -> bool {
    let removed = registry().write().remove(id).is_some();
    if removed {
        info!(controller_id = id, "Removed DSP7265 controller from registry");
    }
    removed
}

/// Withdraw `id` only while it still maps to `controller`.
fn withdraw_controller(id: &str, controller: &SharedController) {
    let mut map = registry().write();
    if map.get(id).is_some_and(|c| Arc::ptr_eq(c, controller)) {
        map.remove(id);
        info!(controller_id = id, "Withdrew DSP7265 controller from registry");
    }
}
