//! DSP7265 0-D viewer.
//!
//! Reads any subset of the lock-in outputs (X, Y, magnitude, phase, ADC 1-3)
//! once per acquisition. Channels are organised in named groups
//! (`channel00`, `channel01`, ...); each group becomes one [`ScalarGroup`]
//! holding one single-element array per selected channel.

use crate::config::Dsp7265Config;
use crate::controller::{
    connect_controller, lookup_controller, ControllerRole, DeviceSession, DriverState, InitStatus,
    Initialized, SharedController,
};
use crate::dsp7265::Channel;
use crate::transport::{Connector, SystemConnector};
use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::{ChannelReadable, DeviceCategory, Parameterized};
use daq_core::data::ScalarGroup;
use daq_core::driver::{Capability, DeviceComponents, DeviceMetadata, DriverFactory};
use daq_core::error::{AppResult, DaqError};
use daq_core::observable::ParameterSet;
use daq_core::parameter::Parameter;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Driver type of the viewer in host configuration.
pub const VIEWER_TYPE: &str = "dsp7265_viewer";

const GROUP_PREFIX: &str = "channel";

// =============================================================================
// Channel groups
// =============================================================================

/// One named selection of channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    /// Sequential index, never reused while a higher one exists
    pub index: u32,
    /// Selected channels, in selection order
    pub channels: Vec<Channel>,
}

impl ChannelGroup {
    /// Group name, `channelNN`.
    pub fn name(&self) -> String {
        format!("{}{:02}", GROUP_PREFIX, self.index)
    }

    /// Display title, `Measure NN`.
    pub fn title(&self) -> String {
        format!("Measure {:02}", self.index)
    }

    /// Selected channel labels.
    pub fn labels(&self) -> Vec<&'static str> {
        self.channels.iter().map(Channel::name).collect()
    }

    /// Zero-valued preview of this group.
    pub fn placeholder(&self) -> ScalarGroup {
        ScalarGroup::placeholder(self.name(), &self.labels())
    }
}

/// Ordered, growable set of channel groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelGroups {
    groups: Vec<ChannelGroup>,
}

impl ChannelGroups {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// One group per selection, indexed from 0.
    pub fn from_selections(selections: &[Vec<Channel>]) -> Self {
        let mut groups = Self::new();
        for channels in selections {
            groups.add_with(channels.clone());
        }
        groups
    }

    /// Index the next group will get: highest existing index + 1, or 0.
    pub fn next_index(&self) -> u32 {
        self.groups
            .iter()
            .map(|g| g.index)
            .max()
            .map_or(0, |max| max + 1)
    }

    /// Add a group selecting `x`; returns its name.
    pub fn add(&mut self) -> String {
        self.add_with(vec![Channel::X])
    }

    /// Add a group with the given selection; returns its name.
    pub fn add_with(&mut self, channels: Vec<Channel>) -> String {
        let group = ChannelGroup {
            index: self.next_index(),
            channels,
        };
        let name = group.name();
        self.groups.push(group);
        name
    }

    /// Remove a group by name.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.groups.len();
        self.groups.retain(|g| g.name() != name);
        self.groups.len() != before
    }

    /// Replace the selection of a group.
    pub fn select(&mut self, name: &str, channels: Vec<Channel>) -> AppResult<()> {
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.name() == name)
            .ok_or_else(|| DaqError::Configuration(format!("no channel group '{}'", name)))?;
        group.channels = channels;
        Ok(())
    }

    /// Group by name.
    pub fn get(&self, name: &str) -> Option<&ChannelGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Groups in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelGroup> {
        self.groups.iter()
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no groups.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Zero-valued preview of every group.
    pub fn placeholders(&self) -> Vec<ScalarGroup> {
        self.groups.iter().map(ChannelGroup::placeholder).collect()
    }
}

// =============================================================================
// Dsp7265ViewerFactory
// =============================================================================

/// Factory for the channel viewer.
pub struct Dsp7265ViewerFactory;

static VIEWER_CAPABILITIES: &[Capability] =
    &[Capability::ChannelReadable, Capability::Parameterized];

impl DriverFactory for Dsp7265ViewerFactory {
    fn driver_type(&self) -> &'static str {
        VIEWER_TYPE
    }

    fn name(&self) -> &'static str {
        "Signal Recovery DSP7265 Lock-in Channels"
    }

    fn capabilities(&self) -> &'static [Capability] {
        VIEWER_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        Dsp7265Config::from_toml(config.clone())?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg = Dsp7265Config::from_toml(config).context("Invalid DSP7265 viewer config")?;
            let controller_id = cfg.controller_id.clone();
            let shared = match cfg.role {
                ControllerRole::Primary => None,
                ControllerRole::Secondary => lookup_controller(&controller_id),
            };

            let viewer = Arc::new(Dsp7265Viewer::new(cfg, Arc::new(SystemConnector)));
            viewer
                .initialize(shared)
                .await
                .with_context(|| format!("DSP7265 viewer '{}' failed to initialize", controller_id))?;
            if viewer.role() == ControllerRole::Primary {
                viewer.publish(&controller_id)?;
            }

            Ok(DeviceComponents::new()
                .with_category(DeviceCategory::Detector)
                .with_channel_readable(viewer.clone())
                .with_parameterized(viewer)
                .with_metadata(DeviceMetadata {
                    channels: Channel::ALL.iter().map(|c| c.name().to_string()).collect(),
                    ..Default::default()
                }))
        })
    }
}

// =============================================================================
// Dsp7265Viewer
// =============================================================================

/// Channel reader over a (possibly shared) DSP7265.
pub struct Dsp7265Viewer {
    config: Dsp7265Config,
    connector: Arc<dyn Connector>,
    session: Arc<DeviceSession>,
    groups: Mutex<ChannelGroups>,
    id: Parameter<String>,
    parameters: ParameterSet,
}

impl std::fmt::Debug for Dsp7265Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsp7265Viewer")
            .field("role", &self.session.role())
            .field("state", &self.session.state())
            .field("groups", &*self.groups.lock())
            .finish_non_exhaustive()
    }
}

impl Dsp7265Viewer {
    /// Build an uninitialized viewer with the configured channel groups.
    pub fn new(config: Dsp7265Config, connector: Arc<dyn Connector>) -> Self {
        let session = Arc::new(DeviceSession::new(VIEWER_TYPE, config.role));
        let groups = ChannelGroups::from_selections(&config.channels);
        let id = Parameter::new("id", String::new())
            .with_title("ID:")
            .read_only();
        let mut parameters = ParameterSet::new();
        parameters.register(id.clone());

        Self {
            config,
            connector,
            session,
            groups: Mutex::new(groups),
            id,
            parameters,
        }
    }

    /// Role from the configuration.
    pub fn role(&self) -> ControllerRole {
        self.session.role()
    }

    /// Lifecycle state.
    pub fn state(&self) -> DriverState {
        self.session.state()
    }

    /// `{info, initialized}` of the last initialization.
    pub fn status(&self) -> InitStatus {
        self.session.status()
    }

    /// Connect (primary) or attach to `shared` (secondary) and identify.
    #[instrument(skip(self, shared), fields(role = ?self.role()), err)]
    pub async fn initialize(&self, shared: Option<SharedController>) -> AppResult<Initialized> {
        self.session.begin()?;
        if let Err(e) = self.config.validate() {
            return Err(self.session.fail(e).await);
        }
        match connect_controller(
            self.role(),
            &self.config.connection,
            shared,
            self.connector.as_ref(),
        )
        .await
        {
            Ok(init) => {
                self.session.ready(&init);
                self.id.inner().set_unchecked(init.info.clone());
                Ok(init)
            }
            Err(e) => Err(self.session.fail(e).await),
        }
    }

    /// Publish this primary's controller under `id` for secondaries.
    ///
    /// The entry is withdrawn when this viewer closes.
    pub fn publish(&self, id: &str) -> AppResult<()> {
        self.session.publish(id)
    }

    /// Snapshot of the channel groups.
    pub fn groups(&self) -> ChannelGroups {
        self.groups.lock().clone()
    }

    /// Add a group selecting `x`; returns its name.
    pub fn add_group(&self) -> String {
        let name = self.groups.lock().add();
        debug!(group = %name, "Added channel group");
        name
    }

    /// Remove a group by name.
    pub fn remove_group(&self, name: &str) -> bool {
        self.groups.lock().remove(name)
    }

    /// Change the selection of a group and return the zero-valued preview
    /// of every group for the host to resize its display.
    pub fn select_channels(&self, group: &str, channels: Vec<Channel>) -> AppResult<Vec<ScalarGroup>> {
        let mut groups = self.groups.lock();
        groups.select(group, channels)?;
        Ok(groups.placeholders())
    }

    /// Zero-valued preview of every group.
    pub fn placeholders(&self) -> Vec<ScalarGroup> {
        self.groups.lock().placeholders()
    }

    /// Read every selected channel once, one bundle per group.
    #[instrument(skip(self), err)]
    pub async fn read_groups(&self) -> AppResult<Vec<ScalarGroup>> {
        let controller = self.session.controller("read channels")?;
        let groups = self.groups();
        let mut bundles = Vec::with_capacity(groups.len());
        for group in groups.iter() {
            let mut bundle = ScalarGroup::new(group.name());
            for channel in &group.channels {
                bundle.push(channel.name(), controller.read_channel(*channel).await?);
            }
            bundles.push(bundle);
        }
        Ok(bundles)
    }

    /// Close the viewer. A primary shuts the connection down, a secondary
    /// only lets go of it. Closing again is a no-op.
    #[instrument(skip(self), err)]
    pub async fn close(&self) -> AppResult<()> {
        self.session.close().await
    }
}

#[async_trait]
impl ChannelReadable for Dsp7265Viewer {
    async fn read_channels(&self) -> Result<Vec<ScalarGroup>> {
        Ok(self.read_groups().await?)
    }
}

impl Parameterized for Dsp7265Viewer {
    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;
    use crate::simulated::{SimulatedConnector, SIMULATED_ID};

    #[test]
    fn group_names_and_titles_are_zero_padded() {
        let mut groups = ChannelGroups::new();
        let name = groups.add();
        assert_eq!(name, "channel00");
        let group = groups.get("channel00").unwrap();
        assert_eq!(group.title(), "Measure 00");
        assert_eq!(group.channels, vec![Channel::X]);
    }

    #[test]
    fn new_index_is_max_plus_one() {
        let mut groups = ChannelGroups::new();
        assert_eq!(groups.next_index(), 0);
        groups.add();
        groups.add();
        groups.add();
        assert!(groups.remove("channel01"));
        assert_eq!(groups.add(), "channel03");

        assert!(groups.remove("channel03"));
        assert_eq!(groups.add(), "channel03");

        for name in ["channel00", "channel02", "channel03"] {
            assert!(groups.remove(name));
        }
        assert!(groups.is_empty());
        assert_eq!(groups.add(), "channel00");
        assert!(!groups.remove("channel42"));
    }

    #[test]
    fn selection_change_yields_placeholders() {
        let viewer = Dsp7265Viewer::new(
            Dsp7265Config::default(),
            Arc::new(SimulatedConnector::default()),
        );
        viewer.add_group();
        let preview = viewer
            .select_channels("channel00", vec![Channel::Mag, Channel::Phase])
            .unwrap();
        assert_eq!(preview.len(), 1);
        assert_eq!(preview[0].labels, vec!["mag", "phase"]);
        assert_eq!(preview[0].data, vec![vec![0.0], vec![0.0]]);

        assert!(matches!(
            viewer.select_channels("channel09", vec![]),
            Err(DaqError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn read_before_initialize_is_invalid_state() {
        let viewer = Dsp7265Viewer::new(
            Dsp7265Config::default(),
            Arc::new(SimulatedConnector::default()),
        );
        let err = viewer.read_channels().await.unwrap_err();
        assert!(matches!(
            DaqError::find(&err),
            Some(DaqError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_fills_id_parameter() {
        let config = Dsp7265Config {
            connection: ConnectionSettings::simulated(),
            ..Default::default()
        };
        let viewer = Dsp7265Viewer::new(config, Arc::new(SimulatedConnector::default()));
        viewer.initialize(None).await.unwrap();
        assert_eq!(viewer.id.get(), SIMULATED_ID);
        assert!(viewer.status().initialized);
        assert!(viewer.stop().await.is_ok());
    }
}
