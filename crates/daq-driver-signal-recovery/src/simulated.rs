//! In-memory DSP7265 for tests and dry runs.
//!
//! Every `write` of the form `<MNEMONIC> <arg>` stores `arg` under the
//! mnemonic; a later `query` of the mnemonic returns it. Measurement
//! commands (`X.`, `MAG.`, `ADC. 1`, ...) return preset readings that tests
//! can override. Clones share state, so a test can keep a handle while the
//! driver owns the boxed transport.

use crate::config::ConnectionSettings;
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use daq_core::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Identification string reported by the simulated instrument.
pub const SIMULATED_ID: &str = "7265";

#[derive(Debug)]
struct SimulatedState {
    values: HashMap<String, String>,
    commands: Vec<String>,
    failing: Vec<String>,
    closed: bool,
    close_calls: usize,
}

impl Default for SimulatedState {
    fn default() -> Self {
        let values = [
            ("ID", SIMULATED_ID),
            ("OF.", "1000.0"),
            ("OA.", "1.0E-06"),
            ("X.", "0.0"),
            ("Y.", "0.0"),
            ("MAG.", "0.0"),
            ("PHA.", "0.0"),
            ("ADC. 1", "0.0"),
            ("ADC. 2", "0.0"),
            ("ADC. 3", "0.0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            values,
            commands: Vec::new(),
            failing: Vec::new(),
            closed: false,
            close_calls: 0,
        }
    }
}

impl SimulatedState {
    fn check(&mut self, command: &str) -> AppResult<()> {
        if self.closed {
            return Err(DaqError::DeviceCommand(format!(
                "'{}' sent on a closed connection",
                command
            )));
        }
        self.commands.push(command.to_string());
        if self.failing.iter().any(|p| command.starts_with(p.as_str())) {
            return Err(DaqError::DeviceCommand(format!("'{}' rejected", command)));
        }
        Ok(())
    }
}

/// Simulated instrument. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedTransport {
    /// Fresh instrument with default readings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset the reply to `command`.
    pub fn with_value(self, command: &str, reply: &str) -> Self {
        self.set_value(command, reply);
        self
    }

    /// Change the reply to `command`.
    pub fn set_value(&self, command: &str, reply: &str) {
        self.state
            .lock()
            .values
            .insert(command.to_string(), reply.to_string());
    }

    /// Last stored value for a mnemonic.
    pub fn value(&self, mnemonic: &str) -> Option<String> {
        self.state.lock().values.get(mnemonic).cloned()
    }

    /// Make every command starting with `prefix` fail.
    pub fn fail_on(&self, prefix: &str) {
        self.state.lock().failing.push(prefix.to_string());
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of `close` calls received.
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        state.check(command)?;
        if let Some((mnemonic, arg)) = command.split_once(' ') {
            state
                .values
                .insert(mnemonic.to_string(), arg.trim().to_string());
        }
        Ok(())
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut state = self.state.lock();
        state.check(command)?;
        state
            .values
            .get(command)
            .cloned()
            .ok_or_else(|| DaqError::DeviceCommand(format!("no reply to '{}'", command)))
    }

    async fn close(&self) -> AppResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_calls += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "simulated DSP7265".to_string()
    }
}

/// Connector handing out one shared [`SimulatedTransport`] and counting opens.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    instrument: SimulatedTransport,
    opens: Arc<AtomicUsize>,
    open_error: Option<String>,
}

impl SimulatedConnector {
    /// Connector over `instrument`.
    pub fn new(instrument: SimulatedTransport) -> Self {
        Self {
            instrument,
            ..Default::default()
        }
    }

    /// Connector whose every open fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            open_error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The shared instrument.
    pub fn instrument(&self) -> &SimulatedTransport {
        &self.instrument
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(&self, _settings: &ConnectionSettings) -> AppResult<Box<dyn Transport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        match &self.open_error {
            Some(message) => Err(DaqError::Connection(message.clone())),
            None => Ok(Box::new(self.instrument.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_written_value() {
        let sim = SimulatedTransport::new();
        sim.write("OF. 1234.5").await.unwrap();
        assert_eq!(sim.query("OF.").await.unwrap(), "1234.5");
        assert_eq!(sim.value("OF."), Some("1234.5".into()));
        assert_eq!(sim.commands(), vec!["OF. 1234.5", "OF."]);
    }

    #[tokio::test]
    async fn injected_failures_and_close() {
        let sim = SimulatedTransport::new();
        sim.fail_on("TC");
        assert!(matches!(
            sim.write("TC 3").await,
            Err(DaqError::DeviceCommand(_))
        ));
        assert!(sim.query("UNKNOWN").await.is_err());

        sim.close().await.unwrap();
        assert!(sim.is_closed());
        assert!(sim.query("ID").await.is_err());
    }

    #[tokio::test]
    async fn connector_counts_opens() {
        let connector = SimulatedConnector::default();
        let settings = ConnectionSettings::default();
        let transport = connector.open(&settings).await.unwrap();
        assert_eq!(transport.query("ID").await.unwrap(), SIMULATED_ID);
        assert_eq!(connector.opens(), 1);

        let failing = SimulatedConnector::failing("port busy");
        assert!(matches!(
            failing.open(&settings).await,
            Err(DaqError::Connection(_))
        ));
        assert_eq!(failing.opens(), 1);
    }
}
