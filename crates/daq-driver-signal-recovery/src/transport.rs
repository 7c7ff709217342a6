//! Transport adapters for the DSP7265.
//!
//! The instrument speaks line-oriented ASCII. Three backends are supported:
//!
//! - **VISA**: a VISA resource string resolved without a VISA library.
//!   `ASRL<path|n>::INSTR` opens a serial port, `TCPIP[n]::<host>::<port>::SOCKET`
//!   opens a raw TCP socket.
//! - **Prologix**: GPIB through a Prologix GPIB-USB (or GPIB-ETHERNET)
//!   controller. The address names the controller, `gpib_address` the
//!   instrument on the bus.
//! - **Simulated**: an in-memory instrument, see [`crate::simulated`].
//!
//! Commands are CR-terminated. Replies end at CR or LF; NUL padding and
//! surrounding whitespace are stripped.

use crate::config::ConnectionSettings;
use crate::simulated::SimulatedTransport;
use async_trait::async_trait;
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::{drain_serial_buffer, open_serial_async, wrap_shared, DynSerial, SharedPort};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Time spent discarding stale bytes right after a stream is opened.
const OPEN_DRAIN_MS: u64 = 20;

// =============================================================================
// Adapter kinds
// =============================================================================

/// Supported transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// VISA resource string (serial or raw socket)
    #[default]
    #[serde(alias = "VISA")]
    Visa,
    /// GPIB through a Prologix controller
    #[serde(alias = "Prologix")]
    Prologix,
    /// In-memory instrument
    #[serde(alias = "Simulated")]
    Simulated,
}

impl AdapterKind {
    /// Every adapter, in the order hosts list them.
    pub const ALL: [AdapterKind; 3] = [AdapterKind::Visa, AdapterKind::Prologix, AdapterKind::Simulated];

    /// Label shown to users.
    pub fn label(&self) -> &'static str {
        match self {
            AdapterKind::Visa => "VISA",
            AdapterKind::Prologix => "Prologix",
            AdapterKind::Simulated => "Simulated",
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Transport trait
// =============================================================================

/// Request/response channel to one instrument.
///
/// Implementations serialize access internally; a command and its reply are
/// never interleaved with another caller's.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a command that produces no reply.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a command and return its trimmed reply.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Release the underlying connection.
    async fn close(&self) -> AppResult<()>;

    /// Human-readable description of the connection.
    fn describe(&self) -> String;
}

// =============================================================================
// VISA resource strings
// =============================================================================

/// A VISA resource this crate can open natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisaResource {
    /// Serial port path
    Serial {
        /// OS path of the port
        path: String,
    },
    /// Raw TCP socket
    Socket {
        /// Host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl VisaResource {
    /// Parse `ASRL..::INSTR` and `TCPIP..::SOCKET` resources.
    ///
    /// A bare path without `::` is taken as a serial port.
    pub fn parse(resource: &str) -> AppResult<Self> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(DaqError::Configuration("device address is empty".into()));
        }
        if !resource.contains("::") {
            return Ok(VisaResource::Serial {
                path: resource.to_string(),
            });
        }

        let parts: Vec<&str> = resource.split("::").collect();
        let head = parts[0].to_ascii_uppercase();
        let suffix = parts.last().map(|s| s.to_ascii_uppercase()).unwrap_or_default();

        if let Some(board) = head.strip_prefix("ASRL") {
            if parts.len() != 2 || suffix != "INSTR" {
                return Err(unsupported(resource));
            }
            // Keep the original case of the path.
            let path = &parts[0][4..];
            return Ok(VisaResource::Serial {
                path: serial_path_for(board, path),
            });
        }

        if head.starts_with("TCPIP") && suffix == "SOCKET" && parts.len() == 4 {
            let port = parts[2].parse::<u16>().map_err(|_| {
                DaqError::Configuration(format!("invalid socket port in '{}'", resource))
            })?;
            return Ok(VisaResource::Socket {
                host: parts[1].to_string(),
                port,
            });
        }

        Err(unsupported(resource))
    }

    /// The resource in VISA notation.
    pub fn to_resource_string(&self) -> String {
        match self {
            VisaResource::Serial { path } => format!("ASRL{}::INSTR", path),
            VisaResource::Socket { host, port } => format!("TCPIP0::{}::{}::SOCKET", host, port),
        }
    }
}

fn unsupported(resource: &str) -> DaqError {
    DaqError::Configuration(format!(
        "unsupported VISA resource '{}': only ASRL..::INSTR and TCPIP..::SOCKET \
         are handled natively, use the Prologix adapter for GPIB",
        resource
    ))
}

/// `ASRL3` is board number 3, anything else is a literal path.
fn serial_path_for(board_upper: &str, original: &str) -> String {
    match board_upper.parse::<u32>() {
        Ok(n) if cfg!(windows) => format!("COM{}", n),
        Ok(n) => format!("/dev/ttyS{}", n.saturating_sub(1)),
        Err(_) => original.to_string(),
    }
}

/// Serial ports present on this machine, as VISA resource strings.
///
/// Used as the choice list for the device address.
pub fn list_resources() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                VisaResource::Serial { path: p.port_name }.to_resource_string()
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "Serial port enumeration failed");
            Vec::new()
        }
    }
}

// =============================================================================
// LineTransport
// =============================================================================

/// Terminated ASCII lines over any byte stream.
pub struct LineTransport {
    port: SharedPort,
    terminator: &'static str,
    timeout: Duration,
    resource: String,
}

impl LineTransport {
    /// Wrap an open stream. Commands are terminated with CR.
    pub fn new(stream: DynSerial, resource: impl Into<String>, timeout: Duration) -> Self {
        Self {
            port: wrap_shared(stream),
            terminator: "\r",
            timeout,
            resource: resource.into(),
        }
    }

    /// Use a different command terminator.
    pub fn with_terminator(mut self, terminator: &'static str) -> Self {
        self.terminator = terminator;
        self
    }

    /// Discard bytes left over from a previous session.
    pub async fn clear(&self, timeout_ms: u64) -> usize {
        let mut guard = self.port.lock().await;
        let discarded = drain_serial_buffer(guard.get_mut(), timeout_ms).await;
        if discarded > 0 {
            debug!(resource = %self.resource, discarded, "Discarded stale bytes");
        }
        discarded
    }

    /// Send `lines` back to back under one lock.
    pub async fn send(&self, lines: &[&str]) -> AppResult<()> {
        let mut guard = self.port.lock().await;
        self.write_lines(guard.get_mut(), lines).await
    }

    /// Send `lines` back to back, then read one reply under the same lock.
    pub async fn send_and_read(&self, lines: &[&str]) -> AppResult<String> {
        let mut guard = self.port.lock().await;
        self.write_lines(guard.get_mut(), lines).await?;

        match tokio::time::timeout(self.timeout, read_reply(&mut *guard)).await {
            Ok(reply) => reply,
            Err(_) => Err(DaqError::DeviceCommand(format!(
                "no reply to '{}' within {} ms",
                lines.last().copied().unwrap_or_default(),
                self.timeout.as_millis()
            ))),
        }
    }

    async fn write_lines(&self, writer: &mut DynSerial, lines: &[&str]) -> AppResult<()> {
        for line in lines {
            debug!(resource = %self.resource, command = %line, "Sending command");
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(self.terminator.as_bytes()).await?;
        }
        writer.flush().await?;
        Ok(())
    }
}

/// Read one reply line: leading terminators are skipped, NULs dropped.
async fn read_reply<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> AppResult<String> {
    let mut line = Vec::new();
    loop {
        match reader.read_u8().await? {
            b'\r' | b'\n' if line.is_empty() => continue,
            b'\r' | b'\n' => break,
            0 => continue,
            byte => line.push(byte),
        }
    }
    Ok(String::from_utf8_lossy(&line).trim().to_string())
}

#[async_trait]
impl Transport for LineTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        self.send(&[command]).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.send_and_read(&[command]).await
    }

    async fn close(&self) -> AppResult<()> {
        let mut guard = self.port.lock().await;
        guard.get_mut().shutdown().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.resource.clone()
    }
}

// =============================================================================
// PrologixTransport
// =============================================================================

/// GPIB instrument behind a Prologix controller.
///
/// The controller is put in controller mode with read-after-write disabled;
/// the instrument address is sent before every command so several
/// instruments can share one controller.
pub struct PrologixTransport {
    line: LineTransport,
    gpib_address: u8,
    address_command: String,
}

impl PrologixTransport {
    /// Configure the controller and target `gpib_address`.
    pub async fn connect(line: LineTransport, gpib_address: u8) -> AppResult<Self> {
        if gpib_address > 30 {
            return Err(DaqError::Configuration(format!(
                "GPIB address must be 0-30, got {}",
                gpib_address
            )));
        }
        let line = line.with_terminator("\n");
        line.send(&["++mode 1", "++auto 0", "++eoi 1", "++eos 3"])
            .await?;
        Ok(Self {
            line,
            gpib_address,
            address_command: format!("++addr {}", gpib_address),
        })
    }
}

#[async_trait]
impl Transport for PrologixTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        self.line.send(&[&self.address_command, command]).await
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        self.line
            .send_and_read(&[&self.address_command, command, "++read eoi"])
            .await
    }

    async fn close(&self) -> AppResult<()> {
        self.line.close().await
    }

    fn describe(&self) -> String {
        format!("{} (GPIB {})", self.line.describe(), self.gpib_address)
    }
}

// =============================================================================
// Connectors
// =============================================================================

/// Opens transports from connection settings.
///
/// Production code uses [`SystemConnector`]; tests substitute a connector
/// that counts opens.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport. Failures are `DaqError::Connection`, bad
    /// settings are `DaqError::Configuration`.
    async fn open(&self, settings: &ConnectionSettings) -> AppResult<Box<dyn Transport>>;
}

/// Opens real serial ports and sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    async fn open(&self, settings: &ConnectionSettings) -> AppResult<Box<dyn Transport>> {
        let timeout = settings.timeout();
        match settings.adapter {
            AdapterKind::Simulated => {
                info!("Opening simulated DSP7265");
                Ok(Box::new(SimulatedTransport::new()))
            }
            AdapterKind::Visa => {
                let resource = VisaResource::parse(&settings.address)?;
                let line = open_line(&resource, settings.baud_rate, timeout).await?;
                info!(resource = %line.describe(), "Opened VISA connection");
                Ok(Box::new(line))
            }
            AdapterKind::Prologix => {
                let resource = VisaResource::parse(&settings.address)?;
                let line = open_line(&resource, settings.baud_rate, timeout).await?;
                let prologix = PrologixTransport::connect(line, settings.gpib_address)
                    .await
                    .map_err(|e| match e {
                        err @ DaqError::Configuration(_) => err,
                        other => DaqError::Connection(format!("Prologix setup failed: {}", other)),
                    })?;
                info!(resource = %prologix.describe(), "Opened Prologix connection");
                Ok(Box::new(prologix))
            }
        }
    }
}

async fn open_line(
    resource: &VisaResource,
    baud_rate: u32,
    timeout: Duration,
) -> AppResult<LineTransport> {
    let stream: DynSerial = match resource {
        VisaResource::Serial { path } => {
            let port = open_serial_async(path, baud_rate, "DSP7265")
                .await
                .map_err(|e| DaqError::Connection(format!("{:#}", e)))?;
            Box::new(port)
        }
        VisaResource::Socket { host, port } => {
            let connect = tokio::net::TcpStream::connect((host.as_str(), *port));
            let stream = tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    DaqError::Connection(format!("connect to {}:{} timed out", host, port))
                })?
                .map_err(|e| DaqError::Connection(format!("connect to {}:{}: {}", host, port, e)))?;
            Box::new(stream)
        }
    };

    let line = LineTransport::new(stream, resource.to_resource_string(), timeout);
    line.clear(OPEN_DRAIN_MS).await;
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn parses_serial_and_socket_resources() {
        assert_eq!(
            VisaResource::parse("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            VisaResource::Serial {
                path: "/dev/ttyUSB0".into()
            }
        );
        assert_eq!(
            VisaResource::parse("TCPIP0::192.168.0.7::50000::SOCKET").unwrap(),
            VisaResource::Socket {
                host: "192.168.0.7".into(),
                port: 50000
            }
        );
        assert_eq!(
            VisaResource::parse("/dev/ttyUSB1").unwrap(),
            VisaResource::Serial {
                path: "/dev/ttyUSB1".into()
            }
        );
    }

    #[test]
    fn gpib_resource_points_at_prologix() {
        let err = VisaResource::parse("GPIB0::12::INSTR").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(ref m) if m.contains("Prologix")));
        assert!(VisaResource::parse("  ").is_err());
        assert!(VisaResource::parse("TCPIP0::host::notaport::SOCKET").is_err());
    }

    #[tokio::test]
    async fn line_transport_query_strips_nul_and_terminators() {
        let (host, device) = tokio::io::duplex(256);
        let transport = LineTransport::new(Box::new(device), "duplex", Duration::from_secs(1));

        let instrument = tokio::spawn(async move {
            let mut reader = BufReader::new(host);
            let mut cmd = Vec::new();
            reader.read_until(b'\r', &mut cmd).await.unwrap();
            reader.get_mut().write_all(b"\n1.000E+03\0\r\n").await.unwrap();
            cmd
        });

        let reply = transport.query("OF.").await.unwrap();
        assert_eq!(reply, "1.000E+03");
        assert_eq!(instrument.await.unwrap(), b"OF.\r");
    }

    #[tokio::test]
    async fn line_transport_times_out_as_device_command_error() {
        let (_host, device) = tokio::io::duplex(64);
        let transport =
            LineTransport::new(Box::new(device), "duplex", Duration::from_millis(20));
        let err = transport.query("ID").await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceCommand(_)));
    }

    #[tokio::test]
    async fn prologix_configures_controller_and_addresses_each_command() {
        let (host, device) = tokio::io::duplex(1024);
        let line = LineTransport::new(Box::new(device), "duplex", Duration::from_secs(1));

        let instrument = tokio::spawn(async move {
            let mut reader = BufReader::new(host);
            let mut seen = Vec::new();
            loop {
                let mut l = String::new();
                if reader.read_line(&mut l).await.unwrap() == 0 {
                    break;
                }
                let l = l.trim_end().to_string();
                let done = l == "++read eoi";
                seen.push(l);
                if done {
                    reader.get_mut().write_all(b"7265\r\n").await.unwrap();
                    break;
                }
            }
            seen
        });

        let transport = PrologixTransport::connect(line, 12).await.unwrap();
        assert_eq!(transport.query("ID").await.unwrap(), "7265");

        let seen = instrument.await.unwrap();
        assert_eq!(
            seen,
            vec!["++mode 1", "++auto 0", "++eoi 1", "++eos 3", "++addr 12", "ID", "++read eoi"]
        );
    }

    #[tokio::test]
    async fn prologix_rejects_out_of_range_address() {
        let (_host, device) = tokio::io::duplex(64);
        let line = LineTransport::new(Box::new(device), "duplex", Duration::from_millis(50));
        assert!(matches!(
            PrologixTransport::connect(line, 31).await,
            Err(DaqError::Configuration(_))
        ));
    }
}
