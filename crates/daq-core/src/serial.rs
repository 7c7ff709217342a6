//! Async byte-stream plumbing shared by instrument drivers.
//!
//! Requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! daq-core = { path = "../daq-core", features = ["serial"] }
//! ```
//!
//! - [`SerialPortIO`]: anything `AsyncRead + AsyncWrite` (serial port, TCP
//!   socket, `tokio::io::DuplexStream` in tests)
//! - [`DynSerial`] / [`SharedPort`]: type-erased and mutex-shared handles
//! - [`open_serial_async`]: open a port off the async runtime, 8N1
//! - [`drain_serial_buffer`]: discard stale bytes before a command
//!
//! ```rust,ignore
//! let port = open_serial_async("/dev/ttyUSB0", 9600, "DSP7265").await?;
//! let shared = wrap_shared(Box::new(port));
//! let mut guard = shared.lock().await;
//! drain_serial_buffer(guard.get_mut(), 50).await;
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

/// Trait alias for async byte-stream I/O.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Stream shared between tasks, buffered for delimiter-based reads.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a type-erased stream into a [`SharedPort`].
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Open a serial port on a blocking thread with 8N1 and no flow control.
///
/// # Errors
///
/// Returns an error naming the device and path if the port cannot be opened.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let device = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open {} serial port: {}", device, path))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Read and discard whatever arrives within `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shared_port_reads_until_cr() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = wrap_shared(Box::new(device));
        let other = port.clone();

        host.write_all(b"7265\r").await.unwrap();

        let mut guard = other.lock().await;
        let mut buf = Vec::new();
        guard.read_until(b'\r', &mut buf).await.unwrap();
        assert_eq!(buf, b"7265\r");
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale 1.0E+3\r").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 13);
    }
}
