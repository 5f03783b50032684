//! Serial capture
//!
//! Native version of the program the relay runs next to the link program:
//! read the console cable in small chunks, decode as UTF-8 (lossy) and
//! append to the capture file, flushing after every chunk so a tailing
//! reader sees data immediately. The port is opened non-exclusively so
//! the link program can hold it at the same time.

use super::session::CancellationToken;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Bytes requested per read
pub const CHUNK_SIZE: usize = 100;

/// Serial read timeout
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Capture errors
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Device does not exist
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Device exists but cannot be opened
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Other serial port failure
    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    /// Read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Capture parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Serial device path
    pub device: String,
    /// Line speed
    pub baud_rate: u32,
    /// File decoded text is appended to
    pub output: PathBuf,
    /// Bytes per read
    pub chunk_size: usize,
    /// Read timeout
    pub read_timeout: Duration,
    /// Also write decoded text to stdout
    pub echo: bool,
}

impl CaptureConfig {
    /// Default chunk size and timeout, no echo
    pub fn new(device: &str, baud_rate: u32, output: impl Into<PathBuf>) -> Self {
        Self {
            device: device.to_string(),
            baud_rate,
            output: output.into(),
            chunk_size: CHUNK_SIZE,
            read_timeout: READ_TIMEOUT,
            echo: false,
        }
    }
}

/// Counters for a capture run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    /// Raw bytes read from the port
    pub bytes_read: u64,
    /// Bytes of decoded text written
    pub bytes_written: u64,
    /// Non-empty reads
    pub chunks: u64,
}

/// Copy decoded chunks from `reader` to `sink` until cancelled or the
/// reader reports end of stream. Read timeouts are treated as "no data".
pub fn capture_loop<R, W>(
    reader: &mut R,
    sink: &mut W,
    mut echo: Option<&mut dyn Write>,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<CaptureStats, CaptureError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut stats = CaptureStats::default();

    while !cancel.is_cancelled() {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let text = String::from_utf8_lossy(&buffer[..n]);
        sink.write_all(text.as_bytes())?;
        sink.flush()?;

        if let Some(out) = echo.as_mut() {
            out.write_all(text.as_bytes())?;
            out.flush()?;
        }

        stats.bytes_read += n as u64;
        stats.bytes_written += text.len() as u64;
        stats.chunks += 1;
    }

    Ok(stats)
}

fn open_port(config: &CaptureConfig) -> Result<Box<dyn serialport::SerialPort>, CaptureError> {
    let builder = serialport::new(&config.device, config.baud_rate).timeout(config.read_timeout);

    let map_err = |e: serialport::Error| match e.kind() {
        serialport::ErrorKind::NoDevice => CaptureError::PortNotFound(config.device.clone()),
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            CaptureError::PermissionDenied(config.device.clone())
        }
        _ => CaptureError::Serial(e),
    };

    #[cfg(unix)]
    {
        let mut port = builder.open_native().map_err(map_err)?;
        port.set_exclusive(false)?;
        Ok(Box::new(port))
    }

    #[cfg(not(unix))]
    {
        builder.open().map_err(map_err)
    }
}

/// Open the serial device and capture into `config.output` until cancelled
pub fn run_capture(
    config: &CaptureConfig,
    cancel: &CancellationToken,
) -> Result<CaptureStats, CaptureError> {
    let mut port = open_port(config)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.output)?;

    info!(
        device = %config.device,
        baud = config.baud_rate,
        output = %config.output.display(),
        "Capture started"
    );

    let mut stdout = io::stdout();
    let echo: Option<&mut dyn Write> = if config.echo { Some(&mut stdout) } else { None };
    let stats = capture_loop(&mut *port, &mut file, echo, config.chunk_size, cancel)?;

    debug!(?stats, "Capture finished");
    Ok(stats)
}

/// Serial ports present on this machine
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, CaptureError> {
    Ok(serialport::available_ports()?)
}
