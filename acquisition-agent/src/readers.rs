//! Peripheral readers
//!
//! Stateless one-shot reads from a TCP socket on localhost or a serial line.
//! Both readers share the same contract: they never fail, every transport
//! problem comes back as `status = -1` with the error text.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serialport::{DataBits, Parity, SerialPortType, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::error::AgentError;
use crate::protocol::PeripheralConfig;

/// Upper bound of a single capture
pub const READ_BUFFER_SIZE: usize = 1_000_000;

/// Read timeout when a command has been written to the device
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const CHUNK_SIZE: usize = 64 * 1024;

/// `(status, error, reply)` triple returned by every reader
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadOutcome {
    pub status: i32,
    pub error: String,
    pub reply: String,
}

impl ReadOutcome {
    pub fn success(reply: String) -> Self {
        Self {
            status: 0,
            error: String::new(),
            reply,
        }
    }

    pub fn failure(error: impl std::fmt::Display) -> Self {
        Self {
            status: -1,
            error: error.to_string(),
            reply: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Serial port visible on this machine
#[derive(Debug, Clone, Serialize)]
pub struct CommPort {
    pub name: String,
    pub kind: String,
}

/// Validated serial line settings
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub device: String,
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
}

impl SerialSettings {
    pub fn from_config(config: &PeripheralConfig) -> Result<Self, AgentError> {
        let device = config
            .device
            .clone()
            .ok_or(AgentError::MissingPeripheralField("device"))?;

        Ok(Self {
            device,
            baud: config.baud,
            parity: parse_parity(&config.parity)?,
            data_bits: parse_data_bits(config.bytesize)?,
            stop_bits: stop_bits_from_code(config.stopbits)?,
        })
    }
}

fn parse_parity(parity: &str) -> Result<Parity, AgentError> {
    match parity.trim().to_ascii_uppercase().as_str() {
        "N" | "NONE" | "" => Ok(Parity::None),
        "E" | "EVEN" => Ok(Parity::Even),
        "O" | "ODD" => Ok(Parity::Odd),
        _ => Err(AgentError::InvalidSerialSetting {
            setting: "parity",
            value: parity.to_string(),
        }),
    }
}

fn parse_data_bits(bytesize: u8) -> Result<DataBits, AgentError> {
    match bytesize {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(AgentError::InvalidSerialSetting {
            setting: "bytesize",
            value: other.to_string(),
        }),
    }
}

/// Map the stop-bit code (0 = one, 1 = one and a half, 2 = two).
///
/// One and a half stop bits cannot be driven by the serial backend.
pub fn stop_bits_from_code(code: u8) -> Result<StopBits, AgentError> {
    match code {
        0 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(AgentError::InvalidSerialSetting {
            setting: "stopbits",
            value: other.to_string(),
        }),
    }
}

/// Turn a poll interval in seconds into a usable timeout
pub fn interval_timeout(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds.min(86_400.0))
    } else {
        Duration::from_secs(1)
    }
}

/// Poll a TCP instrument listening on `localhost:port`
pub async fn read_tcp(port: u16, poll_interval: f64, command: &str) -> ReadOutcome {
    let limit = if command.is_empty() {
        interval_timeout(poll_interval)
    } else {
        COMMAND_TIMEOUT
    };

    match read_tcp_inner(port, limit, command).await {
        Ok(reply) => ReadOutcome::success(reply),
        Err(e) => ReadOutcome::failure(format!("{:#}", e)),
    }
}

async fn read_tcp_inner(port: u16, limit: Duration, command: &str) -> Result<String> {
    let deadline = Instant::now() + limit;

    let mut stream = timeout(limit, TcpStream::connect(("localhost", port)))
        .await
        .map_err(|_| anyhow!("connection to localhost:{} timed out", port))?
        .with_context(|| format!("connection to localhost:{} failed", port))?;

    if !command.is_empty() {
        stream
            .write_all(command.as_bytes())
            .await
            .context("failed to write command")?;
    }

    let mut data = Vec::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, stream.read(&mut chunk)).await {
            Err(_) if data.is_empty() => bail!("timed out waiting for data on localhost:{}", port),
            Err(_) => break,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let take = n.min(READ_BUFFER_SIZE - data.len());
                data.extend_from_slice(&chunk[..take]);
                if data.len() >= READ_BUFFER_SIZE || chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Ok(Err(e)) => return Err(e).context("read failed"),
        }
    }

    debug!("Read {} bytes from localhost:{}", data.len(), port);
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Poll a serial instrument
pub async fn read_serial(settings: SerialSettings, poll_interval: f64, command: &str) -> ReadOutcome {
    let limit = if command.is_empty() {
        interval_timeout(poll_interval / 2.0)
    } else {
        COMMAND_TIMEOUT
    };
    let command = command.to_string();

    let result = tokio::task::spawn_blocking(move || read_serial_blocking(&settings, limit, &command))
        .await
        .map_err(|e| anyhow!("serial read task failed: {}", e))
        .and_then(|r| r);

    match result {
        Ok(reply) => ReadOutcome::success(reply),
        Err(e) => ReadOutcome::failure(format!("{:#}", e)),
    }
}

fn read_serial_blocking(settings: &SerialSettings, limit: Duration, command: &str) -> Result<String> {
    let mut port = serialport::new(&settings.device, settings.baud)
        .data_bits(settings.data_bits)
        .parity(settings.parity)
        .stop_bits(settings.stop_bits)
        .timeout(limit)
        .open()
        .with_context(|| format!("failed to open {}", settings.device))?;

    if !command.is_empty() {
        port.write_all(command.as_bytes())
            .context("failed to write command")?;
        port.flush().context("failed to flush command")?;
    }

    let mut data = vec![0u8; READ_BUFFER_SIZE];

    // Blocks until the line has something to say
    let mut filled = match port.read(&mut data) {
        Ok(n) => n,
        Err(e) if e.kind() == ErrorKind::TimedOut => {
            bail!("timed out waiting for data on {}", settings.device)
        }
        Err(e) => return Err(e).with_context(|| format!("read from {} failed", settings.device)),
    };

    while filled < READ_BUFFER_SIZE {
        let pending = port.bytes_to_read().context("failed to query pending bytes")? as usize;
        if pending == 0 {
            break;
        }
        let end = (filled + pending).min(READ_BUFFER_SIZE);
        match port.read(&mut data[filled..end]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::TimedOut => break,
            Err(e) => return Err(e).with_context(|| format!("read from {} failed", settings.device)),
        }
    }

    data.truncate(filled);
    debug!("Read {} bytes from {}", filled, settings.device);
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Enumerate serial ports
pub fn list_comm_ports() -> Result<Vec<CommPort>> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;

    Ok(ports
        .into_iter()
        .map(|p| CommPort {
            name: p.port_name,
            kind: match p.port_type {
                SerialPortType::UsbPort(_) => "usb",
                SerialPortType::PciPort => "pci",
                SerialPortType::BluetoothPort => "bluetooth",
                SerialPortType::Unknown => "unknown",
            }
            .to_string(),
        })
        .collect())
}
