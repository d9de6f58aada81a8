// src/communication/transport.rs - Byte-level serial transport and port opening
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Port not found: {0}")]
    PortNotFound(String),
    #[error("Failed to open {port} at {baud} baud: {reason}")]
    Open {
        port: String,
        baud: u32,
        reason: String,
    },
    #[error("I/O error on {port}: {reason}")]
    Io { port: String, reason: String },
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("No response from {0}")]
    NoResponse(String),
    #[error("Not connected")]
    NotConnected,
}

impl ConnectionError {
    /// I/O trouble on a link that was working is worth a reconnect; a port that never opened is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::Io { .. } | ConnectionError::Closed(_))
    }
}

/// A single open link to a controller. Writes go out as whole lines; reads come back as
/// whole lines with the terminator stripped.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    fn baud(&self) -> u32;

    async fn write_line(&self, line: &str) -> Result<(), ConnectionError>;

    /// `Ok(None)` means nothing complete arrived before `timeout`.
    async fn read_line(&self, timeout: Duration) -> Result<Option<String>, ConnectionError>;

    /// Drop any stale bytes the device sent before we started listening.
    async fn clear_input(&self) -> Result<(), ConnectionError>;

    async fn close(&self);
}

/// Something that can enumerate ports and open them. Real serial hardware and the
/// simulated firmware both plug in here.
#[async_trait]
pub trait PortOpener: Send + Sync {
    fn available_ports(&self) -> Vec<String>;

    async fn open(&self, port: &str, baud: u32) -> Result<Arc<dyn Transport>, ConnectionError>;
}

/// Accumulates raw bytes and hands out complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next non-empty line, lossily decoded. Partial lines stay buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.pending.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_end_matches(['\r', '\n']).trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Serial transport on top of serial2-tokio.
pub struct SerialTransport {
    name: String,
    baud: u32,
    port: serial2_tokio::SerialPort,
    buffer: Mutex<LineBuffer>,
    closed: AtomicBool,
}

impl SerialTransport {
    pub fn open(port_name: &str, baud: u32) -> Result<Self, ConnectionError> {
        let port = serial2_tokio::SerialPort::open(port_name, baud).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConnectionError::PortNotFound(port_name.to_string())
            } else {
                ConnectionError::Open {
                    port: port_name.to_string(),
                    baud,
                    reason: e.to_string(),
                }
            }
        })?;
        tracing::info!("Opened serial port {} at {} baud", port_name, baud);
        Ok(Self {
            name: port_name.to_string(),
            baud,
            port,
            buffer: Mutex::new(LineBuffer::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn io_error(&self, e: std::io::Error) -> ConnectionError {
        ConnectionError::Io {
            port: self.name.clone(),
            reason: e.to_string(),
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectionError::Closed(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        tracing::debug!("Serial TX [{}]: {}", self.name, line);
        self.port
            .write_all(&bytes)
            .await
            .map_err(|e| self.io_error(e))
    }

    async fn read_line(&self, timeout: Duration) -> Result<Option<String>, ConnectionError> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        let mut buffer = self.buffer.lock().await;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(line) = buffer.next_line() {
                tracing::debug!("Serial RX [{}]: {}", self.name, line);
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.port.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(ConnectionError::Closed(self.name.clone())),
                Ok(Ok(n)) => buffer.extend(&chunk[..n]),
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Ok(Err(e)) => return Err(self.io_error(e)),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn clear_input(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.buffer.lock().await.clear();
        self.port
            .discard_input_buffer()
            .map_err(|e| self.io_error(e))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Closed serial port {}", self.name);
        }
    }
}

/// Opens real serial ports.
#[derive(Debug, Clone, Default)]
pub struct SerialPortOpener;

#[async_trait]
impl PortOpener for SerialPortOpener {
    fn available_ports(&self) -> Vec<String> {
        match serial2_tokio::SerialPort::available_ports() {
            Ok(paths) => paths.iter().map(|p| p.display().to_string()).collect(),
            Err(e) => {
                tracing::error!("Failed to enumerate serial ports: {}", e);
                vec![]
            }
        }
    }

    async fn open(&self, port: &str, baud: u32) -> Result<Arc<dyn Transport>, ConnectionError> {
        let transport = SerialTransport::open(port, baud)?;
        Ok(Arc::new(transport))
    }
}
