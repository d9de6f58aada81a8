// src/discovery.rs - Finding printers: which port, which baud, which firmware
use crate::communication::transport::{ConnectionError, PortOpener, Transport};
use crate::config::DiscoveryConfig;
use crate::firmware::{Dialect, FirmwareIdentity, IDENTIFY_COMMAND, is_meaningful};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Discovery worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCandidate {
    pub port: String,
    pub baud: u32,
    pub dialect: Dialect,
    pub display_name: String,
    pub identity: FirmwareIdentity,
}

/// Ports whose name looks like a USB-serial adapter or a CDC-ACM board.
pub fn is_usb_serial_port(path: &str) -> bool {
    if path.contains("/serial/by-id/usb-") {
        return true;
    }
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    const PREFIXES: [&str; 6] = [
        "ttyUSB",
        "ttyACM",
        "cu.usbserial",
        "cu.usbmodem",
        "tty.usbserial",
        "tty.usbmodem",
    ];
    if PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    match (name.get(..3), name.get(3..)) {
        (Some(prefix), Some(number)) => {
            prefix.eq_ignore_ascii_case("COM")
                && !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Scan every candidate port. Ports are probed concurrently (bounded by
/// `max_workers`); baud rates on a single port are tried one after another.
/// Returns whatever was found before `timeout`, sorted by port.
pub async fn detect_printers(
    opener: Arc<dyn PortOpener>,
    config: &DiscoveryConfig,
    timeout: Duration,
) -> Vec<DeviceCandidate> {
    let ports: Vec<String> = opener
        .available_ports()
        .into_iter()
        .filter(|p| config.include_all_ports || is_usb_serial_port(p))
        .collect();
    if ports.is_empty() {
        tracing::info!("No candidate serial ports found");
        return vec![];
    }
    tracing::info!("Scanning {} port(s) at {:?} baud", ports.len(), config.baud_rates);

    let workers = Arc::new(Semaphore::new(config.max_workers.max(1)));
    let mut scans = JoinSet::new();
    for port in ports {
        let opener = opener.clone();
        let workers = workers.clone();
        let config = config.clone();
        scans.spawn(async move {
            let _permit = workers.acquire_owned().await.ok()?;
            scan_port(opener.as_ref(), &port, &config).await
        });
    }

    let deadline = Instant::now() + timeout;
    let mut found = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, scans.join_next()).await {
            Ok(Some(Ok(Some(candidate)))) => found.push(candidate),
            Ok(Some(Ok(None))) => {}
            Ok(Some(Err(e))) => tracing::warn!("{}", DiscoveryError::Worker(e.to_string())),
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("Discovery timed out; {} scan(s) abandoned", scans.len());
                scans.abort_all();
                break;
            }
        }
    }
    found.sort_by(|a, b| a.port.cmp(&b.port));
    tracing::info!("Discovery found {} printer(s)", found.len());
    found
}

/// First baud on `port` that yields an intelligible identification.
async fn scan_port(
    opener: &dyn PortOpener,
    port: &str,
    config: &DiscoveryConfig,
) -> Option<DeviceCandidate> {
    for &baud in &config.baud_rates {
        match probe_port(opener, port, baud, config).await {
            Ok(Some(identity)) => {
                tracing::info!("Found {} on {} at {} baud", identity.display_name, port, baud);
                return Some(DeviceCandidate {
                    port: port.to_string(),
                    baud,
                    dialect: identity.dialect,
                    display_name: identity.display_name.clone(),
                    identity,
                });
            }
            Ok(None) => tracing::debug!("No intelligible reply on {} at {} baud", port, baud),
            Err(DiscoveryError::Connection(ConnectionError::PortNotFound(_))) => {
                tracing::debug!("{} disappeared during scan", port);
                return None;
            }
            Err(e) => tracing::debug!("Probe of {} at {} baud failed: {}", port, baud, e),
        }
    }
    None
}

/// Open `port` at `baud`, ask it to identify itself, and close it again.
pub async fn probe_port(
    opener: &dyn PortOpener,
    port: &str,
    baud: u32,
    config: &DiscoveryConfig,
) -> Result<Option<FirmwareIdentity>, DiscoveryError> {
    let transport = opener.open(port, baud).await?;
    let result = probe_transport(transport.as_ref(), config).await;
    transport.close().await;
    result
}

async fn probe_transport(
    transport: &dyn Transport,
    config: &DiscoveryConfig,
) -> Result<Option<FirmwareIdentity>, DiscoveryError> {
    transport.clear_input().await?;
    // A bare newline flushes any half-line the board may still be holding
    transport.write_line("").await?;
    transport.write_line(IDENTIFY_COMMAND).await?;

    let poll = Duration::from_millis(config.probe_timeout_ms);
    let mut lines: Vec<String> = Vec::new();
    for _ in 0..config.probe_polls {
        match transport.read_line(poll).await? {
            Some(line) => {
                let is_ack = line == "ok" || line.starts_with("ok ");
                if is_ack && is_meaningful(&lines.join("\n")) {
                    break;
                }
                if !is_ack {
                    lines.push(line);
                }
            }
            None if is_meaningful(&lines.join("\n")) => break,
            None => {}
        }
    }
    Ok(FirmwareIdentity::classify(&lines.join("\n")))
}
