// src/host.rs - Public entry points for callers that drive printers
use crate::communication::codec::AckEvent;
use crate::communication::protocol::ProtocolError;
use crate::communication::transport::{ConnectionError, PortOpener, SerialPortOpener};
use crate::config::Config;
use crate::connection::{Connection, ConnectionHandle, ConnectionStatus};
use crate::discovery::{self, DeviceCandidate};
use crate::gcode_source::CommandSource;
use crate::print_job::{JobHandle, PrintJobError, ProgressObserver, ProgressSnapshot};
use std::sync::Arc;
use std::time::Duration;

/// Facade over discovery, connections and jobs. Holds no global state: every
/// connection gets its own engine, monitor and circuit breaker.
#[derive(Clone)]
pub struct PrinterHost {
    opener: Arc<dyn PortOpener>,
    config: Config,
}

impl PrinterHost {
    pub fn new(opener: Arc<dyn PortOpener>, config: Config) -> Self {
        Self { opener, config }
    }

    /// Host on real serial hardware.
    pub fn serial(config: Config) -> Self {
        Self::new(Arc::new(SerialPortOpener), config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn detect_printers(&self, timeout: Duration) -> Vec<DeviceCandidate> {
        discovery::detect_printers(self.opener.clone(), &self.config.discovery, timeout).await
    }

    pub async fn connect(&self, port: &str, baud: u32) -> Result<ConnectionHandle, ConnectionError> {
        Connection::open(self.opener.clone(), port, baud, self.config.clone()).await
    }

    /// Connect to the configured port, or the first printer discovery turns up.
    pub async fn connect_auto(&self, timeout: Duration) -> Result<ConnectionHandle, ConnectionError> {
        if let (Some(port), Some(baud)) = (&self.config.connection.port, self.config.connection.baud) {
            return self.connect(port, baud).await;
        }
        let candidates = self.detect_printers(timeout).await;
        let first = candidates
            .into_iter()
            .find(|c| self.config.connection.port.as_ref().is_none_or(|p| *p == c.port))
            .ok_or_else(|| ConnectionError::PortNotFound("no printer detected".to_string()))?;
        self.connect(&first.port, first.baud).await
    }

    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        handle.close().await;
    }

    pub async fn send_command(
        &self,
        handle: &ConnectionHandle,
        text: &str,
    ) -> Result<AckEvent, ProtocolError> {
        handle.send_command(text).await.map(|reply| reply.ack)
    }

    pub fn stream(
        &self,
        handle: &ConnectionHandle,
        source: CommandSource,
        on_progress: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<JobHandle, PrintJobError> {
        JobHandle::start(handle, source, on_progress)
    }

    pub fn pause(&self, job: &JobHandle) -> bool {
        job.pause()
    }

    pub fn resume(&self, job: &JobHandle) -> bool {
        job.resume()
    }

    pub async fn emergency_stop(&self, job: &JobHandle) -> bool {
        job.emergency_stop().await
    }

    pub fn get_progress(&self, job: &JobHandle) -> ProgressSnapshot {
        job.progress()
    }

    pub fn get_connection_status(&self, handle: &ConnectionHandle) -> ConnectionStatus {
        handle.status()
    }
}
