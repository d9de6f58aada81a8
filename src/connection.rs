// src/connection.rs - An identified, monitored link to one printer
use crate::communication::codec::Temperatures;
use crate::communication::protocol::{
    EngineLinks, ExecuteOptions, LinkStats, ProtocolEngine, ProtocolError, Reply,
};
use crate::communication::transport::{ConnectionError, PortOpener, Transport};
use crate::config::Config;
use crate::firmware::{Dialect, FirmwareIdentity, IDENTIFY_COMMAND};
use crate::monitor::{ConnectionMonitor, MonitorHandle};
use crate::print_job::{JobHandle, PrintJobError};
use crate::retry::{BreakerState, CircuitBreaker};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub type ConnectionHandle = Arc<Connection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Connected,
    Lost,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: LinkState,
    pub port: String,
    pub baud: u32,
    pub dialect: Option<Dialect>,
    pub display_name: Option<String>,
    pub checksums: bool,
    pub last_temperatures: Option<Temperatures>,
    pub reconnects: u32,
    pub breaker: BreakerState,
    pub stats: LinkStats,
}

pub struct Connection {
    port: String,
    baud: u32,
    opener: Arc<dyn PortOpener>,
    config: Config,
    links: EngineLinks,
    engine: RwLock<Arc<ProtocolEngine>>,
    identity: RwLock<Option<FirmwareIdentity>>,
    state: watch::Sender<LinkState>,
    active_job: Mutex<Option<JobHandle>>,
    monitor: Mutex<Option<MonitorHandle>>,
    reconnects: AtomicU32,
}

impl Connection {
    /// Open `port`, identify the firmware, agree on framing and start the monitor.
    /// Failing to open at all is reported straight back; nothing is retried here.
    pub async fn open(
        opener: Arc<dyn PortOpener>,
        port: &str,
        baud: u32,
        config: Config,
    ) -> Result<ConnectionHandle, ConnectionError> {
        tracing::info!("Connecting to {} at {} baud", port, baud);
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.failure_threshold,
            Duration::from_millis(config.breaker.open_timeout_ms),
        ));
        let links = EngineLinks::new(breaker);

        let transport = opener.open(port, baud).await?;
        let (engine, identity) = establish(transport, &config, &links).await?;
        tracing::info!(
            "Connected to {} on {} ({} baud, checksums {})",
            identity.display_name,
            port,
            baud,
            if engine.checksums_enabled() { "on" } else { "off" }
        );

        let (state, _) = watch::channel(LinkState::Connected);
        let connection = Arc::new(Connection {
            port: port.to_string(),
            baud,
            opener,
            config,
            links,
            engine: RwLock::new(engine),
            identity: RwLock::new(Some(identity)),
            state,
            active_job: Mutex::new(None),
            monitor: Mutex::new(None),
            reconnects: AtomicU32::new(0),
        });

        if connection.config.monitor.enabled {
            let handle = ConnectionMonitor::spawn(
                Arc::downgrade(&connection),
                connection.config.monitor.clone(),
                connection.config.reconnect.clone(),
            );
            *lock(&connection.monitor) = Some(handle);
        }
        Ok(connection)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> Arc<ProtocolEngine> {
        self.engine
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn identity(&self) -> Option<FirmwareIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn dialect(&self) -> Dialect {
        self.identity().map_or(Dialect::Unknown, |id| id.dialect)
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<String> {
        self.links.unsolicited.subscribe()
    }

    pub fn subscribe_temperatures(&self) -> watch::Receiver<Option<Temperatures>> {
        self.links.telemetry.subscribe()
    }

    pub fn latest_temperatures(&self) -> Option<Temperatures> {
        *self.links.telemetry.borrow()
    }

    pub fn command_options(&self) -> ExecuteOptions {
        self.config.connection.command_options()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectionStatus {
        let identity = self.identity();
        let engine = self.engine();
        let state = self.state();
        ConnectionStatus {
            connected: state == LinkState::Connected && engine.is_alive(),
            state,
            port: self.port.clone(),
            baud: self.baud,
            dialect: identity.as_ref().map(|id| id.dialect),
            display_name: identity.map(|id| id.display_name),
            checksums: engine.checksums_enabled(),
            last_temperatures: self.latest_temperatures(),
            reconnects: self.reconnect_count(),
            breaker: self.links.breaker.state(),
            stats: engine.stats(),
        }
    }

    fn ensure_connected(&self) -> Result<Arc<ProtocolEngine>, ProtocolError> {
        if self.state() != LinkState::Connected {
            return Err(ConnectionError::NotConnected.into());
        }
        Ok(self.engine())
    }

    /// Ad hoc command through the shared command slot.
    pub async fn send_command(&self, text: &str) -> Result<Reply, ProtocolError> {
        let engine = self.ensure_connected()?;
        engine.execute_collect(text, &self.command_options()).await
    }

    /// Run the dialect's bed leveling routine with the long leveling timeout.
    pub async fn run_leveling(&self) -> Result<Reply, ProtocolError> {
        let command = self
            .dialect()
            .profile()
            .leveling_command
            .ok_or_else(|| ProtocolError::Unsupported("bed leveling".to_string()))?;
        let engine = self.ensure_connected()?;
        let opts = ExecuteOptions::new(
            Duration::from_millis(self.config.connection.leveling_timeout_ms),
            0,
        );
        tracing::info!("Running bed leveling ({}) on {}", command, self.port);
        engine.execute_collect(command, &opts).await
    }

    /// Stop the machine regardless of any job. Same out-of-band path as a job's stop.
    pub async fn emergency_stop(&self) -> Result<(), ProtocolError> {
        if let Some(job) = self.active_job() {
            if job.emergency_stop().await {
                return Ok(());
            }
        }
        let stop = self.dialect().profile().stop_command;
        self.engine().emergency_stop(stop).await
    }

    pub fn active_job(&self) -> Option<JobHandle> {
        lock(&self.active_job)
            .as_ref()
            .filter(|job| !job.state().is_terminal())
            .cloned()
    }

    /// Claim the single job slot for `job`.
    pub(crate) fn attach_job(&self, job: &JobHandle) -> Result<(), PrintJobError> {
        let mut slot = lock(&self.active_job);
        if slot.as_ref().is_some_and(|j| !j.state().is_terminal()) {
            return Err(PrintJobError::JobActive(self.port.clone()));
        }
        *slot = Some(job.clone());
        Ok(())
    }

    fn fail_active_job(&self, reason: &str) {
        if let Some(job) = self.active_job() {
            if job.fail(reason) {
                tracing::error!("Job {} failed: {}", job.id(), reason);
            }
        }
    }

    /// Declared by the monitor after repeated poll failures.
    pub(crate) async fn mark_lost(&self, reason: &str) {
        if self.state() == LinkState::Closed {
            return;
        }
        tracing::error!("Connection to {} lost: {}", self.port, reason);
        self.state.send_replace(LinkState::Lost);
        self.fail_active_job(&format!("connection lost: {}", reason));
        self.engine().shutdown().await;
    }

    /// Reopen the same port and baud, re-identify and swap in a fresh engine.
    pub(crate) async fn reconnect(&self) -> Result<(), ConnectionError> {
        if self.state() == LinkState::Closed {
            return Err(ConnectionError::NotConnected);
        }
        self.state.send_replace(LinkState::Reconnecting);
        let result = async {
            let transport = self.opener.open(&self.port, self.baud).await?;
            establish(transport, &self.config, &self.links).await
        }
        .await;

        match result {
            Ok((engine, identity)) => {
                if self.state() == LinkState::Closed {
                    engine.shutdown().await;
                    return Err(ConnectionError::NotConnected);
                }
                self.links.breaker.reset();
                *self.engine.write().unwrap_or_else(|e| e.into_inner()) = engine;
                *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(identity);
                self.reconnects.fetch_add(1, Ordering::SeqCst);
                self.state.send_replace(LinkState::Connected);
                tracing::info!("Reconnected to {} at {} baud", self.port, self.baud);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(LinkState::Lost);
                Err(e)
            }
        }
    }

    /// Explicit disconnect. An unfinished job is failed, never dropped silently.
    pub async fn close(&self) {
        if self.state.send_replace(LinkState::Closed) == LinkState::Closed {
            return;
        }
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
        self.fail_active_job("disconnected");
        lock(&self.active_job).take();
        self.engine().shutdown().await;
        tracing::info!("Disconnected from {}", self.port);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identification and framing handshake on a freshly opened transport.
async fn establish(
    transport: Arc<dyn Transport>,
    config: &Config,
    links: &EngineLinks,
) -> Result<(Arc<ProtocolEngine>, FirmwareIdentity), ConnectionError> {
    let settings = &config.connection;
    if settings.settle_ms > 0 {
        tokio::time::sleep(Duration::from_millis(settings.settle_ms)).await;
    }
    transport.clear_input().await?;

    let port = transport.name().to_string();
    let engine = ProtocolEngine::start(
        transport,
        false,
        config.retry.policy(settings.max_retries),
        links.clone(),
    );

    let ident_opts = ExecuteOptions::new(Duration::from_millis(settings.identify_timeout_ms), 1);
    let identity = match engine.execute_collect(IDENTIFY_COMMAND, &ident_opts).await {
        Ok(reply) => {
            let raw = reply.info_lines.join("\n");
            FirmwareIdentity::classify(&raw).unwrap_or_else(|| FirmwareIdentity::unknown(raw))
        }
        // It answered, just not to this command
        Err(ProtocolError::Rejected { reason, .. }) => FirmwareIdentity::unknown(reason),
        Err(e) => {
            engine.shutdown().await;
            return Err(handshake_error(&port, e));
        }
    };
    tracing::info!(
        "Identified {} as {} ({})",
        port,
        identity.dialect,
        identity.display_name
    );

    let checksums = settings
        .checksums
        .resolve(identity.capabilities.supports_checksums);
    engine.set_checksums(checksums);
    if checksums {
        if let Err(e) = engine.reset_line_numbers(&settings.command_options()).await {
            engine.shutdown().await;
            return Err(handshake_error(&port, e));
        }
    }
    Ok((engine, identity))
}

fn handshake_error(port: &str, error: ProtocolError) -> ConnectionError {
    match error {
        ProtocolError::Connection(e) => e,
        other => ConnectionError::NoResponse(format!("{} ({})", port, other)),
    }
}
