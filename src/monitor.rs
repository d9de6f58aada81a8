// src/monitor.rs - Background link health polling and automatic reconnection
use crate::communication::protocol::{ExecuteOptions, ProtocolError};
use crate::config::{MonitorConfig, ReconnectConfig};
use crate::connection::{Connection, LinkState};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const TEMPERATURE_QUERY: &str = "M105";
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Owned by the connection; dropping it leaves the task running until the connection goes away.
pub struct MonitorHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let mut task = self.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

enum PollOutcome {
    Healthy,
    /// Not evidence either way (a stop in progress, a rejected query).
    Inconclusive,
    Failed(String),
}

pub struct ConnectionMonitor {
    connection: Weak<Connection>,
    config: MonitorConfig,
    reconnect: ReconnectConfig,
    consecutive_failures: u32,
}

impl ConnectionMonitor {
    pub fn spawn(
        connection: Weak<Connection>,
        config: MonitorConfig,
        reconnect: ReconnectConfig,
    ) -> MonitorHandle {
        let (shutdown, rx) = broadcast::channel(1);
        let monitor = ConnectionMonitor {
            connection,
            config,
            reconnect,
            consecutive_failures: 0,
        };
        let task = tokio::spawn(monitor.run(rx));
        MonitorHandle { shutdown, task }
    }

    async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let Some(mut unsolicited) = self.connection.upgrade().map(|c| c.subscribe_unsolicited())
        else {
            return;
        };
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the handshake just proved the link.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("Connection monitor shutting down");
                    break;
                }
                line = unsolicited.recv() => match line {
                    Ok(line) => tracing::debug!("Unsolicited: {}", line),
                    Err(RecvError::Lagged(n)) => tracing::warn!("Monitor skipped {} unsolicited lines", n),
                    Err(RecvError::Closed) => break,
                },
                _ = interval.tick() => {
                    if !self.poll_cycle(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    /// One poll. Returns false when the monitor should exit.
    async fn poll_cycle(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let Some(connection) = self.connection.upgrade() else {
            return false;
        };
        match connection.state() {
            LinkState::Closed => return false,
            LinkState::Connected => {}
            LinkState::Lost | LinkState::Reconnecting => return true,
        }

        match self.poll(&connection).await {
            PollOutcome::Healthy => self.consecutive_failures = 0,
            PollOutcome::Inconclusive => {}
            PollOutcome::Failed(reason) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    "Poll of {} failed ({}/{}): {}",
                    connection.port(),
                    self.consecutive_failures,
                    self.config.failure_threshold,
                    reason
                );
                if self.consecutive_failures >= self.config.failure_threshold {
                    connection.mark_lost(&reason).await;
                    self.consecutive_failures = 0;
                    if !self.config.auto_reconnect {
                        return false;
                    }
                    let port = connection.port().to_string();
                    drop(connection);
                    return self.reconnect_loop(&port, shutdown).await;
                }
            }
        }
        true
    }

    async fn poll(&self, connection: &Connection) -> PollOutcome {
        let engine = connection.engine();
        if !engine.is_alive() {
            return PollOutcome::Failed("link closed".to_string());
        }
        let opts = ExecuteOptions::new(Duration::from_millis(self.config.poll_timeout_ms), 0);
        match engine.execute(TEMPERATURE_QUERY, &opts).await {
            Ok(_) => PollOutcome::Healthy,
            Err(e) if e.is_link_failure() => PollOutcome::Failed(e.to_string()),
            Err(ProtocolError::Rejected { reason, .. }) => {
                tracing::debug!("Temperature query rejected: {}", reason);
                PollOutcome::Inconclusive
            }
            Err(_) => PollOutcome::Inconclusive,
        }
    }

    /// Capped exponential backoff until the port comes back or we are told to stop.
    /// The connection is only borrowed per attempt, so dropping it ends the loop.
    async fn reconnect_loop(&self, port: &str, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let policy = self.reconnect.policy();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if policy.max_retries > 0 && attempt > policy.max_retries {
                tracing::error!(
                    "Giving up on {} after {} reconnect attempts",
                    port,
                    policy.max_retries
                );
                return false;
            }
            let delay = policy.delay_for(attempt);
            tokio::select! {
                _ = shutdown.recv() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(connection) = self.connection.upgrade() else {
                tracing::debug!("Connection to {} dropped, no more reconnects", port);
                return false;
            };
            if connection.state() == LinkState::Closed {
                return false;
            }
            match connection.reconnect().await {
                Ok(()) => return true,
                Err(e) => tracing::warn!("Reconnect attempt {} to {} failed: {}", attempt, port, e),
            }
        }
    }
}
