// Shared fixtures for the simulator-backed integration tests
#![allow(dead_code)]

use krusty_link::config::Config;
use krusty_link::simulator::{FaultPlan, SimulatedDevice, SimulatedPorts};
use krusty_link::{CommandSource, Dialect, JobHandle, JobState, PrinterHost, ProgressSnapshot};
use std::sync::Arc;
use std::time::Duration;

pub const PORT: &str = "/dev/ttyUSB0";
pub const BAUD: u32 = 115200;

/// Config tuned for the in-process bus: no settle delay, short timeouts, no monitor.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.connection.settle_ms = 0;
    config.connection.command_timeout_ms = 500;
    config.connection.identify_timeout_ms = 500;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config.discovery.probe_timeout_ms = 50;
    config.discovery.probe_polls = 4;
    config.monitor.enabled = false;
    config
}

/// Same as `fast_config` with a quick liveness monitor.
pub fn monitored_config() -> Config {
    let mut config = fast_config();
    config.monitor.enabled = true;
    config.monitor.poll_interval_ms = 50;
    config.monitor.poll_timeout_ms = 200;
    config.monitor.failure_threshold = 2;
    config.monitor.auto_reconnect = true;
    config
}

pub fn bus(dialect: Dialect, faults: FaultPlan) -> SimulatedPorts {
    let ports = SimulatedPorts::new();
    ports.attach(SimulatedDevice::new(PORT, dialect, BAUD).with_faults(faults));
    ports
}

pub fn host(ports: &SimulatedPorts, config: Config) -> PrinterHost {
    PrinterHost::new(Arc::new(ports.clone()), config)
}

/// `count` distinct moves, so every line is recognisable in the firmware log.
pub fn moves(count: usize) -> CommandSource {
    CommandSource::from_lines((1..=count).map(move_line))
}

pub fn move_line(n: usize) -> String {
    format!("G1 X{} Y{} F1500", n, n * 2)
}

pub async fn finish(job: &JobHandle) -> ProgressSnapshot {
    tokio::time::timeout(Duration::from_secs(10), job.wait())
        .await
        .expect("job did not finish in time")
}

/// Poll until the job has had `lines` acknowledged.
pub async fn wait_for_lines(job: &JobHandle, lines: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while job.progress().lines_sent < lines {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("job never reached the expected line");
}

pub async fn wait_for_state(job: &JobHandle, state: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while job.state() != state {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("job never reached the expected state");
}
