// Link loss, reconnection and the liveness monitor
mod common;

use common::*;
use krusty_link::retry::BreakerState;
use krusty_link::simulator::{FaultPlan, SimulatedDevice, SimulatedPorts};
use krusty_link::{ConnectionError, Dialect, JobState, LinkState, ProtocolError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_unplug_fails_job_then_reconnects() {
    let ports = SimulatedPorts::new();
    ports.attach(
        SimulatedDevice::new(PORT, Dialect::GenericMarlin, BAUD)
            .with_faults(FaultPlan::new().disconnect_at(4))
            .with_auto_replug(Duration::from_millis(150)),
    );
    let host = host(&ports, monitored_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut states = conn.subscribe_state();
    let recorder = {
        let seen = seen.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.lock().unwrap().push(state);
            }
        })
    };

    let job = host.stream(&conn, moves(10), None).unwrap();
    let done = finish(&job).await;
    assert_eq!(done.state, JobState::Failed);
    let failure = done.failure.unwrap();
    assert_eq!(failure.line_number, 4);
    assert_eq!(failure.line, move_line(4));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !(conn.reconnect_count() == 1 && conn.state() == LinkState::Connected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor never re-established the link");

    let reply = conn.send_command("M105").await.unwrap();
    assert!(reply.ack.temperatures().is_some());
    assert!(conn.status().connected);
    assert_eq!(conn.status().reconnects, 1);
    assert_eq!(ports.open_count(PORT), 2);

    let states = seen.lock().unwrap().clone();
    assert!(states.contains(&LinkState::Lost));
    assert_eq!(states.last(), Some(&LinkState::Connected));

    // A failed job never resumes on its own after the reconnect
    assert_eq!(job.state(), JobState::Failed);
    host.disconnect(&conn).await;
    recorder.abort();
}

#[tokio::test]
async fn test_monitor_fails_paused_job_when_link_drops() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().with_response_delay(Duration::from_millis(5)),
    );
    let config = monitored_config();
    let cycle = Duration::from_millis(config.monitor.poll_interval_ms + config.monitor.poll_timeout_ms);
    let budget = cycle * (config.monitor.failure_threshold + 1);
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(50), None).unwrap();
    wait_for_lines(&job, 2).await;
    assert!(host.pause(&job));
    // Parked: the pause directive went through and no more lines are in flight
    tokio::time::timeout(Duration::from_secs(2), async {
        while !ports.snapshot(PORT).is_some_and(|fw| fw.paused) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("firmware never paused");
    let sent_before = job.progress().lines_sent;

    ports.unplug(PORT);
    let unplugged = Instant::now();
    let done = tokio::time::timeout(budget, job.wait())
        .await
        .expect("monitor never failed the paused job");
    assert!(unplugged.elapsed() <= budget);
    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.lines_sent, sent_before);
    assert!(done.failure.unwrap().reason.contains("connection lost"));
    assert!(conn.active_job().is_none());

    ports.replug(PORT);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !(conn.reconnect_count() == 1 && conn.state() == LinkState::Connected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor never re-established the link");
    assert!(conn.send_command("M105").await.unwrap().ack.temperatures().is_some());
    assert_eq!(job.state(), JobState::Failed);
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_dropped_connection_stops_reconnecting() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let mut config = monitored_config();
    config.reconnect.max_attempts = 0;
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();
    let weak = Arc::downgrade(&conn);

    ports.unplug(PORT);
    tokio::time::timeout(Duration::from_secs(2), async {
        while conn.state() == LinkState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("link loss never noticed");

    // Never closed, just dropped while the monitor keeps retrying
    drop(conn);
    tokio::time::timeout(Duration::from_secs(2), async {
        while weak.upgrade().is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("reconnect loop kept the connection alive");
}

#[tokio::test]
async fn test_explicit_disconnect_then_connect_again() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());

    let first = host.connect(PORT, BAUD).await.unwrap();
    host.send_command(&first, "G28").await.unwrap();
    host.disconnect(&first).await;
    assert_eq!(first.state(), LinkState::Closed);
    assert!(matches!(
        first.send_command("M105").await,
        Err(ProtocolError::Connection(ConnectionError::NotConnected))
    ));

    let second = host.connect(PORT, BAUD).await.unwrap();
    assert!(host.send_command(&second, "M105").await.unwrap().is_ack());
    assert_eq!(host.get_connection_status(&second).state, LinkState::Connected);
    host.disconnect(&second).await;
}

#[tokio::test]
async fn test_disconnect_fails_running_job() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().stall_at(2, Duration::from_secs(2)),
    );
    let mut config = fast_config();
    config.connection.command_timeout_ms = 5000;
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(5), None).unwrap();
    wait_for_lines(&job, 1).await;
    host.disconnect(&conn).await;

    let done = finish(&job).await;
    assert_eq!(done.state, JobState::Failed);
    assert!(done.failure.unwrap().reason.contains("disconnected"));
    assert!(conn.active_job().is_none());
    assert!(host.stream(&conn, moves(1), None).is_err());
}

#[tokio::test]
async fn test_monitor_polls_alongside_stream() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().with_response_delay(Duration::from_millis(1)),
    );
    let mut config = monitored_config();
    config.monitor.poll_interval_ms = 20;
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(150), None).unwrap();
    let done = finish(&job).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.lines_sent, 150);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let fw = ports.snapshot(PORT).unwrap();
    assert!(fw.executed.iter().any(|c| c == "M105"));
    for n in 1..=150 {
        assert_eq!(fw.executed.iter().filter(|c| **c == move_line(n)).count(), 1);
    }
    let status = conn.status();
    assert_eq!(status.state, LinkState::Connected);
    assert_eq!(status.reconnects, 0);
    assert_eq!(status.breaker, BreakerState::Closed);
    assert!(status.last_temperatures.is_some());
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_connect_to_missing_port() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());
    let result = host.connect("/dev/ttyUSB7", BAUD).await;
    assert!(matches!(result, Err(ConnectionError::PortNotFound(_))));
}

#[tokio::test]
async fn test_connect_to_silent_port_reports_no_response() {
    let ports = SimulatedPorts::new();
    ports.add_silent_port("/dev/ttyACM3");
    let mut config = fast_config();
    config.connection.identify_timeout_ms = 100;
    let host = host(&ports, config);
    let result = host.connect("/dev/ttyACM3", BAUD).await;
    assert!(matches!(result, Err(ConnectionError::NoResponse(_))));
}

#[tokio::test]
async fn test_wrong_baud_never_connects() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let mut config = fast_config();
    config.connection.identify_timeout_ms = 100;
    let host = host(&ports, config);
    assert!(host.connect(PORT, 57600).await.is_err());
    // The right rate still works afterwards
    let conn = host.connect(PORT, BAUD).await.unwrap();
    host.disconnect(&conn).await;
}
