// Streaming jobs end to end against simulated firmware
mod common;

use common::*;
use futures_util::StreamExt;
use krusty_link::print_job::ObserverError;
use krusty_link::simulator::FaultPlan;
use krusty_link::{CommandSource, Dialect, JobState, ProgressSnapshot};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_ten_lines_complete_with_checksums() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();
    assert!(conn.status().checksums);

    let job = host.stream(&conn, moves(10), None).unwrap();
    let done = finish(&job).await;

    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.lines_sent, 10);
    assert_eq!(done.percent, 100.0);
    assert!(done.failure.is_none());

    let fw = ports.snapshot(PORT).unwrap();
    let streamed: Vec<&String> = fw.executed.iter().filter(|c| c.starts_with("G1")).collect();
    assert_eq!(streamed.len(), 10);
    for (i, cmd) in streamed.iter().enumerate() {
        assert_eq!(**cmd, move_line(i + 1));
    }
    // Every job line went out framed
    assert!(fw.raw_lines.iter().filter(|l| l.contains("G1 ")).all(|l| l.starts_with('N') && l.contains('*')));
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_firmware_error_fails_job_at_line() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new().error_at(5, "MINTEMP triggered"));
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(10), None).unwrap();
    let done = finish(&job).await;

    assert_eq!(done.state, JobState::Failed);
    assert_eq!(done.lines_sent, 4);
    let failure = done.failure.unwrap();
    assert_eq!(failure.line_number, 5);
    assert_eq!(failure.line, move_line(5));
    assert!(failure.reason.contains("MINTEMP triggered"));

    let fw = ports.snapshot(PORT).unwrap();
    for n in 1..=4 {
        assert!(fw.executed.contains(&move_line(n)));
    }
    for n in 5..=10 {
        assert!(!fw.executed.contains(&move_line(n)), "line {} ran after the failure", n);
    }
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_dropped_line_resent_with_same_number() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new().drop_at(3, 1));
    let mut config = fast_config();
    config.connection.command_timeout_ms = 150;
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(6), None).unwrap();
    let done = finish(&job).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.lines_sent, 6);

    let fw = ports.snapshot(PORT).unwrap();
    let sends: Vec<&String> = fw.raw_lines.iter().filter(|l| l.contains(&move_line(3))).collect();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0], sends[1]);
    assert_eq!(fw.executed.iter().filter(|c| **c == move_line(3)).count(), 1);

    let stats = conn.status().stats;
    assert_eq!(stats.retries, 1);
    assert_eq!(stats.timeouts, 1);
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_busy_notices_extend_the_wait() {
    let faults = FaultPlan::new()
        .busy_at(2, 4)
        .with_response_delay(Duration::from_millis(5));
    let ports = bus(Dialect::GenericMarlin, faults);
    let mut config = fast_config();
    config.connection.command_timeout_ms = 200;
    let host = host(&ports, config);
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let mut lines = vec!["G28".to_string()];
    lines.extend((1..=4).map(move_line));
    let job = host.stream(&conn, CommandSource::from_lines(lines), None).unwrap();
    let done = finish(&job).await;

    assert_eq!(done.state, JobState::Completed);
    let stats = conn.status().stats;
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.timeouts, 0);
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_klipper_streams_without_checksums() {
    let ports = bus(Dialect::Klipper, FaultPlan::new());
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let status = conn.status();
    assert_eq!(status.dialect, Some(Dialect::Klipper));
    assert!(!status.checksums);

    let job = host.stream(&conn, moves(5), None).unwrap();
    assert_eq!(finish(&job).await.state, JobState::Completed);

    let fw = ports.snapshot(PORT).unwrap();
    assert!(fw.raw_lines.iter().all(|l| !l.starts_with('N')));
    assert!(fw.raw_lines.contains(&move_line(5)));
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let ports = bus(
        Dialect::Prusa,
        FaultPlan::new().with_response_delay(Duration::from_millis(1)),
    );
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let gcode = ";LAYER_COUNT:3\n;LAYER:0\nG1 Z0.2\nG1 X1\n;LAYER:1\nG1 Z0.4\nG1 X2\n;LAYER:2\nG1 Z0.6\nG1 X3\n";
    let job = host
        .stream(&conn, CommandSource::from_str(gcode).with_name("layers"), None)
        .unwrap();
    let seen: Vec<ProgressSnapshot> = job.progress_stream().collect().await;

    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[1].lines_sent >= pair[0].lines_sent);
        assert!(pair[1].elapsed >= pair[0].elapsed || pair[1].state.is_terminal());
    }
    assert!(seen.iter().all(|s| s.percent <= 100.0));

    let last = seen.last().unwrap();
    assert_eq!(last.state, JobState::Completed);
    assert_eq!(last.lines_total, 6);
    assert_eq!(last.layer_count, Some(3));
    assert_eq!(last.current_layer, Some(2));
    assert_eq!(last.name.as_deref(), Some("layers"));
    assert_eq!(last.estimated_remaining, Duration::ZERO);
    assert!(last.started_at.is_some());
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_failing_observers_do_not_stop_the_job() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let counting = move |_: &ProgressSnapshot| -> Result<(), ObserverError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let erroring = |_: &ProgressSnapshot| -> Result<(), ObserverError> { Err("display offline".into()) };
    let panicking = |s: &ProgressSnapshot| -> Result<(), ObserverError> {
        if s.lines_sent == 2 {
            panic!("observer bug");
        }
        Ok(())
    };

    let job = host.stream(&conn, moves(8), Some(Arc::new(erroring))).unwrap();
    job.register_observer(Arc::new(panicking));
    let counting_id = job.register_observer(Arc::new(counting));

    let done = finish(&job).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.lines_sent, 8);
    // Registration may race the first acks, never the terminal report
    assert!(calls.load(Ordering::SeqCst) >= 1);
    assert!(job.unregister_observer(counting_id));
    assert!(!job.unregister_observer(counting_id));
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_one_job_per_connection() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().stall_at(1, Duration::from_millis(300)),
    );
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(3), None).unwrap();
    let second = host.stream(&conn, moves(3), None);
    assert!(matches!(second, Err(krusty_link::PrintJobError::JobActive(_))));
    assert_eq!(finish(&job).await.state, JobState::Completed);

    // The slot frees up once the first job is done
    let next = host.stream(&conn, moves(2), None).unwrap();
    assert_eq!(finish(&next).await.state, JobState::Completed);

    let empty = host.stream(&conn, CommandSource::from_str("; nothing to print\n"), None);
    assert!(empty.is_err());
    host.disconnect(&conn).await;
}
