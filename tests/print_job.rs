mod common;

use common::*;
use krusty_link::simulator::FaultPlan;
use krusty_link::{CommandSource, Dialect, JobState, PrintJobError};
use std::time::Duration;

#[tokio::test]
async fn test_valid_state_transitions() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().with_response_delay(Duration::from_millis(5)),
    );
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(20), None).unwrap();
    wait_for_state(&job, JobState::Printing).await;
    job.try_pause().unwrap();
    assert_eq!(job.state(), JobState::Paused);
    job.try_resume().unwrap();
    assert_eq!(job.state(), JobState::Printing);
    assert!(job.emergency_stop().await);
    assert_eq!(job.state(), JobState::Cancelled);
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_invalid_state_transitions() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(2), None).unwrap();
    // Can't resume something that never paused
    let err = job.try_resume().unwrap_err();
    assert!(matches!(err, PrintJobError::InvalidTransition(_)));

    assert_eq!(finish(&job).await.state, JobState::Completed);
    // Terminal states are final
    let err = job.try_pause().unwrap_err();
    assert!(matches!(err, PrintJobError::InvalidTransition(_)));
    let err = job.try_resume().unwrap_err();
    assert!(matches!(err, PrintJobError::InvalidTransition(_)));
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_cancelled_job_cannot_resume() {
    let ports = bus(
        Dialect::GenericMarlin,
        FaultPlan::new().with_response_delay(Duration::from_millis(5)),
    );
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let job = host.stream(&conn, moves(20), None).unwrap();
    wait_for_lines(&job, 2).await;
    assert!(job.pause());
    assert!(job.emergency_stop().await);
    assert!(!job.resume());
    assert_eq!(job.state(), JobState::Cancelled);
    assert_eq!(job.wait().await.state, JobState::Cancelled);
    host.disconnect(&conn).await;
}

#[tokio::test]
async fn test_snapshot_accounting() {
    let ports = bus(Dialect::GenericMarlin, FaultPlan::new());
    let host = host(&ports, fast_config());
    let conn = host.connect(PORT, BAUD).await.unwrap();

    let source = CommandSource::from_str("G28 ; home\n\n; just a comment\nG1 X5\nG1 X6\nM400\n")
        .with_name("tiny");
    let job = host.stream(&conn, source, None).unwrap();
    let first = host.get_progress(&job);
    assert_eq!(first.lines_total, 4);
    assert_eq!(first.job_id, job.id().to_string());

    let done = finish(&job).await;
    assert_eq!(done.lines_sent, 4);
    assert_eq!(done.last_command.as_deref(), Some("M400"));
    assert_eq!(done.name.as_deref(), Some("tiny"));
    assert!(done.failure.is_none());
    host.disconnect(&conn).await;
}
