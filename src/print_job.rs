// src/print_job.rs - Streaming a command source to the printer, one acknowledged line at a time
//! A job walks `Queued → Starting → Printing ⇄ Paused` and ends in exactly one of
//! `Completed`, `Failed` or `Cancelled`. Terminal states are final.

use crate::communication::protocol::{ExecuteOptions, ProtocolEngine, ProtocolError};
use crate::connection::{Connection, LinkState};
use crate::firmware::DialectProfile;
use crate::gcode_source::{CommandSource, PreparedLine, SourceError};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PrintJobError {
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("A job is already active on {0}")]
    JobActive(String),
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Queued,
    Starting,
    Printing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Starting => "starting",
            JobState::Printing => "printing",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why a job ended in `Failed`. Line numbers are 1-based positions in the prepared source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub name: Option<String>,
    pub state: JobState,
    pub lines_sent: usize,
    pub lines_total: usize,
    pub percent: f64,
    pub current_layer: Option<u32>,
    pub layer_count: Option<u32>,
    pub elapsed: Duration,
    pub estimated_remaining: Duration,
    pub last_command: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
}

pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Called after every acknowledged line, before the next line is sent, and once more on
/// the terminal transition. Errors and panics are logged and otherwise ignored.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, snapshot: &ProgressSnapshot) -> Result<(), ObserverError>;
}

impl<F> ProgressObserver for F
where
    F: Fn(&ProgressSnapshot) -> Result<(), ObserverError> + Send + Sync,
{
    fn on_progress(&self, snapshot: &ProgressSnapshot) -> Result<(), ObserverError> {
        self(snapshot)
    }
}

#[derive(Debug)]
struct JobRecord {
    state: JobState,
    lines_sent: usize,
    current_layer: Option<u32>,
    last_command: Option<String>,
    in_flight: Option<String>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    finished: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
    failure: Option<JobFailure>,
}

impl JobRecord {
    fn elapsed(&self) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let end = self.finished.unwrap_or_else(Instant::now);
        let mut paused = self.paused_total;
        if let Some(since) = self.paused_since {
            paused += end.saturating_duration_since(since);
        }
        end.saturating_duration_since(started).saturating_sub(paused)
    }

    fn close_pause(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    /// Move to a terminal state. Returns false if already terminal.
    fn finish(&mut self, state: JobState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let now = Instant::now();
        self.close_pause(now);
        self.state = state;
        self.finished = Some(now);
        true
    }
}

type ObserverList = Vec<(u64, Arc<dyn ProgressObserver>)>;

struct JobShared {
    id: Uuid,
    name: Option<String>,
    total: usize,
    layer_count: Option<u32>,
    record: Mutex<JobRecord>,
    observers: Mutex<ObserverList>,
    next_observer: AtomicU64,
    abort: Arc<AtomicBool>,
    state_changed: Notify,
    progress: watch::Sender<ProgressSnapshot>,
    engine: Arc<ProtocolEngine>,
    profile: &'static DialectProfile,
}

impl JobShared {
    fn record(&self) -> std::sync::MutexGuard<'_, JobRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_of(&self, record: &JobRecord) -> ProgressSnapshot {
        let sent = record.lines_sent;
        let total = self.total;
        let percent = if total == 0 {
            100.0
        } else {
            (sent as f64 / total as f64 * 100.0).min(100.0)
        };
        let elapsed = record.elapsed();
        let remaining_lines = total.saturating_sub(sent);
        let estimated_remaining = if record.state.is_terminal() {
            Duration::ZERO
        } else {
            elapsed.mul_f64(remaining_lines as f64 / sent.max(1) as f64)
        };
        ProgressSnapshot {
            job_id: self.id.to_string(),
            name: self.name.clone(),
            state: record.state,
            lines_sent: sent,
            lines_total: total,
            percent,
            current_layer: record.current_layer,
            layer_count: self.layer_count,
            elapsed,
            estimated_remaining,
            last_command: record.last_command.clone(),
            started_at: record.started_at,
            failure: record.failure.clone(),
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let record = self.record();
        self.snapshot_of(&record)
    }

    /// Deliver a snapshot to every observer in registration order.
    fn publish(&self, snapshot: ProgressSnapshot) {
        let observers: ObserverList = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (id, observer) in observers {
            match catch_unwind(AssertUnwindSafe(|| observer.on_progress(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Progress observer {} failed: {}", id, e),
                Err(_) => tracing::warn!("Progress observer {} panicked", id),
            }
        }
        self.progress.send_replace(snapshot);
    }

    /// End the job in `state`, recording `failure`. Stops any further writes.
    fn terminate(&self, state: JobState, failure: Option<JobFailure>) -> bool {
        let snapshot = {
            let mut record = self.record();
            if !record.finish(state) {
                return false;
            }
            if failure.is_some() {
                record.failure = failure;
            }
            self.snapshot_of(&record)
        };
        self.abort.store(true, Ordering::SeqCst);
        self.state_changed.notify_waiters();
        self.publish(snapshot);
        true
    }

    async fn wait_for_change(&self, current: JobState) {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.record().state != current {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a running or finished job. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl JobHandle {
    /// Accept a job on `connection` and start streaming it in the background.
    pub fn start(
        connection: &Arc<Connection>,
        source: CommandSource,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<JobHandle, PrintJobError> {
        if source.is_empty() {
            return Err(SourceError::Empty.into());
        }
        if connection.state() != LinkState::Connected {
            return Err(PrintJobError::NotConnected(connection.port().to_string()));
        }

        let engine = connection.engine();
        let profile = connection.dialect().profile();
        let id = Uuid::new_v4();
        let record = JobRecord {
            state: JobState::Queued,
            lines_sent: 0,
            current_layer: None,
            last_command: None,
            in_flight: None,
            started: None,
            started_at: None,
            finished: None,
            paused_since: None,
            paused_total: Duration::ZERO,
            failure: None,
        };
        let initial = ProgressSnapshot {
            job_id: id.to_string(),
            name: source.name.clone(),
            state: JobState::Queued,
            lines_sent: 0,
            lines_total: source.len(),
            percent: 0.0,
            current_layer: None,
            layer_count: source.layer_count,
            elapsed: Duration::ZERO,
            estimated_remaining: Duration::ZERO,
            last_command: None,
            started_at: None,
            failure: None,
        };
        let (progress, _) = watch::channel(initial);

        let handle = JobHandle {
            shared: Arc::new(JobShared {
                id,
                name: source.name.clone(),
                total: source.len(),
                layer_count: source.layer_count,
                record: Mutex::new(record),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                abort: Arc::new(AtomicBool::new(false)),
                state_changed: Notify::new(),
                progress,
                engine,
                profile,
            }),
        };
        if let Some(observer) = observer {
            handle.register_observer(observer);
        }
        connection.attach_job(&handle)?;

        let opts = connection
            .command_options()
            .with_abort(handle.shared.abort.clone());
        tracing::info!(
            "Job {} accepted: {} lines on {}",
            id,
            source.len(),
            connection.port()
        );
        tokio::spawn(stream_lines(handle.shared.clone(), source, opts));
        Ok(handle)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> JobState {
        self.shared.record().state
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.snapshot()
    }

    pub fn register_observer(&self, observer: Arc<dyn ProgressObserver>) -> u64 {
        let id = self.shared.next_observer.fetch_add(1, Ordering::SeqCst);
        self.shared
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, observer));
        id
    }

    pub fn unregister_observer(&self, id: u64) -> bool {
        let mut observers = self
            .shared
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Snapshots as they change, ending after the terminal one. Intermediate
    /// snapshots may be coalesced when the consumer falls behind.
    pub fn progress_stream(&self) -> impl Stream<Item = ProgressSnapshot> + Send + 'static {
        let mut rx = self.shared.progress.subscribe();
        async_stream::stream! {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                let done = snapshot.state.is_terminal();
                yield snapshot;
                if done || rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Wait for the terminal state and return its snapshot.
    pub async fn wait(&self) -> ProgressSnapshot {
        let mut rx = self.shared.progress.subscribe();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.progress(),
        }
    }

    /// Only legal from `Printing`. The line in flight finishes first; the firmware's pause
    /// directive follows.
    pub fn pause(&self) -> bool {
        self.try_pause().is_ok()
    }

    pub fn try_pause(&self) -> Result<(), PrintJobError> {
        {
            let mut record = self.shared.record();
            if record.state != JobState::Printing {
                return Err(PrintJobError::InvalidTransition(format!(
                    "cannot pause a job that is {}",
                    record.state
                )));
            }
            record.state = JobState::Paused;
            record.paused_since = Some(Instant::now());
        }
        tracing::info!("Job {} paused", self.shared.id);
        self.shared.state_changed.notify_waiters();
        self.shared.progress.send_replace(self.shared.snapshot());
        Ok(())
    }

    /// Only legal from `Paused`. Streaming continues with the next unsent line.
    pub fn resume(&self) -> bool {
        self.try_resume().is_ok()
    }

    pub fn try_resume(&self) -> Result<(), PrintJobError> {
        {
            let mut record = self.shared.record();
            if record.state != JobState::Paused {
                return Err(PrintJobError::InvalidTransition(format!(
                    "cannot resume a job that is {}",
                    record.state
                )));
            }
            record.close_pause(Instant::now());
            record.state = JobState::Printing;
        }
        tracing::info!("Job {} resumed", self.shared.id);
        self.shared.state_changed.notify_waiters();
        self.shared.progress.send_replace(self.shared.snapshot());
        Ok(())
    }

    /// Cancel immediately. Does not wait for the line in flight. The stop command and
    /// heater shutdown are on the wire before this returns.
    pub async fn emergency_stop(&self) -> bool {
        let shared = &self.shared;
        {
            let mut record = shared.record();
            if record.state.is_terminal() {
                return false;
            }
            record.finish(JobState::Cancelled);
        }
        shared.abort.store(true, Ordering::SeqCst);
        shared.state_changed.notify_waiters();

        if let Err(e) = shared.engine.emergency_stop(shared.profile.stop_command).await {
            tracing::error!("Emergency stop for job {} hit an I/O error: {}", shared.id, e);
        }
        tracing::warn!("Job {} cancelled by emergency stop", shared.id);
        shared.publish(shared.snapshot());
        true
    }

    /// Fail the job from outside the streaming loop (lost link, disconnect).
    pub(crate) fn fail(&self, reason: &str) -> bool {
        let (line_number, line) = {
            let record = self.shared.record();
            let line = record
                .in_flight
                .clone()
                .or_else(|| record.last_command.clone())
                .unwrap_or_default();
            (record.lines_sent + 1, line)
        };
        self.shared.terminate(
            JobState::Failed,
            Some(JobFailure {
                line_number: line_number.min(self.shared.total.max(1)),
                line,
                reason: reason.to_string(),
            }),
        )
    }
}

/// The streaming loop: strictly in order, one line in flight.
async fn stream_lines(shared: Arc<JobShared>, source: CommandSource, opts: ExecuteOptions) {
    {
        let mut record = shared.record();
        if record.state != JobState::Queued {
            return;
        }
        record.state = JobState::Starting;
        record.started = Some(Instant::now());
        record.started_at = Some(Utc::now());
    }
    shared.state_changed.notify_waiters();
    shared.progress.send_replace(shared.snapshot());

    let engine = shared.engine.clone();
    let mut pause_sent = false;

    for (index, line) in source.lines().iter().enumerate() {
        if !park_while_paused(&shared, &engine, &opts, &mut pause_sent).await {
            return;
        }

        shared.record().in_flight = Some(line.text.clone());
        match engine.execute(&line.text, &opts).await {
            Ok(_) => {
                let snapshot = acknowledge(&shared, line);
                if let Some(snapshot) = snapshot {
                    shared.publish(snapshot);
                }
            }
            Err(e) => {
                if shared.record().state.is_terminal() {
                    // Stopped or failed elsewhere; the error is a consequence.
                    tracing::debug!("Job {} loop exiting: {}", shared.id, e);
                    return;
                }
                let reason = failure_reason(&e);
                tracing::error!(
                    "Job {} failed at line {} '{}': {}",
                    shared.id,
                    index + 1,
                    line.text,
                    reason
                );
                shared.terminate(
                    JobState::Failed,
                    Some(JobFailure {
                        line_number: index + 1,
                        line: line.text.clone(),
                        reason,
                    }),
                );
                return;
            }
        }
    }

    if shared.terminate(JobState::Completed, None) {
        tracing::info!("Job {} completed ({} lines)", shared.id, shared.total);
    }
}

/// Record one acknowledged line. `None` when the job ended while the line was in flight.
fn acknowledge(shared: &JobShared, line: &PreparedLine) -> Option<ProgressSnapshot> {
    let snapshot = {
        let mut record = shared.record();
        if record.state.is_terminal() {
            return None;
        }
        record.lines_sent += 1;
        record.in_flight = None;
        record.last_command = Some(line.text.clone());
        if line.layer.is_some() {
            record.current_layer = line.layer;
        }
        if record.state == JobState::Starting {
            record.state = JobState::Printing;
        }
        shared.snapshot_of(&record)
    };
    if snapshot.lines_sent == 1 {
        shared.state_changed.notify_waiters();
    }
    Some(snapshot)
}

/// Holds the loop while the job is paused. Returns false when the job has ended.
async fn park_while_paused(
    shared: &JobShared,
    engine: &ProtocolEngine,
    opts: &ExecuteOptions,
    pause_sent: &mut bool,
) -> bool {
    loop {
        let state = shared.record().state;
        match state {
            JobState::Paused => {
                if !*pause_sent {
                    if let Some(command) = shared.profile.pause_command {
                        send_directive(shared, engine, command, opts).await;
                    }
                    *pause_sent = true;
                }
                shared.wait_for_change(JobState::Paused).await;
            }
            JobState::Printing | JobState::Starting => {
                if *pause_sent {
                    if let Some(command) = shared.profile.resume_command {
                        send_directive(shared, engine, command, opts).await;
                    }
                    *pause_sent = false;
                }
                return true;
            }
            _ => return false,
        }
    }
}

/// Pause and resume directives are best effort; a firmware that refuses them does not
/// fail the job.
async fn send_directive(shared: &JobShared, engine: &ProtocolEngine, command: &str, opts: &ExecuteOptions) {
    match engine.execute(command, opts).await {
        Ok(_) => tracing::debug!("Job {}: sent '{}'", shared.id, command),
        Err(e) => tracing::warn!("Job {}: directive '{}' failed: {}", shared.id, command, e),
    }
}

fn failure_reason(error: &ProtocolError) -> String {
    match error {
        ProtocolError::Rejected { reason, .. } => format!("firmware error: {}", reason),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> JobRecord {
        JobRecord {
            state: JobState::Printing,
            lines_sent: 0,
            current_layer: None,
            last_command: None,
            in_flight: None,
            started: None,
            started_at: None,
            finished: None,
            paused_since: None,
            paused_total: Duration::ZERO,
            failure: None,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert_eq!(JobState::Printing.to_string(), "printing");
    }

    #[test]
    fn test_finish_is_one_way() {
        let mut r = record();
        assert!(r.finish(JobState::Cancelled));
        assert!(!r.finish(JobState::Completed));
        assert_eq!(r.state, JobState::Cancelled);
    }

    #[test]
    fn test_elapsed_excludes_pauses() {
        let mut r = record();
        let start = Instant::now() - Duration::from_secs(10);
        r.started = Some(start);
        r.paused_total = Duration::from_secs(4);
        r.finished = Some(start + Duration::from_secs(10));
        assert_eq!(r.elapsed(), Duration::from_secs(6));

        r.paused_since = Some(start + Duration::from_secs(8));
        assert_eq!(r.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn test_closure_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = move |s: &ProgressSnapshot| -> Result<(), ObserverError> {
            sink.lock().unwrap().push(s.lines_sent);
            Ok(())
        };
        let snapshot = ProgressSnapshot {
            job_id: "j".into(),
            name: None,
            state: JobState::Printing,
            lines_sent: 3,
            lines_total: 10,
            percent: 30.0,
            current_layer: None,
            layer_count: None,
            elapsed: Duration::ZERO,
            estimated_remaining: Duration::ZERO,
            last_command: None,
            started_at: None,
            failure: None,
        };
        observer.on_progress(&snapshot).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }
}
