// src/communication/protocol.rs - One-command-at-a-time request/acknowledgment engine
//! The protocol engine is the only path to the device. It owns a single reader task per
//! transport and a one-deep command slot, so streaming and status polling never interleave
//! lines on the wire.

use crate::communication::codec::{self, AckEvent, Temperatures};
use crate::communication::transport::{ConnectionError, Transport};
use crate::retry::{CircuitBreaker, RetryPolicy};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const READER_POLL: Duration = Duration::from_millis(100);
const RECENT_LINES: usize = 64;
const STOP_WRITE_TIMEOUT: Duration = Duration::from_millis(250);
/// How long a late acknowledgment for an earlier write is waited for before it is written off.
const ACK_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("No acknowledgment for '{command}' after {attempts} attempt(s)")]
    Timeout { command: String, attempts: u32 },
    #[error("Firmware rejected '{command}': {reason}")]
    Rejected { command: String, reason: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Command pre-empted by emergency stop")]
    Preempted,
    #[error("Emergency stop in effect; command not sent")]
    Halted,
    #[error("Link marked unhealthy; circuit breaker open")]
    CircuitOpen,
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Not supported by this firmware: {0}")]
    Unsupported(String),
}

impl ProtocolError {
    /// Failures that say something about link health, as opposed to the firmware
    /// refusing a command or a deliberate stop.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout { .. }
                | ProtocolError::Connection(_)
                | ProtocolError::CircuitOpen
                | ProtocolError::Malformed(_)
        )
    }
}

/// Per-call knobs for [`ProtocolEngine::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    /// Checked under the write lock right before each line goes out.
    pub abort: Option<Arc<AtomicBool>>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_retries: 3,
            abort: None,
        }
    }
}

impl ExecuteOptions {
    pub fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
            abort: None,
        }
    }

    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }
}

/// The acknowledgment plus whatever informational lines arrived before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub ack: AckEvent,
    pub info_lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub lines_sent: u64,
    pub acks: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct LinkCounters {
    lines_sent: AtomicU64,
    acks: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl LinkCounters {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            lines_sent: self.lines_sent.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Channels owned by the connection so they outlive any single engine (reconnects swap engines).
#[derive(Clone)]
pub struct EngineLinks {
    pub telemetry: Arc<watch::Sender<Option<Temperatures>>>,
    pub unsolicited: broadcast::Sender<String>,
    pub breaker: Arc<CircuitBreaker>,
}

impl EngineLinks {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        let (telemetry, _) = watch::channel(None);
        let (unsolicited, _) = broadcast::channel(128);
        Self {
            telemetry: Arc::new(telemetry),
            unsolicited,
            breaker,
        }
    }
}

#[derive(Debug)]
enum ReaderEvent {
    Line(AckEvent),
    Closed(ConnectionError),
}

struct Slot {
    next_seq: u32,
    needs_resync: bool,
    events: mpsc::UnboundedReceiver<ReaderEvent>,
}

struct ReaderShared {
    alive: AtomicBool,
    recent: StdMutex<VecDeque<String>>,
    counters: LinkCounters,
}

pub struct ProtocolEngine {
    transport: Arc<dyn Transport>,
    slot: Mutex<Slot>,
    writer: Mutex<()>,
    checksums: AtomicBool,
    retry: RetryPolicy,
    links: EngineLinks,
    shared: Arc<ReaderShared>,
    preempt_epoch: AtomicU64,
    preempted: Notify,
    /// Lines written whose `ok` has not been consumed yet.
    owed_acks: AtomicU32,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl ProtocolEngine {
    /// Take ownership of an open transport and start its reader task.
    pub fn start(
        transport: Arc<dyn Transport>,
        checksums: bool,
        retry: RetryPolicy,
        links: EngineLinks,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ReaderShared {
            alive: AtomicBool::new(true),
            recent: StdMutex::new(VecDeque::with_capacity(RECENT_LINES)),
            counters: LinkCounters::default(),
        });

        let reader = tokio::spawn(reader_loop(
            transport.clone(),
            tx,
            shared.clone(),
            links.clone(),
        ));

        Arc::new(Self {
            transport,
            slot: Mutex::new(Slot {
                next_seq: 0,
                needs_resync: false,
                events: rx,
            }),
            writer: Mutex::new(()),
            checksums: AtomicBool::new(checksums),
            retry,
            links,
            shared,
            preempt_epoch: AtomicU64::new(0),
            preempted: Notify::new(),
            owed_acks: AtomicU32::new(0),
            reader: StdMutex::new(Some(reader)),
        })
    }

    pub fn port_name(&self) -> &str {
        self.transport.name()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn checksums_enabled(&self) -> bool {
        self.checksums.load(Ordering::SeqCst)
    }

    pub fn set_checksums(&self, enabled: bool) {
        self.checksums.store(enabled, Ordering::SeqCst);
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.counters.snapshot()
    }

    /// Most recent lines that matched no known response shape, oldest first.
    pub fn recent_unrecognized(&self) -> Vec<String> {
        lock_recent(&self.shared.recent).iter().cloned().collect()
    }

    pub fn latest_temperatures(&self) -> Option<Temperatures> {
        *self.links.telemetry.borrow()
    }

    /// Send one command and wait for its acknowledgment.
    pub async fn execute(&self, command: &str, opts: &ExecuteOptions) -> Result<AckEvent, ProtocolError> {
        self.execute_collect(command, opts).await.map(|reply| reply.ack)
    }

    /// Like [`execute`](Self::execute) but also returns the informational lines that
    /// preceded the acknowledgment (identification replies, leveling grids).
    pub async fn execute_collect(
        &self,
        command: &str,
        opts: &ExecuteOptions,
    ) -> Result<Reply, ProtocolError> {
        let command = command.trim();
        self.ensure_alive()?;
        if !self.links.breaker.allow() {
            return Err(ProtocolError::CircuitOpen);
        }

        let epoch = self.preempt_epoch.load(Ordering::SeqCst);
        let mut slot = tokio::select! {
            biased;
            _ = self.wait_preempted(epoch) => return Err(ProtocolError::Preempted),
            slot = self.slot.lock() => slot,
        };

        let result = self.exchange(&mut slot, command, opts, epoch).await;
        match &result {
            Ok(_) | Err(ProtocolError::Rejected { .. }) => self.links.breaker.record_success(),
            Err(e) if e.is_link_failure() => self.links.breaker.record_failure(),
            Err(_) => {}
        }
        result
    }

    /// Reset the firmware's expected line number to 0. The next framed line is N1.
    pub async fn reset_line_numbers(&self, opts: &ExecuteOptions) -> Result<(), ProtocolError> {
        self.ensure_alive()?;
        let epoch = self.preempt_epoch.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;
        slot.next_seq = 0;
        self.resync(&mut slot, opts, epoch).await
    }

    /// Out-of-band stop: no slot, no acknowledgment wait, no retry. Whatever command is
    /// in flight is abandoned. Heater targets are zeroed unconditionally.
    pub async fn emergency_stop(&self, stop_command: &str) -> Result<(), ProtocolError> {
        self.preempt_epoch.fetch_add(1, Ordering::SeqCst);
        self.preempted.notify_waiters();

        // Preemption drops any in-flight write, so the lock frees up quickly. A writer stuck
        // anyway does not hold the stop back.
        let _guard = match tokio::time::timeout(STOP_WRITE_TIMEOUT, self.writer.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("Writer on {} still busy, sending stop anyway", self.transport.name());
                None
            }
        };
        tracing::warn!("Emergency stop on {}", self.transport.name());
        let mut first_error = None;
        for line in [stop_command, "M104 S0", "M140 S0"] {
            let result = tokio::time::timeout(STOP_WRITE_TIMEOUT, self.transport.write_line(line))
                .await
                .unwrap_or_else(|_| {
                    Err(ConnectionError::Io {
                        port: self.transport.name().to_string(),
                        reason: "write timed out".to_string(),
                    })
                });
            if let Err(e) = result {
                tracing::error!("Emergency stop line '{}' failed: {}", line, e);
                first_error.get_or_insert(e);
            } else {
                self.shared.counters.lines_sent.fetch_add(1, Ordering::Relaxed);
                // Heater lines are acknowledged even by halted firmware
                if line != stop_command {
                    self.owed_acks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Stop the reader task and close the transport.
    pub async fn shutdown(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.transport.close().await;
    }

    fn ensure_alive(&self) -> Result<(), ProtocolError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(ConnectionError::Closed(self.transport.name().to_string()).into())
        }
    }

    async fn wait_preempted(&self, epoch: u64) {
        loop {
            let notified = self.preempted.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.preempt_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            notified.await;
        }
    }

    /// Write one line under the writer lock. The write is bounded by the command timeout
    /// and abandoned on preemption so an emergency stop never queues behind it.
    async fn write_guarded(&self, line: &str, opts: &ExecuteOptions, epoch: u64) -> Result<(), ProtocolError> {
        let write = async {
            let _guard = self.writer.lock().await;
            if opts.abort.as_deref().is_some_and(|a| a.load(Ordering::SeqCst)) {
                return Err(ProtocolError::Halted);
            }
            let result = match tokio::time::timeout(opts.timeout, self.transport.write_line(line)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Io {
                    port: self.transport.name().to_string(),
                    reason: "write timed out".to_string(),
                }),
            };
            match result {
                Ok(()) => {
                    self.shared.counters.lines_sent.fetch_add(1, Ordering::Relaxed);
                    self.owed_acks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(e) => {
                    self.shared.alive.store(false, Ordering::SeqCst);
                    Err(e.into())
                }
            }
        };
        tokio::select! {
            biased;
            _ = self.wait_preempted(epoch) => Err(ProtocolError::Preempted),
            result = write => result,
        }
    }

    /// Count one acknowledgment against the owed total. False if nothing was owed.
    fn take_owed_ack(&self) -> bool {
        self.owed_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Consume everything earlier writes still have coming (trailing `ok` after an error,
    /// the second ack of a resent line) so the next line's ack cannot be mistaken for it.
    /// Acks that do not show up within [`ACK_GRACE`] are written off.
    async fn settle(&self, slot: &mut Slot, epoch: u64) -> Result<(), ProtocolError> {
        let mut deadline = None;
        loop {
            let event = match slot.events.try_recv() {
                Ok(event) => event,
                Err(_) => {
                    if self.owed_acks.load(Ordering::SeqCst) == 0 {
                        return Ok(());
                    }
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + ACK_GRACE);
                    let next = tokio::select! {
                        biased;
                        _ = self.wait_preempted(epoch) => return Err(ProtocolError::Preempted),
                        next = tokio::time::timeout_at(deadline, slot.events.recv()) => next,
                    };
                    match next {
                        Ok(Some(event)) => event,
                        Ok(None) => {
                            return Err(ConnectionError::Closed(self.transport.name().to_string()).into());
                        }
                        Err(_) => {
                            let missing = self.owed_acks.swap(0, Ordering::SeqCst);
                            tracing::debug!("Writing off {} missing ack(s)", missing);
                            return Ok(());
                        }
                    }
                }
            };
            match event {
                ReaderEvent::Closed(e) => return Err(e.into()),
                ReaderEvent::Line(AckEvent::Ok | AckEvent::OkWithTemperature(_)) => {
                    if !self.take_owed_ack() {
                        tracing::trace!("Dropping unsolicited ack");
                    }
                }
                ReaderEvent::Line(event) => tracing::trace!("Dropping stale response {:?}", event),
            }
        }
    }

    async fn resync(&self, slot: &mut Slot, opts: &ExecuteOptions, epoch: u64) -> Result<(), ProtocolError> {
        let seq = slot.next_seq;
        let line = codec::frame_command(seq, &format!("M110 N{}", seq));
        tracing::debug!("Resetting line number to {}", seq);
        self.settle(slot, epoch).await?;
        self.send_and_wait(slot, &line, "M110", opts, epoch).await?;
        slot.next_seq = seq + 1;
        slot.needs_resync = false;
        Ok(())
    }

    async fn exchange(
        &self,
        slot: &mut Slot,
        command: &str,
        opts: &ExecuteOptions,
        epoch: u64,
    ) -> Result<Reply, ProtocolError> {
        self.settle(slot, epoch).await?;

        let line = if self.checksums_enabled() {
            if slot.needs_resync {
                // Continue numbering from the last line the firmware accepted
                slot.next_seq = slot.next_seq.saturating_sub(1);
                self.resync(slot, opts, epoch).await?;
            }
            let seq = slot.next_seq;
            slot.next_seq += 1;
            codec::frame_command(seq, command)
        } else {
            command.to_string()
        };

        let result = self.send_and_wait(slot, &line, command, opts, epoch).await;
        if matches!(result, Err(ProtocolError::Rejected { .. })) && self.checksums_enabled() {
            slot.needs_resync = true;
        }
        result
    }

    async fn send_and_wait(
        &self,
        slot: &mut Slot,
        line: &str,
        command: &str,
        opts: &ExecuteOptions,
        epoch: u64,
    ) -> Result<Reply, ProtocolError> {
        let counters = &self.shared.counters;
        let mut info_lines = Vec::new();
        let mut garbled: Option<String> = None;
        let mut attempt = 0u32;

        loop {
            self.write_guarded(line, opts, epoch).await?;
            let mut deadline = Instant::now() + opts.timeout;

            let ack = loop {
                let next = tokio::select! {
                    biased;
                    _ = self.wait_preempted(epoch) => return Err(ProtocolError::Preempted),
                    next = tokio::time::timeout_at(deadline, slot.events.recv()) => next,
                };
                match next {
                    Err(_) => break None,
                    Ok(None) => {
                        return Err(ConnectionError::Closed(self.transport.name().to_string()).into());
                    }
                    Ok(Some(ReaderEvent::Closed(e))) => return Err(e.into()),
                    Ok(Some(ReaderEvent::Line(event))) => match event {
                        AckEvent::Ok | AckEvent::OkWithTemperature(_) => {
                            self.take_owed_ack();
                            break Some(event);
                        }
                        AckEvent::Busy => deadline = Instant::now() + opts.timeout,
                        AckEvent::Error(reason) => {
                            counters.errors.fetch_add(1, Ordering::Relaxed);
                            tracing::error!("Firmware rejected '{}': {}", command, reason);
                            // The firmware still follows up with `Resend:` and `ok`
                            self.settle(slot, epoch).await?;
                            return Err(ProtocolError::Rejected {
                                command: command.to_string(),
                                reason,
                            });
                        }
                        AckEvent::Unrecognized(raw) => {
                            if raw.contains('\u{fffd}') {
                                garbled = Some(raw.clone());
                            }
                            info_lines.push(raw);
                        }
                    },
                }
            };

            if let Some(ack) = ack {
                counters.acks.fetch_add(1, Ordering::Relaxed);
                return Ok(Reply { ack, info_lines });
            }

            counters.timeouts.fetch_add(1, Ordering::Relaxed);
            if attempt >= opts.max_retries {
                tracing::error!("'{}' unacknowledged after {} attempt(s)", command, attempt + 1);
                if let Some(raw) = garbled {
                    return Err(ProtocolError::Malformed(raw));
                }
                return Err(ProtocolError::Timeout {
                    command: command.to_string(),
                    attempts: attempt + 1,
                });
            }
            attempt += 1;
            counters.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                "No ack for '{}', resending (retry {}/{}) in {:?}",
                command,
                attempt,
                opts.max_retries,
                delay
            );
            tokio::select! {
                biased;
                _ = self.wait_preempted(epoch) => return Err(ProtocolError::Preempted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

fn lock_recent(recent: &StdMutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    recent.lock().unwrap_or_else(|e| e.into_inner())
}

/// Single consumer of the transport's input.
async fn reader_loop(
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<ReaderEvent>,
    shared: Arc<ReaderShared>,
    links: EngineLinks,
) {
    loop {
        match transport.read_line(READER_POLL).await {
            Ok(Some(line)) => {
                let event = codec::parse_response(&line);
                match &event {
                    AckEvent::OkWithTemperature(t) => {
                        links.telemetry.send_replace(Some(*t));
                    }
                    AckEvent::Unrecognized(raw) => {
                        if let Some(t) = codec::parse_temperatures(raw) {
                            links.telemetry.send_replace(Some(t));
                        }
                        {
                            let mut recent = lock_recent(&shared.recent);
                            if recent.len() == RECENT_LINES {
                                recent.pop_front();
                            }
                            recent.push_back(raw.clone());
                        }
                        let _ = links.unsolicited.send(raw.clone());
                    }
                    _ => {}
                }
                if events.send(ReaderEvent::Line(event)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                if !shared.alive.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Reader on {} stopped: {}", transport.name(), e);
                shared.alive.store(false, Ordering::SeqCst);
                let _ = events.send(ReaderEvent::Closed(e));
                break;
            }
        }
    }
    tracing::debug!("Reader task for {} exited", transport.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Replies to each written line after a per-reply delay, the way a real board trickles
    /// lines back over serial. Lines with a `stuck` prefix never finish writing.
    struct ScriptedTransport {
        replies: HashMap<&'static str, Vec<(u64, &'static str)>>,
        stuck: Option<&'static str>,
        written: StdMutex<Vec<String>>,
        inbox_tx: mpsc::UnboundedSender<String>,
        inbox: Mutex<mpsc::UnboundedReceiver<String>>,
    }

    impl ScriptedTransport {
        fn new(replies: &[(&'static str, Vec<(u64, &'static str)>)]) -> Self {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            Self {
                replies: replies.iter().cloned().collect(),
                stuck: None,
                written: StdMutex::new(Vec::new()),
                inbox_tx,
                inbox: Mutex::new(inbox),
            }
        }

        fn with_stuck_writes(mut self, prefix: &'static str) -> Self {
            self.stuck = Some(prefix);
            self
        }

        fn written(&self) -> Vec<String> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        fn baud(&self) -> u32 {
            115200
        }

        async fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
            if self.stuck.is_some_and(|p| line.starts_with(p)) {
                std::future::pending::<()>().await;
            }
            self.written.lock().unwrap().push(line.to_string());
            for (delay_ms, reply) in self.replies.get(line).cloned().unwrap_or_default() {
                let tx = self.inbox_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    let _ = tx.send(reply.to_string());
                });
            }
            Ok(())
        }

        async fn read_line(&self, timeout: Duration) -> Result<Option<String>, ConnectionError> {
            let mut inbox = self.inbox.lock().await;
            Ok(tokio::time::timeout(timeout, inbox.recv()).await.ok().flatten())
        }

        async fn clear_input(&self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn engine(transport: Arc<ScriptedTransport>) -> Arc<ProtocolEngine> {
        let breaker = Arc::new(CircuitBreaker::new(5, Duration::from_secs(1)));
        ProtocolEngine::start(
            transport,
            false,
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(10), 1.0),
            EngineLinks::new(breaker),
        )
    }

    const TEMPS: &str = "ok T:20.0 /0.0 B:21.0 /0.0";

    #[tokio::test]
    async fn test_trailing_ok_after_error_is_not_reused() {
        let transport = Arc::new(ScriptedTransport::new(&[
            ("BAD", vec![(5, "Error:Unknown command"), (40, "ok")]),
            ("M105", vec![(20, TEMPS)]),
            ("G28", vec![(5, "ok")]),
        ]));
        let engine = engine(transport.clone());
        let opts = ExecuteOptions::new(Duration::from_millis(500), 0);

        let rejected = engine.execute("BAD", &opts).await;
        assert!(matches!(rejected, Err(ProtocolError::Rejected { .. })));

        let ack = engine.execute("M105", &opts).await.unwrap();
        assert_eq!(ack.temperatures().map(|t| t.bed), Some(21.0));
        assert_eq!(engine.execute("G28", &opts).await.unwrap(), AckEvent::Ok);
        assert_eq!(engine.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_late_ack_of_resent_line_is_absorbed() {
        // Every copy of the line gets its own ok, later than the command timeout
        let transport = Arc::new(ScriptedTransport::new(&[
            ("G1 X5", vec![(80, "ok")]),
            ("M105", vec![(20, TEMPS)]),
        ]));
        let engine = engine(transport.clone());
        let opts = ExecuteOptions::new(Duration::from_millis(50), 2);

        assert_eq!(engine.execute("G1 X5", &opts).await.unwrap(), AckEvent::Ok);
        assert_eq!(engine.stats().retries, 1);

        let ack = engine.execute("M105", &opts).await.unwrap();
        assert!(ack.temperatures().is_some());
        assert_eq!(transport.written(), vec!["G1 X5", "G1 X5", "M105"]);
    }

    #[tokio::test]
    async fn test_missing_ack_is_written_off() {
        let transport = Arc::new(ScriptedTransport::new(&[
            ("G1 X1", vec![(5, "Error:Printer halted")]),
            ("M105", vec![(5, TEMPS)]),
        ]));
        let engine = engine(transport.clone());
        let opts = ExecuteOptions::new(Duration::from_secs(1), 0);

        let started = Instant::now();
        assert!(engine.execute("G1 X1", &opts).await.is_err());
        assert!(engine.execute("M105", &opts).await.unwrap().temperatures().is_some());
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_emergency_stop_not_blocked_by_stuck_write() {
        let transport = Arc::new(
            ScriptedTransport::new(&[("M104 S0", vec![(5, "ok")]), ("M140 S0", vec![(5, "ok")])])
                .with_stuck_writes("G1"),
        );
        let engine = engine(transport.clone());

        let in_flight = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute("G1 X10", &ExecuteOptions::new(Duration::from_secs(10), 0))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        engine.emergency_stop("M112").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(transport.written(), vec!["M112", "M104 S0", "M140 S0"]);

        let result = tokio::time::timeout(Duration::from_secs(1), in_flight)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ProtocolError::Preempted));
    }

    #[tokio::test]
    async fn test_stuck_write_times_out() {
        let transport = Arc::new(ScriptedTransport::new(&[]).with_stuck_writes("G1"));
        let engine = engine(transport);

        let result = engine
            .execute("G1 X1", &ExecuteOptions::new(Duration::from_millis(100), 0))
            .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Connection(ConnectionError::Io { .. }))
        ));
        assert!(!engine.is_alive());
    }
}
