//! # Decode Worker
//!
//! Dedicated thread that runs codec `decode` calls off the presentation
//! thread. Requests arrive through a [`TaskQueue`]; each carries its own
//! one-shot completion signal, which is the only point where the playback
//! loop learns that the sessions are safe to harvest.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::decode::CodecSession;
use crate::task_queue::TaskQueue;

/// A codec session shared between the worker (decode) and the playback
/// loop (harvest). Access is ordered by the request's completion signal.
pub type SharedSession = Arc<Mutex<Box<dyn CodecSession>>>;

pub fn share_session(session: Box<dyn CodecSession>) -> SharedSession {
    Arc::new(Mutex::new(session))
}

// ============================================================================
// Completion Signal
// ============================================================================

/// Result of one payload within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadStatus {
    /// Nothing to decode (empty payload or no session).
    Skipped,
    Decoded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub primary: PayloadStatus,
    pub alpha: PayloadStatus,
}

impl DecodeOutcome {
    /// Outcome of a request that never ran.
    pub fn abandoned() -> Self {
        Self {
            primary: PayloadStatus::Failed,
            alpha: PayloadStatus::Failed,
        }
    }
}

/// Sending half of a request's one-shot signal. Consumed on fulfilment, so
/// a request can be completed at most once.
pub struct Completion {
    tx: Sender<DecodeOutcome>,
}

impl Completion {
    pub fn fulfill(self, outcome: DecodeOutcome) {
        // The receiver may already be gone during shutdown.
        let _ = self.tx.send(outcome);
    }
}

/// Receiving half held by the submitter.
pub struct DecodeTicket {
    rx: Receiver<DecodeOutcome>,
}

impl DecodeTicket {
    /// Wait up to `timeout` for the request to complete.
    ///
    /// `None` means still pending. A request whose `Completion` was dropped
    /// without being fulfilled resolves as [`DecodeOutcome::abandoned`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<DecodeOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(DecodeOutcome::abandoned()),
        }
    }

    /// Block until the request completes.
    pub fn wait(&self) -> DecodeOutcome {
        self.rx.recv().unwrap_or_else(|_| DecodeOutcome::abandoned())
    }
}

/// Fresh signal pair; one per request.
pub fn completion_pair() -> (Completion, DecodeTicket) {
    let (tx, rx) = bounded(1);
    (Completion { tx }, DecodeTicket { rx })
}

// ============================================================================
// Decode Request
// ============================================================================

/// One unit of decode work: a primary payload, an optional alpha payload,
/// and the sessions to feed them to.
pub struct DecodeRequest {
    pub sequence: u64,
    pub primary: Bytes,
    pub alpha: Option<Bytes>,
    pub primary_session: SharedSession,
    pub alpha_session: Option<SharedSession>,
    pub completion: Completion,
}

impl DecodeRequest {
    /// Build a request and the ticket to wait on it.
    pub fn new(
        sequence: u64,
        primary: Bytes,
        alpha: Option<Bytes>,
        primary_session: SharedSession,
        alpha_session: Option<SharedSession>,
    ) -> (Self, DecodeTicket) {
        let (completion, ticket) = completion_pair();
        let request = Self {
            sequence,
            primary,
            alpha,
            primary_session,
            alpha_session,
            completion,
        };
        (request, ticket)
    }
}

// ============================================================================
// Worker Thread
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub requests: u64,
    pub failed_payloads: u64,
}

pub struct DecodeWorker {
    queue: Arc<TaskQueue<DecodeRequest>>,
    handle: Option<JoinHandle<WorkerStats>>,
}

impl DecodeWorker {
    /// Start the worker thread on `queue`.
    pub fn spawn(queue: Arc<TaskQueue<DecodeRequest>>) -> io::Result<Self> {
        let worker_queue = queue.clone();
        let handle = thread::Builder::new()
            .name("vpx-decode".into())
            .spawn(move || run(&worker_queue))?;
        tracing::debug!("Decode worker started");
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue<DecodeRequest>> {
        &self.queue
    }

    /// Shut the queue down, let the worker drain it, and join the thread.
    pub fn shutdown(mut self) -> WorkerStats {
        self.stop()
    }

    fn stop(&mut self) -> WorkerStats {
        self.queue.shutdown();
        let Some(handle) = self.handle.take() else {
            return WorkerStats::default();
        };
        match handle.join() {
            Ok(stats) => {
                tracing::debug!(
                    "Decode worker stopped after {} requests ({} failed payloads)",
                    stats.requests,
                    stats.failed_payloads
                );
                stats
            }
            Err(_) => {
                tracing::error!("Decode worker panicked");
                WorkerStats::default()
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn run(queue: &TaskQueue<DecodeRequest>) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(request) = queue.pop() {
        let outcome = execute(&request);
        stats.requests += 1;
        stats.failed_payloads += [outcome.primary, outcome.alpha]
            .iter()
            .filter(|s| **s == PayloadStatus::Failed)
            .count() as u64;
        request.completion.fulfill(outcome);
    }
    stats
}

fn execute(request: &DecodeRequest) -> DecodeOutcome {
    let primary = decode_payload(&request.primary_session, &request.primary, request.sequence, "primary");
    let alpha = match (&request.alpha_session, &request.alpha) {
        (Some(session), Some(payload)) => decode_payload(session, payload, request.sequence, "alpha"),
        _ => PayloadStatus::Skipped,
    };
    DecodeOutcome { primary, alpha }
}

fn decode_payload(session: &SharedSession, payload: &[u8], sequence: u64, role: &str) -> PayloadStatus {
    if payload.is_empty() {
        return PayloadStatus::Skipped;
    }
    let start = Instant::now();
    let mut session = session.lock();
    let status = match session.decode(payload) {
        Ok(()) => PayloadStatus::Decoded,
        Err(e) => {
            tracing::warn!("Request {}: {} decode failed: {}", sequence, role, e);
            PayloadStatus::Failed
        }
    };
    tracing::trace!(
        "Request {}: {} decode of {} bytes took {}us",
        sequence,
        role,
        payload.len(),
        start.elapsed().as_micros()
    );
    status
}
