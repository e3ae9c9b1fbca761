//! Per-call direction state.
//!
//! Each direction of a stream moves `Open -> HalfClosed -> Closed` and never
//! back. A call is finished once both directions are `Closed`, or terminated
//! early with a [`Status`] when either side fails, cancels or runs out of
//! time. Termination closes both directions and wakes every operation
//! blocked on the call.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, trace};

use crate::pipe::PipeSender;
use crate::transport::Frame;
use crate::Status;

/// The state of one direction of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionState {
    /// Messages may flow.
    Open,
    /// The end-of-stream marker was sent or observed.
    HalfClosed,
    /// The direction is finished.
    Closed,
}

// Internal encoding. `ABORTED` is reported as `Closed` but remembers that the
// direction was closed by termination rather than by end-of-stream.
const OPEN: u8 = 0;
const HALF_CLOSED: u8 = 1;
const CLOSED: u8 = 2;
const ABORTED: u8 = 3;

fn decode_state(raw: u8) -> DirectionState {
    match raw {
        OPEN => DirectionState::Open,
        HALF_CLOSED => DirectionState::HalfClosed,
        _ => DirectionState::Closed,
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Running,
    Finished,
    Terminated(Status),
}

/// Message counters for one call, as seen by one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Messages successfully handed to the transport.
    pub sent: u64,
    /// Messages received and decoded.
    pub received: u64,
}

pub(crate) struct Lifecycle {
    method: String,
    send: AtomicU8,
    recv: AtomicU8,
    outcome: watch::Sender<Outcome>,
    deadline: Option<Instant>,
    // Retained after close_send so termination can still reach the peer.
    outbound: Mutex<Option<PipeSender<Frame>>>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Lifecycle {
    pub(crate) fn new(
        method: impl Into<String>,
        outbound: PipeSender<Frame>,
        deadline: Option<Instant>,
    ) -> Self {
        let (outcome, _) = watch::channel(Outcome::Running);
        Self {
            method: method.into(),
            send: AtomicU8::new(OPEN),
            recv: AtomicU8::new(OPEN),
            outcome,
            deadline,
            outbound: Mutex::new(Some(outbound)),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn send_state(&self) -> DirectionState {
        decode_state(self.send.load(Ordering::Acquire))
    }

    pub(crate) fn recv_state(&self) -> DirectionState {
        decode_state(self.recv.load(Ordering::Acquire))
    }

    pub(crate) fn stats(&self) -> StreamStats {
        StreamStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// The status the call was terminated with, if any.
    pub(crate) fn terminal_status(&self) -> Option<Status> {
        match &*self.outcome.borrow() {
            Outcome::Terminated(status) => Some(status.clone()),
            _ => None,
        }
    }

    /// Returns true once the call finished or was terminated.
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(&*self.outcome.borrow(), Outcome::Running)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Outcome> {
        self.outcome.subscribe()
    }

    // ===== send direction =====

    /// Checks that a message may be sent and returns the pipe to send it on.
    pub(crate) fn begin_send(&self) -> Result<PipeSender<Frame>, Status> {
        self.check_open(&self.send, "send after close_send")?;
        self.outbound()
    }

    /// `Open -> HalfClosed`. Returns the pipe to send the end marker on.
    pub(crate) fn half_close_send(&self) -> Result<PipeSender<Frame>, Status> {
        self.check_open(&self.send, "close_send called twice")?;
        let tx = self.outbound()?;

        match self
            .send
            .compare_exchange(OPEN, HALF_CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(method = %self.method, "send direction half-closed");
                Ok(tx)
            }
            Err(ABORTED) => Err(self.terminated_or_cancelled()),
            Err(_) => Err(Status::invalid_state("close_send called twice")),
        }
    }

    /// `HalfClosed -> Closed`, once the transport took the end marker.
    pub(crate) fn ack_send_close(&self) {
        if self
            .send
            .compare_exchange(HALF_CLOSED, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!(method = %self.method, "send direction closed");
            self.maybe_finish();
        }
    }

    // ===== receive direction =====

    pub(crate) fn begin_recv(&self) -> Result<(), Status> {
        self.check_open(&self.recv, "receive after end-of-stream")
    }

    /// `Open -> HalfClosed -> Closed` on end-of-stream. Nothing is buffered
    /// past the end marker, so the drain completes immediately.
    pub(crate) fn observe_end(&self) {
        if self
            .recv
            .compare_exchange(OPEN, HALF_CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(method = %self.method, "end-of-stream observed");

        if self
            .recv
            .compare_exchange(HALF_CLOSED, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.outcome.send_modify(|_| {});
            self.maybe_finish();
        }
    }

    /// Waits until the receive direction is no longer open.
    pub(crate) async fn recv_closed(&self) -> Result<(), Status> {
        let mut outcome = self.subscribe();
        let _ = outcome
            .wait_for(|o| !matches!(o, Outcome::Running) || self.recv_state() != DirectionState::Open)
            .await;

        match self.terminal_status() {
            Some(status) if self.recv.load(Ordering::Acquire) == ABORTED => Err(status),
            _ => Ok(()),
        }
    }

    // ===== termination =====

    /// Terminates the call and tells the peer why.
    pub(crate) fn abort(&self, status: Status) {
        if let Some(tx) = self.terminate(status.clone()) {
            notify_peer(tx, status);
        }
    }

    /// Terminates the call without notifying the peer, because the peer
    /// already knows (it sent the error) or is gone.
    pub(crate) fn fail(&self, status: Status) {
        let _ = self.terminate(status);
    }

    fn terminate(&self, status: Status) -> Option<PipeSender<Frame>> {
        let changed = self.outcome.send_if_modified(|outcome| match outcome {
            Outcome::Running => {
                *outcome = Outcome::Terminated(status.clone());
                true
            }
            _ => false,
        });

        if !changed {
            return None;
        }

        debug!(method = %self.method, %status, "call terminated");

        for direction in [&self.send, &self.recv] {
            let _ = direction.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| match state {
                OPEN => Some(ABORTED),
                HALF_CLOSED => Some(CLOSED),
                _ => None,
            });
        }

        self.outbound.lock().take()
    }

    fn maybe_finish(&self) {
        if self.send.load(Ordering::Acquire) != CLOSED || self.recv.load(Ordering::Acquire) != CLOSED
        {
            return;
        }

        let finished = self.outcome.send_if_modified(|outcome| match outcome {
            Outcome::Running => {
                *outcome = Outcome::Finished;
                true
            }
            _ => false,
        });

        if finished {
            debug!(
                method = %self.method,
                sent = self.sent.load(Ordering::Relaxed),
                received = self.received.load(Ordering::Relaxed),
                "call finished"
            );
            // Both directions are done; release the pipe to the peer.
            self.outbound.lock().take();
        }
    }

    /// Runs `fut` unless the call is terminated or the deadline passes first.
    pub(crate) async fn guard<T, F>(&self, fut: F) -> Result<T, Status>
    where
        F: Future<Output = Result<T, Status>>,
    {
        if let Some(status) = self.terminal_status() {
            return Err(status);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(self.deadline_elapsed());
        }

        let mut outcome = self.subscribe();
        let terminated = async {
            let status = match outcome
                .wait_for(|o| matches!(o, Outcome::Terminated(_)))
                .await
            {
                Ok(o) => match &*o {
                    Outcome::Terminated(status) => Some(status.clone()),
                    _ => None,
                },
                Err(_) => None,
            };
            match status {
                Some(status) => status,
                // The sender lives in `self`, so the channel cannot close
                // while we borrow it.
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            status = terminated => Err(status),
            res = fut => res,
            () = deadline => Err(self.deadline_elapsed()),
        }
    }

    fn deadline_elapsed(&self) -> Status {
        self.abort(Status::deadline_exceeded("deadline has elapsed"));
        self.terminated_or_cancelled()
    }

    fn check_open(&self, state: &AtomicU8, op: &'static str) -> Result<(), Status> {
        match state.load(Ordering::Acquire) {
            OPEN => match self.terminal_status() {
                Some(status) => Err(status),
                None => Ok(()),
            },
            ABORTED => Err(self.terminated_or_cancelled()),
            _ => Err(Status::invalid_state(op)),
        }
    }

    fn outbound(&self) -> Result<PipeSender<Frame>, Status> {
        self.outbound
            .lock()
            .clone()
            .ok_or_else(|| self.terminated_or_cancelled())
    }

    fn terminated_or_cancelled(&self) -> Status {
        self.terminal_status()
            .unwrap_or_else(|| Status::cancelled("call is no longer running"))
    }
}

fn notify_peer(tx: PipeSender<Frame>, status: Status) {
    if let Err(crate::pipe::Disconnected(frame)) = tx.try_send(Frame::Error(status)) {
        if tx.is_closed() {
            return;
        }
        // The pipe is full; deliver the error once the peer makes room.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = tx.send(frame).await;
            });
        }
    }
}

/// Cancels a call from outside its send and receive flows.
#[derive(Clone)]
pub struct CancelHandle {
    pub(crate) lifecycle: Arc<Lifecycle>,
}

impl CancelHandle {
    /// Cancels the call. Operations blocked on it fail with `Cancelled`, and
    /// the peer is told. Does nothing once the call is already over.
    pub fn cancel(&self) {
        self.lifecycle
            .abort(Status::cancelled("call cancelled by its owner"));
    }

    /// Returns true once the call finished or was terminated.
    pub fn is_terminal(&self) -> bool {
        self.lifecycle.is_terminal()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("method", &self.lifecycle.method())
            .field("terminal", &self.is_terminal())
            .finish()
    }
}
