//! Drives the send and receive flows of streaming calls.
//!
//! For client-streaming calls the flows run one after the other: every request
//! is sent and the direction closed before the single response is read. For
//! bidirectional calls they run as two tasks, and the call is complete only
//! once a [`CompletionLatch`] has seen both finish.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{pin_mut, Stream, StreamExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::stream::{Sender, Streaming};
use crate::Status;

/// A countdown that completes once every participant has reported done.
///
/// Unlike a single-slot signal, the latch cannot fire early: with a count of
/// two, one participant finishing leaves the latch pending.
#[derive(Clone)]
pub struct CompletionLatch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    remaining: AtomicUsize,
    notify: Notify,
}

impl CompletionLatch {
    /// Creates a latch waiting for `count` participants.
    pub fn new(count: usize) -> Self {
        CompletionLatch {
            inner: Arc::new(LatchInner {
                remaining: AtomicUsize::new(count),
                notify: Notify::new(),
            }),
        }
    }

    /// Reports one participant done. Extra calls once the latch completed are
    /// ignored.
    pub fn count_down(&self) {
        let prev = self
            .inner
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        if prev == Ok(1) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns true once every participant reported done.
    pub fn is_complete(&self) -> bool {
        self.inner.remaining.load(Ordering::Acquire) == 0
    }

    /// Waits until every participant reported done.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            pin_mut!(notified);
            // Register before checking so a concurrent count_down is not missed.
            notified.as_mut().enable();

            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// Returns a guard that counts down when dropped, even if the task holding
    /// it panics or is cancelled.
    pub fn guard(&self) -> LatchGuard {
        LatchGuard {
            latch: self.clone(),
        }
    }
}

impl fmt::Debug for CompletionLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("remaining", &self.inner.remaining.load(Ordering::Relaxed))
            .finish()
    }
}

/// Counts a [`CompletionLatch`] down on drop.
#[derive(Debug)]
pub struct LatchGuard {
    latch: CompletionLatch,
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

/// What the two flows of a bidirectional call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowSummary {
    /// Requests sent before the send direction was closed.
    pub sent: usize,
    /// Responses received before end-of-stream.
    pub received: usize,
}

/// Runs the flows of client-streaming and bidirectional calls.
///
/// ```rust
/// # use runnel::client::Driver;
/// # use std::time::Duration;
/// // Throttle the send flow to one request per second.
/// let driver = Driver::new().pacing(Duration::from_secs(1));
/// # drop(driver);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Driver {
    pacing: Option<Duration>,
}

impl Driver {
    /// A driver that sends requests as fast as the transport accepts them.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits `delay` before each request after the first.
    pub fn pacing(self, delay: impl Into<Option<Duration>>) -> Self {
        Driver {
            pacing: delay.into(),
        }
    }

    /// The send flow: sends every request in order, then closes the send
    /// direction. Returns the number of requests sent.
    pub async fn send_all<T, S>(&self, sender: &mut Sender<T>, requests: S) -> Result<usize, Status>
    where
        S: Stream<Item = T>,
    {
        send_flow(self.pacing, sender, requests).await
    }

    /// The receive flow: hands every response to `sink` until end-of-stream.
    /// Returns the number of responses received.
    pub async fn recv_all<T, F>(&self, streaming: &mut Streaming<T>, sink: F) -> Result<usize, Status>
    where
        F: FnMut(T),
    {
        recv_flow(streaming, sink).await
    }

    /// Runs a client-streaming call: the send flow completes and closes
    /// before the single response is read.
    pub async fn client_streaming<Req, Resp, S>(
        &self,
        mut sender: Sender<Req>,
        mut streaming: Streaming<Resp>,
        requests: S,
    ) -> Result<Resp, Status>
    where
        S: Stream<Item = Req>,
    {
        if let Err(status) = self.send_all(&mut sender, requests).await {
            // The peer may have ended the call first; prefer its reason.
            return Err(streaming
                .message()
                .await
                .err()
                .filter(|s| s.code() != crate::Code::InvalidState)
                .unwrap_or(status));
        }

        single_response(&mut streaming).await
    }

    /// Runs a bidirectional call: the send flow and the receive flow run as
    /// two tasks, and this returns once both finished.
    ///
    /// If both flows fail, the receive flow's error is returned, since it
    /// carries the reason the peer gave.
    pub async fn bidi<Req, Resp, S, F>(
        &self,
        mut sender: Sender<Req>,
        mut streaming: Streaming<Resp>,
        requests: S,
        mut sink: F,
    ) -> Result<FlowSummary, Status>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        S: Stream<Item = Req> + Send + 'static,
        F: FnMut(Resp) + Send + 'static,
    {
        let latch = CompletionLatch::new(2);
        let pacing = self.pacing;

        let send_task = {
            let done = latch.guard();
            tokio::spawn(async move {
                let _done = done;
                send_flow(pacing, &mut sender, requests).await
            })
        };
        let recv_task = {
            let done = latch.guard();
            tokio::spawn(async move {
                let _done = done;
                recv_flow(&mut streaming, &mut sink).await
            })
        };

        latch.wait().await;
        debug!("send and receive flows finished");

        let sent = send_task.await.map_err(flow_panicked)?;
        let received = recv_task.await.map_err(flow_panicked)?;

        match (sent, received) {
            (Ok(sent), Ok(received)) => Ok(FlowSummary { sent, received }),
            (sent, Err(status)) => {
                if let Err(send_status) = sent {
                    debug!(%send_status, "send flow also failed");
                }
                Err(status)
            }
            (Err(status), Ok(_)) => Err(status),
        }
    }
}

async fn send_flow<T, S>(
    pacing: Option<Duration>,
    sender: &mut Sender<T>,
    requests: S,
) -> Result<usize, Status>
where
    S: Stream<Item = T>,
{
    pin_mut!(requests);
    let mut sent = 0;

    while let Some(request) = requests.next().await {
        if let (Some(delay), true) = (pacing, sent > 0) {
            tokio::time::sleep(delay).await;
        }
        sender.send(request).await?;
        sent += 1;
    }

    sender.close_send().await?;
    Ok(sent)
}

async fn recv_flow<T, F>(streaming: &mut Streaming<T>, mut sink: F) -> Result<usize, Status>
where
    F: FnMut(T),
{
    let mut received = 0;

    while let Some(response) = streaming.message().await? {
        sink(response);
        received += 1;
    }

    Ok(received)
}

/// Reads exactly one message followed by end-of-stream.
pub(crate) async fn single_response<T>(streaming: &mut Streaming<T>) -> Result<T, Status> {
    let response = match streaming.message().await? {
        Some(response) => response,
        None => return Err(Status::internal("Missing response message.")),
    };

    match streaming.message().await? {
        None => Ok(response),
        Some(_) => {
            let status = Status::internal("Expected exactly one response message.");
            streaming.lifecycle().abort(status.clone());
            Err(status)
        }
    }
}

fn flow_panicked(err: tokio::task::JoinError) -> Status {
    warn!(error = %err, "flow task failed");
    Status::internal(format!("flow task failed: {}", err))
}
