//! Typed handles over the two directions of a stream.
//!
//! A call owns exactly one stream. [`Sender`] drives its send direction and
//! [`Streaming`] its receive direction; both share the call's lifecycle so
//! that termination observed through one wakes the other.

use std::{fmt, sync::Arc};

use bytes::BytesMut;
use futures_util::Stream;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, trace};

use crate::codec::{Decoder, Encoder};
use crate::pipe::PipeReceiver;
use crate::transport::{Frame, RawStream};
use crate::Status;

pub(crate) mod lifecycle;

use self::lifecycle::{Lifecycle, Outcome};
pub use self::lifecycle::{CancelHandle, DirectionState, StreamStats};

type BoxEncoder<T> = Box<dyn Encoder<Item = T, Error = Status> + Send + 'static>;
type BoxDecoder<T> = Box<dyn Decoder<Item = T, Error = Status> + Send + 'static>;

/// Splits a raw stream into its typed send and receive halves.
///
/// `cancel_on_drop` decides what dropping the receive half before end-of-stream
/// means: the client gives up on the call, while the server keeps draining so
/// its response direction can still complete.
pub(crate) fn open<E, D>(
    method: &str,
    stream: RawStream,
    deadline: Option<Instant>,
    encoder: E,
    decoder: D,
    cancel_on_drop: bool,
) -> (Sender<E::Item>, Streaming<D::Item>)
where
    E: Encoder<Error = Status> + Send + 'static,
    D: Decoder<Error = Status> + Send + 'static,
{
    let RawStream { tx, rx } = stream;
    let lifecycle = Arc::new(Lifecycle::new(method, tx, deadline));

    let sender = Sender {
        encoder: Box::new(encoder),
        lifecycle: lifecycle.clone(),
    };
    let streaming = Streaming {
        decoder: Box::new(decoder),
        rx: Some(rx),
        lifecycle,
        cancel_on_drop,
    };

    (sender, streaming)
}

/// The send direction of a call.
pub struct Sender<T> {
    encoder: BoxEncoder<T>,
    lifecycle: Arc<Lifecycle>,
}

impl<T> Sender<T> {
    /// Sends one message, waiting for buffer space if the peer is slow.
    ///
    /// Fails with `InvalidState` after [`Sender::close_send`]. Once the call
    /// is terminated (cancelled, past its deadline, failed by either side) the
    /// direction reports [`DirectionState::Closed`] as well, but every send
    /// fails with the terminal status instead, e.g. `Cancelled`.
    pub async fn send(&mut self, message: T) -> Result<(), Status> {
        let tx = self.lifecycle.begin_send()?;

        let mut buf = BytesMut::new();
        if let Err(status) = self.encoder.encode(message, &mut buf) {
            self.lifecycle.abort(status.clone());
            return Err(status);
        }
        let len = buf.len();

        let lifecycle = &self.lifecycle;
        lifecycle
            .guard(async {
                tx.send(Frame::Data(buf.freeze()))
                    .await
                    .map_err(|_| peer_gone(lifecycle))
            })
            .await?;

        lifecycle.record_sent();
        trace!(method = lifecycle.method(), len, "message sent");
        Ok(())
    }

    /// Half-closes the send direction and waits until the transport took the
    /// end-of-stream marker.
    ///
    /// A second call fails with `InvalidState`; on a terminated call it fails
    /// with the terminal status.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        let tx = self.lifecycle.half_close_send()?;

        let lifecycle = &self.lifecycle;
        lifecycle
            .guard(async {
                tx.send(Frame::End).await.map_err(|_| peer_gone(lifecycle))
            })
            .await?;

        lifecycle.ack_send_close();
        Ok(())
    }

    /// Terminates the call with `status` and sends it to the peer in place of
    /// any further messages.
    pub(crate) fn fail(&mut self, status: Status) {
        self.lifecycle.abort(status);
    }

    /// The state of the send direction.
    pub fn state(&self) -> DirectionState {
        self.lifecycle.send_state()
    }

    /// Message counters for the call.
    pub fn stats(&self) -> StreamStats {
        self.lifecycle.stats()
    }

    /// Returns a handle that can cancel the call from anywhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.lifecycle.send_state() == DirectionState::Open && !self.lifecycle.is_terminal() {
            debug!(method = self.lifecycle.method(), "sender dropped while open");
            self.lifecycle
                .abort(Status::cancelled("sender dropped before close_send"));
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("method", &self.lifecycle.method())
            .field("state", &self.state())
            .finish()
    }
}

/// The receive direction of a call.
pub struct Streaming<T> {
    decoder: BoxDecoder<T>,
    rx: Option<PipeReceiver<Frame>>,
    lifecycle: Arc<Lifecycle>,
    cancel_on_drop: bool,
}

impl<T> Streaming<T> {
    /// Fetch the next message from this stream.
    ///
    /// Returns `Ok(None)` exactly once, at end-of-stream. Receiving again
    /// after that fails with `InvalidState`. A terminated call is different:
    /// the direction reports [`DirectionState::Closed`], and every receive
    /// returns the terminal status (e.g. `Cancelled` or `Transport`).
    ///
    /// ```rust
    /// # use runnel::{Status, stream::Streaming};
    /// # async fn doc(mut request: Streaming<String>) -> Result<(), Status> {
    /// while let Some(message) = request.message().await? {
    ///     println!("{}", message);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        self.lifecycle.begin_recv()?;

        let lifecycle = &self.lifecycle;
        let rx = match self.rx.as_mut() {
            Some(rx) => rx,
            None => return Err(Status::invalid_state("receive after end-of-stream")),
        };

        let frame = lifecycle.guard(async { Ok(rx.recv().await) }).await?;

        match frame {
            Some(Frame::Data(bytes)) => match self.decoder.decode(bytes) {
                Ok(message) => {
                    lifecycle.record_received();
                    trace!(method = lifecycle.method(), "message received");
                    Ok(Some(message))
                }
                Err(status) => {
                    lifecycle.abort(status.clone());
                    Err(status)
                }
            },
            Some(Frame::End) => {
                lifecycle.observe_end();
                if let Some(rx) = self.rx.take() {
                    spawn_tail_watch(rx, lifecycle.clone());
                }
                Ok(None)
            }
            Some(Frame::Error(status)) => {
                lifecycle.fail(status.clone());
                Err(lifecycle.terminal_status().unwrap_or(status))
            }
            None => {
                lifecycle.fail(Status::transport("stream closed without end-of-stream"));
                Err(lifecycle
                    .terminal_status()
                    .unwrap_or_else(|| Status::transport("stream closed")))
            }
        }
    }

    /// Converts the stream into a [`Stream`] of messages that ends at
    /// end-of-stream or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> + Send + 'static
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut streaming = state?;
            match streaming.message().await {
                Ok(Some(message)) => Some((Ok(message), Some(streaming))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }

    /// The state of the receive direction.
    pub fn state(&self) -> DirectionState {
        self.lifecycle.recv_state()
    }

    /// Message counters for the call.
    pub fn stats(&self) -> StreamStats {
        self.lifecycle.stats()
    }

    /// Returns a handle that can cancel the call from anywhere.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    pub(crate) fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }
}

impl<T> Drop for Streaming<T> {
    fn drop(&mut self) {
        let Some(rx) = self.rx.take() else {
            return;
        };

        if self.cancel_on_drop {
            if !self.lifecycle.is_terminal() {
                debug!(method = self.lifecycle.method(), "response stream dropped, cancelling");
                self.lifecycle
                    .abort(Status::cancelled("response stream dropped"));
            }
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(drain(rx, self.lifecycle.clone()));
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("method", &self.lifecycle.method())
            .field("state", &self.state())
            .finish()
    }
}

fn peer_gone(lifecycle: &Lifecycle) -> Status {
    lifecycle.fail(Status::transport("peer closed the stream"));
    lifecycle
        .terminal_status()
        .unwrap_or_else(|| Status::transport("peer closed the stream"))
}

fn spawn_tail_watch(rx: PipeReceiver<Frame>, lifecycle: Arc<Lifecycle>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(watch_tail(rx, lifecycle));
    }
}

/// Discards requests the handler chose not to read, so the peer can finish
/// sending and the call can still complete.
async fn drain(mut rx: PipeReceiver<Frame>, lifecycle: Arc<Lifecycle>) {
    let mut discarded = 0usize;

    loop {
        match rx.recv().await {
            Some(Frame::Data(_)) => discarded += 1,
            Some(Frame::End) => {
                trace!(method = lifecycle.method(), discarded, "drained unread messages");
                lifecycle.observe_end();
                return watch_tail(rx, lifecycle).await;
            }
            Some(Frame::Error(status)) => return lifecycle.fail(status),
            None => {
                return lifecycle.fail(Status::transport("stream closed without end-of-stream"))
            }
        }
    }
}

/// Keeps listening after end-of-stream: the peer may still terminate the
/// call (e.g. cancel) while this side is sending.
async fn watch_tail(mut rx: PipeReceiver<Frame>, lifecycle: Arc<Lifecycle>) {
    let over = call_over(lifecycle.subscribe());
    tokio::pin!(over);

    loop {
        tokio::select! {
            () = &mut over => return,
            frame = rx.recv() => match frame {
                Some(Frame::Error(status)) => return lifecycle.fail(status),
                Some(_) => debug!(method = lifecycle.method(), "frame after end-of-stream ignored"),
                None => return,
            }
        }
    }
}

async fn call_over(mut outcome: watch::Receiver<Outcome>) {
    let _ = outcome
        .wait_for(|o| !matches!(o, Outcome::Running))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, ProstCodec};
    use crate::pipe;
    use crate::Code;
    use std::time::Duration;

    type Pair = (
        (Sender<String>, Streaming<String>),
        (Sender<String>, Streaming<String>),
    );

    fn connected(deadline: Option<Instant>) -> Pair {
        let (a_tx, b_rx) = pipe::pipe(4);
        let (b_tx, a_rx) = pipe::pipe(4);
        let mut codec = ProstCodec::<String, String>::default();

        let a = open(
            "svc/Test",
            RawStream { tx: a_tx, rx: a_rx },
            deadline,
            codec.encoder(),
            codec.decoder(),
            true,
        );
        let b = open(
            "svc/Test",
            RawStream { tx: b_tx, rx: b_rx },
            None,
            codec.encoder(),
            codec.decoder(),
            false,
        );
        (a, b)
    }

    #[tokio::test]
    async fn messages_then_end_of_stream() {
        let ((mut tx, _a_rx), (_b_tx, mut rx)) = connected(None);

        tx.send("one".to_string()).await.unwrap();
        tx.send("two".to_string()).await.unwrap();
        tx.close_send().await.unwrap();
        assert_eq!(tx.state(), DirectionState::Closed);

        assert_eq!(rx.message().await.unwrap().as_deref(), Some("one"));
        assert_eq!(rx.message().await.unwrap().as_deref(), Some("two"));
        assert_eq!(rx.message().await.unwrap(), None);
        assert_eq!(rx.state(), DirectionState::Closed);
        assert_eq!(rx.stats().received, 2);
        assert_eq!(tx.stats().sent, 2);
    }

    #[tokio::test]
    async fn operations_after_close_are_invalid_state() {
        let ((mut tx, _a_rx), (_b_tx, mut rx)) = connected(None);
        tx.close_send().await.unwrap();

        for _ in 0..3 {
            let err = tx.send("late".to_string()).await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidState);
            let err = tx.close_send().await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidState);
        }

        assert_eq!(rx.message().await.unwrap(), None);
        for _ in 0..3 {
            let err = rx.message().await.unwrap_err();
            assert_eq!(err.code(), Code::InvalidState);
        }
    }

    #[tokio::test]
    async fn cancelled_call_repeats_its_status() {
        let ((mut tx, mut rx), (_b_tx, _b_rx)) = connected(None);
        tx.cancel_handle().cancel();

        assert_eq!(tx.state(), DirectionState::Closed);
        assert_eq!(rx.state(), DirectionState::Closed);
        for _ in 0..3 {
            let err = tx.send("late".to_string()).await.unwrap_err();
            assert_eq!(err.code(), Code::Cancelled);
            let err = tx.close_send().await.unwrap_err();
            assert_eq!(err.code(), Code::Cancelled);
            let err = rx.message().await.unwrap_err();
            assert_eq!(err.code(), Code::Cancelled);
        }
    }

    #[tokio::test]
    async fn peer_error_terminates_locally() {
        let ((mut a_tx, mut a_rx), (mut b_tx, _b_rx)) = connected(None);

        b_tx.fail(Status::handler("no"));

        let err = a_rx.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Handler);
        assert_eq!(a_rx.state(), DirectionState::Closed);

        let err = a_tx.send("x".to_string()).await.unwrap_err();
        assert_eq!(err.code(), Code::Handler);
    }

    #[tokio::test]
    async fn dropping_open_sender_cancels_peer() {
        let ((a_tx, _a_rx), (_b_tx, mut b_rx)) = connected(None);

        drop(a_tx);

        let err = b_rx.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn cancel_wakes_blocked_receive() {
        let ((_a_tx, mut a_rx), _b) = connected(None);
        let handle = a_rx.cancel_handle();

        let blocked = tokio::spawn(async move { a_rx.message().await });
        tokio::task::yield_now().await;
        handle.cancel();

        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(handle.is_terminal());
    }

    #[tokio::test]
    async fn cancel_reaches_peer_after_half_close() {
        let ((mut a_tx, a_rx), (mut b_tx, mut b_rx)) = connected(None);

        a_tx.close_send().await.unwrap();
        assert_eq!(b_rx.message().await.unwrap(), None);

        a_rx.cancel_handle().cancel();

        // The peer's send direction is still open; it learns about the
        // cancellation through the tail of its receive direction.
        let mut result = Ok(());
        for _ in 0..10 {
            result = b_tx.send("tick".to_string()).await;
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
        drop(a_rx);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_wakes_blocked_receive() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let ((_a_tx, mut a_rx), (_b_tx, mut b_rx)) = connected(Some(deadline));

        let err = a_rx.message().await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);

        // The deadline is delivered to the peer like a cancellation.
        let err = b_rx.message().await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn malformed_message_is_codec_error() {
        let (a_tx, mut b_rx) = pipe::pipe(4);
        let (b_tx, a_rx) = pipe::pipe(4);
        let mut codec = ProstCodec::<String, String>::default();
        let (_tx, mut rx) = open(
            "svc/Test",
            RawStream { tx: a_tx, rx: a_rx },
            None,
            codec.encoder(),
            codec.decoder(),
            true,
        );

        b_tx.send(Frame::Data(bytes::Bytes::from_static(&[0x0a, 0x10])))
            .await
            .unwrap();

        let err = rx.message().await.unwrap_err();
        assert_eq!(err.code(), Code::Codec);

        // The peer is told why the call ended.
        match b_rx.recv().await {
            Some(Frame::Error(status)) => assert_eq!(status.code(), Code::Codec),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn into_stream_ends_at_end_of_stream() {
        use futures_util::StreamExt;

        let ((mut tx, _a_rx), (_b_tx, rx)) = connected(None);
        for word in ["a", "b", "c"] {
            tx.send(word.to_string()).await.unwrap();
        }
        tx.close_send().await.unwrap();

        let got: Vec<String> = rx.into_stream().map(Result::unwrap).collect().await;
        assert_eq!(got, ["a", "b", "c"]);
    }
}
