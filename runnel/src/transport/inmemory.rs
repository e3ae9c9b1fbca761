//! A transport that connects a client and a server inside one process.
//!
//! ```
//! # async fn doc() {
//! use runnel::transport::inmemory;
//!
//! let (transport, listener) = inmemory::pair();
//! // Hand `listener` to `Server::serve_with_listener` and `transport` to
//! // `Channel::from_transport`.
//! # drop((transport, listener));
//! # }
//! ```

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

use super::{IncomingCall, Listener, RawStream, RequestHeaders, Transport};
use crate::pipe::{self, DEFAULT_BUFFER_SIZE};
use crate::Status;

/// Creates a connected transport/listener pair using the default per-direction
/// buffer size.
pub fn pair() -> (InMemoryTransport, InMemoryListener) {
    pair_with_buffer_size(DEFAULT_BUFFER_SIZE)
}

/// Creates a connected transport/listener pair whose stream directions each
/// buffer at most `buffer_size` frames.
pub fn pair_with_buffer_size(buffer_size: usize) -> (InMemoryTransport, InMemoryListener) {
    let (tx, rx) = mpsc::channel(1);
    (
        InMemoryTransport { calls: tx, buffer_size },
        InMemoryListener {
            calls: AsyncMutex::new(rx),
        },
    )
}

/// The client half of an in-memory connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    calls: mpsc::Sender<IncomingCall>,
    buffer_size: usize,
}

/// The server half of an in-memory connection.
#[derive(Debug)]
pub struct InMemoryListener {
    calls: AsyncMutex<mpsc::Receiver<IncomingCall>>,
}

impl InMemoryListener {
    /// Stops accepting calls. Calls already handed to the listener are still
    /// returned by `accept`.
    pub async fn close(&self) {
        self.calls.lock().await.close();
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn open(&self, headers: RequestHeaders) -> Result<RawStream, Status> {
        let (client_tx, server_rx) = pipe::pipe(self.buffer_size);
        let (server_tx, client_rx) = pipe::pipe(self.buffer_size);

        trace!(method = headers.method_name(), "opening in-memory stream");

        let call = IncomingCall {
            headers,
            stream: RawStream {
                tx: server_tx,
                rx: server_rx,
            },
        };

        self.calls
            .send(call)
            .await
            .map_err(|_| Status::transport("in-memory listener is closed"))?;

        Ok(RawStream {
            tx: client_tx,
            rx: client_rx,
        })
    }
}

#[async_trait]
impl Listener for InMemoryListener {
    async fn accept(&self) -> Option<IncomingCall> {
        self.calls.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Frame;
    use crate::Code;
    use bytes::Bytes;

    #[tokio::test]
    async fn open_reaches_listener() {
        let (transport, listener) = pair();

        let opened = tokio::spawn(async move {
            transport
                .open(RequestHeaders::new("svc/Method"))
                .await
                .unwrap()
        });

        let mut incoming = listener.accept().await.unwrap();
        assert_eq!(incoming.headers.method_name(), "svc/Method");

        let client = opened.await.unwrap();
        client
            .tx
            .send(Frame::Data(Bytes::from_static(b"ping")))
            .await
            .unwrap();

        match incoming.stream.rx.recv().await {
            Some(Frame::Data(data)) => assert_eq!(&data[..], b"ping"),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn open_after_close_fails() {
        let (transport, listener) = pair();
        listener.close().await;

        let err = transport
            .open(RequestHeaders::new("svc/Method"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Transport);
        assert!(listener.accept().await.is_none());
    }
}
