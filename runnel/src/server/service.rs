use async_trait::async_trait;

use crate::stream::{Sender, StreamStats, Streaming};
use crate::Status;

/// Handles unary calls: one request in, one response out.
///
/// Called once per call, after the request direction has ended.
#[async_trait]
pub trait UnaryHandler<Req: Send + 'static>: Send + Sync + 'static {
    /// Response message type
    type Response: Send + 'static;

    /// Handle the request.
    async fn call(&self, request: Req) -> Result<Self::Response, Status>;
}

/// Handles server-streaming calls: one request in, any number of responses
/// out.
///
/// Returning ends the response stream; returning an error terminates the call
/// with that status instead.
#[async_trait]
pub trait ServerStreamHandler<Req: Send + 'static>: Send + Sync + 'static {
    /// Response message type
    type Response: Send + 'static;

    /// Handle the request, emitting responses in order.
    async fn call(
        &self,
        request: Req,
        emitter: &mut Emitter<Self::Response>,
    ) -> Result<(), Status>;
}

/// Handles client-streaming calls: any number of requests in, one response
/// out.
///
/// The response is sent only after the request direction has ended, even if
/// the handler returns before reading every request.
#[async_trait]
pub trait ClientStreamHandler<Req: Send + 'static>: Send + Sync + 'static {
    /// Response message type
    type Response: Send + 'static;

    /// Fold the requests into the single response.
    async fn call(&self, requests: Streaming<Req>) -> Result<Self::Response, Status>;
}

/// Handles bidirectional streaming calls.
///
/// Requests may be read and responses emitted in any order. If the handler
/// returns before the request stream is exhausted, the remaining requests are
/// discarded and the response direction is still closed normally.
#[async_trait]
pub trait BidiStreamHandler<Req: Send + 'static>: Send + Sync + 'static {
    /// Response message type
    type Response: Send + 'static;

    /// Handle the call.
    async fn call(
        &self,
        requests: Streaming<Req>,
        emitter: &mut Emitter<Self::Response>,
    ) -> Result<(), Status>;
}

/// Emits responses on the send direction of a server call.
#[derive(Debug)]
pub struct Emitter<T> {
    sender: Sender<T>,
    emitted: usize,
}

impl<T> Emitter<T> {
    pub(crate) fn new(sender: Sender<T>) -> Self {
        Emitter { sender, emitted: 0 }
    }

    /// Sends one response. Waits if the client is slow to read.
    ///
    /// Fails once the call was cancelled, timed out or lost its transport;
    /// handlers should return the error.
    pub async fn emit(&mut self, response: T) -> Result<(), Status> {
        self.sender.send(response).await?;
        self.emitted += 1;
        Ok(())
    }

    /// The number of responses emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Message counters for the call.
    pub fn stats(&self) -> StreamStats {
        self.sender.stats()
    }

    pub(crate) fn sender(&mut self) -> &mut Sender<T> {
        &mut self.sender
    }
}
