//! The transport a call runs over.
//!
//! A transport opens streams tagged with a method identifier and carries
//! [`Frame`]s in both directions. It knows nothing about call shapes or
//! message types; those live in [`crate::stream`], [`crate::client`] and
//! [`crate::server`].
//!
//! Two implementations are provided: [`inmemory`] connects a client and a
//! server inside one process, and [`tcp`] multiplexes many calls over one
//! TCP connection.

use std::{error, fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::pipe::{PipeReceiver, PipeSender};
use crate::Status;

pub mod inmemory;
pub mod tcp;

/// A unit of data on one direction of a stream.
#[derive(Debug, Clone)]
pub enum Frame {
    /// One encoded message.
    Data(Bytes),
    /// The sender will not send anything else on this direction.
    End,
    /// The sender terminated the call with the given status.
    Error(Status),
}

/// Information sent when a stream is opened.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    /// The full (e.g. "greet.GreetService/Greet") method name for the call.
    method_name: String,
    /// How long the caller is willing to wait for the call to finish.
    timeout: Option<Duration>,
}

impl RequestHeaders {
    /// Returns headers for the given method.
    pub fn new(method_name: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            timeout: None,
        }
    }

    /// Replaces the timeout of self with `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the full method name for these headers.
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// Returns the propagated call timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Both directions of an opened stream, as seen by one endpoint.
#[derive(Debug)]
pub struct RawStream {
    /// Frames to the peer.
    pub tx: PipeSender<Frame>,
    /// Frames from the peer.
    pub rx: PipeReceiver<Frame>,
}

/// A stream opened by a client, as accepted by the server.
#[derive(Debug)]
pub struct IncomingCall {
    /// The headers the client opened the stream with.
    pub headers: RequestHeaders,
    /// The server's end of the stream.
    pub stream: RawStream,
}

/// The client side of a transport.
///
/// Implementations must be safe to use from many concurrently open calls.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a new stream for one call.
    async fn open(&self, headers: RequestHeaders) -> Result<RawStream, Status>;
}

/// The server side of a transport.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Waits for the next call. Returns `None` once the listener is closed.
    async fn accept(&self) -> Option<IncomingCall>;
}

type Source = Box<dyn error::Error + Send + Sync + 'static>;

/// Errors that happen while binding or connecting a transport.
#[derive(Debug)]
pub struct Error(Source);

impl Error {
    pub(crate) fn from_source(source: impl Into<Source>) -> Self {
        Self(source.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}
