//! Single-direction, ordered message channels.
//!
//! A pipe is the unit every call shape is built from: a stream owns one pipe
//! per direction. Messages are delivered reliably and in the order they were
//! sent. `send` waits while the pipe is full, which is how backpressure
//! reaches the producer.

use std::fmt;

use tokio::sync::mpsc;

/// The default number of messages a pipe buffers before `send` waits.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 32;

/// Creates a pipe holding at most `capacity` in-flight messages.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn pipe<T>(capacity: usize) -> (PipeSender<T>, PipeReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (PipeSender { inner: tx }, PipeReceiver { inner: rx })
}

/// The writing end of a pipe.
pub struct PipeSender<T> {
    inner: mpsc::Sender<T>,
}

/// The reading end of a pipe.
pub struct PipeReceiver<T> {
    inner: mpsc::Receiver<T>,
}

/// The reading end of the pipe has gone away. The unsent message is handed
/// back.
pub struct Disconnected<T>(pub T);

impl<T> fmt::Debug for Disconnected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disconnected").finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Disconnected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipe receiver disconnected")
    }
}

impl<T> std::error::Error for Disconnected<T> {}

impl<T> PipeSender<T> {
    /// Sends a message, waiting for buffer space if the pipe is full.
    pub async fn send(&self, msg: T) -> Result<(), Disconnected<T>> {
        self.inner.send(msg).await.map_err(|e| Disconnected(e.0))
    }

    /// Sends a message only if there is room for it right now.
    ///
    /// Used where waiting is not possible, e.g. from `Drop`.
    pub fn try_send(&self, msg: T) -> Result<(), Disconnected<T>> {
        self.inner.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(msg) | mpsc::error::TrySendError::Closed(msg) => {
                Disconnected(msg)
            }
        })
    }

    /// Returns true once the reading end has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl<T> Clone for PipeSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PipeReceiver<T> {
    /// Receives the next message.
    ///
    /// Returns `None` once every sender has been dropped and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }
}

impl<T> fmt::Debug for PipeSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeSender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> fmt::Debug for PipeReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReceiver").finish()
    }
}
