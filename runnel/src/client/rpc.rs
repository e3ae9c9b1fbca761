use std::time::Duration;

use futures_util::Stream;
use tokio::time::Instant;
use tracing::debug;

use super::{driver, CallOptions, Channel, Driver};
use crate::codec::Codec;
use crate::stream::{self, Sender, Streaming};
use crate::transport::RequestHeaders;
use crate::Status;

/// A codec agnostic call dispatcher.
///
/// This is the low level client that typed stubs are built on. Each method
/// opens one stream on the channel and composes the send and receive
/// directions according to the call shape.
#[derive(Debug, Clone)]
pub struct Rpc {
    channel: Channel,
}

impl Rpc {
    /// Creates a new dispatcher over `channel`.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// The channel calls are opened on.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Send a single unary request: exactly one message each way.
    pub async fn unary<M1, M2, C>(
        &self,
        request: M1,
        method: &str,
        codec: C,
        options: &CallOptions,
    ) -> Result<M2, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
    {
        let (mut tx, mut rx) = self.streaming(method, codec, options).await?;

        tx.send(request).await?;
        tx.close_send().await?;

        driver::single_response(&mut rx).await
    }

    /// Send a single request and return the stream of responses.
    ///
    /// End-of-stream on the returned [`Streaming`] is the normal end of the
    /// call.
    pub async fn server_streaming<M1, M2, C>(
        &self,
        request: M1,
        method: &str,
        codec: C,
        options: &CallOptions,
    ) -> Result<Streaming<M2>, Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
    {
        let (mut tx, rx) = self.streaming(method, codec, options).await?;

        tx.send(request).await?;
        tx.close_send().await?;

        Ok(rx)
    }

    /// Send every message of `requests`, then wait for the single response.
    pub async fn client_streaming<S, M1, M2, C>(
        &self,
        requests: S,
        method: &str,
        codec: C,
        options: &CallOptions,
    ) -> Result<M2, Status>
    where
        S: Stream<Item = M1>,
        C: Codec<Encode = M1, Decode = M2>,
    {
        let (tx, rx) = self.streaming(method, codec, options).await?;
        Driver::new().client_streaming(tx, rx, requests).await
    }

    /// Open a call with both directions left to the caller.
    ///
    /// Dropping the returned [`Sender`] before [`Sender::close_send`], or the
    /// [`Streaming`] before end-of-stream, cancels the call.
    pub async fn streaming<M1, M2, C>(
        &self,
        method: &str,
        mut codec: C,
        options: &CallOptions,
    ) -> Result<(Sender<M1>, Streaming<M2>), Status>
    where
        C: Codec<Encode = M1, Decode = M2>,
    {
        let timeout = options.timeout.or(self.channel.timeout());
        let deadline = timeout.map(|t| Instant::now() + t);
        let headers = RequestHeaders::new(method).with_timeout(timeout);

        let open = self.channel.open(headers);
        let raw = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, open)
                .await
                .map_err(|_| Status::deadline_exceeded("deadline elapsed while opening the call"))??,
            None => open.await?,
        };

        debug!(method, ?timeout, "call opened");

        Ok(stream::open(
            method,
            raw,
            deadline,
            codec.encoder(),
            codec.decoder(),
            true,
        ))
    }
}

impl CallOptions {
    /// Options with no per-call deadline beyond the channel default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline for the call, counted from when it is opened.
    ///
    /// The timeout is also sent to the server, which stops the handler once
    /// it elapses.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
