//! A typed client for `greet.GreetService`.

use std::time::Duration;

use futures_util::Stream;
use runnel::client::{CallOptions, Channel, Driver, Endpoint, FlowSummary, Rpc};
use runnel::codec::ProstCodec;
use runnel::stream::{Sender, Streaming};
use runnel::{transport, Status};

use crate::pb::{GreetRequest, GreetResponse, Numbers};
use crate::server::methods;

/// Calls `greet.GreetService` over a [`Channel`].
///
/// ```rust,no_run
/// # use runnel_greet::{client::GreeterClient, pb::Greeting};
/// # async fn doc() -> Result<(), Box<dyn std::error::Error>> {
/// let client = GreeterClient::connect("127.0.0.1:50051").await?;
/// let response = client.greet(Greeting::full("Ann", "Lee").into()).await?;
/// assert_eq!(response.result, "Hi Ann Lee");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct GreeterClient {
    inner: Rpc,
    options: CallOptions,
    driver: Driver,
}

impl GreeterClient {
    /// Connects to a server listening on `dst`.
    pub async fn connect(dst: impl Into<String>) -> Result<Self, transport::Error> {
        let channel = Endpoint::from_shared(dst).connect().await?;
        Ok(Self::new(channel))
    }

    /// A client calling over `channel`.
    pub fn new(channel: Channel) -> Self {
        GreeterClient {
            inner: Rpc::new(channel),
            options: CallOptions::new(),
            driver: Driver::new(),
        }
    }

    /// Sets the deadline of every call made by this client.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.timeout(timeout);
        self
    }

    /// Waits `delay` between two requests of a streaming call.
    pub fn pacing(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.driver = self.driver.pacing(delay);
        self
    }

    /// `Greet`
    pub async fn greet(&self, request: GreetRequest) -> Result<GreetResponse, Status> {
        self.inner
            .unary(request, methods::GREET, ProstCodec::default(), &self.options)
            .await
    }

    /// `GreetManyTimes`: the returned stream ends after the last greeting.
    pub async fn greet_many_times(
        &self,
        request: GreetRequest,
    ) -> Result<Streaming<GreetResponse>, Status> {
        self.inner
            .server_streaming(
                request,
                methods::GREET_MANY_TIMES,
                ProstCodec::default(),
                &self.options,
            )
            .await
    }

    /// `LongGreet`: sends every request, then returns the single response.
    pub async fn long_greet<S>(&self, requests: S) -> Result<GreetResponse, Status>
    where
        S: Stream<Item = GreetRequest>,
    {
        let (tx, rx) = self.open(methods::LONG_GREET).await?;
        self.driver.client_streaming(tx, rx, requests).await
    }

    /// `GreetEveryOne`: sends `requests` while handing each greeting to
    /// `sink`, returning once both are done.
    pub async fn greet_every_one<S, F>(&self, requests: S, sink: F) -> Result<FlowSummary, Status>
    where
        S: Stream<Item = GreetRequest> + Send + 'static,
        F: FnMut(GreetResponse) + Send + 'static,
    {
        let (tx, rx) = self.open(methods::GREET_EVERY_ONE).await?;
        self.driver.bidi(tx, rx, requests, sink).await
    }

    /// `FindMaximum`: sends `numbers` while handing each reported maximum to
    /// `sink`, returning once both are done.
    pub async fn find_maximum<S, F>(&self, numbers: S, sink: F) -> Result<FlowSummary, Status>
    where
        S: Stream<Item = Numbers> + Send + 'static,
        F: FnMut(Numbers) + Send + 'static,
    {
        let (tx, rx) = self.open(methods::FIND_MAXIMUM).await?;
        self.driver.bidi(tx, rx, numbers, sink).await
    }

    /// Opens `GreetEveryOne` with both directions left to the caller.
    pub async fn greet_every_one_stream(
        &self,
    ) -> Result<(Sender<GreetRequest>, Streaming<GreetResponse>), Status> {
        self.open(methods::GREET_EVERY_ONE).await
    }

    /// Opens `FindMaximum` with both directions left to the caller.
    pub async fn find_maximum_stream(
        &self,
    ) -> Result<(Sender<Numbers>, Streaming<Numbers>), Status> {
        self.open(methods::FIND_MAXIMUM).await
    }

    async fn open<M1, M2>(&self, method: &str) -> Result<(Sender<M1>, Streaming<M2>), Status>
    where
        M1: prost::Message + Send + 'static,
        M2: prost::Message + Default + Send + 'static,
    {
        self.inner
            .streaming(method, ProstCodec::default(), &self.options)
            .await
    }
}
