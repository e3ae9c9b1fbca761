//! The server side of `greet.GreetService`.
//!
//! [`Greeter`] is the service contract, [`GreeterServer`] registers an
//! implementation of it with a [`runnel::server::Server`], and [`GreetService`]
//! is the stock implementation.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use runnel::codec::ProstCodec;
use runnel::server::{
    BidiStreamHandler, ClientStreamHandler, Emitter, NamedService, Routes, ServerStreamHandler,
    UnaryHandler,
};
use runnel::stream::Streaming;
use runnel::Status;
use tracing::{debug, info};

use crate::pb::{GreetRequest, GreetResponse, Greeting, Numbers};

/// Methods of `greet.GreetService`.
#[async_trait]
pub trait Greeter: Send + Sync + 'static {
    /// Unary: one greeting for the full name.
    async fn greet(&self, request: GreetRequest) -> Result<GreetResponse, Status>;

    /// Server streaming: a sequence of numbered greetings.
    async fn greet_many_times(
        &self,
        request: GreetRequest,
        responses: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status>;

    /// Client streaming: one greeting for everybody in the request stream.
    async fn long_greet(&self, requests: Streaming<GreetRequest>)
        -> Result<GreetResponse, Status>;

    /// Bidirectional streaming: one greeting per request.
    async fn greet_every_one(
        &self,
        requests: Streaming<GreetRequest>,
        responses: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status>;

    /// Bidirectional streaming: the running maximum of the numbers received.
    async fn find_maximum(
        &self,
        requests: Streaming<Numbers>,
        responses: &mut Emitter<Numbers>,
    ) -> Result<(), Status>;
}

/// Registers a [`Greeter`] under the `greet.GreetService` method names.
///
/// ```rust
/// # use runnel::server::Server;
/// # use runnel_greet::server::{GreetService, GreeterServer};
/// let router = Server::builder().add_service(GreeterServer::new(GreetService::default()));
/// # drop(router);
/// ```
#[derive(Debug)]
pub struct GreeterServer<T> {
    inner: Arc<T>,
}

impl<T: Greeter> GreeterServer<T> {
    /// Wraps `inner`.
    pub fn new(inner: T) -> Self {
        Self::from_arc(Arc::new(inner))
    }

    /// Wraps an already shared `inner`.
    pub fn from_arc(inner: Arc<T>) -> Self {
        Self { inner }
    }
}

impl<T> Clone for GreeterServer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Greeter> NamedService for GreeterServer<T> {
    const NAME: &'static str = "greet.GreetService";
}

/// Full method identifiers of `greet.GreetService`.
pub mod methods {
    /// `Greet`
    pub const GREET: &str = "greet.GreetService/Greet";
    /// `GreetManyTimes`
    pub const GREET_MANY_TIMES: &str = "greet.GreetService/GreetManyTimes";
    /// `LongGreet`
    pub const LONG_GREET: &str = "greet.GreetService/LongGreet";
    /// `GreetEveryOne`
    pub const GREET_EVERY_ONE: &str = "greet.GreetService/GreetEveryOne";
    /// `FindMaximum`
    pub const FIND_MAXIMUM: &str = "greet.GreetService/FindMaximum";
}

impl<T: Greeter> From<GreeterServer<T>> for Routes {
    fn from(server: GreeterServer<T>) -> Self {
        let inner = server.inner;
        Routes::new()
            .unary(methods::GREET, ProstCodec::default(), GreetSvc(inner.clone()))
            .server_streaming(
                methods::GREET_MANY_TIMES,
                ProstCodec::default(),
                GreetManyTimesSvc(inner.clone()),
            )
            .client_streaming(
                methods::LONG_GREET,
                ProstCodec::default(),
                LongGreetSvc(inner.clone()),
            )
            .bidi_streaming(
                methods::GREET_EVERY_ONE,
                ProstCodec::default(),
                GreetEveryOneSvc(inner.clone()),
            )
            .bidi_streaming(
                methods::FIND_MAXIMUM,
                ProstCodec::default(),
                FindMaximumSvc(inner),
            )
    }
}

struct GreetSvc<T>(Arc<T>);

#[async_trait]
impl<T: Greeter> UnaryHandler<GreetRequest> for GreetSvc<T> {
    type Response = GreetResponse;

    async fn call(&self, request: GreetRequest) -> Result<GreetResponse, Status> {
        self.0.greet(request).await
    }
}

struct GreetManyTimesSvc<T>(Arc<T>);

#[async_trait]
impl<T: Greeter> ServerStreamHandler<GreetRequest> for GreetManyTimesSvc<T> {
    type Response = GreetResponse;

    async fn call(
        &self,
        request: GreetRequest,
        emitter: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status> {
        self.0.greet_many_times(request, emitter).await
    }
}

struct LongGreetSvc<T>(Arc<T>);

#[async_trait]
impl<T: Greeter> ClientStreamHandler<GreetRequest> for LongGreetSvc<T> {
    type Response = GreetResponse;

    async fn call(&self, requests: Streaming<GreetRequest>) -> Result<GreetResponse, Status> {
        self.0.long_greet(requests).await
    }
}

struct GreetEveryOneSvc<T>(Arc<T>);

#[async_trait]
impl<T: Greeter> BidiStreamHandler<GreetRequest> for GreetEveryOneSvc<T> {
    type Response = GreetResponse;

    async fn call(
        &self,
        requests: Streaming<GreetRequest>,
        emitter: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status> {
        self.0.greet_every_one(requests, emitter).await
    }
}

struct FindMaximumSvc<T>(Arc<T>);

#[async_trait]
impl<T: Greeter> BidiStreamHandler<Numbers> for FindMaximumSvc<T> {
    type Response = Numbers;

    async fn call(
        &self,
        requests: Streaming<Numbers>,
        emitter: &mut Emitter<Numbers>,
    ) -> Result<(), Status> {
        self.0.find_maximum(requests, emitter).await
    }
}

/// When `FindMaximum` reports the running maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReductionPolicy {
    /// One update per number received.
    #[default]
    EveryInput,
    /// An update only when the maximum grows.
    OnChange,
    /// A single update after the request stream ended.
    Final,
}

impl FromStr for ReductionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "every-input" => Ok(ReductionPolicy::EveryInput),
            "on-change" => Ok(ReductionPolicy::OnChange),
            "final" => Ok(ReductionPolicy::Final),
            other => Err(format!(
                "unknown reduction policy `{}`, expected one of: every-input, on-change, final",
                other
            )),
        }
    }
}

impl fmt::Display for ReductionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReductionPolicy::EveryInput => "every-input",
            ReductionPolicy::OnChange => "on-change",
            ReductionPolicy::Final => "final",
        })
    }
}

/// The stock [`Greeter`].
///
/// ```rust
/// # use std::time::Duration;
/// # use runnel_greet::server::{GreetService, ReductionPolicy};
/// let service = GreetService::new()
///     .greet_count(3)
///     .stream_delay(Duration::from_millis(100))
///     .reduction(ReductionPolicy::OnChange);
/// # drop(service);
/// ```
#[derive(Debug, Clone)]
pub struct GreetService {
    greet_count: usize,
    stream_delay: Option<Duration>,
    reduction: ReductionPolicy,
}

impl Default for GreetService {
    fn default() -> Self {
        GreetService {
            greet_count: 10,
            stream_delay: None,
            reduction: ReductionPolicy::default(),
        }
    }
}

impl GreetService {
    /// Ten greetings per `GreetManyTimes`, no delay between them, and one
    /// `FindMaximum` update per input.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many greetings `GreetManyTimes` sends.
    pub fn greet_count(mut self, count: usize) -> Self {
        self.greet_count = count;
        self
    }

    /// Pause between two greetings of `GreetManyTimes`.
    pub fn stream_delay(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.stream_delay = delay.into();
        self
    }

    /// When `FindMaximum` reports.
    pub fn reduction(mut self, policy: ReductionPolicy) -> Self {
        self.reduction = policy;
        self
    }
}

fn greeting(request: &GreetRequest) -> Greeting {
    request.greeting.clone().unwrap_or_default()
}

fn hello(request: &GreetRequest) -> GreetResponse {
    GreetResponse {
        result: format!("Hello {}! ", greeting(request).first_name),
    }
}

#[async_trait]
impl Greeter for GreetService {
    async fn greet(&self, request: GreetRequest) -> Result<GreetResponse, Status> {
        info!(?request, "Greet invoked");

        Ok(GreetResponse {
            result: format!("Hi {}", greeting(&request).full_name()),
        })
    }

    async fn greet_many_times(
        &self,
        request: GreetRequest,
        responses: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status> {
        info!(?request, count = self.greet_count, "GreetManyTimes invoked");
        let name = greeting(&request).full_name();

        for i in 0..self.greet_count {
            if let (Some(delay), true) = (self.stream_delay, i > 0) {
                tokio::time::sleep(delay).await;
            }
            responses
                .emit(GreetResponse {
                    result: format!("Hello {} : number = {}", name, i),
                })
                .await?;
        }

        Ok(())
    }

    async fn long_greet(
        &self,
        mut requests: Streaming<GreetRequest>,
    ) -> Result<GreetResponse, Status> {
        info!("LongGreet invoked");
        let mut result = String::new();

        while let Some(request) = requests.message().await? {
            result.push_str(&hello(&request).result);
        }

        debug!(received = requests.stats().received, "LongGreet done");
        Ok(GreetResponse { result })
    }

    async fn greet_every_one(
        &self,
        mut requests: Streaming<GreetRequest>,
        responses: &mut Emitter<GreetResponse>,
    ) -> Result<(), Status> {
        info!("GreetEveryOne invoked");

        while let Some(request) = requests.message().await? {
            responses.emit(hello(&request)).await?;
        }

        Ok(())
    }

    async fn find_maximum(
        &self,
        mut requests: Streaming<Numbers>,
        responses: &mut Emitter<Numbers>,
    ) -> Result<(), Status> {
        info!(policy = %self.reduction, "FindMaximum invoked");
        let mut max: Option<i32> = None;

        while let Some(Numbers { number }) = requests.message().await? {
            let grew = max.map_or(true, |max| number > max);
            if grew {
                max = Some(number);
            }

            let report = match self.reduction {
                ReductionPolicy::EveryInput => true,
                ReductionPolicy::OnChange => grew,
                ReductionPolicy::Final => false,
            };
            if let (true, Some(max)) = (report, max) {
                responses.emit(Numbers::from(max)).await?;
            }
        }

        if let (ReductionPolicy::Final, Some(max)) = (self.reduction, max) {
            responses.emit(Numbers::from(max)).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduction_policy_parses_its_display_form() {
        for policy in [
            ReductionPolicy::EveryInput,
            ReductionPolicy::OnChange,
            ReductionPolicy::Final,
        ] {
            assert_eq!(policy.to_string().parse::<ReductionPolicy>(), Ok(policy));
        }
        assert!("sometimes".parse::<ReductionPolicy>().is_err());
    }

    #[test]
    fn routes_cover_every_method() {
        let routes = Routes::from(GreeterServer::new(GreetService::default()));
        for method in [
            methods::GREET,
            methods::GREET_MANY_TIMES,
            methods::LONG_GREET,
            methods::GREET_EVERY_ONE,
            methods::FIND_MAXIMUM,
        ] {
            assert!(routes.contains(method), "{} missing", method);
            assert!(method.starts_with(GreeterServer::<GreetService>::NAME));
        }
    }
}
