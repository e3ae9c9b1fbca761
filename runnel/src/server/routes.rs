use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;
use tracing::debug;

use super::service::{
    BidiStreamHandler, ClientStreamHandler, Emitter, ServerStreamHandler, UnaryHandler,
};
use crate::codec::Codec;
use crate::stream::{self, Sender, Streaming};
use crate::transport::RawStream;
use crate::Status;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An accepted call, ready to be dispatched to its handler.
pub(crate) struct ServerCall {
    pub(crate) method: String,
    pub(crate) stream: RawStream,
    pub(crate) deadline: Option<Instant>,
}

/// A handler erased over its call shape and message types.
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, call: ServerCall) -> BoxFuture;
}

/// A table from method identifiers to handlers.
///
/// ```rust
/// # use runnel::{Status, server::{Routes, UnaryHandler}, codec::ProstCodec};
/// struct Shout;
///
/// #[runnel::async_trait]
/// impl UnaryHandler<String> for Shout {
///     type Response = String;
///
///     async fn call(&self, request: String) -> Result<String, Status> {
///         Ok(request.to_uppercase())
///     }
/// }
///
/// let routes = Routes::new().unary("demo.Shout/Shout", ProstCodec::default(), Shout);
/// assert!(routes.contains("demo.Shout/Shout"));
/// ```
#[derive(Clone, Default)]
pub struct Routes {
    methods: HashMap<String, Arc<dyn Dispatch>>,
}

impl Routes {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unary handler under `method`.
    pub fn unary<C, H>(self, method: impl Into<String>, codec: C, handler: H) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        H: UnaryHandler<C::Decode, Response = C::Encode>,
    {
        self.route(
            method,
            UnaryMethod {
                codec,
                handler: Arc::new(handler),
            },
        )
    }

    /// Registers a server-streaming handler under `method`.
    pub fn server_streaming<C, H>(self, method: impl Into<String>, codec: C, handler: H) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        H: ServerStreamHandler<C::Decode, Response = C::Encode>,
    {
        self.route(
            method,
            ServerStreamingMethod {
                codec,
                handler: Arc::new(handler),
            },
        )
    }

    /// Registers a client-streaming handler under `method`.
    pub fn client_streaming<C, H>(self, method: impl Into<String>, codec: C, handler: H) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        H: ClientStreamHandler<C::Decode, Response = C::Encode>,
    {
        self.route(
            method,
            ClientStreamingMethod {
                codec,
                handler: Arc::new(handler),
            },
        )
    }

    /// Registers a bidirectional streaming handler under `method`.
    pub fn bidi_streaming<C, H>(self, method: impl Into<String>, codec: C, handler: H) -> Self
    where
        C: Codec + Clone + Send + Sync + 'static,
        H: BidiStreamHandler<C::Decode, Response = C::Encode>,
    {
        self.route(
            method,
            BidiStreamingMethod {
                codec,
                handler: Arc::new(handler),
            },
        )
    }

    /// Adds every method of `other`. Methods registered in both tables keep
    /// the handler from `other`.
    pub fn merge(mut self, other: Routes) -> Self {
        self.methods.extend(other.methods);
        self
    }

    /// Returns true if a handler is registered for `method`.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub(crate) fn get(&self, method: &str) -> Option<&Arc<dyn Dispatch>> {
        self.methods.get(method)
    }

    fn route(mut self, method: impl Into<String>, handler: impl Dispatch) -> Self {
        self.methods.insert(method.into(), Arc::new(handler));
        self
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

fn open_call<C: Codec>(mut codec: C, call: ServerCall) -> (Sender<C::Encode>, Streaming<C::Decode>) {
    stream::open(
        &call.method,
        call.stream,
        call.deadline,
        codec.encoder(),
        codec.decoder(),
        false,
    )
}

/// Reads exactly one request followed by end-of-stream.
async fn single_request<T>(requests: &mut Streaming<T>) -> Result<T, Status> {
    let request = match requests.message().await? {
        Some(request) => request,
        None => return Err(Status::internal("Missing request message.")),
    };

    match requests.message().await? {
        None => Ok(request),
        Some(_) => Err(Status::internal("Expected exactly one request message.")),
    }
}

/// Closes the response direction, or terminates the call with the handler's
/// error.
async fn finish<T>(sender: &mut Sender<T>, result: Result<(), Status>) {
    let result = match result {
        Ok(()) => sender.close_send().await,
        Err(status) => {
            debug!(%status, "handler failed");
            sender.fail(status);
            return;
        }
    };

    if let Err(status) = result {
        debug!(%status, "failed to close response stream");
    }
}

struct UnaryMethod<C, H> {
    codec: C,
    handler: Arc<H>,
}

impl<C, H> Dispatch for UnaryMethod<C, H>
where
    C: Codec + Clone + Send + Sync + 'static,
    H: UnaryHandler<C::Decode, Response = C::Encode>,
{
    fn dispatch(&self, call: ServerCall) -> BoxFuture {
        let (mut tx, mut rx) = open_call(self.codec.clone(), call);
        let handler = self.handler.clone();

        Box::pin(async move {
            let lifecycle = rx.lifecycle().clone();
            let result = lifecycle
                .guard(async {
                    let request = single_request(&mut rx).await?;
                    let response = handler.call(request).await?;
                    tx.send(response).await
                })
                .await;

            finish(&mut tx, result).await;
        })
    }
}

struct ServerStreamingMethod<C, H> {
    codec: C,
    handler: Arc<H>,
}

impl<C, H> Dispatch for ServerStreamingMethod<C, H>
where
    C: Codec + Clone + Send + Sync + 'static,
    H: ServerStreamHandler<C::Decode, Response = C::Encode>,
{
    fn dispatch(&self, call: ServerCall) -> BoxFuture {
        let (tx, mut rx) = open_call(self.codec.clone(), call);
        let handler = self.handler.clone();

        Box::pin(async move {
            let lifecycle = rx.lifecycle().clone();
            let mut emitter = Emitter::new(tx);
            let result = lifecycle
                .guard(async {
                    let request = single_request(&mut rx).await?;
                    handler.call(request, &mut emitter).await
                })
                .await;

            debug!(emitted = emitter.emitted(), "response stream done");
            finish(emitter.sender(), result).await;
        })
    }
}

struct ClientStreamingMethod<C, H> {
    codec: C,
    handler: Arc<H>,
}

impl<C, H> Dispatch for ClientStreamingMethod<C, H>
where
    C: Codec + Clone + Send + Sync + 'static,
    H: ClientStreamHandler<C::Decode, Response = C::Encode>,
{
    fn dispatch(&self, call: ServerCall) -> BoxFuture {
        let (mut tx, rx) = open_call(self.codec.clone(), call);
        let handler = self.handler.clone();

        Box::pin(async move {
            let lifecycle = rx.lifecycle().clone();
            let result = lifecycle
                .guard(async {
                    let response = handler.call(rx).await?;
                    // Requests the handler left unread are drained first, so
                    // the response never precedes end-of-stream.
                    lifecycle.recv_closed().await?;
                    tx.send(response).await
                })
                .await;

            finish(&mut tx, result).await;
        })
    }
}

struct BidiStreamingMethod<C, H> {
    codec: C,
    handler: Arc<H>,
}

impl<C, H> Dispatch for BidiStreamingMethod<C, H>
where
    C: Codec + Clone + Send + Sync + 'static,
    H: BidiStreamHandler<C::Decode, Response = C::Encode>,
{
    fn dispatch(&self, call: ServerCall) -> BoxFuture {
        let (tx, rx) = open_call(self.codec.clone(), call);
        let handler = self.handler.clone();

        Box::pin(async move {
            let lifecycle = rx.lifecycle().clone();
            let mut emitter = Emitter::new(tx);
            let result = lifecycle.guard(handler.call(rx, &mut emitter)).await;

            debug!(emitted = emitter.emitted(), "response stream done");
            finish(emitter.sender(), result).await;
        })
    }
}
