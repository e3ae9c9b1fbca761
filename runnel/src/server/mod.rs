//! Generic server implementation.
//!
//! Services implement the handler trait matching each method's call shape
//! ([`UnaryHandler`], [`ServerStreamHandler`], [`ClientStreamHandler`],
//! [`BidiStreamHandler`]) and register them in [`Routes`]. A [`Server`]
//! accepts calls from a [`Listener`] and runs each on its own task.

mod routes;
mod service;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{sync::watch, time::Instant};
use tracing::{debug, info, info_span, Instrument};

pub use self::routes::Routes;
pub use self::service::{
    BidiStreamHandler, ClientStreamHandler, Emitter, ServerStreamHandler, UnaryHandler,
};

use self::routes::ServerCall;
use crate::transport::{
    tcp::{ConnectionConfig, TcpIncoming},
    Error, Frame, IncomingCall, Listener, RawStream,
};
use crate::Status;

/// A service with a fixed name, whose methods live under `<NAME>/<Method>`.
pub trait NamedService {
    /// The service name, e.g. `greet.GreetService`.
    const NAME: &'static str;
}

/// A server builder: configure it, add services, then serve.
#[derive(Debug, Clone, Default)]
pub struct Server {
    timeout: Option<Duration>,
    config: ConnectionConfig,
}

/// A [`Server`] with services added, ready to serve.
#[derive(Debug)]
pub struct Router {
    server: Server,
    routes: Routes,
}

impl Server {
    /// Create a new server builder that can configure a [`Server`].
    pub fn builder() -> Self {
        Server::default()
    }

    /// Set a timeout on every call handled by this server.
    ///
    /// A client may ask for a shorter one; the smaller of the two applies.
    /// When it elapses the handler is dropped and the client observes
    /// `DeadlineExceeded`.
    ///
    /// ```
    /// # use runnel::server::Server;
    /// # use std::time::Duration;
    /// # let builder = Server::builder();
    /// builder.timeout(Duration::from_secs(30));
    /// ```
    pub fn timeout(self, timeout: Duration) -> Self {
        Server {
            timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the number of frames each stream direction buffers before `send`
    /// waits.
    pub fn buffer_size(mut self, sz: impl Into<Option<usize>>) -> Self {
        self.config.buffer_size = sz
            .into()
            .unwrap_or(crate::pipe::DEFAULT_BUFFER_SIZE)
            .max(1);
        self
    }

    /// Sets the largest frame payload accepted from clients.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.config.max_message_size = limit;
        self
    }

    /// Set the value of `TCP_NODELAY` option for accepted connections. Enabled by default.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    /// Create a router with the `S` typed service as the first service.
    pub fn add_service<S>(self, svc: S) -> Router
    where
        S: NamedService + Into<Routes>,
    {
        Router {
            server: self,
            routes: Routes::new(),
        }
        .add_service(svc)
    }

    /// Create a router from an already assembled method table.
    pub fn add_routes(self, routes: Routes) -> Router {
        Router {
            server: self,
            routes,
        }
    }
}

impl Router {
    /// Add a new service to this router.
    pub fn add_service<S>(mut self, svc: S) -> Self
    where
        S: NamedService + Into<Routes>,
    {
        debug!(service = S::NAME, "adding service");
        self.routes = self.routes.merge(svc.into());
        self
    }

    /// Add every method of `routes` to this router.
    pub fn add_routes(mut self, routes: Routes) -> Self {
        self.routes = self.routes.merge(routes);
        self
    }

    /// Consume this [`Router`] and serve on `addr` until the process exits.
    pub async fn serve(self, addr: SocketAddr) -> Result<(), Error> {
        self.serve_with_shutdown(addr, std::future::pending()).await
    }

    /// Serve on `addr` until `signal` completes. Calls already running when
    /// it does are allowed to finish before this returns.
    pub async fn serve_with_shutdown<F>(self, addr: SocketAddr, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let incoming = TcpIncoming::bind_with(addr, self.server.config).await?;
        info!(addr = %incoming.local_addr(), "listening");
        self.serve_with_listener(incoming, signal).await
    }

    /// Serve calls accepted from `listener` until `signal` completes or the
    /// listener closes. Calls already running are allowed to finish before
    /// this returns.
    pub async fn serve_with_listener<L, F>(self, listener: L, signal: F) -> Result<(), Error>
    where
        L: Listener,
        F: Future<Output = ()>,
    {
        let routes = Arc::new(self.routes);
        let timeout = self.server.timeout;

        // Every call task holds a receiver; `closed` resolves once they are
        // all gone.
        let (in_flight, _) = watch::channel(());

        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("signal received, shutting down");
                    break;
                }
                call = listener.accept() => match call {
                    Some(call) => spawn_call(&routes, timeout, call, in_flight.subscribe()),
                    None => {
                        debug!("listener closed");
                        break;
                    }
                }
            }
        }

        // Stop accepting before waiting on the calls still running.
        drop(listener);
        in_flight.closed().await;
        debug!("all calls finished");

        Ok(())
    }
}

fn spawn_call(
    routes: &Arc<Routes>,
    timeout: Option<Duration>,
    call: IncomingCall,
    in_flight: watch::Receiver<()>,
) {
    let IncomingCall { headers, stream } = call;
    let method = headers.method_name().to_owned();

    let timeout = match (timeout, headers.timeout()) {
        (Some(server), Some(client)) => Some(server.min(client)),
        (server, client) => server.or(client),
    };
    let deadline = timeout.map(|t| Instant::now() + t);

    let span = info_span!("call", method = %method);

    let Some(handler) = routes.get(&method) else {
        tokio::spawn(
            async move {
                let _in_flight = in_flight;
                reject_unimplemented(method, stream).await;
            }
            .instrument(span),
        );
        return;
    };

    let call = handler.dispatch(ServerCall {
        method,
        stream,
        deadline,
    });

    tokio::spawn(
        async move {
            let _in_flight = in_flight;
            debug!(?timeout, "call started");
            call.await;
            debug!("call complete");
        }
        .instrument(span),
    );
}

async fn reject_unimplemented(method: String, stream: RawStream) {
    let RawStream { tx, mut rx } = stream;
    info!("unimplemented method");

    let status = Status::unimplemented(format!("Method not found: {}", method));
    if tx.send(Frame::Error(status)).await.is_err() {
        return;
    }

    // Keep reading until the client stops sending, so it reads the error
    // rather than a closed stream.
    while let Some(Frame::Data(_)) = rx.recv().await {}
}
