use std::{fmt, sync::Arc, time::Duration};

use tracing::debug;

use crate::transport::{
    tcp::{ConnectionConfig, TcpTransport},
    Error, RawStream, RequestHeaders, Transport,
};
use crate::Status;

/// A handle to a transport that calls are opened on.
///
/// Cheap to clone; clones share the underlying connection, which is safe to
/// use from many concurrently open calls.
#[derive(Clone)]
pub struct Channel {
    transport: Arc<dyn Transport>,
    timeout: Option<Duration>,
}

impl Channel {
    /// Wraps an already established transport, e.g. one half of an
    /// [`inmemory`](crate::transport::inmemory) pair.
    pub fn from_transport<T: Transport>(transport: T) -> Self {
        Channel {
            transport: Arc::new(transport),
            timeout: None,
        }
    }

    /// Create an [`Endpoint`] builder that can create [`Channel`]s.
    pub fn builder(addr: impl Into<String>) -> Endpoint {
        Endpoint::from_shared(addr)
    }

    /// The default per-call timeout of this channel.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Replaces the default per-call timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) async fn open(&self, headers: RequestHeaders) -> Result<RawStream, Status> {
        self.transport.open(headers).await
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Channel builder.
///
/// This struct is used to build and configure TCP channels.
#[derive(Clone)]
pub struct Endpoint {
    addr: String,
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    config: ConnectionConfig,
}

impl Endpoint {
    /// Builds an endpoint from a static `host:port` string.
    ///
    /// ```
    /// # use runnel::client::Endpoint;
    /// Endpoint::from_static("127.0.0.1:50051");
    /// ```
    pub fn from_static(addr: &'static str) -> Self {
        Self::from_shared(addr)
    }

    /// Builds an endpoint from a `host:port` string. The address is resolved
    /// when connecting.
    pub fn from_shared(addr: impl Into<String>) -> Self {
        Endpoint {
            addr: addr.into(),
            timeout: None,
            connect_timeout: None,
            config: ConnectionConfig::default(),
        }
    }

    /// Apply a timeout to each call made through the channel.
    ///
    /// The timeout is sent to the server along with the call, which applies
    /// it too.
    ///
    /// ```
    /// # use runnel::client::Endpoint;
    /// # use std::time::Duration;
    /// # let mut builder = Endpoint::from_static("127.0.0.1:50051");
    /// builder.timeout(Duration::from_secs(5));
    /// ```
    pub fn timeout(self, dur: Duration) -> Self {
        Endpoint {
            timeout: Some(dur),
            ..self
        }
    }

    /// Apply a timeout to connecting to the address.
    pub fn connect_timeout(self, dur: Duration) -> Self {
        Endpoint {
            connect_timeout: Some(dur),
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

    /// Sets the largest frame payload accepted from the server.
    pub fn max_message_size(mut self, limit: usize) -> Self {
        self.config.max_message_size = limit;
        self
    }

    /// Set the value of `TCP_NODELAY` option for the connection. Enabled by default.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.nodelay = enabled;
        self
    }

    /// Resolves the address and connects.
    pub async fn connect(&self) -> Result<Channel, Error> {
        let addr = tokio::net::lookup_host(self.addr.as_str())
            .await
            .map_err(Error::from_source)?
            .next()
            .ok_or_else(|| {
                Error::from_source(format!("no address found for {:?}", self.addr))
            })?;

        let transport =
            TcpTransport::connect_with(addr, self.config, self.connect_timeout).await?;
        debug!(addr = %self.addr, "channel connected");

        Ok(Channel::from_transport(transport).with_timeout(self.timeout))
    }

    /// The address this endpoint connects to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Get whether TCP_NODELAY is enabled.
    pub fn get_tcp_nodelay(&self) -> bool {
        self.config.nodelay
    }

    /// Get the connect timeout.
    pub fn get_connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_settings() {
        let endpoint = Endpoint::from_static("127.0.0.1:50051")
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(1))
            .tcp_nodelay(false)
            .buffer_size(0usize);

        assert_eq!(endpoint.addr(), "127.0.0.1:50051");
        assert_eq!(endpoint.get_connect_timeout(), Some(Duration::from_secs(1)));
        assert!(!endpoint.get_tcp_nodelay());
        assert_eq!(endpoint.config.buffer_size, 1);
    }

    #[tokio::test]
    async fn connect_refused_is_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = Endpoint::from_shared(addr.to_string()).connect().await;
        assert!(result.is_err());
    }
}
