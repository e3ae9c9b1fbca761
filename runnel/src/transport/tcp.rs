//! Calls multiplexed over a single TCP connection.
//!
//! Every frame on the socket is prefixed with a 9 byte header:
//!
//! ```text
//! +------+-----------+-----------+-------------------+
//! | kind | stream id |  length   |  payload (length) |
//! |  u8  |  u32 (BE) |  u32 (BE) |                   |
//! +------+-----------+-----------+-------------------+
//! ```
//!
//! `OPEN` starts a stream (payload: timeout in milliseconds as a `u64`, zero
//! meaning none, followed by the UTF-8 method name). `DATA`, `END` and `ERROR`
//! map onto [`Frame`]; an `ERROR` payload is the status code byte followed by
//! the UTF-8 message.
//!
//! # Flow control
//!
//! Each direction of a stream may have at most [`INITIAL_WINDOW`] `DATA`
//! frames in flight. The receiving end hands credit back with `WINDOW`
//! frames (payload: the number of frames, as a `u32`) as its local reader
//! consumes them. A stream whose reader stops reading therefore only stalls
//! its own sender; the connection reader never waits on a single stream.
//! `END` and `ERROR` frames need no credit.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex as AsyncMutex, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{Error, Frame, IncomingCall, Listener, RawStream, RequestHeaders, Transport};
use crate::pipe::{self, PipeReceiver, PipeSender, DEFAULT_BUFFER_SIZE};
use crate::{Code, Status};

// kind + stream id + payload length
const HEADER_SIZE: usize = std::mem::size_of::<u8>() + 2 * std::mem::size_of::<u32>();

// The default maximum payload size in bytes for a frame. Defaults to 4MB.
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// `DATA` frames one direction of a stream may send before it has to wait
/// for credit. Both ends of a connection assume the same value.
pub const INITIAL_WINDOW: usize = 64;

// Credit is handed back once this many frames were consumed.
const WINDOW_UPDATE_THRESHOLD: usize = INITIAL_WINDOW / 2;

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_END: u8 = 2;
const KIND_ERROR: u8 = 3;
const KIND_WINDOW: u8 = 4;

/// Settings shared by both ends of a TCP connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionConfig {
    pub(crate) buffer_size: usize,
    pub(crate) max_message_size: usize,
    pub(crate) nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            nodelay: true,
        }
    }
}

enum WireFrame {
    Open(RequestHeaders),
    Stream(Frame),
    Window(u32),
}

/// The connection's view of one stream.
struct Route {
    // Frames from the peer, waiting to be relayed to the local end. Holds at
    // most a window of DATA plus the closing frames.
    inbound: PipeSender<Frame>,
    // Credit for DATA sent to the peer.
    credit: Arc<Semaphore>,
    // The peer sent END.
    peer_done: bool,
    // The local end will send nothing more.
    local_done: bool,
}

/// State shared by the tasks of one side of a connection.
struct Shared {
    writer: mpsc::Sender<(u32, WireFrame)>,
    routes: Mutex<HashMap<u32, Route>>,
    closed: AtomicBool,
    config: ConnectionConfig,
}

impl Shared {
    /// Registers stream `id` and starts relaying inbound frames to the
    /// returned stream. The outbound side only starts moving once the
    /// returned [`Forwarder`] is spawned.
    fn register(self: &Arc<Self>, id: u32) -> Result<(RawStream, Forwarder), Status> {
        let (route_tx, route_rx) = pipe::pipe(INITIAL_WINDOW + 2);
        let (inbound_tx, inbound_rx) = pipe::pipe(self.config.buffer_size);
        let (outbound_tx, outbound_rx) = pipe::pipe(self.config.buffer_size);
        let credit = Arc::new(Semaphore::new(INITIAL_WINDOW));

        {
            // Checked under the lock so a concurrent shutdown cannot miss the
            // new route.
            let mut routes = self.routes.lock();
            if self.closed.load(Ordering::Acquire) {
                return Err(Status::transport("connection closed"));
            }
            routes.insert(
                id,
                Route {
                    inbound: route_tx,
                    credit: credit.clone(),
                    peer_done: false,
                    local_done: false,
                },
            );
        }
        tokio::spawn(relay(id, route_rx, inbound_tx, self.writer.clone()));

        let stream = RawStream {
            tx: outbound_tx,
            rx: inbound_rx,
        };
        let forwarder = Forwarder {
            id,
            outbound: outbound_rx,
            credit,
            shared: self.clone(),
        };
        Ok((stream, forwarder))
    }

    /// Hands a frame from the peer to its stream without waiting.
    fn route(&self, id: u32, frame: Frame) {
        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(&id) else {
            trace!(stream = id, "frame for unknown stream dropped");
            return;
        };

        let kind = match &frame {
            Frame::Data(_) => KIND_DATA,
            Frame::End => KIND_END,
            Frame::Error(_) => KIND_ERROR,
        };

        if route.inbound.try_send(frame).is_err() {
            if route.inbound.is_closed() {
                trace!(stream = id, "local end gone, dropping inbound frames");
                route.peer_done = true;
                if route.local_done {
                    routes.remove(&id);
                }
                return;
            }

            warn!(stream = id, "peer exceeded its flow control window, resetting stream");
            if let Some(route) = routes.remove(&id) {
                route.credit.close();
            }
            let reset = Status::transport("flow control window exceeded");
            let _ = self.writer.try_send((id, WireFrame::Stream(Frame::Error(reset))));
            return;
        }

        match kind {
            KIND_ERROR => {
                // The peer ended the call; stop waiting for its credit.
                route.credit.close();
                routes.remove(&id);
            }
            KIND_END => {
                route.peer_done = true;
                if route.local_done {
                    routes.remove(&id);
                }
            }
            _ => {}
        }
    }

    fn grant(&self, id: u32, credit: u32) {
        match self.routes.lock().get(&id) {
            Some(route) => route.credit.add_permits(credit as usize),
            None => trace!(stream = id, "credit for unknown stream dropped"),
        }
    }

    fn local_done(&self, id: u32) {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get_mut(&id) {
            route.local_done = true;
            if route.peer_done {
                routes.remove(&id);
            }
        }
    }

    fn forget(&self, id: u32) {
        self.routes.lock().remove(&id);
    }

    /// Fails every stream still routed over this connection.
    fn shutdown(&self, cause: Option<Status>) {
        self.closed.store(true, Ordering::Release);

        let status = cause.unwrap_or_else(|| Status::transport("connection closed"));
        let routes = std::mem::take(&mut *self.routes.lock());
        for (id, route) in routes {
            trace!(stream = id, "failing stream on connection shutdown");
            route.credit.close();
            // Dropping the route also ends the stream if the pipe is full.
            let _ = route.inbound.try_send(Frame::Error(status.clone()));
        }
    }
}

/// Moves frames from the connection to the local end of one stream, handing
/// credit back to the peer as the local end makes room.
async fn relay(
    id: u32,
    mut from_peer: PipeReceiver<Frame>,
    local: PipeSender<Frame>,
    writer: mpsc::Sender<(u32, WireFrame)>,
) {
    let mut consumed = 0usize;

    while let Some(frame) = from_peer.recv().await {
        let data = matches!(frame, Frame::Data(_));
        if local.send(frame).await.is_err() {
            return;
        }

        if data {
            consumed += 1;
            if consumed >= WINDOW_UPDATE_THRESHOLD {
                trace!(stream = id, consumed, "returning credit");
                if writer.send((id, WireFrame::Window(consumed as u32))).await.is_err() {
                    return;
                }
                consumed = 0;
            }
        }
    }
}

/// Moves frames written to a stream's outbound pipe onto the connection.
struct Forwarder {
    id: u32,
    outbound: PipeReceiver<Frame>,
    credit: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl Forwarder {
    fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        let id = self.id;
        let mut finished = false;
        let mut reset = true;

        while let Some(frame) = self.outbound.recv().await {
            if let Frame::Data(_) = frame {
                match self.credit.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        // The peer ended the call or the connection is gone.
                        reset = false;
                        break;
                    }
                }
            }

            finished = finished || matches!(frame, Frame::End | Frame::Error(_));
            if self
                .shared
                .writer
                .send((id, WireFrame::Stream(frame)))
                .await
                .is_err()
            {
                return;
            }
        }

        if !finished && reset && !self.shared.closed.load(Ordering::Acquire) {
            // The local end was dropped mid-stream.
            trace!(stream = id, "stream dropped without end, resetting");
            let reset = Frame::Error(Status::cancelled("stream dropped by peer"));
            let _ = self.shared.writer.send((id, WireFrame::Stream(reset))).await;
        }

        self.shared.local_done(id);
    }
}

/// One side of a TCP connection: a writer task draining an outbound queue and
/// a reader task routing inbound frames to their streams.
struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn spawn(
        socket: TcpStream,
        config: ConnectionConfig,
        incoming: Option<mpsc::Sender<IncomingCall>>,
    ) -> Self {
        let peer = socket.peer_addr().ok();
        let (read_half, write_half) = socket.into_split();
        let (writer, outbound) = mpsc::channel(config.buffer_size);

        let shared = Arc::new(Shared {
            writer,
            routes: Mutex::default(),
            closed: AtomicBool::new(false),
            config,
        });

        tokio::spawn(write_loop(write_half, outbound));

        let reader = Reader {
            shared: shared.clone(),
            incoming,
        };
        tokio::spawn(async move {
            let result = reader.run(read_half).await;
            match &result {
                Ok(()) => debug!(?peer, "connection closed by peer"),
                Err(status) => warn!(?peer, %status, "connection failed"),
            }
            reader.shared.shutdown(result.err());
        });

        Connection { shared }
    }
}

async fn write_loop<W>(mut io: W, mut outbound: mpsc::Receiver<(u32, WireFrame)>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);

    while let Some((id, frame)) = outbound.recv().await {
        buf.clear();
        encode_frame(id, &frame, &mut buf);

        if let Err(err) = io.write_all(&buf).await {
            warn!(error = %err, "failed to write frame");
            return;
        }
    }

    let _ = io.shutdown().await;
}

fn encode_frame(id: u32, frame: &WireFrame, buf: &mut BytesMut) {
    match frame {
        WireFrame::Open(headers) => {
            let method = headers.method_name().as_bytes();
            let timeout_ms = headers
                .timeout()
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX).max(1))
                .unwrap_or(0);
            put_header(buf, KIND_OPEN, id, 8 + method.len());
            buf.put_u64(timeout_ms);
            buf.put_slice(method);
        }
        WireFrame::Stream(Frame::Data(data)) => {
            put_header(buf, KIND_DATA, id, data.len());
            buf.put_slice(data);
        }
        WireFrame::Stream(Frame::End) => put_header(buf, KIND_END, id, 0),
        WireFrame::Stream(Frame::Error(status)) => {
            let message = status.message().as_bytes();
            put_header(buf, KIND_ERROR, id, 1 + message.len());
            buf.put_u8(status.code().into());
            buf.put_slice(message);
        }
        WireFrame::Window(credit) => {
            put_header(buf, KIND_WINDOW, id, 4);
            buf.put_u32(*credit);
        }
    }
}

fn put_header(buf: &mut BytesMut, kind: u8, id: u32, len: usize) {
    buf.reserve(HEADER_SIZE + len);
    buf.put_u8(kind);
    buf.put_u32(id);
    buf.put_u32(len as u32);
}

struct Reader {
    shared: Arc<Shared>,
    // Only set on the accepting side of a connection.
    incoming: Option<mpsc::Sender<IncomingCall>>,
}

impl Reader {
    async fn run<R>(&self, mut io: R) -> Result<(), Status>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_SIZE];
        let max_message_size = self.shared.config.max_message_size;

        loop {
            match io.read_exact(&mut header).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }

            let mut cursor = &header[..];
            let kind = cursor.get_u8();
            let id = cursor.get_u32();
            let len = cursor.get_u32() as usize;

            if len > max_message_size {
                return Err(Status::transport(format!(
                    "Error, frame length too large: found {} bytes, the limit is: {} bytes",
                    len, max_message_size
                )));
            }

            let mut payload = vec![0u8; len];
            io.read_exact(&mut payload).await?;
            let mut payload = Bytes::from(payload);

            match kind {
                KIND_OPEN => self.open(id, payload).await?,
                KIND_DATA => self.shared.route(id, Frame::Data(payload)),
                KIND_END => self.shared.route(id, Frame::End),
                KIND_ERROR => self.shared.route(id, decode_error(payload)),
                KIND_WINDOW if payload.remaining() == 4 => {
                    self.shared.grant(id, payload.get_u32())
                }
                KIND_WINDOW => {
                    return Err(Status::transport("protocol error: malformed WINDOW frame"))
                }
                other => {
                    return Err(Status::transport(format!(
                        "protocol error: unknown frame kind {}",
                        other
                    )))
                }
            }
        }
    }

    async fn open(&self, id: u32, mut payload: Bytes) -> Result<(), Status> {
        let Some(incoming) = &self.incoming else {
            return Err(Status::transport("protocol error: client received OPEN"));
        };

        if payload.remaining() < 8 {
            return Err(Status::transport("protocol error: truncated OPEN frame"));
        }
        let timeout = match payload.get_u64() {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let method = String::from_utf8_lossy(&payload).into_owned();

        trace!(stream = id, %method, "stream opened by peer");

        let (stream, forwarder) = self.shared.register(id)?;
        forwarder.spawn();

        let call = IncomingCall {
            headers: RequestHeaders::new(method).with_timeout(timeout),
            stream,
        };

        if let Err(mpsc::error::SendError(call)) = incoming.send(call).await {
            debug!(stream = id, "listener gone, rejecting stream");
            self.shared.forget(id);
            let _ = call
                .stream
                .tx
                .try_send(Frame::Error(Status::transport("server is not accepting calls")));
        }

        Ok(())
    }
}

fn decode_error(mut payload: Bytes) -> Frame {
    if !payload.has_remaining() {
        return Frame::Error(Status::internal("protocol error: empty ERROR frame"));
    }
    let code = Code::from(payload.get_u8());
    let message = String::from_utf8_lossy(&payload).into_owned();
    Frame::Error(Status::new(code, message))
}

/// The client side of a TCP connection.
///
/// Cheap to clone; all clones share the one connection.
#[derive(Clone)]
pub struct TcpTransport {
    conn: Arc<Shared>,
    next_id: Arc<AtomicU32>,
}

impl TcpTransport {
    /// Connects to `addr` with default settings.
    pub async fn connect(addr: SocketAddr) -> Result<Self, Error> {
        Self::connect_with(addr, ConnectionConfig::default(), None).await
    }

    pub(crate) async fn connect_with(
        addr: SocketAddr,
        config: ConnectionConfig,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, Error> {
        let connect = TcpStream::connect(addr);
        let socket = match connect_timeout {
            Some(dur) => tokio::time::timeout(dur, connect)
                .await
                .map_err(Error::from_source)?,
            None => connect.await,
        }
        .map_err(Error::from_source)?;
        socket.set_nodelay(config.nodelay).map_err(Error::from_source)?;

        debug!(%addr, "connected");

        Ok(Self {
            conn: Connection::spawn(socket, config, None).shared,
            next_id: Arc::new(AtomicU32::new(1)),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, headers: RequestHeaders) -> Result<RawStream, Status> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (stream, forwarder) = self.conn.register(id)?;

        // OPEN must be queued before the forwarder can queue any DATA.
        if self
            .conn
            .writer
            .send((id, WireFrame::Open(headers)))
            .await
            .is_err()
        {
            self.conn.forget(id);
            return Err(Status::transport("connection closed"));
        }
        forwarder.spawn();

        Ok(stream)
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("closed", &self.conn.closed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Accepts TCP connections and yields the calls opened over them.
pub struct TcpIncoming {
    calls: AsyncMutex<mpsc::Receiver<IncomingCall>>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpIncoming {
    /// Binds `addr` with default settings and starts accepting connections.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        Self::bind_with(addr, ConnectionConfig::default()).await
    }

    pub(crate) async fn bind_with(
        addr: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await.map_err(Error::from_source)?;
        let local_addr = listener.local_addr().map_err(Error::from_source)?;
        let (tx, rx) = mpsc::channel(config.buffer_size);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        if let Err(err) = socket.set_nodelay(config.nodelay) {
                            warn!(%peer, error = %err, "failed to set TCP_NODELAY");
                        }
                        debug!(%peer, "accepted connection");
                        // Server-side connections need no handle: they live as
                        // long as their reader and writer tasks.
                        let _ = Connection::spawn(socket, config, Some(tx.clone()));
                    }
                    Err(err) => {
                        // Accept errors (e.g. too many open files) are
                        // per-connection, keep accepting.
                        warn!(error = %err, "accept error");
                    }
                }
            }
        });

        Ok(Self {
            calls: AsyncMutex::new(rx),
            local_addr,
            accept_task,
        })
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpIncoming {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl fmt::Debug for TcpIncoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpIncoming")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[async_trait]
impl Listener for TcpIncoming {
    async fn accept(&self) -> Option<IncomingCall> {
        self.calls.lock().await.recv().await
    }
}
