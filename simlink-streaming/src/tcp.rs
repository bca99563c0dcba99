// TCP stream connection
//
// Handshake: connect, send the stream id as u32 little-endian, then read
// frames of `u32 LE length | payload` until stopped. Dropped sessions are
// re-established immediately once, failed connection attempts back off
// exponentially.

use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use simlink_core::StreamingConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::connection::{ConnectionState, Connector, SharedFrameHandler, StreamConnection};
use crate::error::{StreamError, StreamResult};
use crate::token::{Protocol, StreamId, StreamToken};

type ReconnectDelays = std::iter::Chain<std::iter::Once<Duration>, ExponentialBackoff>;

/// Tuning for [`TcpStreamConnection`]
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts after a failure before giving up (None = forever)
    pub max_reconnect_attempts: Option<usize>,
    pub max_frame_length: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&StreamingConfig::default())
    }
}

impl From<&StreamingConfig> for ConnectionOptions {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            reconnect_min_delay: config.reconnect_min_delay(),
            reconnect_max_delay: config.reconnect_max_delay(),
            max_reconnect_attempts: config.max_reconnect_attempts,
            max_frame_length: config.max_frame_length,
        }
    }
}

/// Builds [`TcpStreamConnection`]s
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    options: ConnectionOptions,
}

impl TcpConnector {
    #[must_use]
    pub const fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub const fn options(&self) -> &ConnectionOptions {
        &self.options
    }
}

impl Connector for TcpConnector {
    type Connection = TcpStreamConnection;

    fn open(
        &self,
        runtime: &Handle,
        token: StreamToken,
        handler: SharedFrameHandler,
    ) -> StreamResult<TcpStreamConnection> {
        if token.protocol() != Protocol::Tcp {
            return Err(StreamError::UnsupportedProtocol(token.stream_id()));
        }
        let endpoint = token.endpoint().ok_or_else(|| {
            StreamError::InvalidToken(format!("stream {} has no address", token.stream_id()))
        })?;
        if endpoint.port() == 0 {
            return Err(StreamError::InvalidToken(format!(
                "stream {} has no port",
                token.stream_id()
            )));
        }

        Ok(TcpStreamConnection::new(
            runtime.clone(),
            token,
            endpoint,
            handler,
            self.options.clone(),
        ))
    }
}

thread_local! {
    /// Frame handlers currently running on this thread
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Restores the depth even if the handler panics
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn inside_delivery() -> bool {
    DELIVERY_DEPTH.with(Cell::get) > 0
}

/// Orders frame delivery against `stop()`.
///
/// `running` is held only by the connection's own task around one handler
/// call. `close()` waits on it unless the caller is itself a frame handler,
/// so handlers can unsubscribe any stream, their own included.
struct Delivery {
    stopped: AtomicBool,
    running: Mutex<()>,
    handler: SharedFrameHandler,
}

impl Delivery {
    /// Returns false once the connection is stopped
    fn deliver(&self, frame: Bytes) -> bool {
        let _running = self.running.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let _depth = DepthGuard::enter();
        self.handler.on_frame(frame);
        true
    }

    /// No delivery starts after this returns. Outside a handler it also
    /// waits for one already in flight.
    fn close(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if !inside_delivery() {
            drop(self.running.lock());
        }
    }
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == ConnectionState::Stopped || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// One TCP connection for one stream
pub struct TcpStreamConnection {
    token: StreamToken,
    endpoint: SocketAddr,
    runtime: Handle,
    options: ConnectionOptions,
    delivery: Arc<Delivery>,
    state: Arc<watch::Sender<ConnectionState>>,
    frames_received: Arc<AtomicU64>,
    cancel_token: CancellationToken,
    started: AtomicBool,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpStreamConnection {
    pub fn new(
        runtime: Handle,
        token: StreamToken,
        endpoint: SocketAddr,
        handler: SharedFrameHandler,
        options: ConnectionOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            token,
            endpoint,
            runtime,
            options,
            delivery: Arc::new(Delivery {
                stopped: AtomicBool::new(false),
                running: Mutex::new(()),
                handler,
            }),
            state: Arc::new(state),
            frames_received: Arc::new(AtomicU64::new(0)),
            cancel_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            task_handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Frames read from the socket so far, across reconnects
    #[must_use]
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
}

impl StreamConnection for TcpStreamConnection {
    fn token(&self) -> &StreamToken {
        &self.token
    }

    fn connect(&self) {
        if self.started.swap(true, Ordering::SeqCst) || self.cancel_token.is_cancelled() {
            return;
        }

        let worker = Worker {
            stream_id: self.token.stream_id(),
            endpoint: self.endpoint,
            options: self.options.clone(),
            delivery: Arc::clone(&self.delivery),
            state: Arc::clone(&self.state),
            frames_received: Arc::clone(&self.frames_received),
        };
        let cancel_token = self.cancel_token.clone();
        let span = tracing::info_span!(
            "stream_connection",
            stream_id = self.token.stream_id(),
            endpoint = %self.endpoint
        );

        let handle = self.runtime.spawn(
            async move {
                tokio::select! {
                    () = worker.run() => {}
                    () = cancel_token.cancelled() => {
                        debug!("Stream connection task cancelled");
                    }
                }
            }
            .instrument(span),
        );
        *self.task_handle.lock() = Some(handle);
    }

    fn stop(&self) {
        self.delivery.close();
        set_state(&self.state, ConnectionState::Stopped);
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.lock().take() {
            handle.abort();
        }
        debug!(stream_id = self.token.stream_id(), "Stream connection stopped");
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

impl Drop for TcpStreamConnection {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// State moved into the connection task
struct Worker {
    stream_id: StreamId,
    endpoint: SocketAddr,
    options: ConnectionOptions,
    delivery: Arc<Delivery>,
    state: Arc<watch::Sender<ConnectionState>>,
    frames_received: Arc<AtomicU64>,
}

impl Worker {
    fn reconnect_delays(&self) -> ReconnectDelays {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.options.reconnect_min_delay)
            .with_max_delay(self.options.reconnect_max_delay)
            .with_max_times(self.options.max_reconnect_attempts.unwrap_or(usize::MAX))
            .build();
        std::iter::once(Duration::ZERO).chain(backoff)
    }

    async fn run(self) {
        let mut delays = self.reconnect_delays();

        loop {
            let Some(delay) = delays.next() else {
                error!(
                    attempts = self.options.max_reconnect_attempts,
                    "Giving up on stream connection"
                );
                set_state(&self.state, ConnectionState::Disconnected);
                return;
            };
            if !delay.is_zero() {
                set_state(&self.state, ConnectionState::Disconnected);
                tokio::time::sleep(delay).await;
            }

            set_state(&self.state, ConnectionState::Connecting);
            let socket = match self.open().await {
                Ok(socket) => socket,
                Err(e) => {
                    info!(error = %e, "Stream connection failed, retrying");
                    continue;
                }
            };

            set_state(&self.state, ConnectionState::Connected);
            debug!("Connected, receiving frames");

            match self.read_frames(socket).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "Stream session dropped, reconnecting");
                    set_state(&self.state, ConnectionState::Disconnected);
                    delays = self.reconnect_delays();
                }
            }
        }
    }

    async fn open(&self) -> io::Result<TcpStream> {
        let mut socket = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect(self.endpoint),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        socket.set_nodelay(true)?;
        socket.write_all(&self.stream_id.to_le_bytes()).await?;
        Ok(socket)
    }

    /// Ok(()) when delivery was refused because the connection stopped
    async fn read_frames(&self, socket: TcpStream) -> io::Result<()> {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .max_frame_length(self.options.max_frame_length)
            .new_codec();
        let mut frames = FramedRead::new(socket, codec);

        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "zero-length frame"));
            }
            self.frames_received.fetch_add(1, Ordering::Relaxed);
            if !self.delivery.deliver(frame.freeze()) {
                return Ok(());
            }
        }

        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the stream"))
    }
}
