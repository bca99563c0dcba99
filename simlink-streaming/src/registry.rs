//! Stream subscription registry.
//!
//! Multiplexes any number of stream connections onto one tokio runtime,
//! keyed by stream id. The map is concurrent, so `subscribe` and
//! `unsubscribe` may be called from any thread; a stream id is claimed
//! atomically, and connections are always stopped outside the map lock.
//!
//! The registry does not own the runtime. Connection tasks hold only
//! reference-counted state and a cancellation token, so dropping the
//! registry while the runtime is still running cancels them cleanly.
//! Anything the frame handlers capture must stay valid until the registry
//! (or the runtime) is gone.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use simlink_core::StreamingConfig;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, Connector, FrameHandler, SharedFrameHandler, StreamConnection};
use crate::error::{StreamError, StreamResult};
use crate::tcp::{ConnectionOptions, TcpConnector};
use crate::token::{has_port, resolve_endpoint, StreamId, StreamToken};

/// Address applied to tokens that arrive without one.
///
/// The port is only used for tokens whose own port is unset (0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackAddress {
    ip: IpAddr,
    port: Option<u16>,
}

impl FallbackAddress {
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }

    #[must_use]
    pub const fn from_endpoint(endpoint: SocketAddr) -> Self {
        Self {
            ip: endpoint.ip(),
            port: Some(endpoint.port()),
        }
    }

    /// "10.0.0.2", "10.0.0.2:2001", "sim-host" or "sim-host:2001"
    pub fn parse(text: &str) -> StreamResult<Self> {
        if has_port(text) {
            Ok(Self::from_endpoint(resolve_endpoint(text, 0)?))
        } else {
            Ok(Self::new(resolve_endpoint(text, 0)?.ip()))
        }
    }

    /// Keep an explicit port, otherwise use `port`
    #[must_use]
    pub const fn or_port(self, port: u16) -> Self {
        match self.port {
            Some(_) => self,
            None => Self {
                ip: self.ip,
                port: Some(port),
            },
        }
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    #[must_use]
    pub const fn port(&self) -> Option<u16> {
        self.port
    }

    /// Fill in the token's address. Returns false (and leaves the token
    /// alone) when it already has one.
    fn apply(&self, token: &mut StreamToken) -> bool {
        if token.has_address() {
            return false;
        }
        token.set_address(self.ip);
        if token.port() == 0 {
            if let Some(port) = self.port {
                token.set_port(port);
            }
        }
        true
    }
}

impl Default for FallbackAddress {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// Owns one connection per subscribed stream id
pub struct StreamSubscriptionRegistry<C: Connector = TcpConnector> {
    fallback: FallbackAddress,
    connector: C,
    connections: DashMap<StreamId, C::Connection>,
}

impl StreamSubscriptionRegistry<TcpConnector> {
    /// Registry whose fallback is the local host on the default stream port
    #[must_use]
    pub fn new() -> Self {
        Self::with_tcp_fallback(FallbackAddress::default())
    }

    #[must_use]
    pub fn with_fallback(ip: IpAddr) -> Self {
        Self::with_tcp_fallback(FallbackAddress::new(ip))
    }

    #[must_use]
    pub fn from_endpoint(endpoint: SocketAddr) -> Self {
        Self::with_tcp_fallback(FallbackAddress::from_endpoint(endpoint))
    }

    pub fn from_address(address: &str) -> StreamResult<Self> {
        Ok(Self::with_tcp_fallback(FallbackAddress::parse(address)?))
    }

    fn with_tcp_fallback(fallback: FallbackAddress) -> Self {
        let default_port = StreamingConfig::default().default_port;
        Self::with_connector(TcpConnector::default(), fallback.or_port(default_port))
    }

    pub fn from_config(config: &StreamingConfig) -> StreamResult<Self> {
        let fallback = FallbackAddress::parse(&config.fallback_address)?.or_port(config.default_port);
        Ok(Self::with_connector(
            TcpConnector::new(ConnectionOptions::from(config)),
            fallback,
        ))
    }
}

impl Default for StreamSubscriptionRegistry<TcpConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> StreamSubscriptionRegistry<C> {
    pub fn with_connector(connector: C, fallback: FallbackAddress) -> Self {
        Self {
            fallback,
            connector,
            connections: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn fallback(&self) -> FallbackAddress {
        self.fallback
    }

    #[must_use]
    pub const fn connector(&self) -> &C {
        &self.connector
    }

    /// Subscribe to a stream; `handler` runs once per received frame.
    ///
    /// The connection is established in the background on `runtime`;
    /// connection failures never surface here (watch
    /// [`connection_state`](Self::connection_state) instead). Subscribing
    /// to a stream id that is already subscribed is rejected.
    pub fn subscribe<H: FrameHandler>(
        &self,
        runtime: &Handle,
        token: StreamToken,
        handler: H,
    ) -> StreamResult<()> {
        self.subscribe_shared(runtime, token, Arc::new(handler))
    }

    pub fn subscribe_shared(
        &self,
        runtime: &Handle,
        mut token: StreamToken,
        handler: SharedFrameHandler,
    ) -> StreamResult<()> {
        let stream_id = token.stream_id();

        match self.connections.entry(stream_id) {
            Entry::Occupied(_) => {
                warn!(stream_id, "Rejected duplicate subscription");
                Err(StreamError::AlreadySubscribed(stream_id))
            }
            Entry::Vacant(slot) => {
                if self.fallback.apply(&mut token) {
                    debug!(stream_id, address = %self.fallback.ip, "Applied fallback address");
                }

                let connection = self.connector.open(runtime, token, handler)?;
                connection.connect();
                slot.insert(connection);

                info!(stream_id, token = %token, "Subscribed to stream");
                Ok(())
            }
        }
    }

    /// Stop and forget the stream. Unknown stream ids are ignored.
    pub fn unsubscribe(&self, token: &StreamToken) {
        let stream_id = token.stream_id();
        // Removed first so stop() runs outside the shard lock
        let removed = self.connections.remove(&stream_id);
        match removed {
            Some((_, connection)) => {
                connection.stop();
                info!(stream_id, "Unsubscribed from stream");
            }
            None => debug!(stream_id, "Unsubscribe for unknown stream ignored"),
        }
    }

    /// Stop every connection. Safe to call more than once; `Drop` calls it.
    pub fn shutdown(&self) {
        let stream_ids: Vec<StreamId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut stopped = 0usize;
        for stream_id in stream_ids {
            if let Some((_, connection)) = self.connections.remove(&stream_id) {
                connection.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "Stream registry shut down");
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, stream_id: StreamId) -> bool {
        self.connections.contains_key(&stream_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Subscribed stream ids, ascending
    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.connections.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Endpoint the stream's connection is bound to
    #[must_use]
    pub fn endpoint(&self, stream_id: StreamId) -> Option<SocketAddr> {
        self.connections
            .get(&stream_id)
            .and_then(|connection| connection.token().endpoint())
    }

    #[must_use]
    pub fn connection_state(&self, stream_id: StreamId) -> Option<watch::Receiver<ConnectionState>> {
        self.connections
            .get(&stream_id)
            .map(|connection| connection.watch_state())
    }

    /// Run `f` against the stream's connection without removing it
    pub fn with_connection<R>(
        &self,
        stream_id: StreamId,
        f: impl FnOnce(&C::Connection) -> R,
    ) -> Option<R> {
        self.connections.get(&stream_id).map(|connection| f(&connection))
    }
}

impl<C: Connector> Drop for StreamSubscriptionRegistry<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
