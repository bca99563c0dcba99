//! Per-stream connection contract.
//!
//! The registry only talks to connections through [`StreamConnection`] and
//! builds them through a [`Connector`], so the transport can be swapped
//! (tests use stub connections that count `stop` calls).

use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::error::StreamResult;
use crate::token::StreamToken;

/// Receives every frame of one stream, in arrival order.
///
/// Runs on a runtime worker thread; keep it short and hand heavy work off
/// to a channel or task.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: Bytes);
}

impl<F> FrameHandler for F
where
    F: Fn(Bytes) + Send + Sync + 'static,
{
    fn on_frame(&self, frame: Bytes) {
        self(frame);
    }
}

pub type SharedFrameHandler = Arc<dyn FrameHandler>;

/// Lifecycle of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `stop()` was called; terminal
    Stopped,
}

/// One network connection bound to one stream token.
pub trait StreamConnection: Send + Sync + 'static {
    /// Token this connection was built for (address already resolved)
    fn token(&self) -> &StreamToken;

    /// Start connecting in the background. Never blocks; calling it more
    /// than once has no effect.
    fn connect(&self);

    /// Cancel pending work. Once this returns no new frame delivery starts.
    fn stop(&self);

    fn state(&self) -> ConnectionState;

    /// Receiver that observes state transitions
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
}

/// Builds connections for the registry.
pub trait Connector: Send + Sync + 'static {
    type Connection: StreamConnection;

    /// Build (but do not start) a connection for `token`, whose tasks will
    /// run on `runtime`.
    fn open(
        &self,
        runtime: &Handle,
        token: StreamToken,
        handler: SharedFrameHandler,
    ) -> StreamResult<Self::Connection>;
}
