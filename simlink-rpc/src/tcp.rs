// TCP RPC transport
//
// One socket, two tasks: a writer draining an unbounded frame queue and a
// reader routing responses to the waiting callers by msgid. Frames are
// `u32 LE length | JSON message`.
//
// Dropping the client cancels the reader at once; the writer still flushes
// whatever was queued before the drop and then exits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use simlink_core::RpcConfig;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::error::{TransportError, TransportResult};
use crate::message::Message;
use crate::transport::RpcTransport;

const MAX_MESSAGE_LENGTH: usize = 64 * 1024 * 1024;

/// `(error, result)` of a response
type Reply = (Value, Value);

struct Shared {
    next_msgid: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<Reply>>,
    closed: AtomicBool,
}

impl Shared {
    /// Mark the connection dead and fail every waiting call
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes the callers with a receive error
        self.pending.clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes the pending slot however the call ends (reply, timeout, or the
/// caller dropping the future)
struct PendingSlot<'a> {
    shared: &'a Shared,
    msgid: u32,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.msgid);
    }
}

/// RPC client over a single TCP connection
pub struct TcpRpcClient {
    peer: SocketAddr,
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Bytes>,
    writer: Option<JoinHandle<()>>,
    cancel_token: CancellationToken,
}

impl TcpRpcClient {
    /// Connect to `address` ("host:port"), bounded by `connect_timeout`
    pub async fn connect(address: &str, connect_timeout: Duration) -> TransportResult<Self> {
        let endpoint = tokio::net::lookup_host(address)
            .await
            .map_err(|e| TransportError::InvalidAddress(format!("{address}: {e}")))?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{address}: no addresses resolved")))?;

        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: format!("connect to {address}"),
                timeout: connect_timeout,
            })??;

        Self::from_stream(stream)
    }

    pub async fn from_config(config: &RpcConfig) -> TransportResult<Self> {
        Self::connect(&config.address, config.timeout()).await
    }

    /// Take over an established socket. Must be called within a tokio runtime.
    pub fn from_stream(stream: TcpStream) -> TransportResult<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            next_msgid: AtomicU32::new(0),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let (outgoing, queue) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let span = tracing::info_span!("rpc_connection", peer = %peer);

        let writer = tokio::spawn(
            write_loop(write_half, queue, Arc::clone(&shared), cancel_token.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(
            read_loop(read_half, Arc::clone(&shared), cancel_token.clone()).instrument(span),
        );

        info!(peer = %peer, "RPC client connected");
        Ok(Self {
            peer,
            shared,
            outgoing,
            writer: Some(writer),
            cancel_token,
        })
    }

    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Calls still waiting for a response
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Wait until everything queued so far has been written, then close
    pub async fn close(mut self) {
        let writer = self.writer.take();
        drop(self);
        if let Some(writer) = writer {
            let _ = writer.await;
        }
    }

    fn enqueue(&self, message: &Message) -> TransportResult<()> {
        if self.shared.is_closed() {
            return Err(TransportError::Disconnected);
        }
        let frame = message.encode()?;
        self.outgoing
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }
}

#[async_trait]
impl RpcTransport for TcpRpcClient {
    type Error = TransportError;

    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> TransportResult<Value> {
        let msgid = self.shared.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.shared.pending.insert(msgid, reply_tx);
        let _slot = PendingSlot {
            shared: &self.shared,
            msgid,
        };

        self.enqueue(&Message::Request {
            msgid,
            method: method.to_string(),
            params,
        })?;

        // A close racing the insert drops our sender, which ends the wait below
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok((Value::Null, result))) => Ok(result),
            Ok(Ok((error, _))) => Err(TransportError::Remote {
                method: method.to_string(),
                error,
            }),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => {
                debug!(method, msgid, "RPC call timed out");
                Err(TransportError::Timeout {
                    operation: method.to_string(),
                    timeout,
                })
            }
        }
    }

    fn notify(&self, method: &str, params: Vec<Value>) -> TransportResult<()> {
        self.enqueue(&Message::Notification {
            method: method.to_string(),
            params,
        })
    }
}

impl Drop for TcpRpcClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
    cancel_token: CancellationToken,
) {
    let mut sink = FramedWrite::new(write_half, codec());

    // Ends once every sender is gone and the queue is drained
    while let Some(frame) = queue.recv().await {
        if let Err(e) = sink.send(frame).await {
            warn!(error = %e, "RPC write failed");
            shared.close();
            cancel_token.cancel();
            break;
        }
    }

    debug!("RPC writer stopped");
}

async fn read_loop(read_half: OwnedReadHalf, shared: Arc<Shared>, cancel_token: CancellationToken) {
    let mut frames = FramedRead::new(read_half, codec());

    loop {
        let frame = tokio::select! {
            () = cancel_token.cancelled() => break,
            frame = frames.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "RPC read failed");
                break;
            }
            None => {
                info!("RPC server closed the connection");
                break;
            }
        };

        match Message::decode(&frame) {
            Ok(Message::Response {
                msgid,
                error,
                result,
            }) => match shared.pending.remove(&msgid) {
                // The caller may have given up already; that is fine
                Some((_, reply)) => {
                    let _ = reply.send((error, result));
                }
                None => debug!(msgid, "Response for unknown call dropped"),
            },
            Ok(other) => debug!(message = ?other, "Ignoring server-initiated message"),
            Err(e) => {
                warn!(error = %e, "Malformed RPC message, closing connection");
                break;
            }
        }
    }

    shared.close();
    cancel_token.cancel();
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_length(4)
        .max_frame_length(MAX_MESSAGE_LENGTH)
        .new_codec()
}
