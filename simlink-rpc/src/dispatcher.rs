//! RPC call dispatcher.
//!
//! Thin layer over an [`RpcTransport`]: prepends the [`CallMetadata`] tag
//! to every argument list and applies one timeout to every call. Errors
//! from the transport are returned as they are.

use std::time::Duration;

use serde_json::Value;
use simlink_core::RpcConfig;
use tracing::{debug, Instrument};

use crate::error::TransportResult;
use crate::metadata::CallMetadata;
use crate::tcp::TcpRpcClient;
use crate::transport::RpcTransport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RpcCallDispatcher<T: RpcTransport = TcpRpcClient> {
    transport: T,
    timeout: Duration,
}

impl RpcCallDispatcher<TcpRpcClient> {
    /// Connect the default TCP transport; `timeout` bounds the connect and
    /// every later call.
    pub async fn connect(address: &str, timeout: Duration) -> TransportResult<Self> {
        let transport = TcpRpcClient::connect(address, timeout).await?;
        Ok(Self::with_timeout(transport, timeout))
    }

    pub async fn from_config(config: &RpcConfig) -> TransportResult<Self> {
        Self::connect(&config.address, config.timeout()).await
    }
}

impl<T: RpcTransport> RpcCallDispatcher<T> {
    pub const fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_TIMEOUT)
    }

    pub const fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Applies to calls made after this returns
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Invoke `method` and wait for its result
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, T::Error> {
        let params = with_metadata(CallMetadata::synchronous(), args);
        let span = tracing::debug_span!("rpc_call", method, timeout = ?self.timeout);
        self.transport
            .call(method, params, self.timeout)
            .instrument(span)
            .await
    }

    /// Invoke `method` without waiting. Only a failure to queue the call is
    /// reported.
    pub fn async_call(&self, method: &str, args: Vec<Value>) -> Result<(), T::Error> {
        let params = with_metadata(CallMetadata::asynchronous(), args);
        debug!(method, "Queued asynchronous call");
        self.transport.notify(method, params)
    }
}

fn with_metadata(metadata: CallMetadata, args: Vec<Value>) -> Vec<Value> {
    let mut params = Vec::with_capacity(args.len() + 1);
    params.push(metadata.to_value());
    params.extend(args);
    params
}
