use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Client side of an RPC connection.
///
/// `params` are passed through untouched; the dispatcher has already put the
/// call metadata in front.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Invoke `method` and wait for its result, at most `timeout`
    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, Self::Error>;

    /// Queue a call whose result nobody waits for. Never suspends.
    fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), Self::Error>;
}
