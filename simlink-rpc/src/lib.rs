// simlink-rpc - remote procedure calls into the simulator
//
// Layout:
// - metadata    - per-call tag telling the server whether a response is expected
// - transport   - RpcTransport trait the dispatcher is generic over
// - message     - request / response / notification envelopes
// - tcp         - default transport: length-prefixed JSON over TCP
// - dispatcher  - RpcCallDispatcher, stamps metadata and applies the timeout

pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metadata;
pub mod tcp;
pub mod transport;

pub use dispatcher::RpcCallDispatcher;
pub use error::{TransportError, TransportResult};
pub use message::Message;
pub use metadata::CallMetadata;
pub use tcp::TcpRpcClient;
pub use transport::RpcTransport;
