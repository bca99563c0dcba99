// simlink-streaming - multiplexed sensor stream subscriptions
//
// Layout:
// - token       - stream identifier + optional endpoint, 24-byte wire form
// - connection  - per-stream connection contract and frame callback
// - tcp         - default TCP connection (stream-id handshake, framed reads, reconnect)
// - registry    - stream id -> connection map sharing one tokio runtime

pub mod connection;
pub mod error;
pub mod registry;
pub mod tcp;
pub mod token;

pub use connection::{ConnectionState, Connector, FrameHandler, SharedFrameHandler, StreamConnection};
pub use error::{StreamError, StreamResult};
pub use registry::{FallbackAddress, StreamSubscriptionRegistry};
pub use tcp::{ConnectionOptions, TcpConnector, TcpStreamConnection};
pub use token::{Protocol, StreamId, StreamToken, TOKEN_WIRE_SIZE};
