//! L2CAP client/server messaging
//!
//! Request/response sessions over connection-oriented L2CAP sockets:
//! - [`L2capClient`] sends requests and hands responses to a handler
//! - [`L2capServer`] serves several clients, one worker per connection
//! - `"STOP"` ends a session on any server and is answered with `"STOP_ACK"`

pub mod client;
pub mod handler;
pub mod server;
pub mod socket;

// Re-export the public API
pub use self::client::L2capClient;
pub use self::handler::{
    is_stop, Defaults, PeerInfo, RequestBuilder, RequestHandler, ResponseBuilder, ResponseHandler,
    DEFAULT_REQUEST, DEFAULT_RESPONSE, STOP, STOP_ACK,
};
pub use self::server::{L2capServer, SessionReport, ShutdownHandle};
pub use self::socket::L2capSocket;
