//! DecoyNet Core Types
//!
//! Wire messages, framing and transport shared by the server and the node
//! agent.
//!
//! ## Streams
//!
//! Every logical stream is one connection to the server's stream endpoint.
//! The first frame is a [`StreamOpen`] naming the stream kind and carrying
//! string metadata (the node id for Command streams):
//!
//! - **Command**: long-lived, one per node, requests down and responses up
//! - **Tunnel**: one per proxied TCP connection, [`TunnelFrame`]s both ways
//! - **Register** / **Resource**: unary, one request frame then one [`Ack`]

mod error;
mod frame;
mod protocol;
mod tls;
mod transport;
mod tunnel;
mod types;

pub use error::*;
pub use frame::*;
pub use protocol::*;
pub use tls::{client_tls_config, server_tls_config, TlsPaths};
pub use transport::*;
pub use tunnel::{pump, TunnelStats};
pub use types::*;
