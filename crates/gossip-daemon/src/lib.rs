//! gossip-daemon library: Socket-owning side of the membership transport.
//!
//! This is a thin layer over gossip-core that binds real UDP and TCP
//! sockets, allowing integration tests to run full nodes on loopback.

pub mod error;
pub mod node;
pub mod tcp;
pub mod udp;

// Re-export key types for convenience
pub use error::DaemonError;
pub use node::Node;
pub use udp::{UdpTransport, bind_udp};
