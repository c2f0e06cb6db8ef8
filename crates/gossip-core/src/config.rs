//! Transport configuration.

use crate::protocol::decode_addr;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Default port for both UDP gossip and TCP push/pull.
pub const DEFAULT_PORT: u16 = 7946;

/// Default datagram size budget, safe for common MTUs.
pub const UDP_SEND_BUF: usize = 1400;

/// Size of the buffer used to read a single datagram.
pub const UDP_BUF_SIZE: usize = 65536;

/// Kernel receive window we try to get for the UDP socket.
pub const UDP_RECV_BUF: usize = 2 * 1024 * 1024;

/// Configuration for the transport layer.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port used when an address carries only an IP (default: 7946)
    pub udp_port: u16,
    /// Port dialed for push/pull when only an IP is known (default: 7946)
    pub tcp_port: u16,
    /// IP published in our own member row. When unset, a wildcard bind
    /// advertises the address of the outbound interface (default: None)
    pub advertise_ip: Option<IpAddr>,
    /// How long a relayed probe waits for the target's ack (default: 500ms)
    pub probe_timeout: Duration,
    /// Connect and I/O timeout for push/pull streams (default: 10s)
    pub tcp_timeout: Duration,
    /// Datagram size budget used when piggybacking broadcasts (default: 1400)
    pub udp_send_budget: usize,
    /// Compress outgoing datagrams and push/pull state (default: false)
    pub enable_compression: bool,
    /// Most compound/compress wrappers unwrapped for one datagram (default: 4)
    pub max_nesting_depth: usize,
    /// Warn when handling one datagram takes longer than this (default: 10ms)
    pub blocking_warning: Duration,
    /// How often expired ack handlers are swept (default: 100ms)
    pub ack_sweep_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_PORT,
            tcp_port: DEFAULT_PORT,
            advertise_ip: None,
            probe_timeout: Duration::from_millis(500),
            tcp_timeout: Duration::from_secs(10),
            udp_send_budget: UDP_SEND_BUF,
            enable_compression: false,
            max_nesting_depth: 4,
            blocking_warning: Duration::from_millis(10),
            ack_sweep_interval: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    /// Use `port` for both UDP and TCP.
    pub fn with_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self.tcp_port = port;
        self
    }

    /// Enable or disable compression.
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.enable_compression = enabled;
        self
    }

    /// Publish `ip` in our member row instead of the bound address.
    pub fn with_advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    /// Stream address for a member's raw address bytes.
    ///
    /// IP-only forms are dialed on `tcp_port`.
    pub fn resolve_tcp(&self, raw: &[u8]) -> Option<SocketAddr> {
        decode_addr(raw, self.tcp_port)
    }

    /// Datagram address for a member's raw address bytes.
    ///
    /// IP-only forms are sent to `udp_port`.
    pub fn resolve_udp(&self, raw: &[u8]) -> Option<SocketAddr> {
        decode_addr(raw, self.udp_port)
    }
}
