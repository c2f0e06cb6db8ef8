//! UDP socket setup, write path and receive loop.

use gossip_core::config::{UDP_BUF_SIZE, UDP_RECV_BUF};
use gossip_core::protocol::HEADER_LEN;
use gossip_core::{Dispatcher, PacketTransport};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bind a UDP socket and grow its kernel receive window.
///
/// Must be called from within a tokio runtime.
pub fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&addr.into())?;
    set_receive_window(&socket);
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Ask for [`UDP_RECV_BUF`] bytes, halving until the OS accepts.
fn set_receive_window(socket: &Socket) {
    let mut size = UDP_RECV_BUF;
    while size > 0 {
        if socket.set_recv_buffer_size(size).is_ok() {
            debug!("UDP receive buffer set to {} bytes", size);
            return;
        }
        size /= 2;
    }
    warn!("Failed to set any UDP receive buffer size");
}

/// Datagram writer over a shared tokio socket.
///
/// Writes are attempted synchronously; when the socket would block the
/// datagram is handed to a spawned task instead.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    handle: Handle,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, handle: Handle) -> Self {
        Self { socket, handle }
    }
}

impl PacketTransport for UdpTransport {
    fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<()> {
        match self.socket.try_send_to(buf, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let socket = Arc::clone(&self.socket);
                let buf = buf.to_vec();
                self.handle.spawn(async move {
                    if let Err(e) = socket.send_to(&buf, addr).await {
                        error!("Failed to send UDP packet to {}: {}", addr, e);
                    }
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Receive datagrams and dispatch each one inline until shutdown.
pub async fn udp_listen(
    socket: Arc<UdpSocket>,
    dispatcher: Arc<Dispatcher>,
    blocking_warning: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let (n, from) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    error!("Error reading UDP packet: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        if n < HEADER_LEN {
            error!("UDP packet too short ({} bytes) from {}", n, from);
            continue;
        }

        let started = Instant::now();
        dispatcher.handle_datagram(&buf[..n], from);

        let elapsed = started.elapsed();
        if elapsed > blocking_warning {
            warn!("Potential blocking operation, handling a packet took {:?}", elapsed);
        }
    }

    info!("UDP listener stopped");
}
