//! TCP accept loop and push/pull connection handling.
//!
//! The exchange itself is blocking I/O over a std stream, so each
//! connection runs on the blocking pool with read and write timeouts set.

use crate::error::DaemonError;
use gossip_core::{RemoteState, StateExchange};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{error, info};

/// Accept push/pull connections until shutdown, one task per connection.
pub async fn tcp_listen(
    listener: TcpListener,
    exchange: Arc<StateExchange>,
    tcp_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, addr) = tokio::select! {
            result = listener.accept() => match result {
                Ok(accepted) => accepted,
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    error!("Error accepting TCP connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        let exchange = Arc::clone(&exchange);
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, addr, exchange, tcp_timeout).await {
                error!("Push/pull with {} failed: {}", addr, e);
            }
        });
    }

    info!("TCP listener stopped");
}

/// Respond to one inbound push/pull exchange. The connection closes on return.
async fn handle_conn(
    stream: TcpStream,
    addr: SocketAddr,
    exchange: Arc<StateExchange>,
    tcp_timeout: Duration,
) -> Result<(), DaemonError> {
    info!("Responding to push/pull sync with {}", addr);
    let mut stream = into_blocking(stream.into_std()?, tcp_timeout)?;
    tokio::task::spawn_blocking(move || exchange.respond(&mut stream)).await??;
    Ok(())
}

/// Dial `addr`, send our state and read theirs.
pub async fn push_pull(
    addr: SocketAddr,
    exchange: Arc<StateExchange>,
    tcp_timeout: Duration,
) -> Result<RemoteState, DaemonError> {
    info!("Initiating push/pull sync with {}", addr);
    tokio::task::spawn_blocking(move || -> Result<RemoteState, DaemonError> {
        let stream = StdTcpStream::connect_timeout(&addr, tcp_timeout)?;
        let mut stream = into_blocking(stream, tcp_timeout)?;
        Ok(exchange.initiate(&mut stream)?)
    })
    .await?
}

fn into_blocking(stream: StdTcpStream, timeout: Duration) -> std::io::Result<StdTcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}
