//! A running cluster member.
//!
//! `Node` wires the core pieces to real sockets: UDP and TCP are bound on
//! the same port, the receive loops run as tokio tasks and a sweeper
//! expires overdue ack handlers. Shutdown is a one-way flag; the loops
//! exit on their next wake-up.
//!
//! The member row published for this node never carries a wildcard IP:
//! see [`advertise_addr`].

use crate::error::DaemonError;
use crate::tcp::{push_pull, tcp_listen};
use crate::udp::{UdpTransport, bind_udp, udp_listen};
use gossip_core::protocol::{Ping, encode_addr};
use gossip_core::{
    AckRegistry, Delegate, Dispatcher, MembershipHandler, MessageType, NodeState, NodeTable, Outbound,
    PacketTransport, RemoteState, SequenceGenerator, StateExchange, TransmitQueue, TransportConfig,
    VersionTable,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Incarnation a node starts at.
const INITIAL_INCARNATION: u32 = 1;

pub struct Node {
    name: String,
    local_addr: SocketAddr,
    advertised: SocketAddr,
    config: TransportConfig,
    table: Arc<NodeTable>,
    outbound: Arc<Outbound>,
    exchange: Arc<StateExchange>,
    acks: Arc<AckRegistry>,
    seq: Arc<SequenceGenerator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind sockets on `bind` and start the background loops.
    ///
    /// Binding port 0 picks a free port for both protocols.
    pub async fn start(
        name: impl Into<String>,
        bind: SocketAddr,
        config: TransportConfig,
        delegate: Arc<dyn Delegate>,
    ) -> Result<Self, DaemonError> {
        let name = name.into();
        let versions = VersionTable::current();

        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let socket = Arc::new(bind_udp(local_addr)?);

        let advertised = advertise_addr(local_addr, config.advertise_ip);
        let broadcasts = Arc::new(TransmitQueue::new());
        let table = Arc::new(
            NodeTable::new(name.clone(), encode_addr(&advertised), INITIAL_INCARNATION)
                .with_broadcasts(Arc::clone(&broadcasts), versions),
        );
        let transport: Arc<dyn PacketTransport> =
            Arc::new(UdpTransport::new(Arc::clone(&socket), Handle::current()));
        let outbound = Arc::new(Outbound::new(&config, versions, transport, broadcasts));
        let acks = Arc::new(AckRegistry::new());
        let seq = Arc::new(SequenceGenerator::new());
        let membership: Arc<dyn MembershipHandler> = table.clone();

        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::clone(&outbound),
            Arc::clone(&membership),
            Arc::clone(&delegate),
            Arc::clone(&acks),
            Arc::clone(&seq),
        ));
        let exchange = Arc::new(StateExchange::new(&config, versions, membership, delegate));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(udp_listen(
                socket,
                dispatcher,
                config.blocking_warning,
                shutdown_rx.clone(),
            )),
            tokio::spawn(tcp_listen(
                listener,
                Arc::clone(&exchange),
                config.tcp_timeout,
                shutdown_rx.clone(),
            )),
            tokio::spawn(sweep_acks(
                Arc::clone(&acks),
                config.ack_sweep_interval,
                shutdown_rx,
            )),
        ];

        table.announce();
        info!("Node {} listening on {}, advertising {}", name, local_addr, advertised);

        Ok(Self {
            name,
            local_addr,
            advertised,
            config,
            table,
            outbound,
            exchange,
            acks,
            seq,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address both sockets are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address published in our member row.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn members(&self) -> Vec<NodeState> {
        self.table.members()
    }

    pub fn table(&self) -> &Arc<NodeTable> {
        &self.table
    }

    pub fn outbound(&self) -> &Arc<Outbound> {
        &self.outbound
    }

    /// Send a direct probe and wait up to the probe timeout for its ack.
    pub async fn ping(&self, to: SocketAddr) -> Result<bool, DaemonError> {
        let seq_no = self.seq.next();
        let (tx, rx) = oneshot::channel();
        self.acks.register(
            seq_no,
            move || {
                let _ = tx.send(());
            },
            self.config.probe_timeout,
        );

        self.outbound
            .encode_and_send(to, MessageType::Ping, &Ping { seq_no })?;
        let acked = matches!(timeout(self.config.probe_timeout, rx).await, Ok(Ok(())));
        debug!("Probe {} to {} acked: {}", seq_no, to, acked);
        Ok(acked)
    }

    /// Send an opaque user message.
    pub fn send_user_msg(&self, to: SocketAddr, payload: &[u8]) -> Result<(), DaemonError> {
        self.outbound.send_user_msg(to, payload)?;
        Ok(())
    }

    /// Run a push/pull exchange with `addr` without merging the result.
    pub async fn push_pull(&self, addr: SocketAddr) -> Result<RemoteState, DaemonError> {
        push_pull(addr, Arc::clone(&self.exchange), self.config.tcp_timeout).await
    }

    /// Push/pull with a peer known only by raw address bytes.
    ///
    /// IP-only addresses are dialed on the configured TCP port.
    pub async fn push_pull_raw(&self, raw: &[u8]) -> Result<RemoteState, DaemonError> {
        let addr = self
            .config
            .resolve_tcp(raw)
            .ok_or(DaemonError::BadAddress(raw.len()))?;
        self.push_pull(addr).await
    }

    /// Sync with a member from our table, dialing the address in its row.
    pub async fn sync_with_member(&self, name: &str) -> Result<usize, DaemonError> {
        let member = self
            .table
            .get(name)
            .ok_or_else(|| DaemonError::UnknownMember(name.to_string()))?;
        let addr = self
            .config
            .resolve_tcp(&member.addr)
            .ok_or(DaemonError::BadAddress(member.addr.len()))?;
        self.sync_with(addr).await
    }

    /// Run a push/pull exchange with `addr` and merge what comes back.
    ///
    /// If the node list was cut short, the rows that did arrive are still
    /// merged before the error is returned. Returns the number of remote rows.
    pub async fn sync_with(&self, addr: SocketAddr) -> Result<usize, DaemonError> {
        match self.push_pull(addr).await {
            Ok(remote) => {
                let count = remote.nodes.len();
                self.exchange.merge_remote(remote);
                info!("Synced {} node(s) from {}", count, addr);
                Ok(count)
            }
            Err(DaemonError::PushPull(e)) if !e.partial_nodes().is_empty() => {
                warn!(
                    "Merging {} node(s) from incomplete sync with {}",
                    e.partial_nodes().len(),
                    addr
                );
                self.table.merge_remote_nodes(e.partial_nodes().to_vec());
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Node {} shut down", self.name);
    }
}

/// Address to publish for a node bound to `bound`.
///
/// An explicit `advertise` IP wins. A wildcard bind advertises the local
/// interface the OS would route outbound traffic through, falling back to
/// loopback when there is no route. The port is always the bound one.
pub fn advertise_addr(bound: SocketAddr, advertise: Option<IpAddr>) -> SocketAddr {
    if let Some(ip) = advertise {
        return SocketAddr::new(ip, bound.port());
    }
    if !bound.ip().is_unspecified() {
        return bound;
    }

    let ip = match outbound_interface(bound.ip()) {
        Some(ip) => ip,
        None => {
            let fallback = match bound.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            warn!(
                "Bound to {} with no routable interface, advertising {}",
                bound, fallback
            );
            fallback
        }
    };
    SocketAddr::new(ip, bound.port())
}

/// Local IP picked by the routing table. Connecting a UDP socket sends nothing.
fn outbound_interface(family: IpAddr) -> Option<IpAddr> {
    let (local, remote): (SocketAddr, SocketAddr) = match family {
        IpAddr::V4(_) => (
            (Ipv4Addr::UNSPECIFIED, 0).into(),
            (Ipv4Addr::new(192, 0, 2, 1), 9).into(),
        ),
        IpAddr::V6(_) => (
            (Ipv6Addr::UNSPECIFIED, 0).into(),
            (Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1), 9).into(),
        ),
    };
    let socket = StdUdpSocket::bind(local).ok()?;
    socket.connect(remote).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Periodically expire overdue ack handlers.
async fn sweep_acks(acks: Arc<AckRegistry>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let expired = acks.sweep();
                if expired > 0 {
                    debug!("Expired {} ack handler(s)", expired);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
