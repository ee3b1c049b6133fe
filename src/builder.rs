//! Public handle to a running DHT engine.

use crate::{
    dispatch::Dispatcher,
    id::{InfoHash, NodeId},
    routing::{node::Node, table::RoutingTable},
    snapshot::Snapshot,
    socket::{Socket, SocketTrait},
    storage::AnnounceStorage,
    token::TokenTracker,
    transaction::MESSAGE_TIMEOUT,
    worker::{bootstrap::TableBootstrap, DhtHandler, IpVersion, OneshotTask, StartSearch, State},
};
use rand::Rng;
use std::{
    collections::HashSet,
    io,
    net::{IpAddr, SocketAddr},
    ops::RangeInclusive,
    path::PathBuf,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task,
};

/// How the engine picks its UDP port.
#[derive(Clone, Debug)]
pub enum PortSelection {
    /// Bind exactly this port, typically the one persisted from a previous
    /// run so NAT mappings stay valid.
    Reuse(u16),
    /// Try each port in the range until one binds.
    Range(RangeInclusive<u16>),
    /// Let the OS pick.
    Any,
}

/// Configuration for one engine instance.
///
/// An instance serves a single address family. Dual-stack operation means
/// two instances, one bound to an IPv4 and one to an IPv6 address, each with
/// its own routing table and state file (it is recommended they share a node
/// id). A failure to start one family never affects the other.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub listen_ip: IpAddr,
    pub ports: PortSelection,
    /// How long to wait for a response to a query.
    pub message_timeout: Duration,
    /// Where to persist the routing state. `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
    /// `host:port` entry points used to join the network when the routing
    /// table is empty or stale.
    pub entry_points: HashSet<String>,
    /// Port to announce to other nodes. `None` announces the UDP source
    /// port (implied port), which is what NATed peers usually want.
    pub announce_port: Option<u16>,
    /// Fixed node id. `None` restores the persisted id or generates one.
    pub node_id: Option<NodeId>,
}

impl DhtConfig {
    pub fn new(listen_ip: IpAddr) -> Self {
        Self {
            listen_ip,
            ports: PortSelection::Any,
            message_timeout: MESSAGE_TIMEOUT,
            snapshot_path: None,
            entry_points: HashSet::new(),
            announce_port: None,
            node_id: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to bind UDP socket")]
    Bind(#[source] io::Error),
}

/// Handle to a running engine.
///
/// Cheaply cloneable; every clone talks to the same engine. The engine shuts
/// down, saving its state, when the last handle is dropped.
#[derive(Clone)]
pub struct Dht {
    send: mpsc::UnboundedSender<OneshotTask>,
}

impl Dht {
    /// Start an engine for the address family of `config.listen_ip`.
    pub async fn start(config: DhtConfig) -> Result<Self, SetupError> {
        let socket = bind(config.listen_ip, &config.ports)
            .await
            .map_err(SetupError::Bind)?;

        Self::start_on(socket, config).await
    }

    /// Start an engine on an already bound socket. Used by tests to plug in
    /// their own transport.
    pub async fn start_on<S>(socket: S, config: DhtConfig) -> Result<Self, SetupError>
    where
        S: SocketTrait + Send + Sync + 'static,
    {
        let socket = Socket::new(socket).map_err(SetupError::Bind)?;
        let ip_v = socket.ip_version();

        // Losing the previous state is recoverable, the engine just starts
        // from scratch with a fresh id.
        let snapshot = match &config.snapshot_path {
            Some(path) => Snapshot::load(path).await,
            None => None,
        };

        let mut rng = rand::thread_rng();

        let local_id = config
            .node_id
            .or_else(|| snapshot.as_ref().map(|snapshot| snapshot.id))
            .unwrap_or_else(|| rng.gen());

        let mut table = RoutingTable::new(local_id);
        if let Some(snapshot) = &snapshot {
            for node in snapshot.nodes() {
                let matches = match ip_v {
                    IpVersion::V4 => node.addr.is_ipv4(),
                    IpVersion::V6 => node.addr.is_ipv6(),
                };
                if matches {
                    // Restored nodes have unknown liveness until the
                    // post-bootstrap refresh re-verifies them.
                    table.add_node(Node::new_contact(node.id, node.addr));
                }
            }
        }

        log::info!(
            "{ip_v}: starting node {local_id:x} with {} restored contacts",
            table.num_nodes()
        );

        let dispatcher = Dispatcher::new(socket, config.message_timeout, &mut rng);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut handler = DhtHandler::new(
            dispatcher,
            table,
            AnnounceStorage::new(),
            TokenTracker::new(&mut rng),
            TableBootstrap::new(config.entry_points),
            config.snapshot_path,
            config.announce_port,
            command_rx,
        );
        task::spawn(async move { handler.run().await });

        Ok(Self { send: command_tx })
    }

    /// Wait until the initial bootstrap completed. Returns `false` if the
    /// engine shut down before that.
    pub async fn bootstrapped(&self) -> bool {
        let (tx, rx) = oneshot::channel();

        self.send.send(OneshotTask::CheckBootstrap(tx)).is_ok() && rx.await.unwrap_or(false)
    }

    /// Search for peers announced for `info_hash`, optionally announcing
    /// ourselves to the closest nodes once the search converges.
    ///
    /// Found peers are streamed through the returned receiver. The channel
    /// closes when the search is complete.
    pub fn search(&self, info_hash: InfoHash, announce: bool) -> mpsc::UnboundedReceiver<SocketAddr> {
        let (tx, rx) = mpsc::unbounded_channel();

        if self
            .send
            .send(OneshotTask::StartSearch(StartSearch {
                info_hash,
                announce,
                tx,
            }))
            .is_err()
        {
            log::error!("failed to start search, the engine has shut down");
        }

        rx
    }

    /// The address the engine is bound to.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.send.send(OneshotTask::GetLocalAddr(tx)).ok()?;
        rx.await.ok()
    }

    /// Persist the routing state now, outside the automatic save cadence.
    pub async fn save_state(&self) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();

        self.send
            .send(OneshotTask::SaveState(tx))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "engine has shut down"))?;

        rx.await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "engine has shut down"))?
    }

    /// Diagnostic view of the engine.
    pub async fn state(&self) -> Option<State> {
        let (tx, rx) = oneshot::channel();
        self.send.send(OneshotTask::GetState(tx)).ok()?;
        rx.await.ok()
    }
}

async fn bind(ip: IpAddr, ports: &PortSelection) -> io::Result<UdpSocket> {
    match ports {
        PortSelection::Reuse(port) => UdpSocket::bind((ip, *port)).await,
        PortSelection::Any => UdpSocket::bind((ip, 0)).await,
        PortSelection::Range(range) => {
            let mut last_error = None;

            for port in range.clone() {
                match UdpSocket::bind((ip, port)).await {
                    Ok(socket) => return Ok(socket),
                    Err(error) => last_error = Some(error),
                }
            }

            Err(last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty port range")))
        }
    }
}
