pub(crate) use self::handler::DhtHandler;
use crate::{id::InfoHash, transaction::LookupId};
use std::{collections::HashSet, fmt, io, net::SocketAddr};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub(crate) mod bootstrap;
mod handler;
mod lookup;
mod refresh;
mod timer;

/// Point-in-time view of the engine, exposed for diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct State {
    pub is_running: bool,
    pub bootstrapped: bool,
    pub good_node_count: usize,
    pub questionable_node_count: usize,
    pub bucket_count: usize,
    pub pending_transactions: usize,
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IpVersion {
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Command sent from the public handle to the worker task.
pub(crate) enum OneshotTask {
    /// Check bootstrap status. The sender is notified once the bootstrap
    /// completed.
    CheckBootstrap(oneshot::Sender<bool>),
    /// Start a peer search for an info hash.
    StartSearch(StartSearch),
    /// Get the local address the socket is bound to.
    GetLocalAddr(oneshot::Sender<SocketAddr>),
    /// Save the routing state to the snapshot file now.
    SaveState(oneshot::Sender<io::Result<()>>),
    /// Retrieve diagnostic information.
    GetState(oneshot::Sender<State>),
}

pub(crate) struct StartSearch {
    pub info_hash: InfoHash,
    /// Announce ourselves to the closest responders once the search
    /// converges.
    pub announce: bool,
    pub tx: mpsc::UnboundedSender<SocketAddr>,
}

/// Work the worker scheduled for itself to run later.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ScheduledCheck {
    /// Retry or expire timed out transactions.
    SweepTransactions,
    /// Start or retry the bootstrap.
    Bootstrap,
    /// Refresh buckets that saw no activity recently.
    RefreshStaleBuckets {
        /// Refresh every bucket regardless of staleness.
        force: bool,
    },
    /// Retire the current announce token secret.
    RotateTokens,
    /// Drop expired peer announces.
    PurgeStorage,
    /// Periodically persist the routing state.
    SaveSnapshot,
    /// Deadline for an iterative lookup making no progress.
    LookupTimeout(LookupId),
}

#[derive(Error, Debug)]
pub(crate) enum WorkerError {
    #[error("received unsolicited response")]
    UnsolicitedResponse,
}

/// Resolve host:port entry points to socket addresses of the given family.
pub(crate) async fn resolve(entry_points: &HashSet<String>, ip_v: IpVersion) -> HashSet<SocketAddr> {
    futures_util::future::join_all(entry_points.iter().map(tokio::net::lookup_host))
        .await
        .into_iter()
        .filter_map(|result| result.ok())
        .flatten()
        .filter(|addr| match ip_v {
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        })
        .collect()
}
