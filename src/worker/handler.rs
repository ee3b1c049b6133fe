//! The worker task owning all engine state.
//!
//! Everything here runs on a single task: incoming datagrams, commands from
//! the public handle and scheduled checks are multiplexed onto one loop, so
//! no state is ever shared across tasks and no locking is needed.

use super::{
    bootstrap::TableBootstrap,
    lookup::{Lookup, LookupKind, LOOKUP_TIMEOUT},
    refresh::{self, CHECK_INTERVAL},
    timer::{Timeout, Timer},
    OneshotTask, ScheduledCheck, StartSearch, State, WorkerError,
};
use crate::{
    dispatch::Dispatcher,
    id::NodeId,
    message::{
        error_code, AnnouncePeerQuery, ErrorMessage, FindNodeQuery, GetPeersQuery,
        GetPeersResponse, Message, MessageBody, NodeListResponse, Query, Response,
    },
    routing::{
        bucket::BUCKET_SIZE,
        node::{Node, NodeHandle, NodeStatus},
        table::RoutingTable,
    },
    snapshot::Snapshot,
    storage::{AnnounceStorage, PURGE_INTERVAL},
    token::{TokenTracker, ROTATE_INTERVAL},
    transaction::{LookupId, Origin, PendingTransaction, SWEEP_INTERVAL},
    worker::IpVersion,
};
use futures_util::StreamExt;
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, time::Duration};
use tokio::sync::mpsc;

/// How often the routing state is persisted.
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Candidates seeding an iterative lookup.
const LOOKUP_SEEDS: usize = 32;

pub(crate) struct DhtHandler {
    dispatcher: Dispatcher,
    table: RoutingTable,
    storage: AnnounceStorage,
    tokens: TokenTracker,
    bootstrap: TableBootstrap,
    bootstrap_lookup: Option<LookupId>,
    lookups: HashMap<LookupId, LookupEntry>,
    next_lookup_id: u64,
    command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    timer: Timer<ScheduledCheck>,
    snapshot_path: Option<PathBuf>,
    announce_port: Option<u16>,
}

struct LookupEntry {
    lookup: Lookup,
    deadline: Timeout,
}

impl DhtHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dispatcher: Dispatcher,
        table: RoutingTable,
        storage: AnnounceStorage,
        tokens: TokenTracker,
        bootstrap: TableBootstrap,
        snapshot_path: Option<PathBuf>,
        announce_port: Option<u16>,
        command_rx: mpsc::UnboundedReceiver<OneshotTask>,
    ) -> Self {
        Self {
            dispatcher,
            table,
            storage,
            tokens,
            bootstrap,
            bootstrap_lookup: None,
            lookups: HashMap::new(),
            next_lookup_id: 0,
            command_rx,
            timer: Timer::new(),
            snapshot_path,
            announce_port,
        }
    }

    pub async fn run(&mut self) {
        self.timer.schedule_in(Duration::ZERO, ScheduledCheck::Bootstrap);
        self.timer
            .schedule_in(SWEEP_INTERVAL, ScheduledCheck::SweepTransactions);
        self.timer.schedule_in(
            CHECK_INTERVAL,
            ScheduledCheck::RefreshStaleBuckets { force: false },
        );
        self.timer
            .schedule_in(ROTATE_INTERVAL, ScheduledCheck::RotateTokens);
        self.timer
            .schedule_in(PURGE_INTERVAL, ScheduledCheck::PurgeStorage);
        if self.snapshot_path.is_some() {
            self.timer
                .schedule_in(AUTOSAVE_INTERVAL, ScheduledCheck::SaveSnapshot);
        }

        loop {
            tokio::select! {
                result = self.dispatcher.recv() => match result {
                    Ok((message, from)) => {
                        if let Err(error) = self.handle_message(message, from).await {
                            log::debug!(
                                "{}: dropping message from {from:?}: {error}",
                                self.ip_version()
                            );
                        }
                    }
                    Err(error) => {
                        log::error!("{}: socket closed: {error}", self.ip_version());
                        break;
                    }
                },
                command = self.command_rx.recv() => match command {
                    Some(task) => self.handle_command(task).await,
                    // Every handle was dropped, shut down.
                    None => break,
                },
                check = self.timer.next(), if !self.timer.is_empty() => {
                    if let Some(check) = check {
                        self.handle_check(check).await;
                    }
                }
            }
        }

        if let Some(path) = self.snapshot_path.clone() {
            if let Err(error) = self.save_snapshot(&path).await {
                log::warn!("{}: failed to save state: {error}", self.ip_version());
            }
        }
    }

    fn ip_version(&self) -> IpVersion {
        self.dispatcher.ip_version()
    }

    fn local_id(&self) -> NodeId {
        self.table.local_id()
    }

    // ---- incoming messages ----

    async fn handle_message(
        &mut self,
        message: Message,
        from: SocketAddr,
    ) -> Result<(), WorkerError> {
        match message.body {
            MessageBody::Query(query) => {
                self.handle_query(message.transaction_id, query, from).await;
                Ok(())
            }
            MessageBody::Response(response) => {
                let transaction = self
                    .dispatcher
                    .resolve(&message.transaction_id, from)
                    .ok_or(WorkerError::UnsolicitedResponse)?;
                self.handle_response(response, from, transaction).await;
                Ok(())
            }
            MessageBody::Error(error) => {
                let transaction = self
                    .dispatcher
                    .resolve(&message.transaction_id, from)
                    .ok_or(WorkerError::UnsolicitedResponse)?;
                log::debug!(
                    "{}: error reply from {from:?}: {} {:?}",
                    self.ip_version(),
                    error.code,
                    error.message
                );
                // The query did not achieve anything, treat it like a
                // timeout for both the table and the owning task.
                self.handle_transaction_failure(transaction.target, transaction.origin)
                    .await;
                Ok(())
            }
        }
    }

    async fn handle_query(&mut self, transaction_id: Vec<u8>, query: Query, from: SocketAddr) {
        let sender = NodeHandle::new(query.sender_id(), from);

        // A query proves the sender exists but not that it answers queries,
        // so an unknown sender enters the table unverified.
        self.table.add_node(Node::new_contact(sender.id, sender.addr));
        self.table.record_remote_query(&sender);

        match query {
            Query::Ping(_) => {
                self.dispatcher
                    .send_response(
                        transaction_id,
                        Response::NodeList(NodeListResponse::ack(self.local_id())),
                        from,
                    )
                    .await;
            }
            Query::FindNode(query) => {
                let response = self.node_list_response(query.target);
                self.dispatcher
                    .send_response(transaction_id, Response::NodeList(response), from)
                    .await;
            }
            Query::GetPeers(query) => {
                let nodes = self.node_list_response(query.info_hash);
                let response = GetPeersResponse {
                    id: self.local_id(),
                    values: self.storage.peers(&query.info_hash),
                    nodes_v4: nodes.nodes_v4,
                    nodes_v6: nodes.nodes_v6,
                    token: self.tokens.create(from.ip()),
                };
                self.dispatcher
                    .send_response(transaction_id, Response::GetPeers(response), from)
                    .await;
            }
            Query::AnnouncePeer(query) => {
                self.handle_announce_peer(transaction_id, query, from).await;
            }
        }
    }

    /// Closest nodes we know of, in the response field matching our family.
    ///
    /// The BEP32 `want` field of the query is decoded but deliberately not
    /// consulted: an engine serves a single address family and has no
    /// contacts of the other one, so the only honest answer to any `want`
    /// is the family it is bound to.
    fn node_list_response(&self, target: NodeId) -> NodeListResponse {
        let nodes = self.table.closest_nodes(target, BUCKET_SIZE);

        match self.ip_version() {
            IpVersion::V4 => NodeListResponse {
                id: self.local_id(),
                nodes_v4: nodes,
                nodes_v6: Vec::new(),
            },
            IpVersion::V6 => NodeListResponse {
                id: self.local_id(),
                nodes_v4: Vec::new(),
                nodes_v6: nodes,
            },
        }
    }

    async fn handle_announce_peer(
        &mut self,
        transaction_id: Vec<u8>,
        query: AnnouncePeerQuery,
        from: SocketAddr,
    ) {
        if !self.tokens.validate(from.ip(), &query.token) {
            log::debug!(
                "{}: rejecting announce with bad token from {from:?}",
                self.ip_version()
            );
            self.dispatcher
                .send_error(
                    transaction_id,
                    ErrorMessage {
                        code: error_code::PROTOCOL_ERROR,
                        message: "invalid token".to_owned(),
                    },
                    from,
                )
                .await;
            return;
        }

        // An omitted port means "announce my UDP source port".
        let peer = SocketAddr::new(from.ip(), query.port.unwrap_or_else(|| from.port()));
        self.storage.add_peer(query.info_hash, peer);

        self.dispatcher
            .send_response(
                transaction_id,
                Response::NodeList(NodeListResponse::ack(self.local_id())),
                from,
            )
            .await;
    }

    async fn handle_response(
        &mut self,
        response: Response,
        from: SocketAddr,
        transaction: PendingTransaction,
    ) {
        // The node answered under whatever id it claims; that handle, not
        // the one we sent to, is what enters the table.
        let responder = NodeHandle::new(response.sender_id(), from);
        self.table.record_success(&responder);

        let lookup_id = match transaction.origin {
            Origin::Ping => return,
            Origin::Lookup(id) => id,
        };

        let (nodes, values, token) = match response {
            Response::NodeList(response) => (
                self.filter_family(response.nodes_v4, response.nodes_v6),
                Vec::new(),
                None,
            ),
            Response::GetPeers(response) => {
                let nodes = self.filter_family(response.nodes_v4, response.nodes_v6);
                (nodes, response.values, Some(response.token))
            }
        };

        let Some(entry) = self.lookups.get_mut(&lookup_id) else {
            // The lookup already finished, the response still refreshed the
            // table above.
            return;
        };

        let next = entry.lookup.on_response(&responder, nodes, values, token);
        self.continue_lookup(lookup_id, next).await;
    }

    fn filter_family(&self, nodes_v4: Vec<NodeHandle>, nodes_v6: Vec<NodeHandle>) -> Vec<NodeHandle> {
        match self.ip_version() {
            IpVersion::V4 => nodes_v4,
            IpVersion::V6 => nodes_v6,
        }
    }

    async fn handle_transaction_failure(&mut self, target: NodeHandle, origin: Origin) {
        self.table.record_failure(&target);

        if let Origin::Lookup(lookup_id) = origin {
            if let Some(entry) = self.lookups.get_mut(&lookup_id) {
                let next = entry.lookup.on_failure(&target);
                self.continue_lookup(lookup_id, next).await;
            }
        }
    }

    // ---- commands ----

    async fn handle_command(&mut self, task: OneshotTask) {
        match task {
            OneshotTask::CheckBootstrap(tx) => self.bootstrap.subscribe(tx),
            OneshotTask::StartSearch(search) => self.start_search(search).await,
            OneshotTask::GetLocalAddr(tx) => {
                tx.send(self.dispatcher.local_addr()).ok();
            }
            OneshotTask::SaveState(tx) => {
                let result = match self.snapshot_path.clone() {
                    Some(path) => self.save_snapshot(&path).await,
                    None => Ok(()),
                };
                tx.send(result).ok();
            }
            OneshotTask::GetState(tx) => {
                tx.send(self.state()).ok();
            }
        }
    }

    async fn start_search(&mut self, search: StartSearch) {
        let StartSearch {
            info_hash,
            announce,
            tx,
        } = search;

        let seeds = self.table.closest_nodes(info_hash, LOOKUP_SEEDS);
        self.start_lookup(info_hash, LookupKind::GetPeers { announce, tx }, seeds)
            .await;
    }

    fn state(&self) -> State {
        let mut good = 0;
        let mut questionable = 0;
        for node in self.table.buckets().flat_map(|bucket| bucket.iter()) {
            match node.status() {
                NodeStatus::Good => good += 1,
                NodeStatus::Questionable => questionable += 1,
                NodeStatus::Bad => (),
            }
        }

        State {
            is_running: true,
            bootstrapped: self.bootstrap.is_bootstrapped(),
            good_node_count: good,
            questionable_node_count: questionable,
            bucket_count: self.table.buckets().count(),
            pending_transactions: self.dispatcher.num_pending(),
        }
    }

    // ---- scheduled checks ----

    async fn handle_check(&mut self, check: ScheduledCheck) {
        match check {
            ScheduledCheck::SweepTransactions => {
                for (target, origin) in self.dispatcher.sweep().await {
                    self.handle_transaction_failure(target, origin).await;
                }
                self.timer
                    .schedule_in(SWEEP_INTERVAL, ScheduledCheck::SweepTransactions);
            }
            ScheduledCheck::Bootstrap => self.start_bootstrap().await,
            ScheduledCheck::RefreshStaleBuckets { force } => {
                let targets =
                    refresh::refresh_targets(&self.table, force, &mut rand::thread_rng());
                for target in targets {
                    let seeds = self.table.closest_nodes(target, LOOKUP_SEEDS);
                    self.start_lookup(target, LookupKind::FindNode, seeds).await;
                }

                // A forced refresh is a one-off, the periodic check keeps
                // its own cadence.
                if !force {
                    self.timer.schedule_in(
                        CHECK_INTERVAL,
                        ScheduledCheck::RefreshStaleBuckets { force: false },
                    );
                }
            }
            ScheduledCheck::RotateTokens => {
                self.tokens.rotate(&mut rand::thread_rng());
                self.timer
                    .schedule_in(ROTATE_INTERVAL, ScheduledCheck::RotateTokens);
            }
            ScheduledCheck::PurgeStorage => {
                self.storage.purge_expired();
                log::trace!(
                    "{}: storage holds announces for {} info hashes",
                    self.ip_version(),
                    self.storage.num_info_hashes()
                );
                self.timer
                    .schedule_in(PURGE_INTERVAL, ScheduledCheck::PurgeStorage);
            }
            ScheduledCheck::SaveSnapshot => {
                if let Some(path) = self.snapshot_path.clone() {
                    if let Err(error) = self.save_snapshot(&path).await {
                        log::warn!("{}: failed to save state: {error}", self.ip_version());
                    }
                    self.timer
                        .schedule_in(AUTOSAVE_INTERVAL, ScheduledCheck::SaveSnapshot);
                }
            }
            ScheduledCheck::LookupTimeout(lookup_id) => {
                // The lookup stalled, settle for whatever it found.
                if self.lookups.contains_key(&lookup_id) {
                    log::debug!("{}: lookup timed out", self.ip_version());
                    self.finish_lookup(lookup_id).await;
                }
            }
        }
    }

    // ---- bootstrap ----

    async fn start_bootstrap(&mut self) {
        self.bootstrap.record_attempt();

        let resolved = super::resolve(self.bootstrap.entry_points(), self.ip_version()).await;

        // Entry points come as bare addresses; their node ids are unknown
        // until they respond, so placeholders stand in. The placeholders
        // never enter the routing table, only the responses do.
        let mut seeds: Vec<NodeHandle> = resolved
            .into_iter()
            .map(|addr| NodeHandle::new(rand::random(), addr))
            .collect();
        seeds.extend(self.table.closest_nodes(self.local_id(), LOOKUP_SEEDS));

        if seeds.is_empty() {
            if self.bootstrap.entry_points().is_empty() {
                // Nothing to join. This node is the first of its network and
                // is ready to serve others as-is.
                log::info!(
                    "{}: no entry points configured, starting standalone",
                    self.ip_version()
                );
                self.bootstrap.record_success();
            } else {
                let delay = self.bootstrap.retry_delay();
                log::debug!(
                    "{}: no bootstrap contacts, retrying in {delay:?}",
                    self.ip_version()
                );
                self.timer.schedule_in(delay, ScheduledCheck::Bootstrap);
            }
            return;
        }

        let target = self.local_id();
        let lookup_id = self.start_lookup(target, LookupKind::FindNode, seeds).await;
        self.bootstrap_lookup = lookup_id;
    }

    // ---- lookups ----

    /// Start an iterative lookup. Returns `None` if it completed on the
    /// spot (no candidates at all).
    async fn start_lookup(
        &mut self,
        target: NodeId,
        kind: LookupKind,
        seeds: Vec<NodeHandle>,
    ) -> Option<LookupId> {
        let lookup_id = LookupId(self.next_lookup_id);
        self.next_lookup_id += 1;

        let mut lookup = Lookup::new(target, kind, seeds);
        let batch = lookup.start();

        let deadline = self
            .timer
            .schedule_in(LOOKUP_TIMEOUT, ScheduledCheck::LookupTimeout(lookup_id));
        self.lookups
            .insert(lookup_id, LookupEntry { lookup, deadline });

        self.send_lookup_queries(lookup_id, batch).await;

        if self
            .lookups
            .get(&lookup_id)
            .map(|entry| entry.lookup.is_done())
            .unwrap_or(true)
        {
            self.finish_lookup(lookup_id).await;
            None
        } else {
            Some(lookup_id)
        }
    }

    async fn continue_lookup(&mut self, lookup_id: LookupId, next: Vec<NodeHandle>) {
        self.send_lookup_queries(lookup_id, next).await;

        if let Some(entry) = self.lookups.get(&lookup_id) {
            if entry.lookup.is_done() {
                self.finish_lookup(lookup_id).await;
            }
        }
    }

    async fn send_lookup_queries(&mut self, lookup_id: LookupId, batch: Vec<NodeHandle>) {
        let Some(entry) = self.lookups.get(&lookup_id) else {
            return;
        };

        let target = entry.lookup.target();
        let query = if entry.lookup.is_find_node() {
            Query::FindNode(FindNodeQuery {
                id: self.local_id(),
                target,
                want: None,
            })
        } else {
            Query::GetPeers(GetPeersQuery {
                id: self.local_id(),
                info_hash: target,
                want: None,
            })
        };

        for node in batch {
            self.dispatcher
                .send_query(query.clone(), node, Origin::Lookup(lookup_id))
                .await;
        }
    }

    async fn finish_lookup(&mut self, lookup_id: LookupId) {
        let Some(entry) = self.lookups.remove(&lookup_id) else {
            return;
        };
        self.timer.cancel(entry.deadline);

        // Announce to the closest responders that gave us a token. Dropping
        // the lookup afterwards closes the peer stream, signalling the
        // search is complete.
        for (node, token) in entry.lookup.announce_targets() {
            let query = Query::AnnouncePeer(AnnouncePeerQuery {
                id: self.local_id(),
                info_hash: entry.lookup.info_hash(),
                port: self.announce_port,
                token,
            });
            self.dispatcher.send_query(query, node, Origin::Ping).await;
        }

        if self.bootstrap_lookup == Some(lookup_id) {
            self.bootstrap_lookup = None;
            self.finish_bootstrap(entry.lookup.responded()).await;
        }
    }

    async fn finish_bootstrap(&mut self, responded: bool) {
        if responded {
            log::info!(
                "{}: bootstrap complete, {} nodes",
                self.ip_version(),
                self.table.num_nodes()
            );
            self.bootstrap.record_success();

            // The bootstrap lookup only explores the neighborhood of our own
            // id, and any restored nodes may be long gone. One refresh pass
            // over every bucket fills in the rest of the table.
            self.timer.schedule_in(
                Duration::ZERO,
                ScheduledCheck::RefreshStaleBuckets { force: true },
            );
        } else {
            let delay = self.bootstrap.retry_delay();
            log::debug!(
                "{}: bootstrap attempt failed, retrying in {delay:?}",
                self.ip_version()
            );
            self.timer.schedule_in(delay, ScheduledCheck::Bootstrap);
        }
    }

    // ---- persistence ----

    async fn save_snapshot(&self, path: &std::path::Path) -> std::io::Result<()> {
        let snapshot = Snapshot::new(self.local_id(), &self.table.contacts());
        snapshot.save(path).await?;
        log::debug!(
            "{}: saved state, {} nodes",
            self.ip_version(),
            snapshot.nodes().count()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::{Dht, DhtConfig},
        socket::SocketTrait,
        test,
    };
    use async_trait::async_trait;
    use std::{
        io,
        net::{Ipv4Addr, SocketAddr},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use tokio::{sync::mpsc, time};

    /// Transport backed by a single scripted remote node that acks every
    /// find_node, enough to drive a bootstrap without real sockets.
    struct EntryNodeSocket {
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        remote_id: NodeId,
        replies_tx: mpsc::UnboundedSender<Vec<u8>>,
        replies_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        find_nodes: Arc<AtomicUsize>,
    }

    impl EntryNodeSocket {
        fn new(remote_addr: SocketAddr) -> Self {
            let (replies_tx, replies_rx) = mpsc::unbounded_channel();

            Self {
                local_addr: (Ipv4Addr::LOCALHOST, 40001).into(),
                remote_addr,
                remote_id: test::dummy_node_id(),
                replies_tx,
                replies_rx,
                find_nodes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SocketTrait for EntryNodeSocket {
        async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
            if *target != self.remote_addr {
                return Ok(());
            }

            let message = match Message::decode(buf) {
                Ok(message) => message,
                Err(_) => return Ok(()),
            };

            if let MessageBody::Query(Query::FindNode(_)) = &message.body {
                self.find_nodes.fetch_add(1, Ordering::SeqCst);

                let reply = Message {
                    transaction_id: message.transaction_id,
                    body: MessageBody::Response(Response::NodeList(NodeListResponse::ack(
                        self.remote_id,
                    ))),
                };
                self.replies_tx.send(reply.encode()).ok();
            }

            Ok(())
        }

        async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.replies_rx.recv().await {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok((bytes.len(), self.remote_addr))
                }
                // Both channel ends live in this struct, so this is
                // unreachable while the socket exists.
                None => std::future::pending().await,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local_addr)
        }
    }

    // A node joining through an entry point must follow the bootstrap with a
    // refresh pass over every bucket, even when it started from scratch with
    // nothing restored from a state file.
    #[tokio::test(flavor = "multi_thread")]
    async fn positive_fresh_bootstrap_followed_by_full_refresh() {
        let remote_addr: SocketAddr = (Ipv4Addr::new(127, 0, 0, 2), 40002).into();
        let socket = EntryNodeSocket::new(remote_addr);
        let find_nodes = socket.find_nodes.clone();

        let mut config = DhtConfig::new(Ipv4Addr::LOCALHOST.into());
        config.entry_points.insert(remote_addr.to_string());

        let node = Dht::start_on(socket, config).await.unwrap();
        assert!(node.bootstrapped().await);

        // The bootstrap lookup accounts for the first query; the refresh
        // visiting every bucket sends at least one more.
        time::timeout(Duration::from_secs(5), async {
            while find_nodes.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no refresh query after bootstrap");
    }
}
