//! Storage for peers announced to us via announce_peer.

use crate::id::InfoHash;
use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// How long an announced peer is handed out before it has to re-announce.
pub(crate) const ANNOUNCE_TTL: Duration = Duration::from_secs(30 * 60);

/// How often expired announces are purged.
pub(crate) const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cap on stored peers per info hash. A re-announce of a stored peer always
/// gets through, only genuinely new peers are turned away at the cap.
const MAX_PEERS_PER_HASH: usize = 64;

pub(crate) struct AnnounceStorage {
    items: HashMap<InfoHash, HashMap<SocketAddr, Instant>>,
}

impl AnnounceStorage {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
        }
    }

    /// Store or refresh an announce. Returns false if the peer was new and
    /// the info hash is at capacity.
    pub fn add_peer(&mut self, info_hash: InfoHash, peer: SocketAddr) -> bool {
        self.add_peer_at(info_hash, peer, Instant::now())
    }

    fn add_peer_at(&mut self, info_hash: InfoHash, peer: SocketAddr, now: Instant) -> bool {
        let peers = self.items.entry(info_hash).or_default();

        if peers.len() >= MAX_PEERS_PER_HASH && !peers.contains_key(&peer) {
            return false;
        }

        peers.insert(peer, now);
        true
    }

    /// Non-expired peers announced for `info_hash`.
    pub fn peers(&self, info_hash: &InfoHash) -> Vec<SocketAddr> {
        self.peers_at(info_hash, Instant::now())
    }

    fn peers_at(&self, info_hash: &InfoHash, now: Instant) -> Vec<SocketAddr> {
        self.items
            .get(info_hash)
            .into_iter()
            .flatten()
            .filter(|(_, announced)| now.saturating_duration_since(**announced) < ANNOUNCE_TTL)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Drop expired announces and empty info hash entries.
    pub fn purge_expired(&mut self) {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&mut self, now: Instant) {
        self.items.retain(|_, peers| {
            peers.retain(|_, announced| now.saturating_duration_since(*announced) < ANNOUNCE_TTL);
            !peers.is_empty()
        });
    }

    pub fn num_info_hashes(&self) -> usize {
        self.items.len()
    }
}
