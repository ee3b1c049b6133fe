//! Bucket refresh scheduling.
//!
//! A bucket that saw no activity for a while gets a find_node lookup towards
//! a random id in its range, re-verifying its nodes and discovering new ones.

use crate::{id::NodeId, routing::table::RoutingTable};
use rand::Rng;
use std::time::Duration;

/// A bucket untouched for this long is considered stale.
pub(crate) const STALENESS_PERIOD: Duration = Duration::from_secs(15 * 60);

/// How often staleness is checked.
pub(crate) const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Stale buckets refreshed per check, to spread the traffic out.
const MAX_PER_CHECK: usize = 2;

/// Lookup targets for the buckets due for a refresh. A forced refresh
/// targets every bucket, as after a completed bootstrap when most of the
/// table is still unexplored.
pub(crate) fn refresh_targets<R: Rng>(
    table: &RoutingTable,
    force: bool,
    rng: &mut R,
) -> Vec<NodeId> {
    let indices: Vec<usize> = if force {
        (0..table.buckets().count()).collect()
    } else {
        table
            .stale_buckets(STALENESS_PERIOD)
            .into_iter()
            .take(MAX_PER_CHECK)
            .collect()
    };

    indices
        .into_iter()
        .map(|index| table.refresh_target(index, rng))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{routing::node::Node, test};

    #[test]
    fn positive_fresh_table_has_no_targets() {
        let table = RoutingTable::new(test::dummy_node_id());

        assert!(refresh_targets(&table, false, &mut rand::thread_rng()).is_empty());
    }

    #[test]
    fn positive_forced_refresh_covers_every_bucket() {
        let local_id = test::dummy_node_id();
        let mut table = RoutingTable::new(local_id);
        for addr in test::dummy_block_socket_addrs(4) {
            table.add_node(Node::new_verified(local_id.flip_bit(0), addr));
        }

        let targets = refresh_targets(&table, true, &mut rand::thread_rng());

        assert_eq!(targets.len(), table.buckets().count());
    }
}
