use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Instant;

use identity::{DhtId, KEY_LEN, Mode, NodeId};
use tracing::{debug, trace};

use crate::bucket::{Bucket, DEFAULT_BUCKET_SIZE};
use crate::diversity::DiversityFilter;
use crate::error::{TableError, TableResult};
use crate::peer::PeerInfo;

/// Hard ceiling on bucket count: one bucket per keyspace bit.
pub const MAX_BUCKETS: usize = KEY_LEN * 8;

/// Deepest common-prefix length for which refresh timestamps are tracked.
///
/// Beyond this depth random targets are too expensive to generate and the
/// buckets are almost always empty anyway.
pub const MAX_CPL_FOR_REFRESH: usize = 15;

/// Tunables for [`RoutingTable`].
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    /// Peers per bucket.
    pub bucket_size: usize,
    /// Per-CPL cap enforced by the diversity filter; `None` disables it.
    pub max_peers_per_cpl: Option<usize>,
    /// Group IPv4 peers by /8 instead of /16.
    pub legacy_classful: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            max_peers_per_cpl: None,
            legacy_classful: false,
        }
    }
}

struct Inner {
    buckets: Vec<Bucket>,
    diversity: DiversityFilter,
    cpl_refreshed_at: [Option<Instant>; MAX_CPL_FOR_REFRESH + 1],
}

/// XOR-metric k-bucket routing table.
///
/// Buckets are indexed by the common-prefix length between a peer's
/// [`DhtId`] and the local one; a peer lives in bucket
/// `min(cpl, buckets.len() - 1)`. Only the last bucket splits, and trailing
/// empty buckets collapse on removal. All writes serialize behind one lock;
/// reads may proceed concurrently.
pub struct RoutingTable {
    local_id: NodeId,
    local_dht_id: DhtId,
    config: TableConfig,
    inner: RwLock<Inner>,
}

impl RoutingTable {
    /// Creates an empty table owned by `local_id`.
    #[must_use]
    pub fn new(local_id: NodeId, config: TableConfig) -> Self {
        assert!(config.bucket_size > 0, "bucket size must be positive");
        Self {
            local_id,
            local_dht_id: local_id.dht_id(),
            config,
            inner: RwLock::new(Inner {
                buckets: vec![Bucket::new()],
                diversity: DiversityFilter::new(
                    config.max_peers_per_cpl,
                    config.legacy_classful,
                ),
                cpl_refreshed_at: [None; MAX_CPL_FOR_REFRESH + 1],
            }),
        }
    }

    /// Identifier of the local node.
    #[must_use]
    pub const fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Keyspace position of the local node.
    #[must_use]
    pub const fn local_dht_id(&self) -> &DhtId {
        &self.local_dht_id
    }

    fn cpl_of(&self, id: &DhtId) -> usize {
        self.local_dht_id.common_prefix_len(id)
    }

    /// Attempts to admit a peer.
    ///
    /// Succeeds when the destination bucket has room, when splitting the
    /// last bucket makes room, or when a replaceable entry can be evicted.
    /// A peer already present has its mode refreshed and counts as success.
    /// `query_peer` marks the entry as useful immediately, for peers that
    /// just answered a query.
    pub fn try_add(
        &self,
        id: NodeId,
        addr: SocketAddr,
        mode: Mode,
        query_peer: bool,
        replaceable: bool,
    ) -> TableResult<()> {
        let dht_id = id.dht_id();
        let cpl = self.cpl_of(&dht_id);
        if cpl == MAX_BUCKETS {
            return Err(TableError::LocalPeer);
        }

        let mut inner = self.inner.write().expect("routing table lock poisoned");

        let index = bucket_index(cpl, inner.buckets.len());
        if let Some(existing) = inner.buckets[index].get_mut(id) {
            existing.set_mode(mode);
            if query_peer {
                existing.mark_useful(Instant::now());
            }
            return Ok(());
        }

        if !inner.diversity.allows(cpl, &addr) {
            trace!(peer = %id, cpl, "diversity filter rejected peer");
            return Err(TableError::Diversity { cpl });
        }

        loop {
            let index = bucket_index(cpl, inner.buckets.len());

            if inner.buckets[index].len() < self.config.bucket_size {
                let mut info = PeerInfo::new(id, addr, mode, replaceable);
                if query_peer {
                    info.mark_useful(Instant::now());
                }
                inner.buckets[index].push_front(info);
                inner.diversity.record_added(cpl, &addr);
                return Ok(());
            }

            let last = inner.buckets.len() - 1;
            if index == last && inner.buckets.len() < MAX_BUCKETS {
                self.split_last_bucket(&mut inner);
                continue;
            }

            return if let Some(victim) = inner.buckets[index].evict_replaceable() {
                let victim_cpl = self.cpl_of(victim.dht_id());
                inner.diversity.record_removed(victim_cpl, &victim.addr());
                debug!(evicted = %victim.id(), admitted = %id, "replaced peer in full bucket");

                let mut info = PeerInfo::new(id, addr, mode, replaceable);
                if query_peer {
                    info.mark_useful(Instant::now());
                }
                inner.buckets[index].push_front(info);
                inner.diversity.record_added(cpl, &addr);
                Ok(())
            } else {
                Err(TableError::NoCapacity)
            };
        }
    }

    /// Splits the last bucket: entries whose CPL exceeds the old last index
    /// move into a freshly appended bucket.
    fn split_last_bucket(&self, inner: &mut Inner) {
        let old_last = inner.buckets.len() - 1;
        let moved: Vec<PeerInfo> = {
            let bucket = &mut inner.buckets[old_last];
            let all: Vec<PeerInfo> = bucket.drain().collect();
            let mut keep = Vec::new();
            let mut moved = Vec::new();
            for entry in all {
                if self.cpl_of(entry.dht_id()) > old_last {
                    moved.push(entry);
                } else {
                    keep.push(entry);
                }
            }
            // Rebuild in original order: drain reversed nothing, push_front
            // reverses, so reinsert back-to-front.
            for entry in keep.into_iter().rev() {
                bucket.push_front(entry);
            }
            moved
        };

        let mut fresh = Bucket::new();
        for entry in moved.into_iter().rev() {
            fresh.push_front(entry);
        }
        inner.buckets.push(fresh);
        trace!(buckets = inner.buckets.len(), "split last bucket");
    }

    /// Removes a peer and collapses trailing empty buckets.
    pub fn remove(&self, id: NodeId) -> TableResult<()> {
        let dht_id = id.dht_id();
        let cpl = self.cpl_of(&dht_id);
        let mut inner = self.inner.write().expect("routing table lock poisoned");

        let index = bucket_index(cpl, inner.buckets.len());
        let removed = inner.buckets[index]
            .remove(id)
            .ok_or(TableError::UnknownPeer)?;
        inner.diversity.record_removed(cpl, &removed.addr());

        while inner.buckets.len() > 1
            && inner.buckets.last().is_some_and(Bucket::is_empty)
        {
            inner.buckets.pop();
        }
        Ok(())
    }

    /// Up to `k` peers sorted by ascending XOR distance to `target`.
    ///
    /// Ties keep table iteration order. A mode filter restricts the result
    /// to peers matching that mode (`Auto` entries match every filter).
    #[must_use]
    pub fn nearest_peers(&self, target: &DhtId, k: usize, mode: Option<Mode>) -> Vec<PeerInfo> {
        let inner = self.inner.read().expect("routing table lock poisoned");
        let mut candidates: Vec<PeerInfo> = inner
            .buckets
            .iter()
            .flat_map(Bucket::iter)
            .filter(|p| mode.is_none_or(|m| p.mode().matches(m)))
            .cloned()
            .collect();

        // Stable sort preserves iteration order between equal distances.
        candidates.sort_by_key(|p| p.dht_id().distance(target));
        candidates.truncate(k);
        candidates
    }

    /// Reports whether [`try_add`](Self::try_add) would succeed, without
    /// mutating anything.
    #[must_use]
    pub fn useful_new_peer(&self, id: NodeId, addr: SocketAddr) -> bool {
        let dht_id = id.dht_id();
        let cpl = self.cpl_of(&dht_id);
        if cpl == MAX_BUCKETS {
            return false;
        }

        let inner = self.inner.read().expect("routing table lock poisoned");
        let index = bucket_index(cpl, inner.buckets.len());
        if inner.buckets[index].contains(id) {
            return false;
        }
        if !inner.diversity.allows(cpl, &addr) {
            return false;
        }
        if inner.buckets[index].len() < self.config.bucket_size {
            return true;
        }
        let last = inner.buckets.len() - 1;
        if index == last && inner.buckets.len() < MAX_BUCKETS {
            return true;
        }
        inner.buckets[index].iter().any(PeerInfo::is_replaceable)
    }

    /// Looks a peer up by id.
    #[must_use]
    pub fn find(&self, id: NodeId) -> Option<PeerInfo> {
        let dht_id = id.dht_id();
        let cpl = self.cpl_of(&dht_id);
        if cpl == MAX_BUCKETS {
            return None;
        }
        let inner = self.inner.read().expect("routing table lock poisoned");
        let index = bucket_index(cpl, inner.buckets.len());
        inner.buckets[index].iter().find(|p| p.id() == id).cloned()
    }

    /// Records that `id` answered usefully at `at`.
    pub fn update_last_useful_at(&self, id: NodeId, at: Instant) -> TableResult<()> {
        self.with_peer_mut(id, |peer| peer.mark_useful(at))
    }

    /// Records a successful outbound request to `id` at `at`.
    pub fn update_last_successful_outbound_at(
        &self,
        id: NodeId,
        at: Instant,
    ) -> TableResult<()> {
        self.with_peer_mut(id, |peer| peer.mark_successful_outbound(at))
    }

    fn with_peer_mut(
        &self,
        id: NodeId,
        apply: impl FnOnce(&mut PeerInfo),
    ) -> TableResult<()> {
        let dht_id = id.dht_id();
        let cpl = self.cpl_of(&dht_id);
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        let index = bucket_index(cpl, inner.buckets.len());
        let peer = inner.buckets[index]
            .get_mut(id)
            .ok_or(TableError::UnknownPeer)?;
        apply(peer);
        Ok(())
    }

    /// Number of peers matching the mode filter.
    #[must_use]
    pub fn size(&self, mode: Option<Mode>) -> usize {
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner
            .buckets
            .iter()
            .flat_map(Bucket::iter)
            .filter(|p| mode.is_none_or(|m| p.mode().matches(m)))
            .count()
    }

    /// Snapshot of every peer matching the mode filter, in table order.
    #[must_use]
    pub fn list_peers(&self, mode: Option<Mode>) -> Vec<PeerInfo> {
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner
            .buckets
            .iter()
            .flat_map(Bucket::iter)
            .filter(|p| mode.is_none_or(|m| p.mode().matches(m)))
            .cloned()
            .collect()
    }

    /// Pins every current entry so none can be evicted.
    pub fn mark_all_peers_irreplaceable(&self) {
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        for bucket in &mut inner.buckets {
            for peer in bucket.iter_mut() {
                peer.set_replaceable(false);
            }
        }
    }

    /// Current bucket count; exposed for diagnostics.
    #[must_use]
    pub fn num_buckets(&self) -> usize {
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner.buckets.len()
    }

    /// When the bucket at `cpl` was last refreshed, if tracked.
    #[must_use]
    pub fn cpl_refreshed_at(&self, cpl: usize) -> Option<Instant> {
        if cpl > MAX_CPL_FOR_REFRESH {
            return None;
        }
        let inner = self.inner.read().expect("routing table lock poisoned");
        inner.cpl_refreshed_at[cpl]
    }

    /// Stamps the refresh time for `cpl`; deeper CPLs are ignored.
    pub fn track_cpl_refresh(&self, cpl: usize, at: Instant) {
        if cpl > MAX_CPL_FOR_REFRESH {
            return;
        }
        let mut inner = self.inner.write().expect("routing table lock poisoned");
        inner.cpl_refreshed_at[cpl] = Some(at);
    }

    /// Random keyspace key at exactly `cpl` bits of shared prefix with the
    /// local id. Used as a lookup target when refreshing a bucket.
    #[must_use]
    pub fn gen_random_key(&self, cpl: usize) -> DhtId {
        let capped = cpl.min(MAX_CPL_FOR_REFRESH);
        DhtId::random_at_cpl(&self.local_dht_id, capped)
    }

    /// Random peer identifier whose derived [`DhtId`] shares exactly `cpl`
    /// prefix bits with the local id.
    ///
    /// Identifiers hash onto the keyspace, so the prefix cannot be
    /// constructed directly; candidates are sampled until one lands in the
    /// right bucket. Capping at [`MAX_CPL_FOR_REFRESH`] bounds the expected
    /// sample count to 2^16.
    #[must_use]
    pub fn gen_rand_peer_id(&self, cpl: usize) -> NodeId {
        let capped = cpl.min(MAX_CPL_FOR_REFRESH);
        loop {
            let mut bytes = [0u8; KEY_LEN];
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
            let candidate = NodeId::from_bytes(bytes);
            if self.cpl_of(&candidate.dht_id()) == capped {
                return candidate;
            }
        }
    }
}

const fn bucket_index(cpl: usize, num_buckets: usize) -> usize {
    if cpl >= num_buckets { num_buckets - 1 } else { cpl }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> NodeId {
        NodeId::from_bytes([0x11u8; KEY_LEN])
    }

    /// Samples a peer id whose dht id shares exactly `cpl` prefix bits with
    /// the local dht id. Only cheap for small CPLs.
    fn peer_with_cpl(table: &RoutingTable, cpl: usize) -> NodeId {
        loop {
            let mut bytes = [0u8; KEY_LEN];
            rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
            let candidate = NodeId::from_bytes(bytes);
            if table.local_dht_id().common_prefix_len(&candidate.dht_id()) == cpl {
                return candidate;
            }
        }
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.{n}.0.1:4001").parse().expect("valid addr")
    }

    fn add(table: &RoutingTable, id: NodeId, a: SocketAddr) -> TableResult<()> {
        table.try_add(id, a, Mode::Server, false, true)
    }

    #[test]
    fn inserted_peer_is_its_own_nearest() {
        let table = RoutingTable::new(local(), TableConfig::default());
        for n in 0..8 {
            let id = peer_with_cpl(&table, usize::from(n % 3));
            add(&table, id, addr(n)).expect("space available");

            let nearest = table.nearest_peers(&id.dht_id(), 1, None);
            assert_eq!(nearest.len(), 1);
            assert_eq!(nearest[0].id(), id);
        }
    }

    #[test]
    fn size_matches_list_peers_after_mutations() {
        let table = RoutingTable::new(local(), TableConfig::default());
        let mut ids = Vec::new();
        for n in 0..10u8 {
            let id = peer_with_cpl(&table, usize::from(n % 4));
            add(&table, id, addr(n)).expect("space available");
            ids.push(id);
        }
        for id in ids.iter().take(4) {
            table.remove(*id).expect("present");
        }
        assert_eq!(table.size(None), table.list_peers(None).len());
        assert_eq!(table.size(None), 6);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let table = RoutingTable::new(local(), TableConfig::default());
        let id = peer_with_cpl(&table, 0);
        add(&table, id, addr(1)).expect("first add");
        add(&table, id, addr(1)).expect("second add is a refresh");
        assert_eq!(table.size(None), 1);
    }

    #[test]
    fn local_peer_is_rejected() {
        let table = RoutingTable::new(local(), TableConfig::default());
        assert_eq!(
            add(&table, local(), addr(1)),
            Err(TableError::LocalPeer)
        );
    }

    #[test]
    fn full_last_bucket_splits() {
        let config = TableConfig {
            bucket_size: 2,
            ..TableConfig::default()
        };
        let table = RoutingTable::new(local(), config);

        // Two peers at cpl 0 fill the single bucket; a cpl-1 peer then
        // forces a split that separates the prefixes.
        add(&table, peer_with_cpl(&table, 0), addr(1)).expect("room");
        add(&table, peer_with_cpl(&table, 0), addr(2)).expect("room");
        assert_eq!(table.num_buckets(), 1);

        add(&table, peer_with_cpl(&table, 1), addr(3)).expect("split makes room");
        assert!(table.num_buckets() > 1);
        assert_eq!(table.size(None), 3);
    }

    #[test]
    fn full_inner_bucket_evicts_replaceable() {
        let config = TableConfig {
            bucket_size: 2,
            ..TableConfig::default()
        };
        let table = RoutingTable::new(local(), config);

        // Force a split so bucket 0 is no longer the last bucket.
        add(&table, peer_with_cpl(&table, 0), addr(1)).expect("room");
        add(&table, peer_with_cpl(&table, 0), addr(2)).expect("room");
        add(&table, peer_with_cpl(&table, 1), addr(3)).expect("split");
        assert!(table.num_buckets() > 1);

        // Bucket 0 is full with replaceable peers; a third cpl-0 peer
        // replaces one of them instead of splitting.
        let newcomer = peer_with_cpl(&table, 0);
        add(&table, newcomer, addr(4)).expect("eviction admits peer");
        assert!(table.find(newcomer).is_some());
        assert_eq!(table.size(None), 3);
    }

    #[test]
    fn full_inner_bucket_without_replaceable_fails() {
        let config = TableConfig {
            bucket_size: 2,
            ..TableConfig::default()
        };
        let table = RoutingTable::new(local(), config);

        add(&table, peer_with_cpl(&table, 0), addr(1)).expect("room");
        add(&table, peer_with_cpl(&table, 0), addr(2)).expect("room");
        add(&table, peer_with_cpl(&table, 1), addr(3)).expect("split");
        table.mark_all_peers_irreplaceable();

        assert_eq!(
            add(&table, peer_with_cpl(&table, 0), addr(4)),
            Err(TableError::NoCapacity)
        );
    }

    #[test]
    fn trailing_empty_buckets_collapse_on_remove() {
        let config = TableConfig {
            bucket_size: 1,
            ..TableConfig::default()
        };
        let table = RoutingTable::new(local(), config);

        let near = peer_with_cpl(&table, 0);
        let far = peer_with_cpl(&table, 2);
        add(&table, near, addr(1)).expect("room");
        add(&table, far, addr(2)).expect("split chain");
        let buckets_before = table.num_buckets();
        assert!(buckets_before > 1);

        table.remove(far).expect("present");
        assert!(table.num_buckets() < buckets_before);
        // Every remaining bucket is non-empty or the last one.
        assert_eq!(table.size(None), 1);
    }

    #[test]
    fn diversity_cap_rejects_same_group_same_cpl() {
        // Scenario: bucket size 2, one peer per CPL+group.
        let config = TableConfig {
            bucket_size: 2,
            max_peers_per_cpl: Some(1),
            legacy_classful: false,
        };
        let table = RoutingTable::new(local(), config);
        let same_group: SocketAddr = "10.7.1.1:4001".parse().expect("valid");
        let same_group_2: SocketAddr = "10.7.200.9:4001".parse().expect("valid");

        let first = peer_with_cpl(&table, 0);
        let second = peer_with_cpl(&table, 0);
        let third = peer_with_cpl(&table, 0);

        add(&table, first, same_group).expect("first of group");
        assert_eq!(
            add(&table, second, same_group_2),
            Err(TableError::Diversity { cpl: 0 })
        );

        table.remove(first).expect("present");
        add(&table, third, same_group_2).expect("slot freed");
    }

    #[test]
    fn per_cpl_count_never_exceeds_cap() {
        let config = TableConfig {
            bucket_size: 8,
            max_peers_per_cpl: Some(2),
            legacy_classful: false,
        };
        let table = RoutingTable::new(local(), config);

        let mut admitted = 0;
        for n in 0..6u8 {
            // All in one /16 group and one CPL.
            let a: SocketAddr = format!("10.9.{n}.1:4001").parse().expect("valid");
            if add(&table, peer_with_cpl(&table, 1), a).is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 2);
    }

    #[test]
    fn nearest_peers_orders_by_xor_distance() {
        let table = RoutingTable::new(local(), TableConfig::default());
        let mut ids = Vec::new();
        for n in 0..12u8 {
            let id = peer_with_cpl(&table, usize::from(n % 3));
            add(&table, id, addr(n)).expect("room");
            ids.push(id);
        }

        let target = DhtId::hash(b"lookup-target");
        let nearest = table.nearest_peers(&target, 5, None);
        assert_eq!(nearest.len(), 5);
        for pair in nearest.windows(2) {
            assert!(
                pair[0].dht_id().distance(&target) <= pair[1].dht_id().distance(&target),
                "results must be ascending"
            );
        }
    }

    #[test]
    fn nearest_peers_honors_mode_filter() {
        let table = RoutingTable::new(local(), TableConfig::default());
        let server = peer_with_cpl(&table, 0);
        let client = peer_with_cpl(&table, 0);
        table
            .try_add(server, addr(1), Mode::Server, false, true)
            .expect("room");
        table
            .try_add(client, addr(2), Mode::Client, false, true)
            .expect("room");

        let target = DhtId::hash(b"target");
        let servers = table.nearest_peers(&target, 10, Some(Mode::Server));
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id(), server);
        assert_eq!(table.size(Some(Mode::Client)), 1);
    }

    #[test]
    fn useful_new_peer_never_mutates() {
        let config = TableConfig {
            bucket_size: 1,
            ..TableConfig::default()
        };
        let table = RoutingTable::new(local(), config);
        let id = peer_with_cpl(&table, 0);

        assert!(table.useful_new_peer(id, addr(1)));
        assert_eq!(table.size(None), 0);

        add(&table, id, addr(1)).expect("room");
        assert!(!table.useful_new_peer(id, addr(1)));
        assert_eq!(table.size(None), 1);
    }

    #[test]
    fn timestamps_update_through_table() {
        let table = RoutingTable::new(local(), TableConfig::default());
        let id = peer_with_cpl(&table, 0);
        add(&table, id, addr(1)).expect("room");

        let now = Instant::now();
        table.update_last_useful_at(id, now).expect("present");
        table
            .update_last_successful_outbound_at(id, now)
            .expect("present");

        let info = table.find(id).expect("present");
        assert_eq!(info.last_useful_at(), Some(now));
        assert_eq!(info.last_successful_outbound_at(), Some(now));

        assert_eq!(
            table.update_last_useful_at(peer_with_cpl(&table, 1), now),
            Err(TableError::UnknownPeer)
        );
    }

    #[test]
    fn refresh_metadata_round_trips_within_range() {
        let table = RoutingTable::new(local(), TableConfig::default());
        assert!(table.cpl_refreshed_at(3).is_none());

        let now = Instant::now();
        table.track_cpl_refresh(3, now);
        assert_eq!(table.cpl_refreshed_at(3), Some(now));

        table.track_cpl_refresh(MAX_CPL_FOR_REFRESH + 5, now);
        assert!(table.cpl_refreshed_at(MAX_CPL_FOR_REFRESH + 5).is_none());
    }

    #[test]
    fn random_targets_land_in_requested_bucket() {
        let table = RoutingTable::new(local(), TableConfig::default());
        for cpl in [0usize, 1, 5, 9] {
            let key = table.gen_random_key(cpl);
            assert_eq!(table.local_dht_id().common_prefix_len(&key), cpl);

            let id = table.gen_rand_peer_id(cpl);
            assert_eq!(
                table.local_dht_id().common_prefix_len(&id.dht_id()),
                cpl
            );
        }
    }
}
