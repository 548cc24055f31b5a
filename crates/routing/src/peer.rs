use std::net::SocketAddr;
use std::time::Instant;

use identity::{DhtId, Mode, NodeId};

/// A peer as tracked by the routing table.
///
/// The bucket owns the `PeerInfo`; other subsystems hold only the
/// [`NodeId`] and look the peer up when they need fresh state.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    id: NodeId,
    mode: Mode,
    dht_id: DhtId,
    addr: SocketAddr,
    added_at: Instant,
    last_useful_at: Option<Instant>,
    last_successful_outbound_at: Option<Instant>,
    replaceable: bool,
}

impl PeerInfo {
    /// Creates the record for a peer observed at `addr`.
    #[must_use]
    pub fn new(id: NodeId, addr: SocketAddr, mode: Mode, replaceable: bool) -> Self {
        Self {
            id,
            mode,
            dht_id: id.dht_id(),
            addr,
            added_at: Instant::now(),
            last_useful_at: None,
            last_successful_outbound_at: None,
            replaceable,
        }
    }

    /// Stable identifier of the peer.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Mode the peer advertised.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) const fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Keyspace position used for XOR ordering.
    #[must_use]
    pub const fn dht_id(&self) -> &DhtId {
        &self.dht_id
    }

    /// Network address the peer was last observed at.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// When the peer entered the table.
    #[must_use]
    pub const fn added_at(&self) -> Instant {
        self.added_at
    }

    /// When the peer last answered a query usefully, if ever.
    #[must_use]
    pub const fn last_useful_at(&self) -> Option<Instant> {
        self.last_useful_at
    }

    pub(crate) fn mark_useful(&mut self, at: Instant) {
        self.last_useful_at = Some(at);
    }

    /// When an outbound request to the peer last succeeded, if ever.
    #[must_use]
    pub const fn last_successful_outbound_at(&self) -> Option<Instant> {
        self.last_successful_outbound_at
    }

    pub(crate) fn mark_successful_outbound(&mut self, at: Instant) {
        self.last_successful_outbound_at = Some(at);
    }

    /// Whether this entry may be evicted to admit a new peer.
    #[must_use]
    pub const fn is_replaceable(&self) -> bool {
        self.replaceable
    }

    pub(crate) const fn set_replaceable(&mut self, replaceable: bool) {
        self.replaceable = replaceable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(fill: u8) -> PeerInfo {
        PeerInfo::new(
            NodeId::from_bytes([fill; 32]),
            "10.0.0.1:4001".parse().expect("valid addr"),
            Mode::Server,
            true,
        )
    }

    #[test]
    fn dht_id_is_derived_from_node_id() {
        let info = peer(9);
        assert_eq!(info.dht_id(), &info.id().dht_id());
    }

    #[test]
    fn timestamps_start_unset() {
        let info = peer(1);
        assert!(info.last_useful_at().is_none());
        assert!(info.last_successful_outbound_at().is_none());
    }

    #[test]
    fn marking_useful_records_instant() {
        let mut info = peer(2);
        let now = Instant::now();
        info.mark_useful(now);
        assert_eq!(info.last_useful_at(), Some(now));
    }
}
