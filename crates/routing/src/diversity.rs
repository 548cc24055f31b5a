use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// IP group a peer is assigned to for diversity accounting.
///
/// IPv4 addresses group by /16; under the legacy classful rule, addresses
/// in the historical Class A range (first octet below 128) group by /8
/// instead. IPv6 groups by /32. ASN-level grouping needs an external
/// database and is out of scope for the table itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpGroup {
    /// Legacy classful IPv4 group: the top octet.
    V4Class([u8; 1]),
    /// IPv4 /16 group.
    V4([u8; 2]),
    /// IPv6 /32 group.
    V6([u8; 4]),
}

impl IpGroup {
    /// Derives the group key for an address.
    #[must_use]
    pub fn of(addr: &SocketAddr, legacy_classful: bool) -> Self {
        match addr.ip() {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                // Only historical Class A space is classful; higher first
                // octets keep the /16 grouping.
                if legacy_classful && octets[0] < 128 {
                    Self::V4Class([octets[0]])
                } else {
                    Self::V4([octets[0], octets[1]])
                }
            }
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                Self::V6([octets[0], octets[1], octets[2], octets[3]])
            }
        }
    }
}

/// Caps how many peers from one IP group may occupy each CPL.
///
/// Counts are consulted before insertion and decremented on removal, so a
/// rejected peer leaves no trace.
#[derive(Debug)]
pub(crate) struct DiversityFilter {
    max_per_cpl: Option<usize>,
    legacy_classful: bool,
    counts: HashMap<(usize, IpGroup), usize>,
}

impl DiversityFilter {
    pub(crate) fn new(max_per_cpl: Option<usize>, legacy_classful: bool) -> Self {
        Self {
            max_per_cpl,
            legacy_classful,
            counts: HashMap::new(),
        }
    }

    /// Whether a peer at `addr` may be added at `cpl`.
    pub(crate) fn allows(&self, cpl: usize, addr: &SocketAddr) -> bool {
        let Some(max) = self.max_per_cpl else {
            return true;
        };
        let group = IpGroup::of(addr, self.legacy_classful);
        self.counts.get(&(cpl, group)).copied().unwrap_or(0) < max
    }

    pub(crate) fn record_added(&mut self, cpl: usize, addr: &SocketAddr) {
        if self.max_per_cpl.is_none() {
            return;
        }
        let group = IpGroup::of(addr, self.legacy_classful);
        *self.counts.entry((cpl, group)).or_insert(0) += 1;
    }

    pub(crate) fn record_removed(&mut self, cpl: usize, addr: &SocketAddr) {
        if self.max_per_cpl.is_none() {
            return;
        }
        let group = IpGroup::of(addr, self.legacy_classful);
        if let Some(count) = self.counts.get_mut(&(cpl, group)) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&(cpl, group));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().expect("valid addr")
    }

    #[test]
    fn v4_groups_by_slash_16() {
        let a = IpGroup::of(&addr("10.1.2.3:4001"), false);
        let b = IpGroup::of(&addr("10.1.9.9:4001"), false);
        let c = IpGroup::of(&addr("10.2.2.3:4001"), false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn legacy_rule_groups_by_slash_8() {
        let a = IpGroup::of(&addr("10.1.2.3:4001"), true);
        let b = IpGroup::of(&addr("10.200.0.1:4001"), true);
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_rule_leaves_high_first_octets_on_slash_16() {
        // 192.x was never Class A space: distinct /16s stay distinct even
        // with the legacy rule on.
        let a = IpGroup::of(&addr("192.1.2.3:4001"), true);
        let b = IpGroup::of(&addr("192.200.0.1:4001"), true);
        assert_ne!(a, b);
        assert_eq!(a, IpGroup::of(&addr("192.1.99.99:4001"), true));
    }

    #[test]
    fn v6_groups_by_slash_32() {
        let a = IpGroup::of(&addr("[2001:db8::1]:4001"), false);
        let b = IpGroup::of(&addr("[2001:db8:ffff::2]:4001"), false);
        let c = IpGroup::of(&addr("[2001:db9::1]:4001"), false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn filter_caps_per_cpl() {
        let mut filter = DiversityFilter::new(Some(1), false);
        let peer_addr = addr("10.1.2.3:4001");

        assert!(filter.allows(3, &peer_addr));
        filter.record_added(3, &peer_addr);
        assert!(!filter.allows(3, &addr("10.1.50.50:4001")));
        // Same group at a different CPL is unaffected.
        assert!(filter.allows(4, &peer_addr));
    }

    #[test]
    fn removal_frees_the_slot() {
        let mut filter = DiversityFilter::new(Some(1), false);
        let peer_addr = addr("10.1.2.3:4001");

        filter.record_added(5, &peer_addr);
        assert!(!filter.allows(5, &peer_addr));
        filter.record_removed(5, &peer_addr);
        assert!(filter.allows(5, &peer_addr));
    }

    #[test]
    fn unlimited_filter_allows_everything() {
        let filter = DiversityFilter::new(None, false);
        assert!(filter.allows(0, &addr("10.1.2.3:4001")));
    }
}
