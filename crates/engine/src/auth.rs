use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Authorization seam for inbound segment requests.
///
/// The full script-based verifier lives outside the transfer core; the
/// engine only needs a yes/no on a requester's public-key hash against a
/// file's access list.
pub trait Authorizer: Send + Sync + 'static {
    /// Whether the holder of `pubkey_hash` may read `file_id`.
    fn authorize(&self, file_id: &str, pubkey_hash: &[u8]) -> bool;
}

/// Permits everything; for open networks and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _file_id: &str, _pubkey_hash: &[u8]) -> bool {
        true
    }
}

/// Access-list authorizer: each file carries the set of public-key hashes
/// allowed to read it. Files without an entry are denied.
#[derive(Default)]
pub struct AclAuthorizer {
    acl: RwLock<HashMap<String, HashSet<Vec<u8>>>>,
}

impl AclAuthorizer {
    /// Empty access list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `pubkey_hash` read access to `file_id`.
    pub fn grant(&self, file_id: &str, pubkey_hash: &[u8]) {
        let mut acl = self.acl.write().expect("acl lock poisoned");
        acl.entry(file_id.to_owned())
            .or_default()
            .insert(pubkey_hash.to_vec());
    }

    /// Revokes `pubkey_hash`'s access to `file_id`.
    pub fn revoke(&self, file_id: &str, pubkey_hash: &[u8]) {
        let mut acl = self.acl.write().expect("acl lock poisoned");
        if let Some(keys) = acl.get_mut(file_id) {
            keys.remove(pubkey_hash);
            if keys.is_empty() {
                acl.remove(file_id);
            }
        }
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, file_id: &str, pubkey_hash: &[u8]) -> bool {
        let acl = self.acl.read().expect("acl lock poisoned");
        acl.get(file_id).is_some_and(|keys| keys.contains(pubkey_hash))
    }
}
