use thiserror::Error;

/// Result type for routing-table mutations.
pub type TableResult<T> = Result<T, TableError>;

/// Errors surfaced by routing-table operations.
///
/// Mutations are fail-fast: when any of these is returned the table is
/// unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    /// The destination bucket is full, cannot split, and holds no
    /// replaceable entry.
    #[error("bucket has no capacity for peer")]
    NoCapacity,
    /// The per-CPL diversity filter rejected the peer's IP group.
    #[error("diversity filter rejected peer (cpl {cpl})")]
    Diversity {
        /// Common-prefix length of the rejected peer.
        cpl: usize,
    },
    /// The peer shares the local node's identifier.
    #[error("refusing to add the local peer to its own table")]
    LocalPeer,
    /// The peer is not present in the table.
    #[error("peer not found in table")]
    UnknownPeer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cpl() {
        let err = TableError::Diversity { cpl: 12 };
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn errors_compare_by_variant() {
        assert_eq!(TableError::NoCapacity, TableError::NoCapacity);
        assert_ne!(TableError::NoCapacity, TableError::UnknownPeer);
    }
}
