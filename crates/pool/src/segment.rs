use std::collections::HashMap;

use identity::NodeId;

use crate::error::{PoolError, PoolResult};

/// Lifecycle of one segment within a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Not yet scheduled.
    #[default]
    Pending,
    /// Sent to a peer, awaiting acknowledgement.
    InFlight,
    /// Acknowledged by at least one peer (upload) or verified locally
    /// (download).
    Completed,
    /// Retries exhausted.
    Failed,
}

impl SegmentStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Completion is sticky; a failed segment may only be re-queued to
    /// pending by an explicit task reset.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight | Self::Completed | Self::Failed)
                | (Self::InFlight, Self::Completed | Self::Failed | Self::Pending)
                | (Self::Failed, Self::Pending)
        )
    }
}

/// Identity of one segment within a task's slice table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentMeta {
    /// Digest identifying the segment.
    pub segment_id: String,
    /// Position in the erasure-coded sequence.
    pub index: usize,
    /// Whether the segment carries parity rather than file bytes.
    pub is_parity: bool,
}

/// Mutable per-segment bookkeeping held inside a task.
#[derive(Clone, Debug)]
pub struct SegmentState {
    meta: SegmentMeta,
    status: SegmentStatus,
    /// Peers that acknowledged storage, and whether each is still
    /// queryable.
    nodes: HashMap<NodeId, bool>,
    retries: u32,
}

impl SegmentState {
    pub(crate) fn new(meta: SegmentMeta) -> Self {
        Self {
            meta,
            status: SegmentStatus::Pending,
            nodes: HashMap::new(),
            retries: 0,
        }
    }

    /// Segment identity.
    #[must_use]
    pub const fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Current lifecycle status.
    #[must_use]
    pub const fn status(&self) -> SegmentStatus {
        self.status
    }

    pub(crate) fn transition(&mut self, next: SegmentStatus) -> PoolResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(PoolError::InvalidTransition {
                segment_id: self.meta.segment_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Peers holding the segment, with their active flags.
    #[must_use]
    pub const fn nodes(&self) -> &HashMap<NodeId, bool> {
        &self.nodes
    }

    /// Peers still eligible to be queried for this segment.
    #[must_use]
    pub fn active_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter_map(|(id, active)| active.then_some(*id))
            .collect()
    }

    pub(crate) fn set_node(&mut self, peer: NodeId, active: bool) {
        self.nodes.insert(peer, active);
    }

    /// Retry attempts consumed so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    pub(crate) fn bump_retries(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }
}
