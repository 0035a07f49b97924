//! Lossy-counting governor: bounds tree memory by squashing cold leaves.
//!
//! The insertion stream divides into buckets of `ceil(1/error)` weight.
//! At bucket boundaries (and only there) the compress pass walks the leaf
//! queue and squashes every leaf whose `count + delta` has fallen below
//! the current bucket index. A squashed leaf folds its residual count
//! into its parent, which records the folded error in `max_child_delta`
//! so that later descendants inherit a sound bound.

use tracing::debug;

use crate::arena::{Arena, NodeId, NodeKind};

#[derive(Debug)]
pub struct LossyGovernor {
    bucket_width: u64,
    completed_buckets: u64,
    total_weight: u64,
}

impl LossyGovernor {
    /// `error` is the additive frequency error bound, in `(0, 1]`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(error: f64) -> Self {
        debug_assert!(error > 0.0 && error <= 1.0);
        Self {
            bucket_width: ((1.0 / error).ceil() as u64).max(1),
            completed_buckets: 0,
            total_weight: 0,
        }
    }

    /// Total inserted weight.
    #[must_use]
    pub const fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Index of the bucket currently filling (the squash floor).
    #[must_use]
    pub const fn bucket_index(&self) -> u64 {
        self.total_weight.div_ceil(self.bucket_width)
    }

    /// Account for an insertion; returns true when a bucket boundary was
    /// crossed and the caller must run [`LossyGovernor::compress`].
    pub fn record(&mut self, weight: u64) -> bool {
        self.total_weight += weight;
        let completed = self.total_weight / self.bucket_width;
        if completed > self.completed_buckets {
            self.completed_buckets = completed;
            true
        } else {
            false
        }
    }

    /// Squash every cold leaf. The queue walk tolerates in-place pruning:
    /// it remembers the last live node and, whenever the current node has
    /// been detached or killed, resumes from that node's successor.
    /// Parents demoted to leaves are appended before the back sentinel and
    /// reconsidered in the same pass.
    pub fn compress(&self, arena: &mut Arena) {
        let floor = i64::try_from(self.bucket_index()).unwrap_or(i64::MAX);
        let mut squashed = 0u64;
        let mut survivors = 0u64;

        let mut prev = NodeId::FRONT;
        let mut cur = arena.node(NodeId::FRONT).queue_next;
        while cur != NodeId::BACK {
            if arena.node(cur).is_dead() {
                cur = arena.node(prev).queue_next;
                continue;
            }
            let node = arena.node(cur);
            let cold = node.count + i64::try_from(node.delta).unwrap_or(i64::MAX) < floor;
            // A referenced leaf must outlive its suffix-link referrers or
            // the links would dangle; it is reconsidered once they die
            // (their squash decrements the referrer count).
            if cold && node.suffix_referrers == 0 {
                squash(arena, cur);
                squashed += 1;
                cur = arena.node(prev).queue_next;
            } else {
                survivors += 1;
                prev = cur;
                cur = arena.node(cur).queue_next;
            }
        }

        debug!(
            bucket = self.bucket_index(),
            squashed, survivors, "compress pass finished"
        );
    }
}

/// Remove one leaf from the tree, folding its residual count upward.
fn squash(arena: &mut Arena, id: NodeId) {
    debug_assert_eq!(arena.node(id).kind, NodeKind::Leaf);
    debug_assert_eq!(
        arena.node(id).suffix_referrers,
        0,
        "referenced leaves are never squashed"
    );

    arena.queue_detach(id);

    let parent = arena.node(id).parent;
    let key = arena.edge_key(id);
    arena.node_mut(parent).children.remove(&key);

    // Fold the residual count into the parent; the folded error widens the
    // parent's bound for future descendants. The suffix-chain grandparent
    // gives the count back, keeping suffix-propagated totals balanced.
    let count = arena.node(id).count;
    let delta = arena.node(id).delta;
    {
        let p = arena.node_mut(parent);
        p.count += count;
        let folded = count
            .max(0)
            .unsigned_abs()
            .saturating_add(delta);
        p.max_child_delta = p.max_child_delta.max(folded);
    }
    let grandparent = arena.node(parent).suffix;
    if grandparent != NodeId::DUMMY {
        arena.node_mut(grandparent).count -= count;
    }

    // Drop the dying node's suffix reference.
    let referent = arena.node(id).suffix;
    if referent != NodeId::DUMMY {
        arena.node_mut(referent).suffix_referrers -= 1;
        demote_if_isolated(arena, referent);
    }

    arena.node_mut(id).kind = NodeKind::Dead;
    arena.node_mut(id).children = std::collections::HashMap::new();

    demote_if_isolated(arena, parent);
}

/// A branch with no children left and no suffix-link referrers is no
/// longer part of any path: demote it to a leaf and queue it for
/// reconsideration.
fn demote_if_isolated(arena: &mut Arena, id: NodeId) {
    let node = arena.node(id);
    if node.kind == NodeKind::Branch && node.children.is_empty() && node.suffix_referrers == 0 {
        arena.node_mut(id).kind = NodeKind::Leaf;
        arena.queue_push_back(id);
    }
}
