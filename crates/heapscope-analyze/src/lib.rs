//! Streaming heavy-hitter analysis over backtrace streams.
//!
//! A generalized suffix tree (Ukkonen construction) holds every observed
//! stack; lossy counting bounds its memory by squashing loci whose
//! weighted frequency falls below the running bucket floor, while
//! preserving every substring above the configured error bound. At output
//! time a two-pass aggregation ranks the surviving loci.

pub mod arena;
pub mod builder;
pub mod governor;
pub mod report;


use heapscope_error::Result;
use heapscope_types::{dedup_stack, LocId};

pub use arena::{Arena, Node, NodeId, NodeKind};
pub use governor::LossyGovernor;
pub use report::{heavy_hitters, HeavyHitter};

/// Aggregate counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub live_nodes: usize,
    pub dead_nodes: usize,
    pub total_weight: u64,
    pub bucket_index: u64,
}

/// The hotspot engine: suffix tree plus lossy-counting governor.
#[derive(Debug)]
pub struct HotspotTree {
    arena: Arena,
    governor: LossyGovernor,
}

impl HotspotTree {
    /// `error` is the additive frequency error bound in `(0, 1]`; memory
    /// grows as roughly `1/error` loci.
    #[must_use]
    pub fn new(error: f64) -> Self {
        Self {
            arena: Arena::new(),
            governor: LossyGovernor::new(error),
        }
    }

    /// Insert a raw backtrace (innermost frame first) with a weight.
    /// Repeated frames from recursion are deduplicated and the reserved
    /// terminator appended before insertion.
    pub fn insert_backtrace(&mut self, stack: &[LocId], weight: u64) {
        let mut prepared = dedup_stack(stack);
        prepared.push(LocId::TERMINATOR);
        self.insert_prepared(&prepared, weight);
    }

    /// Insert an already repeat-free, terminated token string.
    pub fn insert_prepared(&mut self, tokens: &[LocId], weight: u64) {
        let dest = builder::insert(&mut self.arena, tokens);
        self.arena.node_mut(dest).count += i64::try_from(weight).unwrap_or(i64::MAX);
        if self.governor.record(weight) {
            self.governor.compress(&mut self.arena);
        }
    }

    /// Total inserted weight.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.governor.total_weight()
    }

    /// Enumerate loci whose light weight clears `frequency` of the total
    /// stream weight, heaviest first.
    pub fn heavy_hitters(&mut self, frequency: f64) -> Result<Vec<HeavyHitter>> {
        let total = self.governor.total_weight();
        report::heavy_hitters(&mut self.arena, total, frequency)
    }

    /// Live/dead node counts and governor state.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let live = self.arena.live_nodes().count();
        TreeStats {
            live_nodes: live,
            dead_nodes: self.arena.node_count() - live - 3,
            total_weight: self.governor.total_weight(),
            bucket_index: self.governor.bucket_index(),
        }
    }

    /// Direct arena access for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }
}
