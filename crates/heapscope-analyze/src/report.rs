//! Output-time descendant aggregation and heavy-node enumeration.
//!
//! Counts live where insertions terminated; a locus's true weight is the
//! sum over its subtree *and* over everything reachable through suffix
//! links (a stack containing `xα` also contains `α`). The aggregation
//! runs in two depth-ordered passes over a depth-indexed bucket list:
//! reset by increasing depth, then accumulate by decreasing depth, where
//! each node pushes its total to its parent and its suffix referent and
//! retracts it from the parent's suffix referent to cancel the
//! double-count those two paths share.

use heapscope_error::{HeapscopeError, Result};
use heapscope_types::LocId;

use crate::arena::{Arena, NodeId};

/// One reported hotspot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeavyHitter {
    /// The frame sequence of the locus, root-to-locus order.
    pub label: Vec<LocId>,
    /// Weight attributable to this locus alone (descendant heavy nodes
    /// excluded).
    pub light: u64,
    /// Weight of the locus including all descendants.
    pub total: u64,
    /// `total` plus the lossy-counting error bound.
    pub upper_bound: u64,
}

/// Enumerate every node whose light weight clears `frequency` of the
/// total stream weight, sorted by descending light weight (stable).
pub fn heavy_hitters(
    arena: &mut Arena,
    total_weight: u64,
    frequency: f64,
) -> Result<Vec<HeavyHitter>> {
    if !(frequency > 0.0 && frequency <= 1.0) {
        return Err(HeapscopeError::InvalidFrequency { value: frequency });
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    let threshold = (frequency * total_weight as f64).floor() as i64;

    let by_depth = depth_buckets(arena);

    // Reset pass, shallow to deep.
    for bucket in &by_depth {
        for &id in bucket {
            let n = arena.node_mut(id);
            n.descendants_count = 0;
            n.heavy_descendants_count = 0;
        }
    }

    // Aggregation pass, deep to shallow: every contributor is strictly
    // deeper than the nodes it touches, so each node's aggregates are
    // final by the time it is processed.
    let mut is_heavy = vec![false; arena.node_count()];
    for bucket in by_depth.iter().rev() {
        for &id in bucket {
            if id == NodeId::ROOT {
                continue;
            }
            let node = arena.node(id);
            let total = node.count + node.descendants_count;
            let light = total - node.heavy_descendants_count;
            let delta = i64::try_from(node.delta).unwrap_or(i64::MAX);
            let heavy = if light + delta > threshold {
                is_heavy[id.index()] = true;
                total
            } else {
                node.heavy_descendants_count
            };

            let parent = node.parent;
            let suffix = node.suffix;
            {
                let p = arena.node_mut(parent);
                p.descendants_count += total;
                p.heavy_descendants_count += heavy;
            }
            if suffix != NodeId::DUMMY {
                let s = arena.node_mut(suffix);
                s.descendants_count += total;
                s.heavy_descendants_count += heavy;
            }
            let cancel = arena.node(parent).suffix;
            if cancel != NodeId::DUMMY {
                let g = arena.node_mut(cancel);
                g.descendants_count -= total;
                g.heavy_descendants_count -= heavy;
            }
        }
    }

    // Depth-first emission; the stable descending sort keeps subtree
    // order among ties.
    let mut out = Vec::new();
    let mut label = Vec::new();
    emit(arena, NodeId::ROOT, &is_heavy, &mut label, &mut out);
    out.sort_by(|a, b| b.light.cmp(&a.light));
    Ok(out)
}

/// Live nodes bucketed by label depth, built by a root-to-leaves walk.
fn depth_buckets(arena: &Arena) -> Vec<Vec<NodeId>> {
    let mut buckets: Vec<Vec<NodeId>> = Vec::new();
    let mut stack = vec![NodeId::ROOT];
    while let Some(id) = stack.pop() {
        let depth = arena.node(id).depth as usize;
        if buckets.len() <= depth {
            buckets.resize_with(depth + 1, Vec::new);
        }
        buckets[depth].push(id);
        stack.extend(arena.node(id).children.values().copied());
    }
    buckets
}

fn emit(
    arena: &Arena,
    id: NodeId,
    is_heavy: &[bool],
    label: &mut Vec<LocId>,
    out: &mut Vec<HeavyHitter>,
) {
    if id != NodeId::ROOT {
        label.extend_from_slice(arena.edge_tokens(id));
        if is_heavy[id.index()] {
            let node = arena.node(id);
            let total = (node.count + node.descendants_count).max(0).unsigned_abs();
            let light = (node.count + node.descendants_count - node.heavy_descendants_count)
                .max(0)
                .unsigned_abs()
                .min(total);
            out.push(HeavyHitter {
                label: label.clone(),
                light,
                total,
                upper_bound: total.saturating_add(node.delta),
            });
        }
    }

    // Deterministic child order.
    let mut children: Vec<NodeId> = arena.node(id).children.values().copied().collect();
    children.sort_by_key(|&c| arena.edge_key(c));
    for child in children {
        emit(arena, child, is_heavy, label, out);
    }

    if id != NodeId::ROOT {
        let edge_len = arena.node(id).edge.len as usize;
        label.truncate(label.len() - edge_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder;

    const TERM: LocId = LocId::TERMINATOR;

    fn toks(v: &[u64]) -> Vec<LocId> {
        let mut t: Vec<LocId> = v.iter().copied().map(LocId).collect();
        t.push(TERM);
        t
    }

    fn insert_weighted(arena: &mut Arena, v: &[u64], weight: i64) {
        let dest = builder::insert(arena, &toks(v));
        arena.node_mut(dest).count += weight;
    }

    /// Find the hitter whose label is `stack` plus the terminator.
    fn find<'a>(hitters: &'a [HeavyHitter], stack: &[u64]) -> Option<&'a HeavyHitter> {
        let want = toks(stack);
        hitters.iter().find(|h| h.label == want)
    }

    #[test]
    fn rejects_out_of_range_frequency() {
        let mut arena = Arena::new();
        assert!(heavy_hitters(&mut arena, 10, 0.0).is_err());
        assert!(heavy_hitters(&mut arena, 10, 1.5).is_err());
        assert!(heavy_hitters(&mut arena, 10, 1.0).is_ok());
    }

    #[test]
    fn suffix_counts_aggregate_across_strings() {
        let mut arena = Arena::new();
        // The one-frame stack [2] occurs on its own twice, and as the
        // deep frame of [1,2] and [3,2] another eight times.
        for _ in 0..5 {
            insert_weighted(&mut arena, &[1, 2], 1);
        }
        for _ in 0..3 {
            insert_weighted(&mut arena, &[3, 2], 1);
        }
        insert_weighted(&mut arena, &[2], 2);

        let hitters = heavy_hitters(&mut arena, 10, 0.1).unwrap();
        let two = find(&hitters, &[2]).expect("[2] is heavy");
        assert_eq!(two.total, 10, "suffix occurrences aggregate");
        assert_eq!(two.light, 2, "but only its own weight is light");
        assert_eq!(find(&hitters, &[1, 2]).unwrap().total, 5);
        assert_eq!(find(&hitters, &[3, 2]).unwrap().total, 3);
    }

    #[test]
    fn fully_covered_locus_is_not_reported() {
        let mut arena = Arena::new();
        // Every [2] occurrence is explained by the heavier [1,2] and
        // [3,2] loci, so [2] itself has zero light weight.
        insert_weighted(&mut arena, &[1, 2], 5);
        insert_weighted(&mut arena, &[3, 2], 3);

        let hitters = heavy_hitters(&mut arena, 8, 0.1).unwrap();
        assert!(find(&hitters, &[1, 2]).is_some());
        assert!(find(&hitters, &[3, 2]).is_some());
        assert!(find(&hitters, &[2]).is_none());
    }

    #[test]
    fn light_excludes_heavy_descendants() {
        let mut arena = Arena::new();
        insert_weighted(&mut arena, &[1, 2], 90);
        insert_weighted(&mut arena, &[2], 10);

        let hitters = heavy_hitters(&mut arena, 100, 0.05).unwrap();
        let two = find(&hitters, &[2]).expect("[2] reported");
        assert_eq!(two.total, 100);
        // 90 of those occurrences already belong to the heavy [1,2] locus.
        assert_eq!(two.light, 10);
    }

    #[test]
    fn threshold_filters_rare_substrings() {
        let mut arena = Arena::new();
        insert_weighted(&mut arena, &[1, 2, 3], 97);
        insert_weighted(&mut arena, &[8, 9], 3);

        let hitters = heavy_hitters(&mut arena, 100, 0.5).unwrap();
        assert!(find(&hitters, &[1, 2, 3]).is_some());
        assert!(find(&hitters, &[8, 9]).is_none());
        assert!(find(&hitters, &[9]).is_none());
        for h in &hitters {
            assert!(h.light > 50, "reported node clears the threshold");
        }
    }

    #[test]
    fn results_sort_by_descending_light() {
        let mut arena = Arena::new();
        insert_weighted(&mut arena, &[1], 5);
        insert_weighted(&mut arena, &[2], 9);
        insert_weighted(&mut arena, &[3], 2);

        let hitters = heavy_hitters(&mut arena, 16, 0.1).unwrap();
        let lights: Vec<u64> = hitters.iter().map(|h| h.light).collect();
        let mut sorted = lights.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(lights, sorted);
    }
}
