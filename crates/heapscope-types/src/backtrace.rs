//! Backtrace helpers shared by the writer and the analyzer.
//!
//! Backtraces are ordered innermost-frame-first: index 0 is the newest
//! frame, the last index is the oldest. Successive samples from the same
//! program point share a long run of old frames, which is why the codec
//! transmits only the frames past the shared tail.

use crate::location::LocId;

/// Number of frames shared between `a` and `b` at the deep (oldest) end.
#[must_use]
pub fn common_suffix_len(a: &[LocId], b: &[LocId]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Deduplicate a stack for suffix-tree insertion, keeping the first
/// occurrence of each frame. Recursive programs repeat frames; the tree
/// builder requires each inserted string to be repeat-free.
#[must_use]
pub fn dedup_stack(stack: &[LocId]) -> Vec<LocId> {
    let mut out = Vec::with_capacity(stack.len());
    for &frame in stack {
        if !out.contains(&frame) {
            out.push(frame);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[u64]) -> Vec<LocId> {
        v.iter().copied().map(LocId).collect()
    }

    #[test]
    fn common_suffix_of_identical_stacks_is_full_length() {
        let a = ids(&[1, 2, 3, 4]);
        assert_eq!(common_suffix_len(&a, &a), 4);
    }

    #[test]
    fn common_suffix_counts_from_the_old_end() {
        // Newest frame differs, deep frames agree.
        let a = ids(&[9, 2, 3, 4]);
        let b = ids(&[1, 2, 3, 4]);
        assert_eq!(common_suffix_len(&a, &b), 3);

        // Old frames differ: nothing shared even though the tops match.
        let c = ids(&[1, 2, 3, 7]);
        assert_eq!(common_suffix_len(&b, &c), 0);
    }

    #[test]
    fn common_suffix_handles_length_mismatch() {
        let short = ids(&[3, 4]);
        let long = ids(&[1, 2, 3, 4]);
        assert_eq!(common_suffix_len(&short, &long), 2);
        assert_eq!(common_suffix_len(&long, &short), 2);
        assert_eq!(common_suffix_len(&[], &long), 0);
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let stack = ids(&[5, 1, 5, 2, 1, 3]);
        assert_eq!(dedup_stack(&stack), ids(&[5, 1, 2, 3]));
    }

    #[test]
    fn dedup_of_repeat_free_stack_is_identity() {
        let stack = ids(&[4, 3, 2, 1]);
        assert_eq!(dedup_stack(&stack), stack);
    }
}
