//! Incremental generalized-suffix-tree construction (Ukkonen).
//!
//! Insertion walks the input one token at a time with an active-point
//! cursor. Inserted strings must be repeat-free, with terminator tokens
//! only in end position; the tree layer prepares raw backtraces
//! accordingly. Under that discipline every leaf label ends with a
//! terminator, so a cursor can never be asked to descend out of a leaf.

use heapscope_types::LocId;

use crate::arena::{Arena, Edge, NodeId};

/// Cursor into the tree: a position `len` tokens down the edge from
/// `parent` to `child`. `len == 0` means "at `parent`" (and `child ==
/// parent`).
#[derive(Debug, Clone, Copy)]
pub struct ActivePoint {
    parent: NodeId,
    len: u32,
    child: NodeId,
}

impl ActivePoint {
    #[must_use]
    pub const fn at_root() -> Self {
        Self {
            parent: NodeId::ROOT,
            len: 0,
            child: NodeId::ROOT,
        }
    }

    fn set_at_node(&mut self, node: NodeId) {
        self.parent = node;
        self.len = 0;
        self.child = node;
    }

    /// Try to extend the cursor by one token. On success the cursor
    /// advances (snapping onto the child when the edge is exhausted).
    pub fn scan(&mut self, arena: &Arena, token: LocId) -> bool {
        if self.len == 0 {
            let Some(c) = arena.child(self.parent, token) else {
                return false;
            };
            if arena.node(c).edge.len == 1 {
                self.set_at_node(c);
            } else {
                self.child = c;
                self.len = 1;
            }
            return true;
        }
        if arena.edge_tokens(self.child)[self.len as usize] != token {
            return false;
        }
        self.len += 1;
        if self.len == arena.node(self.child).edge.len {
            let c = self.child;
            self.set_at_node(c);
        }
        true
    }

    /// The node at the cursor, splitting the edge here if the cursor sits
    /// strictly inside one.
    pub fn split_at(&mut self, arena: &mut Arena) -> NodeId {
        if self.len == 0 {
            return self.parent;
        }
        let mid = arena.split_edge(self.child, self.len);
        self.set_at_node(mid);
        mid
    }

    /// Move the cursor to the locus of the suffix of `node`'s label:
    /// through the suffix link when present, otherwise by a skip-count
    /// rescan of `node`'s edge from the parent's suffix locus.
    pub fn goto_suffix(&mut self, arena: &Arena, node: NodeId) {
        debug_assert!(node != NodeId::ROOT, "the empty label has no suffix");
        let link = arena.node(node).suffix;
        if link != NodeId::DUMMY {
            self.set_at_node(link);
            return;
        }
        let parent = arena.node(node).parent;
        let edge = arena.node(node).edge;
        if parent == NodeId::ROOT {
            self.set_at_node(NodeId::ROOT);
            self.rescan(arena, edge.string, edge.start + 1, edge.len - 1);
        } else {
            let parent_suffix = arena.node(parent).suffix;
            debug_assert!(parent_suffix != NodeId::DUMMY, "interior parents carry links");
            self.set_at_node(parent_suffix);
            self.rescan(arena, edge.string, edge.start, edge.len);
        }
    }

    /// Skip-count descent: the rescanned tokens are known to be present,
    /// so only each edge's first token and length are inspected.
    fn rescan(&mut self, arena: &Arena, string: u32, mut start: u32, mut remaining: u32) {
        while remaining > 0 {
            let token = arena.string(string)[start as usize];
            let c = arena
                .child(self.parent, token)
                .expect("rescanned path exists in the tree");
            let edge_len = arena.node(c).edge.len;
            if remaining < edge_len {
                self.child = c;
                self.len = remaining;
                return;
            }
            start += edge_len;
            remaining -= edge_len;
            self.set_at_node(c);
        }
    }
}

/// Insert `tokens` and return the destination node: the first leaf the
/// insertion created, or the locus of the full string when it was already
/// present. Suffix links are materialized along the destination's whole
/// suffix chain before returning.
pub fn insert(arena: &mut Arena, tokens: &[LocId]) -> NodeId {
    debug_assert!(!tokens.is_empty(), "empty strings have no destination");
    debug_assert!(repeat_free(tokens), "inserted strings must be repeat-free");

    let mut cursor = ActivePoint::at_root();
    let mut first_leaf: Option<NodeId> = None;
    let mut pending_link: Option<NodeId> = None;
    let mut stored: Option<u32> = None;

    for (i, &token) in tokens.iter().enumerate() {
        loop {
            let at_node = (cursor.len == 0).then_some(cursor.parent);
            if cursor.scan(arena, token) {
                if let Some(from) = pending_link.take() {
                    debug_assert!(at_node.is_some(), "suffix locus of an interior node is a node");
                    if let Some(to) = at_node {
                        arena.set_suffix_once(from, to);
                    }
                }
                break;
            }

            let split = cursor.split_at(arena);
            if let Some(from) = pending_link.take() {
                if from != split {
                    arena.set_suffix_once(from, split);
                }
            }

            let string =
                *stored.get_or_insert_with(|| arena.add_string(tokens.to_vec()));
            let leaf = arena.new_leaf(
                split,
                Edge {
                    string,
                    start: u32::try_from(i).expect("stack depths fit u32"),
                    len: u32::try_from(tokens.len() - i).expect("stack depths fit u32"),
                },
            );
            first_leaf.get_or_insert(leaf);

            if split == NodeId::ROOT {
                // The empty suffix is next; this token is fully handled.
                break;
            }
            pending_link = Some(split);
            cursor.goto_suffix(arena, split);
        }
    }

    let dest = match first_leaf {
        Some(leaf) => leaf,
        None => cursor.split_at(arena),
    };
    materialize_suffix_chain(arena, dest, &mut cursor);
    dest
}

/// Walk the destination's suffix chain, creating any missing links (and
/// any missing loci) down to the root. Counts propagate across suffix
/// links at output time, so every counted node must sit on a complete
/// chain.
fn materialize_suffix_chain(arena: &mut Arena, dest: NodeId, cursor: &mut ActivePoint) {
    let mut cur = dest;
    while cur != NodeId::ROOT && arena.node(cur).suffix == NodeId::DUMMY {
        cursor.goto_suffix(arena, cur);
        let target = cursor.split_at(arena);
        arena.set_suffix_once(cur, target);
        cur = target;
    }
}

fn repeat_free(tokens: &[LocId]) -> bool {
    let mut seen = std::collections::HashSet::new();
    tokens.iter().all(|t| seen.insert(*t))
}
