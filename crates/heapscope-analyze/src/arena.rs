//! Handle-indexed node arena for the generalized suffix tree.
//!
//! Parent links, suffix links, child values and queue neighbors are all
//! [`NodeId`] handles into one arena, which sidesteps the cyclic-reference
//! problem entirely. Three sentinel handles are allocated up front:
//! `DUMMY` (unset link), and `FRONT`/`BACK` (leaf-queue endpoints). Dead
//! nodes stay in the arena until it is discarded.
//!
//! The leaf queue is a doubly-linked list threaded through the nodes; only
//! leaves and the two sentinels ever appear on it. Child maps exist only
//! on the root and branches. All structural mutation goes through the
//! helpers here so the queue, the child maps and the incoming-reference
//! counters cannot drift apart.

use std::collections::HashMap;

use heapscope_types::LocId;

/// Handle of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Unset link sentinel.
    pub const DUMMY: Self = Self(0);
    /// Leaf-queue front sentinel.
    pub const FRONT: Self = Self(1);
    /// Leaf-queue back sentinel.
    pub const BACK: Self = Self(2);
    /// The root, allocated by [`Arena::new`].
    pub const ROOT: Self = Self(3);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Node variant. Queue membership is a property of `Leaf` and the
/// sentinels only; child maps exist only on `Root` and `Branch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Branch,
    Leaf,
    FrontSentinel,
    BackSentinel,
    Dead,
}

/// Edge label: a window into one of the arena's stored token strings.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub string: u32,
    pub start: u32,
    pub len: u32,
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub edge: Edge,
    pub parent: NodeId,
    /// Locus of this node's label minus its first token; `DUMMY` until
    /// materialized.
    pub suffix: NodeId,
    /// Number of live nodes whose suffix link points here.
    pub suffix_referrers: u32,
    pub children: HashMap<LocId, NodeId>,
    /// Label length in tokens.
    pub depth: u32,
    /// Weighted insertions terminating exactly here (signed: suffix-chain
    /// corrections during squashing may transiently dip below zero).
    pub count: i64,
    /// Lossy-counting error bound for this locus.
    pub delta: u64,
    /// Largest `count + delta` ever squashed directly below this node;
    /// inherited by new descendants.
    pub max_child_delta: u64,
    pub queue_prev: NodeId,
    pub queue_next: NodeId,
    // Scratch for the output-time aggregation passes.
    pub descendants_count: i64,
    pub heavy_descendants_count: i64,
}

impl Node {
    fn bare(kind: NodeKind) -> Self {
        Self {
            kind,
            edge: Edge {
                string: 0,
                start: 0,
                len: 0,
            },
            parent: NodeId::DUMMY,
            suffix: NodeId::DUMMY,
            suffix_referrers: 0,
            children: HashMap::new(),
            depth: 0,
            count: 0,
            delta: 0,
            max_child_delta: 0,
            queue_prev: NodeId::DUMMY,
            queue_next: NodeId::DUMMY,
            descendants_count: 0,
            heavy_descendants_count: 0,
        }
    }

    #[must_use]
    pub const fn is_dead(&self) -> bool {
        matches!(self.kind, NodeKind::Dead)
    }
}

/// The node arena plus the stored token strings edges point into.
#[derive(Debug)]
pub struct Arena {
    nodes: Vec<Node>,
    strings: Vec<Vec<LocId>>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    /// An arena holding the three sentinels, an empty root, and an empty
    /// leaf queue.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = vec![
            Node::bare(NodeKind::Dead), // DUMMY
            Node::bare(NodeKind::FrontSentinel),
            Node::bare(NodeKind::BackSentinel),
            Node::bare(NodeKind::Root),
        ];
        nodes[NodeId::FRONT.index()].queue_next = NodeId::BACK;
        nodes[NodeId::BACK.index()].queue_prev = NodeId::FRONT;
        // The empty label's suffix is itself.
        nodes[NodeId::ROOT.index()].suffix = NodeId::ROOT;
        Self {
            nodes,
            strings: Vec::new(),
        }
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Total nodes ever allocated, sentinels included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Live (non-dead, non-sentinel) node handles.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, n)| {
            matches!(n.kind, NodeKind::Root | NodeKind::Branch | NodeKind::Leaf)
                .then(|| NodeId(u32::try_from(i).expect("arena handles fit u32")))
        })
    }

    /// Store a token string for edges to reference.
    pub fn add_string(&mut self, tokens: Vec<LocId>) -> u32 {
        let id = u32::try_from(self.strings.len()).expect("string handles fit u32");
        self.strings.push(tokens);
        id
    }

    #[must_use]
    pub fn string(&self, id: u32) -> &[LocId] {
        &self.strings[id as usize]
    }

    /// The tokens of a node's edge label.
    #[must_use]
    pub fn edge_tokens(&self, id: NodeId) -> &[LocId] {
        let edge = self.node(id).edge;
        let s = self.string(edge.string);
        &s[edge.start as usize..(edge.start + edge.len) as usize]
    }

    /// First token of a node's edge (its key in the parent's child map).
    #[must_use]
    pub fn edge_key(&self, id: NodeId) -> LocId {
        self.edge_tokens(id)[0]
    }

    #[must_use]
    pub fn child(&self, parent: NodeId, token: LocId) -> Option<NodeId> {
        self.node(parent).children.get(&token).copied()
    }

    /// Create a leaf under `parent` labeled by `edge`. The leaf joins the
    /// queue and inherits its error bound from the parent.
    pub fn new_leaf(&mut self, parent: NodeId, edge: Edge) -> NodeId {
        debug_assert!(edge.len >= 1, "non-root nodes need nonempty edges");
        let inherited = self.node(parent).max_child_delta;
        let depth = self.node(parent).depth + edge.len;
        let id = self.alloc(Node {
            kind: NodeKind::Leaf,
            edge,
            parent,
            depth,
            delta: inherited,
            max_child_delta: inherited,
            ..Node::bare(NodeKind::Leaf)
        });
        let key = self.edge_key(id);
        self.node_mut(parent).children.insert(key, id);
        self.queue_push_back(id);
        id
    }

    /// Split `child`'s edge `offset` tokens in, returning the new interior
    /// node that now sits between `child` and its former parent.
    pub fn split_edge(&mut self, child: NodeId, offset: u32) -> NodeId {
        let child_edge = self.node(child).edge;
        debug_assert!(offset >= 1 && offset < child_edge.len, "split inside the edge");
        let parent = self.node(child).parent;
        let inherited = self.node(parent).max_child_delta;
        let depth = self.node(parent).depth + offset;

        let mid = self.alloc(Node {
            kind: NodeKind::Branch,
            edge: Edge {
                string: child_edge.string,
                start: child_edge.start,
                len: offset,
            },
            parent,
            depth,
            delta: inherited,
            max_child_delta: inherited,
            ..Node::bare(NodeKind::Branch)
        });

        // Re-key: parent now reaches `mid` under the old key; `child`
        // hangs off `mid` under the token where the edge was cut.
        let old_key = self.edge_key(child);
        self.node_mut(parent).children.insert(old_key, mid);
        {
            let c = self.node_mut(child);
            c.edge.start += offset;
            c.edge.len -= offset;
            c.parent = mid;
        }
        let new_key = self.edge_key(child);
        self.node_mut(mid).children.insert(new_key, child);
        mid
    }

    /// Point `from`'s suffix link at `to`, once. Re-linking an
    /// already-linked node is a no-op so referrer counts stay exact.
    pub fn set_suffix_once(&mut self, from: NodeId, to: NodeId) {
        if from == NodeId::ROOT || self.node(from).suffix != NodeId::DUMMY {
            return;
        }
        self.node_mut(from).suffix = to;
        self.node_mut(to).suffix_referrers += 1;
    }

    // --- leaf queue -------------------------------------------------------

    /// Insert `id` just before the back sentinel.
    pub fn queue_push_back(&mut self, id: NodeId) {
        let tail = self.node(NodeId::BACK).queue_prev;
        self.node_mut(tail).queue_next = id;
        {
            let n = self.node_mut(id);
            n.queue_prev = tail;
            n.queue_next = NodeId::BACK;
        }
        self.node_mut(NodeId::BACK).queue_prev = id;
    }

    /// Unlink `id` from the queue.
    pub fn queue_detach(&mut self, id: NodeId) {
        let (prev, next) = {
            let n = self.node(id);
            (n.queue_prev, n.queue_next)
        };
        self.node_mut(prev).queue_next = next;
        self.node_mut(next).queue_prev = prev;
        let n = self.node_mut(id);
        n.queue_prev = NodeId::DUMMY;
        n.queue_next = NodeId::DUMMY;
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).expect("arena handles fit u32"));
        self.nodes.push(node);
        id
    }
}
