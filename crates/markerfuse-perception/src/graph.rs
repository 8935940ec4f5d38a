//! Undirected marker co-observation graph.
//!
//! Nodes are marker ids; an edge joins two markers that have been seen in the
//! same frame at least once.  Redundant paths and cycles are expected (every
//! frame with three markers closes a triangle) and give the resolver more
//! than one way to reach the reference marker.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use markerfuse_types::MarkerId;

/// Adjacency sets keyed by marker id.
///
/// Neighbour sets are ordered so that breadth-first search visits them in
/// ascending id order and returns the same path for the same graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerGraph {
    adjacency: BTreeMap<MarkerId, BTreeSet<MarkerId>>,
}

impl MarkerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from a set of (unordered) marker pairs.
    pub fn from_edges<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (MarkerId, MarkerId)>,
    {
        let mut graph = Self::new();
        for (a, b) in pairs {
            graph.add_edge(a, b);
        }
        graph
    }

    /// Insert the undirected edge `a – b`.  Self-loops are ignored.
    pub fn add_edge(&mut self, a: MarkerId, b: MarkerId) {
        if a == b {
            return;
        }
        self.adjacency.entry(a).or_default().insert(b);
        self.adjacency.entry(b).or_default().insert(a);
    }

    /// Make `id` a node even if it has no edges yet.
    pub fn add_node(&mut self, id: MarkerId) {
        self.adjacency.entry(id).or_default();
    }

    pub fn contains(&self, id: MarkerId) -> bool {
        self.adjacency.contains_key(&id)
    }

    /// Node ids in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = MarkerId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn neighbours(&self, id: MarkerId) -> impl Iterator<Item = MarkerId> + '_ {
        self.adjacency.get(&id).into_iter().flatten().copied()
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    /// A shortest path (by edge count) from `start` to `goal`, inclusive of
    /// both ends.
    ///
    /// Returns `Some(vec![start])` when `start == goal`, and `None` when the
    /// two are in different components or either id is unknown.  Among
    /// equal-length paths the first one discovered wins.
    pub fn shortest_path(&self, start: MarkerId, goal: MarkerId) -> Option<Vec<MarkerId>> {
        if start == goal {
            return Some(vec![start]);
        }
        if !self.contains(start) || !self.contains(goal) {
            return None;
        }

        let mut parent: HashMap<MarkerId, MarkerId> = HashMap::new();
        let mut queue: VecDeque<MarkerId> = VecDeque::new();
        parent.insert(start, start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current) {
                if parent.contains_key(&next) {
                    continue;
                }
                parent.insert(next, current);
                if next == goal {
                    return Some(reconstruct(&parent, start, goal));
                }
                queue.push_back(next);
            }
        }

        None
    }

    /// Every node reachable from `id`, including `id` itself.
    pub fn component_of(&self, id: MarkerId) -> BTreeSet<MarkerId> {
        let mut seen = BTreeSet::new();
        if !self.contains(id) {
            return seen;
        }
        let mut queue = VecDeque::from([id]);
        seen.insert(id);
        while let Some(current) = queue.pop_front() {
            for next in self.neighbours(current) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}

fn reconstruct(parent: &HashMap<MarkerId, MarkerId>, start: MarkerId, goal: MarkerId) -> Vec<MarkerId> {
    let mut path = vec![goal];
    let mut node = goal;
    while node != start {
        node = parent[&node];
        path.push(node);
    }
    path.reverse();
    path
}
