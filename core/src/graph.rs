use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::model::OpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub src: OpId,
    pub dst: OpId,
    pub src_idx: usize,
    pub dst_idx: usize,
}

/// Filter for [`Graph::query_edges`]; `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct EdgeQuery {
    pub srcs: Option<HashSet<OpId>>,
    pub dsts: Option<HashSet<OpId>>,
    pub src_idxs: Option<HashSet<usize>>,
    pub dst_idxs: Option<HashSet<usize>>,
}

impl EdgeQuery {
    pub fn from_src(src: OpId) -> Self {
        Self {
            srcs: Some(HashSet::from([src])),
            ..Default::default()
        }
    }

    pub fn to_dst(dst: OpId) -> Self {
        Self {
            dsts: Some(HashSet::from([dst])),
            ..Default::default()
        }
    }

    fn matches(&self, e: &Edge) -> bool {
        fn allowed<T: std::hash::Hash + Eq>(set: &Option<HashSet<T>>, v: &T) -> bool {
            set.as_ref().map_or(true, |s| s.contains(v))
        }
        allowed(&self.srcs, &e.src)
            && allowed(&self.dsts, &e.dst)
            && allowed(&self.src_idxs, &e.src_idx)
            && allowed(&self.dst_idxs, &e.dst_idx)
    }
}

/// Parallel computation graph: operators as nodes, tensor flow as edges.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<OpId, u64>,
    in_edges: BTreeMap<OpId, BTreeSet<Edge>>,
    out_edges: BTreeMap<OpId, BTreeSet<Edge>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, op: OpId, guid: u64) {
        self.nodes.insert(op, guid);
        self.in_edges.entry(op).or_default();
        self.out_edges.entry(op).or_default();
    }

    pub fn contains_node(&self, op: OpId) -> bool {
        self.nodes.contains_key(&op)
    }

    pub fn node_guid(&self, op: OpId) -> Option<u64> {
        self.nodes.get(&op).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = OpId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn add_edge(&mut self, src: OpId, dst: OpId, src_idx: usize, dst_idx: usize) {
        let edge = Edge {
            src,
            dst,
            src_idx,
            dst_idx,
        };
        self.out_edges.entry(src).or_default().insert(edge);
        self.in_edges.entry(dst).or_default().insert(edge);
    }

    pub fn in_edges(&self, op: OpId) -> Vec<Edge> {
        self.in_edges
            .get(&op)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn out_edges(&self, op: OpId) -> Vec<Edge> {
        self.out_edges
            .get(&op)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn query_edges(&self, query: &EdgeQuery) -> Vec<Edge> {
        let candidates: Box<dyn Iterator<Item = &Edge>> = match &query.srcs {
            Some(srcs) => Box::new(
                srcs.iter()
                    .filter_map(|s| self.out_edges.get(s))
                    .flat_map(|s| s.iter()),
            ),
            None => Box::new(self.out_edges.values().flat_map(|s| s.iter())),
        };
        let mut edges: Vec<Edge> = candidates.filter(|e| query.matches(e)).copied().collect();
        edges.sort();
        edges
    }
}

#[test]
fn test_query_edges() -> anyhow::Result<()> {
    let mut g = Graph::new();
    for i in 0..4 {
        g.add_node(OpId(i), 5_000_000 + i as u64);
    }
    g.add_edge(OpId(0), OpId(1), 0, 0);
    g.add_edge(OpId(0), OpId(2), 0, 0);
    g.add_edge(OpId(1), OpId(3), 0, 0);
    g.add_edge(OpId(2), OpId(3), 0, 1);

    assert_eq!(g.out_edges(OpId(0)).len(), 2);
    assert_eq!(g.in_edges(OpId(3)).len(), 2);
    assert!(g.in_edges(OpId(0)).is_empty());

    let into_second_slot = EdgeQuery {
        dst_idxs: Some(HashSet::from([1])),
        ..Default::default()
    };
    let edges = g.query_edges(&into_second_slot);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].src, OpId(2));

    assert_eq!(g.query_edges(&EdgeQuery::from_src(OpId(0))).len(), 2);
    assert_eq!(g.query_edges(&EdgeQuery::to_dst(OpId(1))).len(), 1);
    assert_eq!(g.query_edges(&EdgeQuery::default()).len(), 4);
    assert_eq!(g.node_guid(OpId(2)), Some(5_000_002));
    Ok(())
}
