//! Max-flow / min-cut for seam finding, on top of petgraph's Ford-Fulkerson.
//!
//! Capacities are quantized to integers so the augmenting-path search runs
//! on exact arithmetic.

use petgraph::algo::ford_fulkerson;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::VecDeque;

/// Integer capacity units per unit of cost.
const CAPACITY_SCALE: f64 = 1024.0;

fn quantize(capacity: f64) -> u64 {
    if capacity > 0.0 && capacity.is_finite() {
        ((capacity * CAPACITY_SCALE).round() as u64).max(1)
    } else {
        0
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    graph: DiGraph<(), u64>,
    /// Flow per arc of the last [`FlowGraph::max_flow`], indexed like the arcs.
    flows: Vec<u64>,
}

impl FlowGraph {
    pub fn new(num_nodes: usize) -> Self {
        let mut graph = DiGraph::with_capacity(num_nodes, num_nodes * 4);
        for _ in 0..num_nodes {
            graph.add_node(());
        }
        Self {
            graph,
            flows: Vec::new(),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.node_count()
    }

    /// Arc `u -> v` with `forward` capacity and `v -> u` with `backward`.
    /// Non-positive capacities add no arc.
    pub fn add_edge(&mut self, u: usize, v: usize, forward: f64, backward: f64) {
        let (a, b) = (NodeIndex::new(u), NodeIndex::new(v));
        let forward = quantize(forward);
        if forward > 0 {
            self.graph.add_edge(a, b, forward);
        }
        let backward = quantize(backward);
        if backward > 0 {
            self.graph.add_edge(b, a, backward);
        }
        self.flows.clear();
    }

    /// Maximum flow from `source` to `sink`, kept for the residual cut.
    pub fn max_flow(&mut self, source: usize, sink: usize) -> f64 {
        if source == sink || self.graph.edge_count() == 0 {
            self.flows = vec![0; self.graph.edge_count()];
            return 0.0;
        }
        let (total, flows) = ford_fulkerson(&self.graph, NodeIndex::new(source), NodeIndex::new(sink));
        self.flows = flows;
        total as f64 / CAPACITY_SCALE
    }

    fn flow(&self, arc: usize) -> u64 {
        self.flows.get(arc).copied().unwrap_or(0)
    }

    /// Nodes reachable from `source` in the residual graph.
    pub fn min_cut_source_side(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.num_nodes()];
        seen[source] = true;
        let mut queue = VecDeque::from([NodeIndex::new(source)]);
        while let Some(u) = queue.pop_front() {
            let forward = self
                .graph
                .edges_directed(u, Direction::Outgoing)
                .filter(|e| *e.weight() > self.flow(e.id().index()))
                .map(|e| e.target());
            let undo = self
                .graph
                .edges_directed(u, Direction::Incoming)
                .filter(|e| self.flow(e.id().index()) > 0)
                .map(|e| e.source());
            for v in forward.chain(undo).collect::<Vec<_>>() {
                if !seen[v.index()] {
                    seen[v.index()] = true;
                    queue.push_back(v);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_network() {
        // CLRS figure 26.1
        let mut g = FlowGraph::new(6);
        g.add_edge(0, 1, 16.0, 0.0);
        g.add_edge(0, 2, 13.0, 0.0);
        g.add_edge(2, 1, 4.0, 0.0);
        g.add_edge(1, 3, 12.0, 0.0);
        g.add_edge(3, 2, 9.0, 0.0);
        g.add_edge(2, 4, 14.0, 0.0);
        g.add_edge(4, 3, 7.0, 0.0);
        g.add_edge(3, 5, 20.0, 0.0);
        g.add_edge(4, 5, 4.0, 0.0);
        assert!((g.max_flow(0, 5) - 23.0).abs() < 1e-9);

        let side = g.min_cut_source_side(0);
        assert!(side[0] && !side[5]);
    }

    #[test]
    fn cut_follows_the_weakest_link() {
        // chain 0 - 1 - 2 - 3 with a weak middle link
        let mut g = FlowGraph::new(4);
        g.add_edge(0, 1, 5.0, 5.0);
        g.add_edge(1, 2, 0.5, 0.5);
        g.add_edge(2, 3, 5.0, 5.0);
        assert!((g.max_flow(0, 3) - 0.5).abs() < 1e-12);
        assert_eq!(g.min_cut_source_side(0), vec![true, true, false, false]);
    }

    #[test]
    fn disconnected_sink_has_zero_flow() {
        let mut g = FlowGraph::new(3);
        g.add_edge(0, 1, 1.0, 0.0);
        assert_eq!(g.max_flow(0, 2), 0.0);
        assert_eq!(g.min_cut_source_side(0), vec![true, true, false]);
    }

    #[test]
    fn tiny_positive_capacities_still_connect() {
        let mut g = FlowGraph::new(2);
        g.add_edge(0, 1, 1e-9, 0.0);
        assert!(g.max_flow(0, 1) > 0.0);
        assert_eq!(g.min_cut_source_side(0), vec![true, false]);
    }
}
