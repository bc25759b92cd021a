//! Alignment graph: which images can be registered to which.

use super::pairwise::PairMatch;
use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{depth_first_search, DfsEvent};
use tracing::debug;

/// Spanning-tree link from `node` up to `parent` through `edge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeLink {
    pub node: usize,
    pub parent: usize,
    pub edge: usize,
}

/// A connected set of at least two images.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Image positions, ascending.
    pub nodes: Vec<usize>,
    /// Indices into [`AlignmentGraph::edges`].
    pub edges: Vec<usize>,
    pub reference: usize,
    /// Non-reference nodes, each listed after its parent.
    pub tree: Vec<TreeLink>,
    pub total_confidence: f64,
}

impl Component {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Position of `image` inside `nodes`.
    pub fn slot(&self, image: usize) -> Option<usize> {
        self.nodes.binary_search(&image).ok()
    }
}

/// Images plus the verified pairs confident enough to align.
#[derive(Debug, Clone)]
pub struct AlignmentGraph {
    pub num_images: usize,
    pub edges: Vec<PairMatch>,
}

impl AlignmentGraph {
    /// Keep pairs whose confidence exceeds `threshold`.
    pub fn build(num_images: usize, matches: Vec<PairMatch>, threshold: f64) -> Self {
        let total = matches.len();
        let edges: Vec<PairMatch> = matches
            .into_iter()
            .filter(|m| m.confidence > threshold)
            .collect();
        debug!(kept = edges.len(), total, threshold, "alignment graph built");
        Self { num_images, edges }
    }

    /// Connected components with two or more images, plus the isolated images.
    ///
    /// `keys` break reference ties (smallest key wins).
    pub fn partition<K: Ord + Copy>(&self, keys: &[K]) -> (Vec<Component>, Vec<usize>) {
        let mut uf = UnionFind::new(self.num_images);
        for e in &self.edges {
            uf.union(e.src, e.dst);
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut root_slot: Vec<Option<usize>> = vec![None; self.num_images];
        for node in 0..self.num_images {
            let root = uf.find(node);
            match root_slot[root] {
                Some(g) => groups[g].push(node),
                None => {
                    root_slot[root] = Some(groups.len());
                    groups.push(vec![node]);
                }
            }
        }

        let mut components = Vec::new();
        let mut isolated = Vec::new();
        for nodes in groups {
            if nodes.len() < 2 {
                isolated.extend(nodes);
                continue;
            }
            components.push(self.component(nodes, keys));
        }
        (components, isolated)
    }

    fn component<K: Ord + Copy>(&self, nodes: Vec<usize>, keys: &[K]) -> Component {
        let edges: Vec<usize> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| nodes.binary_search(&e.src).is_ok())
            .map(|(i, _)| i)
            .collect();

        let mut score = vec![0.0f64; nodes.len()];
        for &ei in &edges {
            let e = &self.edges[ei];
            for n in [e.src, e.dst] {
                if let Ok(slot) = nodes.binary_search(&n) {
                    score[slot] += e.confidence;
                }
            }
        }

        let mut reference = nodes[0];
        let mut best = f64::NEG_INFINITY;
        for (slot, &n) in nodes.iter().enumerate() {
            let better = score[slot] > best
                || (score[slot] == best && (keys[n], n) < (keys[reference], reference));
            if better {
                best = score[slot];
                reference = n;
            }
        }

        let tree = self.spanning_tree(&nodes, &edges, reference);
        let total_confidence = edges.iter().map(|&e| self.edges[e].confidence).sum();
        Component {
            nodes,
            edges,
            reference,
            tree,
            total_confidence,
        }
    }

    /// Maximum-confidence spanning tree, walked depth first from
    /// `reference`.
    fn spanning_tree(&self, nodes: &[usize], edges: &[usize], reference: usize) -> Vec<TreeLink> {
        // Node `k` of both graphs is `nodes[k]`.
        let mut graph = UnGraph::<usize, (f64, usize)>::with_capacity(nodes.len(), edges.len());
        for &n in nodes {
            graph.add_node(n);
        }
        for &ei in edges {
            let e = &self.edges[ei];
            if let (Ok(a), Ok(b)) = (nodes.binary_search(&e.src), nodes.binary_search(&e.dst)) {
                // Negated so the minimum tree keeps the most confident pairs;
                // the edge index makes every weight distinct.
                graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), (-e.confidence, ei));
            }
        }

        let mut forest = UnGraph::<usize, usize>::with_capacity(nodes.len(), nodes.len().saturating_sub(1));
        for &n in nodes {
            forest.add_node(n);
        }
        for element in min_spanning_tree(&graph) {
            if let Element::Edge {
                source,
                target,
                weight: (_, edge),
            } = element
            {
                forest.add_edge(NodeIndex::new(source), NodeIndex::new(target), edge);
            }
        }

        let Ok(root) = nodes.binary_search(&reference) else {
            return Vec::new();
        };
        let mut tree = Vec::with_capacity(nodes.len().saturating_sub(1));
        depth_first_search(&forest, Some(NodeIndex::new(root)), |event| {
            if let DfsEvent::TreeEdge(parent, child) = event {
                if let Some(e) = forest.find_edge(parent, child) {
                    tree.push(TreeLink {
                        node: forest[child],
                        parent: forest[parent],
                        edge: forest[e],
                    });
                }
            }
        });
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;

    fn is_tree_edge(c: &Component, edge: usize) -> bool {
        c.tree.iter().any(|l| l.edge == edge)
    }

    fn edge(src: usize, dst: usize, confidence: f64) -> PairMatch {
        PairMatch {
            src,
            dst,
            homography: Matrix3::identity(),
            inliers: Vec::new(),
            num_candidates: 100,
            confidence,
        }
    }

    #[test]
    fn tree_lists_parents_before_children() {
        let g = AlignmentGraph::build(
            5,
            vec![
                edge(0, 1, 0.9),
                edge(1, 2, 0.8),
                edge(2, 3, 0.95),
                edge(3, 4, 0.7),
                edge(0, 4, 0.6),
                edge(1, 3, 0.55),
            ],
            0.5,
        );
        let (components, _) = g.partition(&[0u32, 1, 2, 3, 4]);
        let c = &components[0];
        assert_eq!(c.tree.len(), 4);

        let mut placed = vec![c.reference];
        for link in &c.tree {
            assert!(placed.contains(&link.parent), "{link:?} before its parent");
            assert!(!placed.contains(&link.node));
            placed.push(link.node);
        }
        // weakest edges closing the two cycles
        assert!(!is_tree_edge(c, 4));
        assert!(!is_tree_edge(c, 5));
    }

    #[test]
    fn weak_edges_are_dropped() {
        let g = AlignmentGraph::build(3, vec![edge(0, 1, 0.9), edge(1, 2, 0.5)], 0.5);
        assert_eq!(g.edges.len(), 1);
        let (components, isolated) = g.partition(&[0u32, 1, 2]);
        assert_eq!(components.len(), 1);
        assert_eq!(isolated, vec![2]);
    }

    #[test]
    fn reference_has_highest_total_confidence() {
        let g = AlignmentGraph::build(
            4,
            vec![edge(0, 1, 0.8), edge(1, 2, 0.9), edge(2, 3, 0.7), edge(0, 2, 0.6)],
            0.5,
        );
        let (components, _) = g.partition(&[0u32, 1, 2, 3]);
        let c = &components[0];
        assert_eq!(c.nodes, vec![0, 1, 2, 3]);
        assert_eq!(c.reference, 2);
        assert_eq!(c.tree.len(), 3);
        // 0-2 is the weakest edge closing a cycle
        assert!(!is_tree_edge(c, 3));
        assert_eq!(c.tree[0].parent, 2);
    }

    #[test]
    fn reference_ties_go_to_smallest_key() {
        let g = AlignmentGraph::build(2, vec![edge(0, 1, 0.9)], 0.5);
        let (components, _) = g.partition(&[7u32, 3]);
        assert_eq!(components[0].reference, 1);
    }

    #[test]
    fn disjoint_pairs_form_separate_components() {
        let g = AlignmentGraph::build(4, vec![edge(0, 1, 0.9), edge(2, 3, 0.9)], 0.5);
        let (components, isolated) = g.partition(&[0u32, 1, 2, 3]);
        assert_eq!(components.len(), 2);
        assert!(isolated.is_empty());
        assert_eq!(components[1].nodes, vec![2, 3]);
    }
}
