use crate::Clustering;
use fxhash::FxHashMap;

/// Container for the network graph: symmetric adjacency lists with f64 edge weights
/// and a weight per node. Self-loops are not stored.
#[derive(Debug, Clone, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    adjacency: Vec<Vec<(usize, f64)>>,
    total_edge_weight: f64,
}

impl Network {
    /// Build a network from undirected `(i, j, weight)` edges. Repeated edges are summed,
    /// self-loops and non-positive weights are ignored. Node weights are set to the node
    /// strength (sum of incident edge weights), the quantity modularity is defined on.
    pub fn from_edges<I: IntoIterator<Item = (usize, usize, f64)>>(n_nodes: usize, edges: I) -> Network {
        let mut edge_memo = FxHashMap::default();
        for (i, j, w) in edges {
            if i == j || w <= 0.0 || !w.is_finite() {
                continue;
            }
            let key = if i < j { (i, j) } else { (j, i) };
            *edge_memo.entry(key).or_insert(0.0) += w;
        }

        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut total_edge_weight = 0.0;
        for (&(i, j), &w) in edge_memo.iter() {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
            total_edge_weight += w;
        }
        // hash order is not stable across runs
        for adj in adjacency.iter_mut() {
            adj.sort_unstable_by_key(|&(j, _)| j);
        }

        let node_weights = adjacency
            .iter()
            .map(|adj| adj.iter().map(|&(_, w)| w).sum())
            .collect();

        Network {
            node_weights,
            adjacency,
            total_edge_weight,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Get the node weight of `node`.
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Pairs of (adjacent node id, edge_weight) for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Number of neighbors of `node`
    pub fn degree(&self, node: usize) -> usize {
        self.adjacency[node].len()
    }

    /// Get the total weight of all nodes in the graph
    pub fn get_total_node_weight(&self) -> f64 {
        self.node_weights.iter().sum()
    }

    /// Total edge weight, each undirected edge counted once. For a reduced network this
    /// includes the weight of the edges collapsed inside its nodes.
    pub fn get_total_edge_weight(&self) -> f64 {
        self.total_edge_weight
    }

    /// Creates a reduced (or aggregate) network based on a clustering.
    /// Each node in the reduced network corresponds to a cluster of nodes in
    /// the original network. The weight of a node in the reduced network equals
    /// the sum of the weights of the nodes in the corresponding cluster. The weight
    /// of an edge between two nodes in the reduced network equals the sum of the
    /// weights of the edges between the two corresponding clusters.
    pub fn create_reduced_network(&self, clustering: &impl Clustering) -> Network {
        let n_clusters = clustering.num_clusters();
        let mut node_weights = vec![0.0; n_clusters];
        for i in 0..self.nodes() {
            node_weights[clustering.get(i)] += self.node_weights[i];
        }

        let mut edge_memo = FxHashMap::default();
        for (i, adj) in self.adjacency.iter().enumerate() {
            let c1 = clustering.get(i);
            for &(j, w) in adj {
                if j <= i {
                    continue;
                }
                let c2 = clustering.get(j);
                if c1 == c2 {
                    continue;
                }
                let key = if c1 < c2 { (c1, c2) } else { (c2, c1) };
                *edge_memo.entry(key).or_insert(0.0) += w;
            }
        }

        let mut adjacency = vec![Vec::new(); n_clusters];
        for (&(c1, c2), &w) in edge_memo.iter() {
            adjacency[c1].push((c2, w));
            adjacency[c2].push((c1, w));
        }
        for adj in adjacency.iter_mut() {
            adj.sort_unstable_by_key(|&(j, _)| j);
        }

        Network {
            node_weights,
            adjacency,
            total_edge_weight: self.total_edge_weight,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SimpleClustering;

    #[test]
    fn test_from_edges() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 0, 1.0), (1, 2, 2.0), (2, 2, 5.0), (2, 3, 0.0)]);
        assert_eq!(n.nodes(), 4);
        assert_eq!(n.neighbors(1).collect::<Vec<_>>(), vec![(0, 2.0), (2, 2.0)]);
        assert_eq!(n.weight(1), 4.0);
        assert_eq!(n.weight(3), 0.0);
        assert_eq!(n.get_total_edge_weight(), 4.0);
        assert_eq!(n.get_total_node_weight(), 8.0);
    }

    #[test]
    fn test_reduced_network() {
        let n = Network::from_edges(4, vec![(0, 1, 1.0), (1, 2, 2.0), (2, 3, 3.0), (0, 3, 0.5)]);
        let c = SimpleClustering::new_from_labels(&[0, 0, 1, 1]);
        let r = n.create_reduced_network(&c);
        assert_eq!(r.nodes(), 2);
        assert_eq!(r.neighbors(0).collect::<Vec<_>>(), vec![(1, 2.5)]);
        assert_eq!(r.weight(0), 1.5 + 3.0);
        assert_eq!(r.weight(1), 5.0 + 3.5);
        assert_eq!(r.get_total_edge_weight(), n.get_total_edge_weight());
    }
}
