use crate::{Clustering, Network, ZeroVec};
use rand::{seq::SliceRandom, Rng};
use std::collections::VecDeque;

/// Move single nodes between clusters while the modularity improves. Nodes are
/// visited in random order; when a node changes cluster its neighbors outside the
/// new cluster are queued again, until the queue is empty.
#[derive(Default)]
pub(crate) struct LocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
    queued: Vec<bool>,
}

impl LocalMoving {
    pub fn new(resolution: f64) -> Self {
        LocalMoving {
            resolution,
            ..LocalMoving::default()
        }
    }

    /// Returns true if any node changed cluster.
    pub fn iterate(&mut self, n: &Network, c: &mut impl Clustering, rng: &mut impl Rng) -> bool {
        let total_edge_weight = n.get_total_edge_weight();
        if n.nodes() == 0 || total_edge_weight <= 0.0 {
            return false;
        }
        let mut update = false;

        self.cluster_weights.zero_len(n.nodes());
        self.nodes_per_cluster.zero_len(n.nodes());
        for i in 0..n.nodes() {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        self.unused_clusters.clear();
        for i in (0..n.nodes()).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters.push(i);
            }
        }

        let mut node_order = (0..n.nodes()).collect::<Vec<_>>();
        node_order.shuffle(rng);
        let mut queue = VecDeque::from(node_order);
        self.queued.clear();
        self.queued.resize(n.nodes(), true);

        self.edge_weight_per_cluster.zero_len(n.nodes());
        self.neighboring_clusters.clear();

        let scale = self.resolution / (2.0 * total_edge_weight);

        while let Some(j) = queue.pop_front() {
            self.queued[j] = false;
            let current_cluster = c.get(j);
            let node_weight = n.weight(j);

            self.cluster_weights[current_cluster] -= node_weight;
            self.nodes_per_cluster[current_cluster] -= 1;
            if self.nodes_per_cluster[current_cluster] == 0 {
                self.unused_clusters.push(current_cluster);
            }

            // An empty cluster is always a candidate, so a node can leave to be alone.
            self.neighboring_clusters.clear();
            if let Some(&empty) = self.unused_clusters.last() {
                self.neighboring_clusters.push(empty);
            }
            for (target, edge_weight) in n.neighbors(j) {
                let neighbor_cluster = c.get(target);
                if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                    self.neighboring_clusters.push(neighbor_cluster);
                }
                self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
            }

            // Ties keep the node where it was, which guarantees termination.
            let mut best_cluster = current_cluster;
            let mut max_increment = self.edge_weight_per_cluster[current_cluster]
                - node_weight * self.cluster_weights[current_cluster] * scale;
            for &l in &self.neighboring_clusters {
                let increment = self.edge_weight_per_cluster[l] - node_weight * self.cluster_weights[l] * scale;
                if increment > max_increment {
                    best_cluster = l;
                    max_increment = increment;
                }
            }
            for &l in &self.neighboring_clusters {
                self.edge_weight_per_cluster[l] = 0.0;
            }
            self.edge_weight_per_cluster[current_cluster] = 0.0;

            self.cluster_weights[best_cluster] += node_weight;
            self.nodes_per_cluster[best_cluster] += 1;
            if self.unused_clusters.last() == Some(&best_cluster) {
                self.unused_clusters.pop();
            }

            if best_cluster != current_cluster {
                c.set(j, best_cluster);
                update = true;
                for (target, _) in n.neighbors(j) {
                    if !self.queued[target] && c.get(target) != best_cluster {
                        self.queued[target] = true;
                        queue.push_back(target);
                    }
                }
            }
        }

        if update {
            c.remove_empty_clusters();
        }

        update
    }
}
