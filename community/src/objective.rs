use crate::{Clustering, Network};

/// Newman-Girvan modularity of a clustering, with a resolution parameter scaling the
/// null-model term. Returns 0 for a graph without edges.
pub fn modularity(resolution: f64, graph: &Network, clustering: &impl Clustering) -> f64 {
    let total_edge_weight = graph.get_total_edge_weight();
    if total_edge_weight <= 0.0 {
        return 0.0;
    }

    let mut quality = 0.0f64;
    for i in 0..graph.nodes() {
        let c_i = clustering.get(i);
        for (j, w) in graph.neighbors(i) {
            // each undirected edge is seen from both ends
            if clustering.get(j) == c_i {
                quality += w;
            }
        }
    }

    let mut cluster_weights = vec![0.0; clustering.num_clusters()];
    for i in 0..graph.nodes() {
        cluster_weights[clustering.get(i)] += graph.weight(i);
    }

    for cluster_weight in cluster_weights {
        quality -= cluster_weight * cluster_weight * resolution / (2.0 * total_edge_weight);
    }

    quality / (2.0 * total_edge_weight)
}

/// Ratio of observed to expected edge weight between every pair of clusters.
///
/// Observed weight of `(a, b)` is the fraction of the (doubly counted) edge weight
/// running between `a` and `b`; expected is the product of the two clusters' shares
/// of total node strength. Values well above 1 off the diagonal flag clusters that
/// are poorly separated. Entries with zero expected weight are 0.
pub fn pairwise_modularity(graph: &Network, clustering: &impl Clustering) -> Vec<Vec<f64>> {
    let k = clustering.num_clusters();
    let mut observed = vec![vec![0.0; k]; k];
    let mut strength = vec![0.0; k];
    let two_m = 2.0 * graph.get_total_edge_weight();

    for i in 0..graph.nodes() {
        let a = clustering.get(i);
        strength[a] += graph.weight(i);
        for (j, w) in graph.neighbors(i) {
            observed[a][clustering.get(j)] += w;
        }
    }

    let mut ratio = vec![vec![0.0; k]; k];
    if two_m <= 0.0 {
        return ratio;
    }
    for a in 0..k {
        for b in 0..k {
            let expected = strength[a] * strength[b] / (two_m * two_m);
            if expected > 0.0 {
                ratio[a][b] = (observed[a][b] / two_m) / expected;
            }
        }
    }
    ratio
}
