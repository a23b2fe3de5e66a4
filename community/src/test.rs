use crate::louvain::{Louvain, DEFAULT_RESOLUTION};
use crate::objective::modularity;
use crate::walktrap::Walktrap;
use crate::{Clustering, Network, SimpleClustering};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

/// Planted-partition test graph: `mu` is the fraction of edges that cross clusters.
fn gen_sample_network(
    rng: &mut impl Rng,
    num_clusters: usize,
    nodes_per_cluster: usize,
    mean_degree: f64,
    mu: f64,
) -> (Network, SimpleClustering) {
    assert!(num_clusters > 1);
    assert!(nodes_per_cluster > 1);

    let total_nodes = num_clusters * nodes_per_cluster;
    let total_edges = (total_nodes as f64 * mean_degree / 2.0).ceil() as usize;

    let cluster = (0..total_nodes).map(|i| i / nodes_per_cluster).collect::<Vec<_>>();
    let true_clusters = SimpleClustering::new_from_labels(&cluster);

    let mut edges = Vec::with_capacity(total_edges);
    for _ in 0..total_edges {
        let in_cluster = rng.gen_bool(1.0 - mu);
        let n1 = rng.gen_range(0..total_nodes);
        let c1 = cluster[n1];

        let n2 = loop {
            let n2 = if in_cluster {
                rng.gen_range(c1 * nodes_per_cluster..(c1 + 1) * nodes_per_cluster)
            } else {
                rng.gen_range(0..total_nodes)
            };
            if n1 != n2 && in_cluster == (cluster[n2] == c1) {
                break n2;
            }
        };

        edges.push((n1, n2, 1.0));
    }

    (Network::from_edges(total_nodes, edges), true_clusters)
}

/// Fraction of node pairs on which two clusterings agree (Rand index).
fn rand_index(a: &impl Clustering, b: &impl Clustering) -> f64 {
    let n = a.nodes();
    let mut agree = 0usize;
    let mut total = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            total += 1;
            if (a.get(i) == a.get(j)) == (b.get(i) == b.get(j)) {
                agree += 1;
            }
        }
    }
    agree as f64 / total as f64
}

#[test]
fn test_louvain_recovers_planted_partition() {
    let mut rng = Pcg64Mcg::seed_from_u64(0);
    let (network, truth) = gen_sample_network(&mut rng, 5, 40, 12.0, 0.05);

    let found = Louvain::new(DEFAULT_RESOLUTION, Some(0)).run(&network);
    assert!(rand_index(&found, &truth) > 0.95);
    assert!(modularity(1.0, &network, &found) >= modularity(1.0, &network, &truth) - 0.02);
}

#[test]
fn test_louvain_is_deterministic_for_a_seed() {
    let mut rng = Pcg64Mcg::seed_from_u64(3);
    let (network, _) = gen_sample_network(&mut rng, 4, 30, 8.0, 0.2);

    let a = Louvain::new(DEFAULT_RESOLUTION, Some(7)).run(&network);
    let b = Louvain::new(DEFAULT_RESOLUTION, Some(7)).run(&network);
    assert_eq!(a, b);
}

#[test]
fn test_walktrap_recovers_planted_partition() {
    let mut rng = Pcg64Mcg::seed_from_u64(1);
    let (network, truth) = gen_sample_network(&mut rng, 4, 25, 10.0, 0.05);

    let found = Walktrap::default().run(&network);
    assert!(rand_index(&found, &truth) > 0.95);
}

#[test]
fn test_every_node_gets_one_label() {
    let mut rng = Pcg64Mcg::seed_from_u64(2);
    let (network, _) = gen_sample_network(&mut rng, 3, 20, 6.0, 0.3);

    for c in [Louvain::new(0.5, Some(1)).run(&network), Walktrap::new(2).run(&network)] {
        assert_eq!(c.nodes(), network.nodes());
        assert!(c.labels().iter().all(|&l| l < c.num_clusters()));
        assert_eq!(c.sizes().iter().sum::<usize>(), network.nodes());
    }
}
