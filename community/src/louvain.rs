use crate::local_moving::LocalMoving;
use crate::objective::modularity;
use crate::{Clustering, Network, SimpleClustering};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Perform the Louvain clustering algorithm
pub struct Louvain {
    rng: ChaCha20Rng,
    local_moving: LocalMoving,
    resolution: f64,
    max_iterations: usize,
}

/// Default resolution for Louvain
pub const DEFAULT_RESOLUTION: f64 = 1.0;

impl Louvain {
    /// Initialize the Louvain algorithm with the given resolution and randomness parameters.
    /// An optional random seed can be supplied, otherwise a seed of 0 will be used.
    pub fn new(resolution: f64, seed: Option<usize>) -> Louvain {
        let seed = seed.unwrap_or_default() as u64;

        Louvain {
            rng: ChaCha20Rng::seed_from_u64(seed),
            local_moving: LocalMoving::new(resolution),
            resolution,
            max_iterations: 20,
        }
    }

    /// Cap on the number of full multilevel passes made by `run`.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Louvain {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Iterate the Louvain algorithm one step. Returns true if cluster labels were updated, otherwise returns false.
    pub fn iterate<C: Clustering>(&mut self, n: &Network, c: &mut C) -> bool {
        // Update the clustering by moving individual nodes between clusters.
        let mut update = self.local_moving.iterate(n, c, &mut self.rng);

        if c.num_clusters() == n.nodes() {
            return update;
        }

        // Aggregate each cluster into one node and cluster the aggregate network.
        let reduced_n = n.create_reduced_network(c);
        let mut reduced_clusters = C::init_different_clusters(reduced_n.nodes());

        update |= self.iterate(&reduced_n, &mut reduced_clusters);

        c.merge_clusters(&reduced_clusters);

        update
    }

    /// Cluster `n` from singletons, repeating multilevel passes until no label changes.
    pub fn run(&mut self, n: &Network) -> SimpleClustering {
        let mut c = SimpleClustering::init_different_clusters(n.nodes());
        for pass in 0..self.max_iterations {
            if !self.iterate(n, &mut c) {
                break;
            }
            info!(
                "louvain pass {}: {} clusters, modularity {:.4}",
                pass + 1,
                c.num_clusters(),
                modularity(self.resolution, n, &c)
            );
        }
        c
    }
}
