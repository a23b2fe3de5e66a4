use crate::curve_fit::find_ab_params;
use crate::embedding::{center, initialize_embedding, random_layout, rescale_with_noise, from_coordinates};
use crate::fuzzy::fuzzy_simplicial_set;
use crate::optimize::{EdgeSchedule, State};
use crate::Q;
use anyhow::{bail, Error};
use log::info;
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::str::FromStr;

/// How the layout is initialized before optimization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMethod {
    /// Spectral layout of the fuzzy graph, falling back to the supplied coordinates
    /// (or random) for large graphs
    Spectral,
    /// First columns of the supplied coordinates (typically PCA)
    Coordinates,
    /// Uniform random
    Random,
}

impl FromStr for InitMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "spectral" => InitMethod::Spectral,
            "pca" | "coordinates" => InitMethod::Coordinates,
            "random" => InitMethod::Random,
            _ => bail!("unknown UMAP initialization '{}'", s),
        })
    }
}

/// UMAP settings
#[derive(Debug, Clone)]
pub struct Umap {
    pub learning_rate: Q,
    pub local_connectivity: Q,
    pub min_dist: Q,
    pub negative_sample_rate: usize,
    pub repulsion_strength: Q,
    pub set_op_mix_ratio: Q,
    pub spread: Q,
    pub init: InitMethod,
    pub n_epochs: Option<usize>,
    pub seed: u64,
    embedded_dim: usize,
}

impl Umap {
    pub fn new(dimensions: usize, min_dist: Q, spread: Q) -> Umap {
        Umap {
            learning_rate: 1.0,
            local_connectivity: 1.0,
            min_dist,
            negative_sample_rate: 5,
            repulsion_strength: 1.0,
            set_op_mix_ratio: 1.0,
            spread,
            init: InitMethod::Spectral,
            n_epochs: None,
            seed: 0,
            embedded_dim: dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.embedded_dim
    }

    /// Number of epochs for optimizing the projection
    pub(crate) fn get_num_epochs(&self, rows: usize) -> usize {
        if let Some(n) = self.n_epochs {
            return n;
        }

        if rows <= 10_000 {
            500
        } else {
            200
        }
    }

    /// Lay out points given their nearest neighbours (n × k, self excluded) and,
    /// optionally, coordinates used for `Coordinates` initialization or as the
    /// large-graph fallback of `Spectral`.
    pub fn fit(
        &self,
        knn_indices: ArrayView2<usize>,
        knn_distances: ArrayView2<Q>,
        init_coords: Option<ArrayView2<Q>>,
    ) -> Result<Array2<Q>, Error> {
        let n = knn_indices.nrows();
        if knn_distances.dim() != knn_indices.dim() {
            bail!(
                "knn indices {:?} and distances {:?} differ in shape",
                knn_indices.dim(),
                knn_distances.dim()
            );
        }
        if self.embedded_dim == 0 {
            bail!("UMAP needs at least one output dimension");
        }
        if n <= self.embedded_dim + 1 {
            bail!("UMAP needs more than {} points, got {}", self.embedded_dim + 1, n);
        }
        if !(self.min_dist >= 0.0 && self.spread > 0.0 && self.min_dist <= self.spread) {
            bail!("UMAP requires 0 <= min_dist <= spread, got {} and {}", self.min_dist, self.spread);
        }
        if self.n_epochs == Some(0) {
            bail!("number of UMAP epochs, if provided, must be greater than 0");
        }
        if let Some(coords) = init_coords {
            if coords.nrows() != n {
                bail!("initial coordinates have {} rows, expected {}", coords.nrows(), n);
            }
        }

        let mut rng = Pcg64Mcg::seed_from_u64(self.seed);
        let n_epochs = self.get_num_epochs(n);

        let graph = fuzzy_simplicial_set(knn_indices, knn_distances, self.local_connectivity, self.set_op_mix_ratio);

        let embedding = match (self.init, init_coords) {
            (InitMethod::Spectral, coords) => initialize_embedding(&graph, self.embedded_dim, coords, &mut rng)?,
            (InitMethod::Coordinates, Some(coords)) => {
                rescale_with_noise(from_coordinates(coords, self.embedded_dim)?, &mut rng)
            }
            (InitMethod::Coordinates, None) => bail!("coordinate initialization needs initial coordinates"),
            (InitMethod::Random, _) => random_layout(n, self.embedded_dim, &mut rng),
        };

        let (a, b) = find_ab_params(self.spread, self.min_dist);
        info!("umap: {} points, {} epochs, a = {:.4}, b = {:.4}", n, n_epochs, a, b);

        let mut state = State::new(
            embedding,
            EdgeSchedule::new(&graph, n_epochs),
            a,
            b,
            self.learning_rate,
            self.repulsion_strength,
            self.negative_sample_rate,
            n_epochs,
            rng,
        );
        state.optimize();

        let mut embedding = state.embedding;
        center(&mut embedding);
        Ok(embedding)
    }
}
