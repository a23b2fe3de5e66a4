//! Two-dimensional (or n-dimensional) UMAP layout of a cell embedding.

use crate::dim_red::X_PCA;
use crate::nn::knn;
use anyhow::Error;
use log::info;
use ndarray::Array2;
use sc_types::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::json;
use umap_rs::{InitMethod, Umap};

/// obsm key of the layout
pub const X_UMAP: &str = "X_umap";

/// UMAP settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapParams {
    /// obsm embedding the neighbours are found in
    pub use_rep: String,
    pub n_neighbors: usize,
    pub n_components: usize,
    pub min_dist: f64,
    pub spread: f64,
    /// `spectral`, `pca` or `random`
    pub init: String,
    pub n_epochs: Option<usize>,
    pub seed: u64,
}

impl Default for UmapParams {
    fn default() -> Self {
        UmapParams {
            use_rep: X_PCA.to_string(),
            n_neighbors: 15,
            n_components: 2,
            min_dist: 0.5,
            spread: 1.0,
            init: "spectral".to_string(),
            n_epochs: None,
            seed: 0,
        }
    }
}

/// Lay out the cells of `params.use_rep` with UMAP. The embedding itself seeds the
/// `pca` initialization and the large-graph fallback of `spectral`.
pub fn umap_layout(data: &Array2<f64>, params: &UmapParams) -> Result<Array2<f64>, Error> {
    let k = params.n_neighbors.min(data.nrows().saturating_sub(1));
    let neighbors = knn(&data.view(), k)?;
    let mut umap = Umap::new(params.n_components, params.min_dist, params.spread);
    umap.init = params.init.parse::<InitMethod>()?;
    umap.n_epochs = params.n_epochs;
    umap.seed = params.seed;
    umap.fit(neighbors.indices.view(), neighbors.distances.view(), Some(data.view()))
}

/// Compute the layout and store it as obsm `X_umap`.
pub fn run_umap(dataset: &mut Dataset, params: &UmapParams) -> Result<(), Error> {
    let layout = umap_layout(dataset.obsm(&params.use_rep)?, params)?;
    info!("UMAP layout of {} cells in {} dimensions", layout.nrows(), layout.ncols());
    dataset.insert_obsm(X_UMAP, layout)?;
    dataset.insert_uns("umap", json!(params));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test::blobs;

    #[test]
    fn test_layout_dimensions() {
        let (points, truth) = blobs(5);
        for dims in [2, 3] {
            let params = UmapParams {
                n_neighbors: 6,
                n_components: dims,
                n_epochs: Some(100),
                ..UmapParams::default()
            };
            let layout = umap_layout(&points, &params).unwrap();
            assert_eq!(layout.dim(), (points.nrows(), dims));
            assert!(layout.iter().all(|v| v.is_finite()));
            if dims == 2 {
                // blob members land closer to their own centroid than to others
                let centroid = |b: usize| {
                    let members = (0..truth.len()).filter(|&i| truth[i] == b).collect::<Vec<_>>();
                    let mut c = [0.0, 0.0];
                    for &i in &members {
                        c[0] += layout[(i, 0)] / members.len() as f64;
                        c[1] += layout[(i, 1)] / members.len() as f64;
                    }
                    c
                };
                let cs = [centroid(0), centroid(1), centroid(2)];
                for (i, &b) in truth.iter().enumerate() {
                    let d = |c: [f64; 2]| (layout[(i, 0)] - c[0]).powi(2) + (layout[(i, 1)] - c[1]).powi(2);
                    let own = d(cs[b]);
                    assert!((0..3).filter(|&o| o != b).all(|o| d(cs[o]) > own));
                }
            }
        }
        let bad = UmapParams {
            init: "tsne".to_string(),
            ..UmapParams::default()
        };
        assert!(umap_layout(&points, &bad).is_err());
    }
}
