#![allow(non_snake_case)]

//! Principal component analysis of log-expression.
//!
//! The SVD back-ends are written against the small `DataMat` trait and ndarray's
//! `Dot`, so the same code runs on an owned matrix or a view. A back-end always
//! computes the plain truncated SVD of what it is given; PCA is obtained by centring
//! the cells × genes matrix first.

use crate::normalization::LOGCOUNTS;
use anyhow::{bail, Error};
use log::info;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use sc_types::matrix::to_dense_cells_by_genes;
use sc_types::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

/// Deterministic full SVD
pub mod exact;

/// Randomized SVD method
pub mod rand_svd;

/// Choosing how many components to keep
pub mod choose;

/// obsm key of the cell embedding
pub const X_PCA: &str = "X_pca";
/// varm key of the gene loadings
pub const PCS: &str = "PCs";

/// (U, singular values, V) with V holding one column per component
type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Trait for getting the dimensions of a matrix
pub trait DataMat {
    /// Get the shape of the matrix
    fn shape(&self) -> [usize; 2];
}

impl DataMat for ArrayView2<'_, f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

impl DataMat for Array2<f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

/// Perform a truncated SVD of a matrix, retaining `k` components.
pub trait Pca<T> {
    /// Compute a rank `k` SVD of `matrix`
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error>;
}

/// SVD back-end used for PCA
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PcaAlgorithm {
    Exact,
    Randomized { seed: u64, n_iter: usize },
}

impl Default for PcaAlgorithm {
    fn default() -> Self {
        PcaAlgorithm::Randomized { seed: 0, n_iter: 4 }
    }
}

impl FromStr for PcaAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "exact" => PcaAlgorithm::Exact,
            "randomized" | "rand" => PcaAlgorithm::default(),
            _ => bail!("PCA algorithm not recognized: {}", s),
        })
    }
}

/// Result of a PCA
#[derive(Clone, Debug)]
pub struct PcaOutput {
    /// cells × k coordinates
    pub embedding: Array2<f64>,
    /// genes × k loadings
    pub loadings: Array2<f64>,
    /// variance explained by each component
    pub variance: Array1<f64>,
    /// fraction of the total variance explained by each component
    pub variance_ratio: Array1<f64>,
    /// summed per-gene variance of the input
    pub total_variance: f64,
}

impl PcaOutput {
    /// Keep only the first `d` components.
    pub fn truncate(&self, d: usize) -> PcaOutput {
        let d = d.min(self.variance.len());
        PcaOutput {
            embedding: self.embedding.slice(ndarray::s![.., ..d]).to_owned(),
            loadings: self.loadings.slice(ndarray::s![.., ..d]).to_owned(),
            variance: self.variance.slice(ndarray::s![..d]).to_owned(),
            variance_ratio: self.variance_ratio.slice(ndarray::s![..d]).to_owned(),
            total_variance: self.total_variance,
        }
    }
}

/// Flip each component so its largest-magnitude loading is positive, making the
/// output independent of the SVD back-end's sign convention.
fn flip_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for j in 0..v.ncols() {
        let pivot = v
            .column(j)
            .iter()
            .copied()
            .fold(0.0f64, |best, x| if x.abs() > best.abs() { x } else { best });
        if pivot < 0.0 {
            v.column_mut(j).mapv_inplace(|x| -x);
            u.column_mut(j).mapv_inplace(|x| -x);
        }
    }
}

/// PCA of a cells × genes matrix; columns are centred here. `k` must not exceed
/// the smaller dimension.
pub fn pca(data: ArrayView2<f64>, k: usize, algorithm: &PcaAlgorithm) -> Result<PcaOutput, Error> {
    let (n_cells, n_genes) = data.dim();
    if k == 0 {
        bail!("PCA needs at least one component");
    }
    if k > n_cells.min(n_genes) {
        bail!(
            "cannot compute {} components from {} cells x {} genes",
            k,
            n_cells,
            n_genes
        );
    }
    if n_cells < 2 {
        bail!("PCA needs at least 2 cells");
    }
    let means = data.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(n_genes));
    let centered = &data - &means.insert_axis(Axis(0));
    let dof = (n_cells - 1) as f64;
    let total_variance = centered.iter().map(|v| v * v).sum::<f64>() / dof;

    let (mut u, s, mut v) = match algorithm {
        PcaAlgorithm::Exact => exact::ExactSvd.run_pca(&centered, k)?,
        PcaAlgorithm::Randomized { seed, n_iter } => rand_svd::RandSvd {
            n_iter: *n_iter,
            seed: *seed,
            ..rand_svd::RandSvd::default()
        }
        .run_pca(&centered, k)?,
    };
    flip_signs(&mut u, &mut v);

    let embedding = &u * &s.view().insert_axis(Axis(0));
    let variance = s.mapv(|x| x * x / dof);
    let variance_ratio = if total_variance > 0.0 {
        &variance / total_variance
    } else {
        Array1::zeros(k)
    };
    info!(
        "PCA of {} cells x {} genes: {} components explain {:.1}% of the variance",
        n_cells,
        n_genes,
        k,
        100.0 * variance_ratio.sum()
    );
    Ok(PcaOutput {
        embedding,
        loadings: v,
        variance,
        variance_ratio,
        total_variance,
    })
}

/// PCA of the `logcounts` of the given genes.
pub fn run_pca(dataset: &Dataset, genes: &[usize], k: usize, algorithm: &PcaAlgorithm) -> Result<PcaOutput, Error> {
    if genes.is_empty() {
        bail!("PCA needs at least one gene");
    }
    let data = to_dense_cells_by_genes(dataset.layer(LOGCOUNTS)?, Some(genes));
    pca(data.view(), k, algorithm)
}

/// Store a PCA as obsm `X_pca`, varm `PCs` (zero rows for genes outside `genes`) and
/// uns `pca`.
pub fn store_pca(dataset: &mut Dataset, genes: &[usize], output: &PcaOutput) -> Result<(), Error> {
    let k = output.variance.len();
    if output.loadings.nrows() != genes.len() {
        bail!("{} loading rows for {} genes", output.loadings.nrows(), genes.len());
    }
    let mut loadings = Array2::<f64>::zeros((dataset.n_genes(), k));
    for (row, &g) in genes.iter().enumerate() {
        loadings.row_mut(g).assign(&output.loadings.row(row));
    }
    dataset.insert_obsm(X_PCA, output.embedding.clone())?;
    dataset.insert_varm(PCS, loadings)?;
    dataset.insert_uns(
        "pca",
        json!({
            "n_components": k,
            "variance": output.variance.to_vec(),
            "variance_ratio": output.variance_ratio.to_vec(),
            "total_variance": output.total_variance,
        }),
    );
    Ok(())
}
