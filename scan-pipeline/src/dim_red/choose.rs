use super::PcaOutput;
use crate::cluster::{cluster_graph, ClusterMethod};
use crate::nn::{knn, snn_graph, SnnWeighting};
use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::{s, ArrayView2};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Settings of the cluster-stability choice
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityParams {
    /// candidate numbers of components
    pub grid: Vec<usize>,
    pub k: usize,
    pub method: ClusterMethod,
}

impl Default for StabilityParams {
    fn default() -> Self {
        StabilityParams {
            grid: (5..=50).step_by(5).collect(),
            k: 10,
            method: ClusterMethod::default(),
        }
    }
}

/// How many principal components to keep
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ComponentChoice {
    /// keep everything computed
    All,
    Fixed(usize),
    /// knee of the variance-explained curve
    Elbow,
    /// largest d whose clustering has at least d + 1 clusters
    ClusterStability(StabilityParams),
    /// smallest d discarding no more than the technical variance
    Denoise { min_rank: usize },
}

impl Default for ComponentChoice {
    fn default() -> Self {
        ComponentChoice::All
    }
}

impl FromStr for ComponentChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "all" => ComponentChoice::All,
            "elbow" => ComponentChoice::Elbow,
            "clusters" | "stability" => ComponentChoice::ClusterStability(StabilityParams::default()),
            "denoise" => ComponentChoice::Denoise { min_rank: 5 },
            _ => match s.strip_prefix("fixed:") {
                Some(n) => ComponentChoice::Fixed(n.parse()?),
                None => bail!("component choice not recognized: {}", s),
            },
        })
    }
}

/// Number of components at the elbow: the point farthest from the straight line
/// joining the first and last variance values. Returns a count (at least 1).
pub fn elbow_point(variance: &[f64]) -> usize {
    let n = variance.len();
    if n < 3 {
        return n.max(1);
    }
    let (x0, y0) = (0.0, variance[0]);
    let (x1, y1) = ((n - 1) as f64, variance[n - 1]);
    let norm = ((x1 - x0) * (x1 - x0) + (y1 - y0) * (y1 - y0)).sqrt();
    let mut best = 0;
    let mut best_dist = f64::NEG_INFINITY;
    for (i, &y) in variance.iter().enumerate() {
        let dist = ((y1 - y0) * i as f64 - (x1 - x0) * (y - y0)).abs() / norm;
        if dist > best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best + 1
}

/// Largest grid value `d` for which clustering the first `d` components yields at
/// least `d + 1` clusters. Falls back to the smallest grid value.
pub fn cluster_stability(embedding: ArrayView2<f64>, params: &StabilityParams) -> Result<usize, Error> {
    let available = embedding.ncols();
    let mut grid = params
        .grid
        .iter()
        .copied()
        .filter(|&d| d >= 1 && d <= available)
        .collect::<Vec<_>>();
    grid.sort_unstable();
    grid.dedup();
    if grid.is_empty() {
        bail!("no candidate component count fits the {} available components", available);
    }

    let mut chosen = None;
    for &d in &grid {
        let sub = embedding.slice(s![.., ..d]);
        let neighbors = knn(&sub, params.k)?;
        let graph = snn_graph(&neighbors, SnnWeighting::Rank)?;
        let labels = cluster_graph(&graph, &params.method)?;
        let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
        debug!("{} components: {} clusters", d, n_clusters);
        if n_clusters > d {
            chosen = Some(d);
        }
    }
    Ok(chosen.unwrap_or(grid[0]))
}

/// Smallest number of components (at least `min_rank`) whose discarded variance
/// does not exceed the total technical variance.
pub fn denoised_rank(variance: &[f64], total_variance: f64, technical: f64, min_rank: usize) -> usize {
    let n = variance.len();
    let lower = min_rank.clamp(1, n.max(1));
    let mut kept = 0.0;
    for (d, v) in variance.iter().enumerate() {
        kept += v;
        if d + 1 >= lower && total_variance - kept <= technical {
            return d + 1;
        }
    }
    n.max(1)
}

/// Apply a component choice to a PCA. `technical` is the summed technical variance
/// of the genes the PCA was run on (needed by `Denoise`).
pub fn choose_components(pca: &PcaOutput, choice: &ComponentChoice, technical: Option<f64>) -> Result<usize, Error> {
    let available = pca.variance.len();
    let d = match choice {
        ComponentChoice::All => available,
        ComponentChoice::Fixed(d) => {
            if *d == 0 || *d > available {
                bail!("cannot keep {} of {} components", d, available);
            }
            *d
        }
        ComponentChoice::Elbow => elbow_point(&pca.variance.to_vec()),
        ComponentChoice::ClusterStability(params) => cluster_stability(pca.embedding.view(), params)?,
        ComponentChoice::Denoise { min_rank } => {
            let Some(technical) = technical else {
                bail!("denoising needs the technical variance of the selected genes");
            };
            denoised_rank(&pca.variance.to_vec(), pca.total_variance, technical, *min_rank)
        }
    };
    info!("keeping {} of {} principal components ({:?})", d, available, choice);
    Ok(d)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::test::blobs;
    use crate::dim_red::{pca, PcaAlgorithm};

    #[test]
    fn test_elbow() {
        let variance = [10.0, 6.0, 2.0, 1.5, 1.2, 1.0, 0.9, 0.8];
        assert_eq!(elbow_point(&variance), 3);
        assert_eq!(elbow_point(&[4.0]), 1);
        assert_eq!(elbow_point(&[]), 1);
    }

    #[test]
    fn test_denoise() {
        let variance = [5.0, 3.0, 1.0, 0.5];
        // total 10: keeping 2 discards 2.0
        assert_eq!(denoised_rank(&variance, 10.0, 2.0, 1), 2);
        assert_eq!(denoised_rank(&variance, 10.0, 2.0, 3), 3);
        assert_eq!(denoised_rank(&variance, 10.0, 0.1, 1), 4);
        assert_eq!(denoised_rank(&variance, 10.0, 100.0, 1), 1);
    }

    #[test]
    fn test_choices_on_blobs() {
        let (points, _) = blobs(4);
        let out = pca(points.view(), 5, &PcaAlgorithm::Exact).unwrap();
        // two directions separate three blobs
        let stability = ComponentChoice::ClusterStability(StabilityParams {
            grid: vec![1, 2, 3, 4, 5],
            k: 6,
            method: ClusterMethod::default(),
        });
        assert_eq!(choose_components(&out, &stability, None).unwrap(), 2);
        assert_eq!(choose_components(&out, &ComponentChoice::All, None).unwrap(), 5);
        assert_eq!(choose_components(&out, &ComponentChoice::Fixed(3), None).unwrap(), 3);
        assert!(choose_components(&out, &ComponentChoice::Fixed(6), None).is_err());
        assert!(choose_components(&out, &ComponentChoice::Denoise { min_rank: 1 }, None).is_err());
        assert_eq!("fixed:7".parse::<ComponentChoice>().unwrap(), ComponentChoice::Fixed(7));
    }
}
