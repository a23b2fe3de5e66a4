use crate::cluster::{cluster_graph, relabel_by_size, ClusterMethod};
use crate::dim_red::{pca, PcaAlgorithm};
use crate::nn::{knn, snn_graph, SnnWeighting};
use crate::stats::median;
use anyhow::{bail, Error};
use log::{debug, info, warn};
use ndarray::prelude::*;
use ndarray_linalg::Solve;
use sc_types::dataset::COUNTS;
use sc_types::matrix::{col_sums, map_entries, row_mean_var, to_dense_cells_by_genes};
use sc_types::{Column, Dataset, Layer};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Name of the log-normalized layer
pub const LOGCOUNTS: &str = "logcounts";
/// obs column holding the size factors
pub const SIZE_FACTOR: &str = "size_factor";

/// How per-cell size factors are computed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SizeFactors {
    /// total counts scaled to mean 1
    LibrarySize,
    /// pooling deconvolution over cells of similar library size
    Deconvolution(DeconvolutionParams),
    /// taken from a numeric obs column
    Explicit { column: String },
}

impl FromStr for SizeFactors {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "library" | "librarysize" => Ok(SizeFactors::LibrarySize),
            "deconvolution" | "pooled" => Ok(SizeFactors::Deconvolution(DeconvolutionParams::default())),
            _ => match s.strip_prefix("column:") {
                Some(column) => Ok(SizeFactors::Explicit {
                    column: column.to_string(),
                }),
                None => bail!("size factor method not recognized: {}", s),
            },
        }
    }
}

/// Where deconvolution gets its cell groups from
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PreClustering {
    /// all cells pooled together
    None,
    /// a categorical obs column
    Column(String),
    /// quick graph-based clustering of the counts
    Quick(QuickClusterParams),
}

/// Settings for deconvolution size factors
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionParams {
    /// pool sizes; sizes larger than a cluster are skipped for that cluster
    pub sizes: Vec<usize>,
    /// genes with a lower average count in a cluster are not used for it
    pub min_mean: f64,
    pub clusters: PreClustering,
}

impl Default for DeconvolutionParams {
    fn default() -> Self {
        DeconvolutionParams {
            sizes: (21..=101).step_by(5).collect(),
            min_mean: 0.1,
            clusters: PreClustering::Quick(QuickClusterParams::default()),
        }
    }
}

/// Settings for the pre-clustering that stabilizes deconvolution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickClusterParams {
    pub n_pcs: usize,
    pub k: usize,
    /// clusters smaller than this are merged into the nearest one
    pub min_size: usize,
    pub method: ClusterMethod,
    pub seed: u64,
}

impl Default for QuickClusterParams {
    fn default() -> Self {
        QuickClusterParams {
            n_pcs: 20,
            k: 10,
            min_size: 100,
            method: ClusterMethod::Walktrap { steps: 4 },
            seed: 0,
        }
    }
}

/// Normalization settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationParams {
    pub size_factors: SizeFactors,
    pub pseudo_count: f64,
}

impl Default for NormalizationParams {
    fn default() -> Self {
        NormalizationParams {
            size_factors: SizeFactors::LibrarySize,
            pseudo_count: 1.0,
        }
    }
}

/// Total counts per cell divided by their mean.
pub fn library_size_factors(counts: &Layer) -> Array1<f64> {
    let totals = col_sums(counts);
    let mean = totals.mean().unwrap_or(0.0);
    if mean > 0.0 {
        totals / mean
    } else {
        totals
    }
}

/// Reject non-finite or non-positive factors and centre the rest to mean 1.
pub fn center_size_factors(mut size_factors: Array1<f64>) -> Result<Array1<f64>, Error> {
    let bad = size_factors.iter().filter(|&&s| !(s.is_finite() && s > 0.0)).count();
    if bad > 0 {
        bail!(
            "{} of {} cells have a non-finite or non-positive size factor",
            bad,
            size_factors.len()
        );
    }
    let mean = size_factors.sum() / size_factors.len() as f64;
    size_factors /= mean;
    Ok(size_factors)
}

/// Order cells for pooling: ascending library size on even ranks, then descending on
/// odd ranks, so every window of the ring mixes small and large libraries.
fn ring_order(lib_sizes: &[f64]) -> Vec<usize> {
    let mut order = (0..lib_sizes.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| lib_sizes[a].total_cmp(&lib_sizes[b]).then(a.cmp(&b)));
    let mut ring = order.iter().step_by(2).copied().collect::<Vec<_>>();
    let odd = order.iter().skip(1).step_by(2).copied().collect::<Vec<_>>();
    ring.extend(odd.into_iter().rev());
    ring
}

/// Deconvolved factors for one group of cells, relative to their library sizes.
/// `expr` is genes × cells of counts divided by library size. Returns theta, with
/// size factor = theta * library size.
fn pooled_factors(expr: ArrayView2<f64>, lib_sizes: &[f64], sizes: &[usize]) -> Result<Array1<f64>, Error> {
    let (n_genes, n_cells) = expr.dim();
    let ave = expr.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n_genes));
    let ring = ring_order(lib_sizes);

    let mut ata = Array2::<f64>::zeros((n_cells, n_cells));
    let mut atb = Array1::<f64>::zeros(n_cells);
    let mut pooled = Array1::<f64>::zeros(n_genes);
    let mut ratios = vec![0.0; n_genes];

    for &size in sizes {
        pooled.fill(0.0);
        for &c in &ring[..size] {
            pooled += &expr.column(c);
        }
        for start in 0..n_cells {
            if start > 0 {
                pooled -= &expr.column(ring[start - 1]);
                pooled += &expr.column(ring[(start + size - 1) % n_cells]);
            }
            for (r, (&p, &a)) in ratios.iter_mut().zip(pooled.iter().zip(&ave)) {
                *r = p / a;
            }
            let rhs = median(&ratios)?;
            let members = (0..size).map(|t| ring[(start + t) % n_cells]).collect::<Vec<_>>();
            for &i in &members {
                for &j in &members {
                    ata[(i, j)] += 1.0;
                }
                atb[i] += rhs;
            }
        }
    }

    // weakly anchor every cell to its own ratio so the system is well posed
    let weight = 1e-6;
    for c in 0..n_cells {
        for (r, (&e, &a)) in ratios.iter_mut().zip(expr.column(c).iter().zip(&ave)) {
            *r = e / a;
        }
        ata[(c, c)] += weight;
        atb[c] += weight * median(&ratios)?;
    }

    Ok(ata.solve_into(atb)?)
}

/// Pooled-deconvolution size factors. Within each cluster, cells are pooled in
/// windows of the library-size ring, a pool's factor is the median ratio of its summed
/// expression to the cluster's average cell, and per-cell factors solve the resulting
/// linear system. Clusters are then rescaled against the cluster of median library
/// size. The result is not centred.
pub fn deconvolution_size_factors(
    counts: &Layer,
    clusters: Option<&[usize]>,
    params: &DeconvolutionParams,
) -> Result<Array1<f64>, Error> {
    let n_cells = counts.cols();
    let lib_sizes = col_sums(counts);
    if let Some(c) = lib_sizes.iter().position(|&l| l <= 0.0) {
        bail!("cell {} has no counts; deconvolution needs positive library sizes", c);
    }
    let assignments = match clusters {
        Some(c) if c.len() != n_cells => bail!("{} cluster labels for {} cells", c.len(), n_cells),
        Some(c) => c.to_vec(),
        None => vec![0; n_cells],
    };
    let n_clusters = assignments.iter().max().map_or(0, |&m| m + 1);
    let members = (0..n_clusters)
        .map(|k| (0..n_cells).filter(|&c| assignments[c] == k).collect::<Vec<_>>())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>();

    // cells x genes
    let dense = to_dense_cells_by_genes(counts, None);
    let mut size_factors = Array1::<f64>::zeros(n_cells);
    let mut libraries = Vec::with_capacity(members.len());

    for cells in &members {
        let libs = cells.iter().map(|&c| lib_sizes[c]).collect::<Vec<_>>();
        let mean_lib = libs.iter().sum::<f64>() / libs.len() as f64;
        let scaled = Array2::from_shape_fn((counts.rows(), cells.len()), |(g, j)| dense[(cells[j], g)] / libs[j]);
        let ave = scaled.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(counts.rows()));
        let genes = (0..counts.rows())
            .filter(|&g| ave[g] * mean_lib >= params.min_mean && ave[g] > 0.0)
            .collect::<Vec<_>>();
        let sizes = params
            .sizes
            .iter()
            .copied()
            .filter(|&s| s >= 1 && s <= cells.len())
            .collect::<Vec<_>>();

        if sizes.is_empty() || genes.is_empty() {
            warn!(
                "cluster of {} cells is too small or too sparse for pooling, using library sizes",
                cells.len()
            );
            for (&c, &l) in cells.iter().zip(&libs) {
                size_factors[c] = l / mean_lib;
            }
        } else {
            let theta = pooled_factors(scaled.select(Axis(0), &genes).view(), &libs, &sizes)?;
            for (j, &c) in cells.iter().enumerate() {
                size_factors[c] = theta[j] * libs[j];
            }
        }
        debug!("pooled {} cells over {} genes", cells.len(), genes.len());
        libraries.push(mean_lib);
    }

    if members.len() > 1 {
        // average cell of each cluster after within-cluster normalization; the median
        // ratio to the reference cluster (median library size) aligns the clusters
        let pseudo_cells = members
            .iter()
            .map(|cells| {
                Array1::from_shape_fn(counts.rows(), |g| {
                    cells.iter().map(|&c| dense[(c, g)] / size_factors[c]).sum::<f64>() / cells.len() as f64
                })
            })
            .collect::<Vec<_>>();
        let mut by_lib = (0..members.len()).collect::<Vec<_>>();
        by_lib.sort_by(|&a, &b| libraries[a].total_cmp(&libraries[b]));
        let reference = by_lib[by_lib.len() / 2];
        for (k, cells) in members.iter().enumerate() {
            if k == reference {
                continue;
            }
            let ratios = pseudo_cells[k]
                .iter()
                .zip(&pseudo_cells[reference])
                .filter(|(&a, &r)| a > 0.0 && r > 0.0 && a.is_finite() && r.is_finite())
                .map(|(&a, &r)| a / r)
                .collect::<Vec<_>>();
            let scale = if ratios.is_empty() {
                warn!("cluster {} shares no expressed genes with the reference cluster", k);
                1.0
            } else {
                median(&ratios)?
            };
            for &c in cells {
                size_factors[c] *= scale;
            }
        }
    }
    Ok(size_factors)
}

/// Quick clustering of raw counts to group similar cells before deconvolution:
/// log library-size normalization, PCA, SNN graph and community detection, with
/// clusters below `min_size` merged into the cluster with the closest centroid.
pub fn quick_cluster(counts: &Layer, params: &QuickClusterParams) -> Result<Vec<usize>, Error> {
    let n_cells = counts.cols();
    if n_cells < 2 * params.min_size.max(1) {
        info!("quick cluster: {} cells is too few to split, using one cluster", n_cells);
        return Ok(vec![0; n_cells]);
    }

    let sf = center_size_factors(library_size_factors(counts))?;
    let logged = log_normalize(counts, sf.view(), 1.0)?;
    let data = to_dense_cells_by_genes(&logged, None);
    let k_pcs = params.n_pcs.min(n_cells - 1).min(counts.rows());
    let pcs = pca(
        data.view(),
        k_pcs,
        &PcaAlgorithm::Randomized {
            seed: params.seed,
            n_iter: 4,
        },
    )?
    .embedding;

    let neighbors = knn(&pcs.view(), params.k.min(n_cells - 1))?;
    let graph = snn_graph(&neighbors, SnnWeighting::Rank)?;
    let mut labels = cluster_graph(&graph, &params.method)?;

    loop {
        let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);
        let mut sizes = vec![0usize; n_clusters];
        for &l in &labels {
            sizes[l] += 1;
        }
        let smallest = (0..n_clusters).min_by_key(|&k| (sizes[k], k));
        let Some(smallest) = smallest else { break };
        if n_clusters < 2 || sizes[smallest] >= params.min_size {
            break;
        }

        let dim = pcs.ncols();
        let mut centroids = Array2::<f64>::zeros((n_clusters, dim));
        for (c, &l) in labels.iter().enumerate() {
            centroids.row_mut(l).scaled_add(1.0 / sizes[l] as f64, &pcs.row(c));
        }
        let target = (0..n_clusters)
            .filter(|&k| k != smallest)
            .min_by(|&a, &b| {
                let da = (&centroids.row(a) - &centroids.row(smallest)).mapv(|v| v * v).sum();
                let db = (&centroids.row(b) - &centroids.row(smallest)).mapv(|v| v * v).sum();
                da.total_cmp(&db)
            })
            .unwrap_or(smallest);
        debug!("merging cluster of {} cells into cluster {}", sizes[smallest], target);
        for l in labels.iter_mut() {
            if *l == smallest {
                *l = target;
            }
        }
        labels = relabel_by_size(&labels);
    }

    info!(
        "quick cluster: {} clusters",
        labels.iter().max().map_or(0, |&m| m + 1)
    );
    Ok(labels)
}

/// `log2(count / size_factor + pseudo_count)`. With a pseudo-count of 1 zeros stay
/// implicit; any other pseudo-count produces a fully stored layer.
pub fn log_normalize(counts: &Layer, size_factors: ArrayView1<f64>, pseudo_count: f64) -> Result<Layer, Error> {
    if size_factors.len() != counts.cols() {
        bail!("{} size factors for {} cells", size_factors.len(), counts.cols());
    }
    if !(pseudo_count > 0.0) {
        bail!("pseudo-count must be positive, got {}", pseudo_count);
    }
    if pseudo_count == 1.0 {
        return Ok(map_entries(counts, |_, c, v| (v / size_factors[c] + 1.0).log2()));
    }
    let mut dense = to_dense_cells_by_genes(counts, None);
    for ((c, _), v) in dense.indexed_iter_mut() {
        *v = (*v / size_factors[c] + pseudo_count).log2();
    }
    Ok(sc_types::matrix::from_dense_cells_by_genes(dense.view()))
}

/// Compute size factors, store them in obs `size_factor` and the log-normalized
/// counts as the `logcounts` layer.
pub fn normalize(dataset: &mut Dataset, params: &NormalizationParams) -> Result<Array1<f64>, Error> {
    let counts = dataset.layer(COUNTS)?;
    let raw = match &params.size_factors {
        SizeFactors::LibrarySize => library_size_factors(counts),
        SizeFactors::Explicit { column } => dataset.obs().numeric(column)?.clone(),
        SizeFactors::Deconvolution(p) => {
            let clusters = match &p.clusters {
                PreClustering::None => None,
                PreClustering::Column(name) => {
                    let labels = dataset.obs().categorical(name)?;
                    if labels.n_missing() > 0 {
                        bail!("pre-clustering column '{}' has {} missing labels", name, labels.n_missing());
                    }
                    Some(labels.codes.iter().flatten().map(|&c| c as usize).collect::<Vec<_>>())
                }
                PreClustering::Quick(q) => Some(quick_cluster(counts, q)?),
            };
            deconvolution_size_factors(counts, clusters.as_deref(), p)?
        }
    };
    let size_factors = center_size_factors(raw)?;
    let logcounts = log_normalize(counts, size_factors.view(), params.pseudo_count)?;

    let (means, _) = row_mean_var(&logcounts);
    info!(
        "normalized {} cells: size factors in [{:.3}, {:.3}], mean log-expression {:.3}",
        size_factors.len(),
        size_factors.iter().copied().fold(f64::INFINITY, f64::min),
        size_factors.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        means.mean().unwrap_or(0.0)
    );

    dataset.insert_layer(LOGCOUNTS, logcounts)?;
    dataset
        .obs_mut()
        .insert(SIZE_FACTOR, Column::Numeric(size_factors.clone()))?;
    Ok(size_factors)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use rand_pcg::Pcg64Mcg;
    use sc_types::matrix::from_dense_cells_by_genes;

    /// Poisson counts with known per-cell depth: cell c has depth 0.5 + (c % 4) * 0.5.
    fn simulated(n_cells: usize, n_genes: usize) -> (Layer, Array1<f64>) {
        let mut rng = Pcg64Mcg::seed_from_u64(3);
        let depth = Array1::from_shape_fn(n_cells, |c| 0.5 + (c % 4) as f64 * 0.5);
        let base = Array1::from_shape_fn(n_genes, |g| 1.0 + (g % 7) as f64);
        let dense = Array2::from_shape_fn((n_cells, n_genes), |(c, g)| {
            Poisson::new(base[g] * depth[c]).unwrap().sample(&mut rng)
        });
        (from_dense_cells_by_genes(dense.view()), depth)
    }

    #[test]
    fn test_center_rejects_bad_factors() {
        let err = center_size_factors(array![1.0, 0.0, f64::NAN, 2.0]).unwrap_err();
        assert!(err.to_string().starts_with("2 of 4 cells"));
        let sf = center_size_factors(array![1.0, 3.0]).unwrap();
        assert_eq!(sf, array![0.5, 1.5]);
    }

    #[test]
    fn test_ring_order() {
        let ring = ring_order(&[5.0, 1.0, 4.0, 2.0, 3.0]);
        // ascending: 1 3 4 2 0
        assert_eq!(ring, vec![1, 4, 0, 2, 3]);
    }

    #[test]
    fn test_deconvolution_tracks_depth() {
        let (counts, depth) = simulated(120, 200);
        let params = DeconvolutionParams {
            sizes: vec![11, 21, 31],
            clusters: PreClustering::None,
            ..DeconvolutionParams::default()
        };
        let sf = center_size_factors(deconvolution_size_factors(&counts, None, &params).unwrap()).unwrap();
        let truth = &depth / depth.mean().unwrap();
        let errors = sf
            .iter()
            .zip(truth.iter())
            .map(|(s, t)| (s - t).abs() / t)
            .collect::<Vec<_>>();
        let mean_error = errors.iter().sum::<f64>() / errors.len() as f64;
        assert!(mean_error < 0.1, "mean relative error {mean_error}");
        assert!(errors.iter().all(|&e| e < 0.35));
        assert_abs_diff_eq!(sf.mean().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_deconvolution_with_clusters() {
        let (counts, _) = simulated(80, 100);
        let clusters = (0..80).map(|c| c / 40).collect::<Vec<_>>();
        let params = DeconvolutionParams {
            sizes: vec![11, 21],
            clusters: PreClustering::None,
            ..DeconvolutionParams::default()
        };
        let sf = deconvolution_size_factors(&counts, Some(&clusters), &params).unwrap();
        assert_eq!(sf.len(), 80);
        assert!(sf.iter().all(|&s| s > 0.0));
        assert!(deconvolution_size_factors(&counts, Some(&clusters[..10]), &params).is_err());
    }

    #[test]
    fn test_normalize_stores_layer_and_factors() {
        let counts = from_dense_cells_by_genes(array![[2.0, 0.0], [6.0, 2.0]].view());
        let mut d = Dataset::new("n", counts, vec!["a".into(), "b".into()], vec!["c1".into(), "c2".into()]).unwrap();
        let sf = normalize(&mut d, &NormalizationParams::default()).unwrap();
        assert_abs_diff_eq!(sf[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(sf[1], 1.6, epsilon = 1e-12);
        let log = d.layer(LOGCOUNTS).unwrap();
        assert_abs_diff_eq!(*log.get(0, 0).unwrap(), (2.0 / sf[0] + 1.0).log2(), epsilon = 1e-12);
        assert_eq!(log.get(1, 0), None);
        assert_eq!(d.obs().numeric(SIZE_FACTOR).unwrap().len(), 2);

        // an explicit column with a zero factor is rejected
        d.obs_mut()
            .insert("sf", Column::Numeric(array![1.0, 0.0]))
            .unwrap();
        let explicit = NormalizationParams {
            size_factors: "column:sf".parse().unwrap(),
            ..NormalizationParams::default()
        };
        assert!(normalize(&mut d, &explicit).is_err());
    }

    #[test]
    fn test_pseudo_count_other_than_one() {
        let counts = from_dense_cells_by_genes(array![[1.0, 0.0]].view());
        let log = log_normalize(&counts, array![1.0].view(), 0.5).unwrap();
        assert_abs_diff_eq!(*log.get(1, 0).unwrap(), (0.5f64).log2(), epsilon = 1e-12);
    }
}
