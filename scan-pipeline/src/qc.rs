//! Per-cell quality control and label cleanup.

use crate::stats::median_mad;
use anyhow::{bail, Error};
use log::info;
use ndarray::Array1;
use sc_types::dataset::COUNTS;
use sc_types::matrix::{col_nnz, col_sums};
use sc_types::{Column, Dataset, Layer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-cell QC metrics of a genes × cells count layer.
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetrics {
    pub total_counts: Array1<f64>,
    pub detected_genes: Array1<f64>,
    /// fraction of counts from genes matching a mitochondrial prefix
    pub mito_fraction: Array1<f64>,
}

/// Settings for outlier-based cell filtering
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    /// gene name prefixes identifying mitochondrial genes
    pub mito_prefixes: Vec<String>,
    /// number of MADs beyond which a cell is an outlier
    pub nmads: f64,
}

impl Default for QcParams {
    fn default() -> Self {
        QcParams {
            mito_prefixes: vec!["mt-".to_string(), "MT-".to_string()],
            nmads: 3.0,
        }
    }
}

/// Compute total counts, detected genes and mitochondrial fraction per cell.
pub fn per_cell_qc_metrics(counts: &Layer, gene_names: &[String], mito_prefixes: &[String]) -> QcMetrics {
    let total_counts = col_sums(counts);
    let detected_genes = col_nnz(counts);
    let mut mito = Array1::<f64>::zeros(counts.cols());
    for (g, row) in counts.outer_iterator().enumerate() {
        if mito_prefixes.iter().any(|p| gene_names[g].starts_with(p.as_str())) {
            for (c, &v) in row.iter() {
                mito[c] += v;
            }
        }
    }
    let mito_fraction = mito
        .iter()
        .zip(&total_counts)
        .map(|(&m, &t)| if t > 0.0 { m / t } else { 0.0 })
        .collect();
    QcMetrics {
        total_counts,
        detected_genes,
        mito_fraction,
    }
}

/// Which side of the distribution is flagged
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Lower,
    Higher,
}

/// Flag values more than `nmads` scaled MADs from the median on one side. With a
/// zero MAD only values strictly beyond the median are flagged.
pub fn is_outlier(values: &[f64], nmads: f64, side: Side) -> Result<Vec<bool>, Error> {
    let (center, mad) = median_mad(values)?;
    Ok(values
        .iter()
        .map(|&v| match side {
            Side::Lower => v < center - nmads * mad,
            Side::Higher => v > center + nmads * mad,
        })
        .collect())
}

/// Cells to discard: low log total counts, low log detected genes or high
/// mitochondrial fraction.
pub fn outlier_cells(metrics: &QcMetrics, nmads: f64) -> Result<Vec<bool>, Error> {
    let log_total = metrics.total_counts.iter().map(|&v| (v + 1.0).ln()).collect::<Vec<_>>();
    let log_detected = metrics.detected_genes.iter().map(|&v| (v + 1.0).ln()).collect::<Vec<_>>();
    let low_total = is_outlier(&log_total, nmads, Side::Lower)?;
    let low_detected = is_outlier(&log_detected, nmads, Side::Lower)?;
    let high_mito = is_outlier(&metrics.mito_fraction.to_vec(), nmads, Side::Higher)?;

    let discard = (0..log_total.len())
        .map(|i| low_total[i] || low_detected[i] || high_mito[i])
        .collect::<Vec<_>>();
    info!(
        "qc: {} low total, {} low detected, {} high mito, {} cells discarded",
        low_total.iter().filter(|&&b| b).count(),
        low_detected.iter().filter(|&&b| b).count(),
        high_mito.iter().filter(|&&b| b).count(),
        discard.iter().filter(|&&b| b).count()
    );
    Ok(discard)
}

/// Store QC metrics and the discard flag as obs columns (`total_counts`,
/// `detected_genes`, `mito_fraction`, `qc_discard`).
pub fn add_qc_metrics(dataset: &mut Dataset, params: &QcParams) -> Result<Vec<bool>, Error> {
    let metrics = per_cell_qc_metrics(dataset.layer(COUNTS)?, dataset.gene_names(), &params.mito_prefixes);
    let discard = outlier_cells(&metrics, params.nmads)?;
    let obs = dataset.obs_mut();
    obs.insert("total_counts", Column::Numeric(metrics.total_counts))?;
    obs.insert("detected_genes", Column::Numeric(metrics.detected_genes))?;
    obs.insert("mito_fraction", Column::Numeric(metrics.mito_fraction))?;
    obs.insert("qc_discard", Column::Flag(discard.clone()))?;
    Ok(discard)
}

/// Compute QC metrics and drop outlier cells.
pub fn filter_outlier_cells(dataset: &mut Dataset, params: &QcParams) -> Result<Dataset, Error> {
    let discard = add_qc_metrics(dataset, params)?;
    let keep = (0..discard.len()).filter(|&i| !discard[i]).collect::<Vec<_>>();
    if keep.is_empty() {
        bail!("quality control discarded every cell");
    }
    dataset.subset_cells(&keep)
}

/// Rare-label filter settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RareLabelFilter {
    /// categorical obs column to filter on
    pub column: String,
    /// categories with fewer members are dropped
    pub min_count: usize,
    /// relabel missing values to this category before counting
    pub placeholder: Option<String>,
    /// rename (or merge) categories before counting
    pub rename: BTreeMap<String, String>,
}

impl Default for RareLabelFilter {
    fn default() -> Self {
        RareLabelFilter {
            column: "label".to_string(),
            min_count: 10,
            placeholder: Some("Unknown".to_string()),
            rename: BTreeMap::new(),
        }
    }
}

/// Keep only cells whose label category has at least `min_count` members. Missing
/// labels are filled first when a placeholder is set, otherwise those cells are
/// dropped. Emptied categories are removed from the category list.
pub fn filter_rare_labels(dataset: &Dataset, filter: &RareLabelFilter) -> Result<Dataset, Error> {
    let mut labels = dataset.obs().categorical(&filter.column)?.clone();
    if let Some(placeholder) = &filter.placeholder {
        labels.fill_missing(placeholder);
    }
    if !filter.rename.is_empty() {
        labels.rename(&filter.rename);
    }

    let counts = labels.counts();
    let keep_category = counts.iter().map(|&c| c >= filter.min_count).collect::<Vec<_>>();
    let keep = labels
        .codes
        .iter()
        .enumerate()
        .filter(|(_, c)| c.map_or(false, |c| keep_category[c as usize]))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    if keep.is_empty() {
        bail!(
            "no category of '{}' has at least {} cells",
            filter.column,
            filter.min_count
        );
    }

    let dropped = labels
        .categories
        .iter()
        .zip(&keep_category)
        .filter(|(_, &k)| !k)
        .map(|(c, _)| c.as_str())
        .collect::<Vec<_>>();
    info!(
        "rare label filter on '{}': keeping {} of {} cells, dropping categories {:?}",
        filter.column,
        keep.len(),
        labels.len(),
        dropped
    );

    let mut relabelled = dataset.clone();
    relabelled
        .obs_mut()
        .insert(&filter.column, Column::Categorical(labels))?;
    let mut subset = relabelled.subset_cells(&keep)?;
    let mut kept_labels = subset.obs().categorical(&filter.column)?.clone();
    kept_labels.remove_unused();
    subset
        .obs_mut()
        .insert(&filter.column, Column::Categorical(kept_labels))?;
    Ok(subset)
}

#[cfg(test)]
mod test {
    use super::*;
    use sc_types::matrix::from_dense_cells_by_genes;
    use sc_types::Categorical;
    use ndarray::Array2;

    fn labelled(labels: &[Option<&str>]) -> Dataset {
        let n = labels.len();
        let dense = Array2::from_shape_fn((n, 2), |(c, g)| (c + g + 1) as f64);
        let mut d = Dataset::new(
            "t",
            from_dense_cells_by_genes(dense.view()),
            vec!["a".into(), "b".into()],
            (0..n).map(|i| format!("c{i}")).collect(),
        )
        .unwrap();
        d.obs_mut()
            .insert("label", Column::Categorical(Categorical::from_labels(labels)))
            .unwrap();
        d
    }

    #[test]
    fn test_rare_labels_kept_exactly_by_threshold() {
        let mut labels = vec![Some("big"); 5];
        labels.extend(vec![Some("mid"); 3]);
        labels.push(Some("tiny"));
        labels.extend(vec![None; 3]);
        let d = labelled(&labels);

        let filter = RareLabelFilter {
            min_count: 3,
            ..RareLabelFilter::default()
        };
        let f = filter_rare_labels(&d, &filter).unwrap();
        let kept = f.obs().categorical("label").unwrap();
        assert_eq!(kept.categories, vec!["big", "mid", "Unknown"]);
        assert_eq!(kept.counts(), vec![5, 3, 3]);
        assert_eq!(f.n_cells(), 11);
        assert!(f.cell_names().iter().all(|c| c != "c8"));

        // without a placeholder missing labels are dropped
        let no_fill = RareLabelFilter {
            min_count: 3,
            placeholder: None,
            ..RareLabelFilter::default()
        };
        let f = filter_rare_labels(&d, &no_fill).unwrap();
        assert_eq!(f.n_cells(), 8);
        assert_eq!(f.obs().categorical("label").unwrap().categories, vec!["big", "mid"]);

        // nothing survives
        let strict = RareLabelFilter {
            min_count: 100,
            ..RareLabelFilter::default()
        };
        assert!(filter_rare_labels(&d, &strict).is_err());
    }

    #[test]
    fn test_rename_merges_before_counting() {
        let mut labels = vec![Some("alpha"); 2];
        labels.extend(vec![Some("beta"); 2]);
        labels.push(Some("gamma"));
        let d = labelled(&labels);
        let filter = RareLabelFilter {
            min_count: 4,
            rename: [("alpha", "endocrine"), ("beta", "endocrine")]
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
            ..RareLabelFilter::default()
        };
        let f = filter_rare_labels(&d, &filter).unwrap();
        assert_eq!(f.obs().categorical("label").unwrap().categories, vec!["endocrine"]);
        assert_eq!(f.n_cells(), 4);
    }

    #[test]
    fn test_qc_metrics_and_outliers() {
        // cell 4 is mostly mitochondrial, cell 5 is nearly empty
        let dense = ndarray::array![
            [100.0, 90.0, 5.0],
            [110.0, 95.0, 4.0],
            [90.0, 100.0, 6.0],
            [105.0, 85.0, 5.0],
            [20.0, 10.0, 150.0],
            [1.0, 0.0, 0.0],
        ];
        let mut d = Dataset::new(
            "qc",
            from_dense_cells_by_genes(dense.view()),
            vec!["Actb".into(), "Gapdh".into(), "mt-Co1".into()],
            (0..6).map(|i| format!("c{i}")).collect(),
        )
        .unwrap();
        let metrics = per_cell_qc_metrics(d.layer(COUNTS).unwrap(), d.gene_names(), &QcParams::default().mito_prefixes);
        assert_eq!(metrics.total_counts[0], 195.0);
        assert_eq!(metrics.detected_genes[5], 1.0);
        assert!((metrics.mito_fraction[4] - 150.0 / 180.0).abs() < 1e-12);

        let f = filter_outlier_cells(&mut d, &QcParams::default()).unwrap();
        assert_eq!(d.obs().flag("qc_discard").unwrap(), &[false, false, false, false, true, true]);
        assert_eq!(f.n_cells(), 4);
        assert!(f.obs().numeric("total_counts").is_ok());
    }
}
