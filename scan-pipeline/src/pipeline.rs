//! The end-to-end analysis: quality control, normalization, feature selection,
//! PCA, clustering, UMAP, markers and, for datasets with spliced and unspliced
//! counts, velocity and fate. Every stage records its results on the dataset.

use crate::cluster::{cluster_cells, ClusterParams, CLUSTER};
use crate::dim_red::choose::{choose_components, ComponentChoice, StabilityParams};
use crate::dim_red::{run_pca, store_pca, PcaAlgorithm};
use crate::embedding::{run_umap, UmapParams};
use crate::export::{write_dataset, write_markers};
use crate::hvg::{mark_hvgs, HvgPolicy};
use crate::loader::{DatasetRegistry, SPLICED, UNSPLICED};
use crate::markers::{find_dataset_markers, MarkerSettings};
use crate::normalization::{normalize, NormalizationParams};
use crate::qc::{filter_outlier_cells, filter_rare_labels, QcParams, RareLabelFilter};
use crate::variance::{model_dataset_gene_var, VarianceParams};
use crate::velocity::{run_fate, run_velocity, FateParams, VelocityParams};
use anyhow::{bail, Context, Error};
use diff_exp::markers::GroupMarkers;
use log::{info, warn};
use sc_types::Dataset;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Settings of every stage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineParams {
    /// outlier filtering, skipped when `None`
    pub qc: Option<QcParams>,
    pub rare_labels: Option<RareLabelFilter>,
    pub normalization: NormalizationParams,
    pub variance: VarianceParams,
    pub hvg: HvgPolicy,
    /// principal components computed before the component choice
    pub n_pcs: usize,
    pub pca_algorithm: PcaAlgorithm,
    pub components: ComponentChoice,
    pub cluster: ClusterParams,
    pub umap: Option<UmapParams>,
    pub markers: Option<MarkerSettings>,
    /// run when the spliced and unspliced layers are present
    pub velocity: Option<VelocityParams>,
    /// needs `velocity`
    pub fate: Option<FateParams>,
}

impl Default for PipelineParams {
    fn default() -> Self {
        PipelineParams {
            qc: Some(QcParams::default()),
            rare_labels: None,
            normalization: NormalizationParams::default(),
            variance: VarianceParams::default(),
            hvg: HvgPolicy::default(),
            n_pcs: 50,
            pca_algorithm: PcaAlgorithm::default(),
            components: ComponentChoice::default(),
            cluster: ClusterParams::default(),
            umap: Some(UmapParams::default()),
            markers: Some(MarkerSettings::default()),
            velocity: Some(VelocityParams::default()),
            fate: Some(FateParams::default()),
        }
    }
}

impl PipelineParams {
    /// Read settings from a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<PipelineParams, Error> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing {}", path.display()))
    }
}

/// What the pipeline produced, beyond what is stored on the dataset
#[derive(Clone, Debug)]
pub struct PipelineOutput {
    pub dataset: Dataset,
    pub n_hvgs: usize,
    pub n_components: usize,
    pub n_clusters: usize,
    pub markers: Vec<GroupMarkers>,
    /// names of the fate lineages, when fate was computed
    pub lineages: Option<Vec<String>>,
}

/// Run every configured stage on a loaded dataset.
pub fn run(dataset: Dataset, params: &PipelineParams) -> Result<PipelineOutput, Error> {
    let mut dataset = dataset;
    if let Some(filter) = &params.rare_labels {
        dataset = filter_rare_labels(&dataset, filter)?;
    }
    if let Some(qc) = &params.qc {
        dataset = filter_outlier_cells(&mut dataset, qc)?;
    }
    if dataset.n_cells() < 3 {
        bail!("{} cells left after filtering, need at least 3", dataset.n_cells());
    }

    normalize(&mut dataset, &params.normalization)?;
    let stats = model_dataset_gene_var(&mut dataset, &params.variance)?;
    let hvgs = mark_hvgs(&mut dataset, &stats, &params.hvg)?;

    let k = params.n_pcs.min(hvgs.len()).min(dataset.n_cells());
    let pca = run_pca(&dataset, &hvgs, k, &params.pca_algorithm)?;
    let technical = hvgs.iter().map(|&g| stats.tech[g]).sum::<f64>();
    let max_neighbors = dataset.n_cells() - 1;
    let components = match &params.components {
        ComponentChoice::ClusterStability(stability) => ComponentChoice::ClusterStability(StabilityParams {
            k: stability.k.min(max_neighbors),
            ..stability.clone()
        }),
        other => other.clone(),
    };
    let d = choose_components(&pca, &components, Some(technical))?;
    store_pca(&mut dataset, &hvgs, &pca.truncate(d))?;

    if params.cluster.k > max_neighbors {
        warn!("{} cells, clustering with {} neighbours", dataset.n_cells(), max_neighbors);
    }
    let cluster = ClusterParams {
        k: params.cluster.k.min(max_neighbors),
        ..params.cluster.clone()
    };
    let labels = cluster_cells(&mut dataset, &cluster)?;
    let n_clusters = labels.iter().max().map_or(0, |&m| m + 1);

    if let Some(umap) = &params.umap {
        run_umap(&mut dataset, umap)?;
    }
    let markers = match &params.markers {
        Some(settings) if n_clusters > 1 || settings.groupby != CLUSTER => {
            find_dataset_markers(&mut dataset, settings)?
        }
        Some(_) => {
            warn!("a single cluster, skipping marker detection");
            Vec::new()
        }
        None => Vec::new(),
    };

    let mut lineages = None;
    let has_velocity_layers = dataset.has_layer(SPLICED) && dataset.has_layer(UNSPLICED);
    match (&params.velocity, has_velocity_layers) {
        (Some(velocity), true) => {
            run_velocity(&mut dataset, velocity)?;
            if let Some(fate) = &params.fate {
                let result = run_fate(&mut dataset, fate)?;
                lineages = Some(result.terminal.iter().map(|&t| result.names[t].clone()).collect());
            }
        }
        (Some(_), false) => info!("no spliced/unspliced layers, skipping velocity"),
        (None, _) => {}
    }

    info!(
        "{}: {} cells, {} HVGs, {} components, {} clusters",
        dataset.name(),
        dataset.n_cells(),
        hvgs.len(),
        d,
        n_clusters
    );
    Ok(PipelineOutput {
        dataset,
        n_hvgs: hvgs.len(),
        n_components: d,
        n_clusters,
        markers,
        lineages,
    })
}

/// Write the dataset and the marker tables into `dir`, plus `<name>.h5ad` when
/// built with hdf5 support.
pub fn write_output(output: &PipelineOutput, dir: &Path) -> Result<(), Error> {
    write_dataset(&output.dataset, dir)?;
    write_markers(&output.markers, output.dataset.gene_names(), dir)?;
    #[cfg(feature = "hdf5")]
    crate::h5ad::write_h5ad(&output.dataset, &dir.join(format!("{}.h5ad", output.dataset.name())))?;
    Ok(())
}

/// Load a registered dataset, run the pipeline and write the results. A dataset
/// with a curated label column gets its rare labels filtered on that column unless
/// the settings name another one.
pub fn run_registered(
    registry: &DatasetRegistry,
    id: &str,
    params: &PipelineParams,
    out_dir: &Path,
) -> Result<PipelineOutput, Error> {
    let descriptor = registry.descriptor(id)?;
    let dataset = registry.load(id)?;
    let mut params = params.clone();
    if let (Some(filter), Some(column)) = (&mut params.rare_labels, &descriptor.label_column) {
        if filter.column == RareLabelFilter::default().column {
            filter.column = column.clone();
        }
    }
    let output = run(dataset, &params)?;
    write_output(&output, out_dir)?;
    Ok(output)
}
