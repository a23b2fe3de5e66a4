//! Graph-based clustering of cells.

use crate::dim_red::X_PCA;
use crate::nn::{connectivities, distance_graph, knn, snn_graph, SnnWeighting};
use anyhow::{bail, Error};
use community::objective::pairwise_modularity;
use community::{Clustering, Louvain, Network, SimpleClustering, Walktrap};
use log::info;
use sc_types::{Categorical, Column, Dataset};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sprs::CsMat;
use std::str::FromStr;

/// obs column holding cluster labels
pub const CLUSTER: &str = "cluster";
/// obsp keys of the cell graphs
pub const SNN: &str = "snn";
pub const CONNECTIVITIES: &str = "connectivities";
pub const DISTANCES: &str = "distances";

/// Community detection algorithm
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClusterMethod {
    Walktrap { steps: usize },
    Louvain { resolution: f64, seed: u64 },
}

impl Default for ClusterMethod {
    fn default() -> Self {
        ClusterMethod::Walktrap {
            steps: community::walktrap::DEFAULT_STEPS,
        }
    }
}

impl FromStr for ClusterMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "walktrap" => ClusterMethod::default(),
            "louvain" => ClusterMethod::Louvain {
                resolution: community::louvain::DEFAULT_RESOLUTION,
                seed: 0,
            },
            _ => bail!("clustering method not recognized: {}", s),
        })
    }
}

/// Undirected network from a symmetric sparse graph; each edge is taken once from
/// the upper triangle.
pub fn to_network(graph: &CsMat<f64>) -> Result<Network, Error> {
    if graph.rows() != graph.cols() {
        bail!("cell graph must be square, got {}x{}", graph.rows(), graph.cols());
    }
    let edges = graph
        .iter()
        .filter(|&(_, (i, j))| i < j)
        .map(|(&w, (i, j))| (i, j, w))
        .collect::<Vec<_>>();
    Ok(Network::from_edges(graph.rows(), edges))
}

/// Relabel so that cluster 0 is the largest.
pub fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let mut clustering = SimpleClustering::new_from_labels(labels);
    clustering.sort_by_size();
    clustering.into_labels()
}

/// Cluster the nodes of a symmetric weighted graph. Every node receives a label and
/// labels are ordered by decreasing cluster size.
pub fn cluster_graph(graph: &CsMat<f64>, method: &ClusterMethod) -> Result<Vec<usize>, Error> {
    let network = to_network(graph)?;
    if network.nodes() == 0 {
        bail!("cannot cluster an empty graph");
    }
    let mut clustering = match method {
        ClusterMethod::Walktrap { steps } => {
            if *steps == 0 {
                bail!("walktrap needs at least one step");
            }
            Walktrap::new(*steps).run(&network)
        }
        ClusterMethod::Louvain { resolution, seed } => {
            if !(*resolution > 0.0) {
                bail!("Louvain resolution must be positive, got {}", resolution);
            }
            Louvain::new(*resolution, Some(*seed as usize)).run(&network)
        }
    };
    clustering.sort_by_size();
    Ok(clustering.into_labels())
}

/// Clustering settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterParams {
    /// obsm embedding the graph is built on
    pub use_rep: String,
    pub k: usize,
    pub weighting: SnnWeighting,
    pub method: ClusterMethod,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            use_rep: X_PCA.to_string(),
            k: 10,
            weighting: SnnWeighting::Rank,
            method: ClusterMethod::default(),
        }
    }
}

/// Build the kNN, SNN and connectivity graphs on an embedding, cluster the SNN graph
/// and store the labels (obs `cluster`), the graphs (obsp `snn`, `connectivities`,
/// `distances`) and the pairwise modularity ratios (uns `pairwise_modularity`).
pub fn cluster_cells(dataset: &mut Dataset, params: &ClusterParams) -> Result<Vec<usize>, Error> {
    let embedding = dataset.obsm(&params.use_rep)?;
    let neighbors = knn(&embedding.view(), params.k)?;
    let snn = snn_graph(&neighbors, params.weighting)?;
    let labels = cluster_graph(&snn, &params.method)?;

    let network = to_network(&snn)?;
    let ratios = pairwise_modularity(&network, &SimpleClustering::new_from_labels(&labels));
    let sizes = Categorical::from_assignments(&labels).counts();
    info!("{} clusters, sizes {:?}", sizes.len(), sizes);

    dataset.insert_obsp(DISTANCES, distance_graph(&neighbors))?;
    dataset.insert_obsp(CONNECTIVITIES, connectivities(&neighbors))?;
    dataset.insert_obsp(SNN, snn)?;
    dataset
        .obs_mut()
        .insert(CLUSTER, Column::Categorical(Categorical::from_assignments(&labels)))?;
    dataset.insert_uns("pairwise_modularity", json!(ratios));
    dataset.insert_uns(
        "neighbors",
        json!({
            "use_rep": params.use_rep,
            "k": params.k,
            "weighting": params.weighting,
            "method": params.method,
        }),
    );
    Ok(labels)
}
