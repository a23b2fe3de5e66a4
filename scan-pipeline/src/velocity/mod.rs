//! RNA velocity from spliced and unspliced counts, and cell fate from the resulting
//! Markov chain.

pub mod confidence;
pub mod embedding;
pub mod fate;
pub mod graph;
pub mod moments;
pub mod pseudotime;
pub mod steady_state;

use crate::cluster::CLUSTER;
use crate::dim_red::X_PCA;
use crate::embedding::X_UMAP;
use crate::loader::{SPLICED, UNSPLICED};
use crate::nn::{connectivities, knn};
use anyhow::{bail, Error};
use log::{info, warn};
use ndarray::{Array1, Array2, Axis};
use sc_types::matrix::{from_dense_cells_by_genes, to_dense_cells_by_genes};
use sc_types::{Categorical, Column, Dataset};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const MS: &str = "Ms";
pub const MU: &str = "Mu";
pub const VELOCITY: &str = "velocity";
pub const VELOCITY_GRAPH: &str = "velocity_graph";
pub const TRANSITIONS: &str = "transitions";
pub const VELOCITY_PSEUDOTIME: &str = "velocity_pseudotime";
pub const FATE_PROBABILITIES: &str = "fate_probabilities";
pub const MACROSTATE_MEMBERSHIPS: &str = "macrostate_memberships";

/// Velocity estimation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityParams {
    /// obsm embedding the moment neighbourhoods are found in
    pub use_rep: String,
    pub n_neighbors: usize,
    /// percent of cells at each extreme used for the steady-state fit
    pub perc: f64,
    pub min_r2: f64,
    pub min_gamma: f64,
    /// cosine scale of the transition kernel
    pub scale: f64,
    /// quantile of maximal cosines that sets the self-transitions
    pub self_quantile: f64,
    /// uniform restart probability of the chain used for pseudotime and fate
    pub restart: f64,
    /// obsm embedding the velocities are projected onto, when present
    pub basis: String,
}

impl Default for VelocityParams {
    fn default() -> Self {
        VelocityParams {
            use_rep: X_PCA.to_string(),
            n_neighbors: 30,
            perc: 5.0,
            min_r2: 0.01,
            min_gamma: 0.01,
            scale: 10.0,
            self_quantile: 0.98,
            restart: 0.01,
            basis: X_UMAP.to_string(),
        }
    }
}

/// Macrostate and fate settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FateParams {
    pub n_states: usize,
    /// coarse self-transition a terminal macrostate must reach
    pub stability: f64,
    /// representative cells per terminal state
    pub n_cells: usize,
    /// categorical obs column used to name macrostates
    pub groupby: Option<String>,
    pub restart: f64,
}

impl Default for FateParams {
    fn default() -> Self {
        FateParams {
            n_states: 3,
            stability: 0.96,
            n_cells: 30,
            groupby: Some(CLUSTER.to_string()),
            restart: 0.01,
        }
    }
}

fn argmax(values: &Array1<f64>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// Estimate velocities and everything derived from them. Stores layers `Ms`, `Mu`
/// and `velocity`; var `velocity_gamma`, `velocity_r2`, `velocity_genes`; obsp
/// `velocity_graph` and `transitions`; obs `velocity_confidence`, `velocity_length`,
/// `root_cells`, `end_points` and `velocity_pseudotime`; obsm `velocity_<basis>`
/// when the basis embedding exists.
pub fn run_velocity(dataset: &mut Dataset, params: &VelocityParams) -> Result<(), Error> {
    let spliced = moments::normalize_to_median(dataset.layer(SPLICED)?)?;
    let unspliced = moments::normalize_to_median(dataset.layer(UNSPLICED)?)?;
    let n = dataset.n_cells();
    if n < 3 {
        bail!("velocity needs at least 3 cells, got {}", n);
    }

    let k = params.n_neighbors.min(n - 1);
    let neighbors = knn(&dataset.obsm(&params.use_rep)?.view(), k)?;
    let weights = moments::neighbor_weights(&connectivities(&neighbors))?;
    let ms = moments::moments(&weights, to_dense_cells_by_genes(&spliced, None).view())?;
    let mu = moments::moments(&weights, to_dense_cells_by_genes(&unspliced, None).view())?;

    let fit = steady_state::fit_steady_state(ms.view(), mu.view(), params.perc, params.min_r2, params.min_gamma)?;
    let genes = fit.velocity_gene_indices();
    if genes.is_empty() {
        bail!(
            "no velocity genes with r2 > {} and gamma > {}",
            params.min_r2,
            params.min_gamma
        );
    }
    info!("{} of {} genes carry velocity", genes.len(), fit.gamma.len());
    let velocity = steady_state::velocity(ms.view(), mu.view(), &fit);

    let vgraph = graph::velocity_graph(ms.view(), velocity.view(), &genes, &neighbors.indices)?;
    let transitions = graph::transition_matrix(&vgraph, params.scale, params.self_quantile)?;
    let chain = pseudotime::damped(&transitions, params.restart)?;
    let (root, end) = pseudotime::root_end_scores(&chain);
    let root_cell = argmax(&root);
    let time = pseudotime::diffusion_pseudotime(&chain, root_cell)?;
    info!("velocity pseudotime rooted at cell {}", dataset.cell_names()[root_cell]);

    let confidence = confidence::velocity_confidence(velocity.view(), &genes, &neighbors.indices)?;
    let length = confidence::velocity_length(velocity.view(), &genes);

    let projected = match dataset.obsm(&params.basis) {
        Ok(basis) => Some(embedding::project_velocity(&transitions, &vgraph, basis.view())?),
        Err(_) => {
            warn!("no '{}' embedding, skipping velocity projection", params.basis);
            None
        }
    };

    dataset.insert_layer(MS, from_dense_cells_by_genes(ms.view()))?;
    dataset.insert_layer(MU, from_dense_cells_by_genes(mu.view()))?;
    dataset.insert_layer(VELOCITY, from_dense_cells_by_genes(velocity.view()))?;
    let var = dataset.var_mut();
    var.insert("velocity_gamma", Column::Numeric(fit.gamma.clone()))?;
    var.insert("velocity_r2", Column::Numeric(fit.r2.clone()))?;
    var.insert("velocity_genes", Column::Flag(fit.velocity_genes.clone()))?;
    dataset.insert_obsp(VELOCITY_GRAPH, vgraph)?;
    dataset.insert_obsp(TRANSITIONS, transitions)?;
    let obs = dataset.obs_mut();
    obs.insert("velocity_confidence", Column::Numeric(confidence))?;
    obs.insert("velocity_length", Column::Numeric(length))?;
    obs.insert("root_cells", Column::Numeric(root))?;
    obs.insert("end_points", Column::Numeric(end))?;
    obs.insert(VELOCITY_PSEUDOTIME, Column::Numeric(time))?;
    if let Some(projected) = projected {
        let key = format!("velocity_{}", params.basis.trim_start_matches("X_"));
        dataset.insert_obsm(&key, projected)?;
    }
    dataset.insert_uns(
        "velocity",
        json!({
            "params": params,
            "n_velocity_genes": genes.len(),
            "root_cell": root_cell,
        }),
    );
    Ok(())
}

/// Macrostates, terminal states and fate probabilities from the stored transition
/// matrix. Stores obs `macrostates` and `terminal_states`; obsm
/// `macrostate_memberships` and `fate_probabilities`; varm `lineage_drivers`
/// (correlation with `Ms`); uns `fate`.
pub fn run_fate(dataset: &mut Dataset, params: &FateParams) -> Result<fate::Fate, Error> {
    let chain = pseudotime::damped(dataset.obsp(TRANSITIONS)?, params.restart)?;
    let labels = match &params.groupby {
        Some(column) => Some(dataset.obs().categorical(column)?),
        None => None,
    };
    let result = fate::compute_fate(&chain, params.n_states, params.stability, params.n_cells, labels)?;

    let expression = to_dense_cells_by_genes(dataset.layer(MS)?, None);
    let drivers = fate::lineage_drivers(expression.view(), &result.probabilities)?;
    let lineage_names = result
        .terminal
        .iter()
        .map(|&t| result.names[t].clone())
        .collect::<Vec<_>>();

    let macrostates = result
        .assignment
        .iter()
        .map(|&a| Some(result.names[a].as_str()))
        .collect::<Vec<_>>();
    let mut terminal_labels = vec![None; dataset.n_cells()];
    for (l, cells) in result.terminal_cells.iter().enumerate() {
        for &c in cells {
            terminal_labels[c] = Some(lineage_names[l].as_str());
        }
    }
    let macrostates = Categorical::from_labels(&macrostates);
    let terminal_states = Categorical::from_labels(&terminal_labels);
    let obs = dataset.obs_mut();
    obs.insert("macrostates", Column::Categorical(macrostates))?;
    obs.insert("terminal_states", Column::Categorical(terminal_states))?;
    dataset.insert_obsm(MACROSTATE_MEMBERSHIPS, result.memberships.clone())?;
    dataset.insert_obsm(FATE_PROBABILITIES, result.probabilities.clone())?;
    dataset.insert_varm("lineage_drivers", drivers)?;
    dataset.insert_uns(
        "fate",
        json!({
            "params": params,
            "macrostates": result.names,
            "lineages": lineage_names,
            "coarse_transitions": result.coarse.axis_iter(Axis(0)).map(|r| r.to_vec()).collect::<Vec<_>>(),
        }),
    );
    Ok(result)
}

/// Mean fate probability of every lineage within each group of a categorical
/// column; groups × lineages, for plotting.
pub fn mean_fate_by_group(dataset: &Dataset, groupby: &str) -> Result<(Vec<String>, Array2<f64>), Error> {
    let probs = dataset.obsm(FATE_PROBABILITIES)?;
    let groups = dataset.obs().categorical(groupby)?;
    let members = groups.groups();
    let mut out = Array2::<f64>::zeros((members.len(), probs.ncols()));
    for (g, cells) in members.iter().enumerate() {
        if !cells.is_empty() {
            out.row_mut(g).assign(&probs.select(Axis(0), cells).mean_axis(Axis(0)).unwrap_or_default());
        }
    }
    Ok((groups.categories.clone(), out))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    /// Cells along a differentiation path: genes 0-3 are induced (unspliced ahead of
    /// the steady-state line), genes 4-7 repressed, gene 8 is constant. The embedding
    /// is the position along the path plus noise.
    pub(crate) fn trajectory(n: usize, seed: u64) -> Dataset {
        let mut rng = Pcg64Mcg::seed_from_u64(seed);
        let noise = Array2::random_using((n, 20), Normal::new(0.0, 0.2).unwrap(), &mut rng);
        let n_genes = 9;
        let mut s = Array2::<f64>::zeros((n, n_genes));
        let mut u = Array2::<f64>::zeros((n, n_genes));
        for c in 0..n {
            let t = c as f64 / (n - 1) as f64;
            let bump = 1.5 * (std::f64::consts::PI * t).sin();
            for g in 0..n_genes {
                let (spl, uns) = match g {
                    0..=3 => (20.0 * t, 10.0 * t + bump),
                    4..=7 => (20.0 * (1.0 - t), (10.0 * (1.0 - t) - bump).max(0.0)),
                    _ => (10.0, 3.0),
                };
                s[(c, g)] = spl + noise[(c, g)].abs();
                u[(c, g)] = uns + noise[(c, g + 9)].abs();
            }
        }
        let counts = &s + &u;
        let genes = (0..n_genes).map(|g| format!("g{g}")).collect();
        let cells = (0..n).map(|c| format!("c{c}")).collect();
        let mut d = Dataset::new("traj", from_dense_cells_by_genes(counts.view()), genes, cells).unwrap();
        d.insert_layer(SPLICED, from_dense_cells_by_genes(s.view())).unwrap();
        d.insert_layer(UNSPLICED, from_dense_cells_by_genes(u.view())).unwrap();
        let pos = Array2::from_shape_fn((n, 2), |(c, k)| {
            if k == 0 {
                c as f64 / n as f64 * 10.0
            } else {
                noise[(c, 19)]
            }
        });
        d.insert_obsm(X_PCA, pos.clone()).unwrap();
        d.insert_obsm(X_UMAP, pos).unwrap();
        let labels = (0..n)
            .map(|c| Some(if c < n / 2 { "early" } else { "late" }))
            .collect::<Vec<_>>();
        d.obs_mut()
            .insert(CLUSTER, Column::Categorical(Categorical::from_labels(&labels)))
            .unwrap();
        d
    }

    #[test]
    fn test_velocity_along_trajectory() {
        let n = 60;
        let mut d = trajectory(n, 3);
        let params = VelocityParams {
            n_neighbors: 8,
            ..VelocityParams::default()
        };
        run_velocity(&mut d, &params).unwrap();

        let flags = d.var().flag("velocity_genes").unwrap();
        assert!(flags[..8].iter().filter(|&&f| f).count() >= 6, "{flags:?}");
        let t = d.obsp(TRANSITIONS).unwrap();
        for total in graph::row_totals(t) {
            assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        }
        // the arrows point along the path
        let arrows = d.obsm("velocity_umap").unwrap();
        let forward = arrows.outer_iter().filter(|a| a[0] > 0.0).count();
        assert!(forward > n / 2, "{forward} of {n} arrows point forward");

        let time = d.obs().numeric(VELOCITY_PSEUDOTIME).unwrap();
        assert!(time.iter().all(|&x| (0.0..=1.0).contains(&x)));
        let early = time.slice(ndarray::s![..n / 4]).mean().unwrap();
        let late = time.slice(ndarray::s![3 * n / 4..]).mean().unwrap();
        assert!(early < late, "early {early} late {late}");
        assert_eq!(d.obs().numeric("velocity_confidence").unwrap().len(), n);
        assert!(d.layer(MS).is_ok() && d.layer(VELOCITY).is_ok());

        let fate = run_fate(
            &mut d,
            &FateParams {
                n_states: 2,
                n_cells: 5,
                ..FateParams::default()
            },
        )
        .unwrap();
        let probs = d.obsm(FATE_PROBABILITIES).unwrap();
        assert_eq!(probs.ncols(), fate.terminal.len());
        for row in probs.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        assert_eq!(d.obsm(MACROSTATE_MEMBERSHIPS).unwrap().nrows(), n);
        assert_eq!(d.varm("lineage_drivers").unwrap().dim(), (9, fate.terminal.len()));
        let (groups, means) = mean_fate_by_group(&d, CLUSTER).unwrap();
        assert_eq!(groups, vec!["early", "late"]);
        assert_eq!(means.dim(), (2, fate.terminal.len()));
    }

    #[test]
    fn test_velocity_needs_layers() {
        let mut d = trajectory(20, 1);
        let mut params = VelocityParams::default();
        params.use_rep = "X_missing".to_string();
        assert!(run_velocity(&mut d, &params).is_err());
        assert!(run_fate(&mut d, &FateParams::default()).is_err());
    }
}
