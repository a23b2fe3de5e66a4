//! Highly variable gene selection from a fitted variance decomposition.

use crate::variance::GeneVarStats;
use anyhow::{bail, Error};
use log::info;
use sc_types::{Column, Dataset};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// var flag marking the selected genes
pub const HVG: &str = "hvg";

/// How many of the ranked genes to keep
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HvgPolicy {
    /// the `n` genes with the largest biological component
    Count(usize),
    /// a fraction of all genes
    Proportion(f64),
    /// every ranked gene with FDR at or below the threshold
    Fdr(f64),
}

impl Default for HvgPolicy {
    fn default() -> Self {
        HvgPolicy::Proportion(0.1)
    }
}

impl FromStr for HvgPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((kind, value)) = s.split_once(':') else {
            bail!("HVG policy must look like count:N, prop:P or fdr:T, got {}", s);
        };
        Ok(match kind {
            "count" | "n" => HvgPolicy::Count(value.parse()?),
            "prop" | "proportion" => HvgPolicy::Proportion(value.parse()?),
            "fdr" => HvgPolicy::Fdr(value.parse()?),
            _ => bail!("HVG policy not recognized: {}", s),
        })
    }
}

/// Genes with a positive biological component, by decreasing `bio` (ties by index).
pub fn rank_by_bio(stats: &GeneVarStats) -> Vec<usize> {
    let mut ranked = (0..stats.bio.len())
        .filter(|&g| stats.bio[g] > 0.0)
        .collect::<Vec<_>>();
    ranked.sort_by(|&a, &b| stats.bio[b].total_cmp(&stats.bio[a]).then(a.cmp(&b)));
    ranked
}

/// Select highly variable genes. Returned indices are in rank order.
pub fn top_hvgs(stats: &GeneVarStats, policy: &HvgPolicy) -> Result<Vec<usize>, Error> {
    let ranked = rank_by_bio(stats);
    let n_genes = stats.bio.len();
    let selected = match *policy {
        HvgPolicy::Count(n) => ranked.into_iter().take(n).collect(),
        HvgPolicy::Proportion(p) => {
            if !(0.0..=1.0).contains(&p) {
                bail!("HVG proportion must be in [0, 1], got {}", p);
            }
            let n = (p * n_genes as f64).ceil() as usize;
            ranked.into_iter().take(n).collect()
        }
        HvgPolicy::Fdr(threshold) => {
            if !(0.0..=1.0).contains(&threshold) {
                bail!("HVG FDR threshold must be in [0, 1], got {}", threshold);
            }
            ranked
                .into_iter()
                .filter(|&g| stats.fdr[g] <= threshold)
                .collect::<Vec<_>>()
        }
    };
    Ok(selected)
}

/// Select HVGs and store them as the var flag `hvg`. Errors when nothing is selected.
pub fn mark_hvgs(dataset: &mut Dataset, stats: &GeneVarStats, policy: &HvgPolicy) -> Result<Vec<usize>, Error> {
    let selected = top_hvgs(stats, policy)?;
    if selected.is_empty() {
        bail!("HVG policy {:?} selected no genes", policy);
    }
    let mut flag = vec![false; dataset.n_genes()];
    for &g in &selected {
        flag[g] = true;
    }
    dataset.var_mut().insert(HVG, Column::Flag(flag))?;
    info!("selected {} of {} genes as highly variable", selected.len(), dataset.n_genes());
    Ok(selected)
}

/// Indices of genes flagged `hvg`, in gene order.
pub fn stored_hvgs(dataset: &Dataset) -> Result<Vec<usize>, Error> {
    let flag = dataset.var().flag(HVG)?;
    Ok((0..flag.len()).filter(|&g| flag[g]).collect())
}
