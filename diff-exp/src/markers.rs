use crate::binom::binomial;
use crate::dist::{berger, bh_adjust, holm_middle, rank_pvalues, simes};
use crate::ttest::{welch, Summary};
use crate::wilcox::rank_sum;
use crate::PairwiseResult;
use anyhow::{bail, Error};
use log::info;
use rayon::prelude::*;
use sc_types::{Categorical, Layer};
use std::str::FromStr;

/// Statistical test used for every pairwise comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Deserialize, serde::Serialize))]
pub enum TestType {
    /// Welch t-test on log-expression; effect is the log-fold change
    TTest,
    /// Wilcoxon rank sum; effect is the AUC
    Wilcoxon,
    /// Exact binomial test on expressing proportions; effect is the log2 ratio
    Binomial,
}

impl FromStr for TestType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "t" | "ttest" | "t-test" => TestType::TTest,
            "wilcox" | "wilcoxon" => TestType::Wilcoxon,
            "binom" | "binomial" => TestType::Binomial,
            _ => bail!("unknown marker test '{}'", s),
        })
    }
}

/// Which change in the group of interest counts as evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Deserialize, serde::Serialize))]
pub enum Direction {
    /// upregulated in the group
    Up,
    /// downregulated in the group
    Down,
    /// either
    Any,
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "up" => Direction::Up,
            "down" => Direction::Down,
            "any" => Direction::Any,
            _ => bail!("unknown direction '{}'", s),
        })
    }
}

/// How p-values of a group's comparisons against every other group are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Deserialize, serde::Serialize))]
pub enum PvalType {
    /// Simes: the gene differs from at least one other group; also reports `top`
    Any,
    /// Berger: the gene differs from every other group
    All,
    /// Holm-middle: the gene differs from at least `min_prop` of the other groups
    Some,
}

impl FromStr for PvalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "any" => PvalType::Any,
            "all" => PvalType::All,
            "some" => PvalType::Some,
            _ => bail!("unknown p-value combination '{}'", s),
        })
    }
}

/// Marker detection settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(any(feature = "serde", test), derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(any(feature = "serde", test), serde(default))]
pub struct MarkerParams {
    /// pairwise test
    pub test: TestType,
    /// direction of change
    pub direction: Direction,
    /// log-fold change threshold
    pub lfc: f64,
    /// combination of pairwise p-values
    pub pval_type: PvalType,
    /// proportion of comparisons that must reject for `PvalType::Some`
    pub min_prop: f64,
}

impl Default for MarkerParams {
    fn default() -> Self {
        MarkerParams {
            test: TestType::TTest,
            direction: Direction::Up,
            lfc: 0.0,
            pval_type: PvalType::Any,
            min_prop: 0.5,
        }
    }
}

/// One gene's statistics for a group
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRow {
    /// gene position in the input matrix
    pub gene: usize,
    /// combined p-value
    pub p_value: f64,
    /// BH-adjusted combined p-value, within the group
    pub fdr: f64,
    /// best rank of the gene across pairwise comparisons (`PvalType::Any` only)
    pub top: Option<usize>,
    /// effect of the pairwise comparison with the smallest p-value
    pub summary_effect: f64,
    /// effect against each other group, in `GroupMarkers::others` order
    pub effects: Vec<f64>,
}

/// Ranked marker list of one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupMarkers {
    /// group name
    pub group: String,
    /// names of the groups compared against
    pub others: Vec<String>,
    /// genes, most significant first
    pub rows: Vec<MarkerRow>,
}

/// Data of one gene split by group, in the form the chosen test needs
enum GroupValues {
    Summaries(Vec<Summary>),
    Values(Vec<Vec<f64>>),
    Expressing(Vec<u64>),
}

fn split_gene(values: &[f64], members: &[Vec<usize>], test: TestType) -> GroupValues {
    match test {
        TestType::TTest => GroupValues::Summaries(
            members
                .iter()
                .map(|m| Summary::from_values(&m.iter().map(|&c| values[c]).collect::<Vec<_>>()))
                .collect(),
        ),
        TestType::Wilcoxon => {
            GroupValues::Values(members.iter().map(|m| m.iter().map(|&c| values[c]).collect()).collect())
        }
        TestType::Binomial => GroupValues::Expressing(
            members
                .iter()
                .map(|m| m.iter().filter(|&&c| values[c] > 0.0).count() as u64)
                .collect(),
        ),
    }
}

fn compare(split: &GroupValues, members: &[Vec<usize>], x: usize, y: usize, lfc: f64) -> PairwiseResult {
    match split {
        GroupValues::Summaries(s) => welch(&s[x], &s[y], lfc),
        GroupValues::Values(v) => rank_sum(&v[x], &v[y], lfc),
        GroupValues::Expressing(e) => binomial(e[x], members[x].len() as u64, e[y], members[y].len() as u64, lfc),
    }
}

fn nan_last(p: f64) -> f64 {
    if p.is_nan() {
        f64::INFINITY
    } else {
        p
    }
}

/// Find markers for every group of `groups` on a genes × cells matrix (log-expression
/// for the t-test and Wilcoxon test; any matrix whose non-zeros mark expression for the
/// binomial test). Cells with a missing label are ignored, as are empty categories.
pub fn find_markers(data: &Layer, groups: &Categorical, params: &MarkerParams) -> Result<Vec<GroupMarkers>, Error> {
    if groups.len() != data.cols() {
        bail!("{} group labels for {} cells", groups.len(), data.cols());
    }
    if params.lfc < 0.0 || !params.lfc.is_finite() {
        bail!("log-fold change threshold must be a non-negative number, got {}", params.lfc);
    }
    if !(params.min_prop > 0.0 && params.min_prop <= 1.0) {
        bail!("min_prop must be in (0, 1], got {}", params.min_prop);
    }

    let (names, members): (Vec<String>, Vec<Vec<usize>>) = groups
        .groups()
        .into_iter()
        .enumerate()
        .filter(|(_, m)| !m.is_empty())
        .map(|(c, m)| (groups.categories[c].clone(), m))
        .unzip();
    let k = members.len();
    if k < 2 {
        bail!("need at least two non-empty groups to find markers, got {}", k);
    }
    if params.test == TestType::TTest {
        if let Some((name, _)) = names.iter().zip(&members).find(|(_, m)| m.len() < 2) {
            bail!("group '{}' has fewer than 2 cells, which the t-test cannot handle", name);
        }
    }

    info!(
        "testing {} genes across {} groups with {:?} ({:?}, lfc {})",
        data.rows(),
        k,
        params.test,
        params.direction,
        params.lfc
    );

    // pairwise[gene][x * k + y]
    let n_cells = data.cols();
    let pairwise = (0..data.rows())
        .into_par_iter()
        .map(|gene| {
            let mut values = vec![0.0; n_cells];
            if let Some(row) = data.outer_view(gene) {
                for (c, &v) in row.iter() {
                    values[c] = v;
                }
            }
            let split = split_gene(&values, &members, params.test);
            let mut results = Vec::with_capacity(k * k);
            for x in 0..k {
                for y in 0..k {
                    results.push(if x == y {
                        PairwiseResult {
                            p_up: f64::NAN,
                            p_down: f64::NAN,
                            effect: f64::NAN,
                        }
                    } else {
                        compare(&split, &members, x, y, params.lfc)
                    });
                }
            }
            results
        })
        .collect::<Vec<_>>();

    let n_genes = data.rows();
    let mut output = Vec::with_capacity(k);
    for x in 0..k {
        let others = (0..k).filter(|&y| y != x).collect::<Vec<_>>();

        let per_comparison = others
            .iter()
            .map(|&y| {
                pairwise
                    .iter()
                    .map(|r| r[x * k + y].p_value(params.direction))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        let top = if params.pval_type == PvalType::Any {
            let ranks = per_comparison.iter().map(|p| rank_pvalues(p)).collect::<Vec<_>>();
            Some(
                (0..n_genes)
                    .map(|g| ranks.iter().map(|r| r[g]).min().unwrap_or(usize::MAX))
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };

        let mut rows = (0..n_genes)
            .map(|g| {
                let pvals = per_comparison.iter().map(|p| p[g]).collect::<Vec<_>>();
                let p_value = match params.pval_type {
                    PvalType::Any => simes(&pvals),
                    PvalType::All => berger(&pvals),
                    PvalType::Some => holm_middle(&pvals, params.min_prop),
                };
                let effects = others.iter().map(|&y| pairwise[g][x * k + y].effect).collect::<Vec<_>>();
                let best = (0..pvals.len())
                    .min_by(|&a, &b| nan_last(pvals[a]).total_cmp(&nan_last(pvals[b])))
                    .unwrap_or(0);
                MarkerRow {
                    gene: g,
                    p_value,
                    fdr: f64::NAN,
                    top: top.as_ref().map(|t| t[g]),
                    summary_effect: effects.get(best).copied().unwrap_or(f64::NAN),
                    effects,
                }
            })
            .collect::<Vec<_>>();

        let fdr = bh_adjust(&rows.iter().map(|r| r.p_value).collect::<Vec<_>>());
        for (row, q) in rows.iter_mut().zip(fdr) {
            row.fdr = q;
        }

        rows.sort_by(|a, b| {
            a.top
                .cmp(&b.top)
                .then(nan_last(a.p_value).total_cmp(&nan_last(b.p_value)))
                .then(a.gene.cmp(&b.gene))
        });

        output.push(GroupMarkers {
            group: names[x].clone(),
            others: others.iter().map(|&y| names[y].clone()).collect(),
            rows,
        });
    }

    Ok(output)
}
