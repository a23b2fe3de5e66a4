//! Marker gene detection: pairwise tests between groups of cells, combined into one
//! ranked marker list per group.

/// p-value adjustment and combination
pub mod dist;
/// Welch t-test
pub mod ttest;
/// Wilcoxon rank sum test
pub mod wilcox;
/// Exact binomial test on expressing-cell proportions
pub mod binom;
/// pairwise comparisons across groups
pub mod markers;

pub use crate::markers::{find_markers, Direction, GroupMarkers, MarkerParams, MarkerRow, PvalType, TestType};

/// One-sided p-values of a comparison of group x against group y, plus its effect size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairwiseResult {
    /// p-value for x greater than y (by more than the lfc threshold)
    pub p_up: f64,
    /// p-value for x less than y (by more than the lfc threshold)
    pub p_down: f64,
    /// test-specific effect size: log-fold change, AUC or log2 ratio of proportions
    pub effect: f64,
}

impl PairwiseResult {
    /// p-value for the requested direction; `Any` takes twice the smaller side.
    pub fn p_value(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Up => self.p_up,
            Direction::Down => self.p_down,
            Direction::Any => (2.0 * self.p_up.min(self.p_down)).min(1.0),
        }
    }
}
