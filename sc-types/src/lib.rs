//! Shared containers for a single-cell analysis run: expression layers, per-cell and
//! per-gene annotation tables, embeddings and cell graphs, kept aligned by cell order.

pub mod categorical;
pub mod dataset;
pub mod frame;
pub mod matrix;

pub use categorical::Categorical;
pub use dataset::Dataset;
pub use frame::{Column, Frame};
pub use matrix::Layer;

/// Validate a selection of positions into an axis of length `n`: non-empty,
/// in range and free of duplicates.
pub fn check_selection(indices: &[usize], n: usize) -> Result<(), anyhow::Error> {
    if indices.is_empty() {
        anyhow::bail!("empty selection");
    }
    let mut seen = vec![false; n];
    for &i in indices {
        if i >= n {
            anyhow::bail!("selection index {} out of range for axis of length {}", i, n);
        }
        if seen[i] {
            anyhow::bail!("selection index {} appears more than once", i);
        }
        seen[i] = true;
    }
    Ok(())
}
