use crate::stats::pearson;
use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Per-cell velocity coherence: the mean Pearson correlation between a cell's
/// velocity and each neighbour's, over the velocity genes.
pub fn velocity_confidence(velocity: ArrayView2<f64>, genes: &[usize], indices: &Array2<usize>) -> Result<Array1<f64>, Error> {
    if indices.nrows() != velocity.nrows() {
        bail!("{} neighbour lists for {} cells", indices.nrows(), velocity.nrows());
    }
    let v = velocity.select(Axis(1), genes);
    Ok(indices
        .outer_iter()
        .enumerate()
        .map(|(i, neighbors)| {
            if neighbors.is_empty() {
                return 0.0;
            }
            let total: f64 = neighbors.iter().map(|&j| pearson(v.row(i), v.row(j))).sum();
            total / neighbors.len() as f64
        })
        .collect())
}

/// Euclidean norm of each cell's velocity over the velocity genes.
pub fn velocity_length(velocity: ArrayView2<f64>, genes: &[usize]) -> Array1<f64> {
    velocity
        .select(Axis(1), genes)
        .outer_iter()
        .map(|row| row.dot(&row).sqrt())
        .collect()
}
