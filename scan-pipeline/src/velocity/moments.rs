use crate::stats::median;
use anyhow::{bail, Error};
use ndarray::{Array2, ArrayView2};
use sc_types::matrix::{col_sums, map_entries};
use sc_types::Layer;
use sprs::{CsMat, TriMat};

/// Scale every cell of a genes × cells layer to the median total count of the cells
/// that have any counts. No log transform.
pub fn normalize_to_median(layer: &Layer) -> Result<Layer, Error> {
    let totals = col_sums(layer);
    let positive = totals.iter().copied().filter(|&t| t > 0.0).collect::<Vec<_>>();
    if positive.is_empty() {
        bail!("layer has no counts");
    }
    let target = median(&positive)?;
    Ok(map_entries(layer, |_, c, v| v * target / totals[c]))
}

/// Row-stochastic neighbourhood weights: each cell averages over itself and every
/// cell it has a positive connectivity to.
pub fn neighbor_weights(connectivities: &CsMat<f64>) -> Result<CsMat<f64>, Error> {
    let n = connectivities.rows();
    if connectivities.cols() != n {
        bail!("connectivities must be square");
    }
    let mut triplets = TriMat::new((n, n));
    for (i, row) in connectivities.outer_iterator().enumerate() {
        let members = std::iter::once(i)
            .chain(row.iter().filter(|&(j, &w)| j != i && w > 0.0).map(|(j, _)| j))
            .collect::<Vec<_>>();
        let w = 1.0 / members.len() as f64;
        for j in members {
            triplets.add_triplet(i, j, w);
        }
    }
    Ok(triplets.to_csr())
}

/// First-order moments: `weights` (cells × cells) times `data` (cells × genes).
pub fn moments(weights: &CsMat<f64>, data: ArrayView2<f64>) -> Result<Array2<f64>, Error> {
    if weights.cols() != data.nrows() {
        bail!("{} graph nodes for {} cells", weights.cols(), data.nrows());
    }
    let mut out = Array2::<f64>::zeros((weights.rows(), data.ncols()));
    for (i, row) in weights.outer_iterator().enumerate() {
        let mut target = out.row_mut(i);
        for (j, &w) in row.iter() {
            target.scaled_add(w, &data.row(j));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use sc_types::matrix::{from_dense_cells_by_genes, from_rows};

    #[test]
    fn test_normalize_to_median() {
        // cell totals 2, 4, 6, 0
        let layer = from_dense_cells_by_genes(array![[1.0, 1.0], [4.0, 0.0], [3.0, 3.0], [0.0, 0.0]].view());
        let norm = normalize_to_median(&layer).unwrap();
        let totals = col_sums(&norm);
        assert_eq!(totals.to_vec(), vec![4.0, 4.0, 4.0, 0.0]);
    }

    #[test]
    fn test_moments_average_self_and_neighbours() {
        let conn = from_rows((3, 3), vec![vec![(1, 0.5)], vec![(0, 0.5), (2, 0.2)], vec![(1, 0.2)]]).unwrap();
        let w = neighbor_weights(&conn).unwrap();
        assert_eq!(w.get(1, 1), Some(&(1.0 / 3.0)));
        let data = array![[3.0], [6.0], [9.0]];
        let m = moments(&w, data.view()).unwrap();
        assert!((m[(0, 0)] - 4.5).abs() < 1e-12);
        assert!((m[(1, 0)] - 6.0).abs() < 1e-12);
        assert!((m[(2, 0)] - 7.5).abs() < 1e-12);
    }
}
