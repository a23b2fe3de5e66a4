use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView2};
use sprs::CsMat;

/// Genes × cells expression layer, stored CSR (one compressed row per gene).
pub type Layer = CsMat<f64>;

/// Make sure a sparse matrix is stored CSR.
pub fn ensure_csr(mat: CsMat<f64>) -> CsMat<f64> {
    if mat.is_csr() {
        mat
    } else {
        mat.to_csr()
    }
}

/// Build a CSR matrix from per-row (column, value) lists. Column order within a row
/// does not need to be sorted.
pub fn from_rows(shape: (usize, usize), rows: Vec<Vec<(usize, f64)>>) -> Result<CsMat<f64>, Error> {
    if rows.len() != shape.0 {
        bail!("expected {} rows, got {}", shape.0, rows.len());
    }
    let mut indptr = Vec::with_capacity(shape.0 + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for mut row in rows {
        row.sort_unstable_by_key(|&(c, _)| c);
        for (c, v) in row {
            if c >= shape.1 {
                bail!("column {} out of range for {} columns", c, shape.1);
            }
            if indices.len() > *indptr.last().unwrap_or(&0) && indices.last() == Some(&c) {
                bail!("duplicate entry in column {}", c);
            }
            indices.push(c);
            data.push(v);
        }
        indptr.push(indices.len());
    }
    Ok(CsMat::new(shape, indptr, indices, data))
}

/// Select (and reorder) columns of a CSR matrix.
pub fn select_cols(mat: &CsMat<f64>, cols: &[usize]) -> CsMat<f64> {
    let mut map = vec![None; mat.cols()];
    for (new, &old) in cols.iter().enumerate() {
        map[old] = Some(new);
    }
    let mut indptr = Vec::with_capacity(mat.rows() + 1);
    let mut indices = Vec::with_capacity(mat.nnz());
    let mut data = Vec::with_capacity(mat.nnz());
    let mut buf = Vec::new();
    indptr.push(0);
    for row in mat.outer_iterator() {
        buf.clear();
        buf.extend(row.iter().filter_map(|(c, &v)| map[c].map(|nc| (nc, v))));
        buf.sort_unstable_by_key(|&(c, _)| c);
        for &(c, v) in &buf {
            indices.push(c);
            data.push(v);
        }
        indptr.push(indices.len());
    }
    CsMat::new((mat.rows(), cols.len()), indptr, indices, data)
}

/// Select (and reorder) rows of a CSR matrix.
pub fn select_rows(mat: &CsMat<f64>, rows: &[usize]) -> CsMat<f64> {
    let mut indptr = Vec::with_capacity(rows.len() + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for &r in rows {
        if let Some(row) = mat.outer_view(r) {
            for (c, &v) in row.iter() {
                indices.push(c);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new((rows.len(), mat.cols()), indptr, indices, data)
}

/// Restrict a square cell × cell graph to the given nodes, re-indexed in selection order.
pub fn select_square(graph: &CsMat<f64>, nodes: &[usize]) -> CsMat<f64> {
    select_cols(&select_rows(graph, nodes), nodes)
}

/// Sum of each column (per-cell totals for a genes × cells layer).
pub fn col_sums(mat: &CsMat<f64>) -> Array1<f64> {
    let mut sums = Array1::zeros(mat.cols());
    for row in mat.outer_iterator() {
        for (c, &v) in row.iter() {
            sums[c] += v;
        }
    }
    sums
}

/// Sum of each row (per-gene totals for a genes × cells layer).
pub fn row_sums(mat: &CsMat<f64>) -> Array1<f64> {
    mat.outer_iterator().map(|row| row.data().iter().sum()).collect()
}

/// Number of non-zero entries per column.
pub fn col_nnz(mat: &CsMat<f64>) -> Array1<f64> {
    let mut nnz = Array1::zeros(mat.cols());
    for row in mat.outer_iterator() {
        for (c, &v) in row.iter() {
            if v != 0.0 {
                nnz[c] += 1.0;
            }
        }
    }
    nnz
}

/// Per-row mean and sample variance, counting implicit zeros.
pub fn row_mean_var(mat: &CsMat<f64>) -> (Array1<f64>, Array1<f64>) {
    let n = mat.cols() as f64;
    let mut means = Array1::zeros(mat.rows());
    let mut vars = Array1::zeros(mat.rows());
    for (r, row) in mat.outer_iterator().enumerate() {
        let sum: f64 = row.data().iter().sum();
        let mean = sum / n;
        let nz = row.nnz() as f64;
        let sq: f64 = row.data().iter().map(|v| (v - mean) * (v - mean)).sum();
        let var = if n > 1.0 {
            (sq + (n - nz) * mean * mean) / (n - 1.0)
        } else {
            0.0
        };
        means[r] = mean;
        vars[r] = var;
    }
    (means, vars)
}

/// Dense cells × genes matrix from a genes × cells layer, optionally restricted to a
/// subset of genes (columns of the result follow `genes` order).
pub fn to_dense_cells_by_genes(mat: &CsMat<f64>, genes: Option<&[usize]>) -> Array2<f64> {
    let all: Vec<usize>;
    let genes = match genes {
        Some(g) => g,
        None => {
            all = (0..mat.rows()).collect();
            &all
        }
    };
    let mut out = Array2::zeros((mat.cols(), genes.len()));
    for (j, &g) in genes.iter().enumerate() {
        if let Some(row) = mat.outer_view(g) {
            for (c, &v) in row.iter() {
                out[(c, j)] = v;
            }
        }
    }
    out
}

/// Sparse genes × cells layer from a dense cells × genes matrix, dropping zeros.
pub fn from_dense_cells_by_genes(dense: ArrayView2<f64>) -> CsMat<f64> {
    let (n_cells, n_genes) = dense.dim();
    let mut indptr = Vec::with_capacity(n_genes + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();
    indptr.push(0);
    for g in 0..n_genes {
        for c in 0..n_cells {
            let v = dense[(c, g)];
            if v != 0.0 {
                indices.push(c);
                data.push(v);
            }
        }
        indptr.push(indices.len());
    }
    CsMat::new((n_genes, n_cells), indptr, indices, data)
}

/// Replace every stored value by `f(row, col, value)`; the sparsity pattern is kept.
pub fn map_entries(mat: &CsMat<f64>, f: impl Fn(usize, usize, f64) -> f64) -> CsMat<f64> {
    let mut indptr = Vec::with_capacity(mat.rows() + 1);
    let mut indices = Vec::with_capacity(mat.nnz());
    let mut data = Vec::with_capacity(mat.nnz());
    indptr.push(0);
    for (r, row) in mat.outer_iterator().enumerate() {
        for (c, &v) in row.iter() {
            indices.push(c);
            data.push(f(r, c, v));
        }
        indptr.push(indices.len());
    }
    CsMat::new(mat.shape(), indptr, indices, data)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn genes_by_cells() -> CsMat<f64> {
        // 3 genes x 4 cells
        from_dense_cells_by_genes(
            array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0], [0.0, 6.0, 0.0]].view(),
        )
    }

    #[test]
    fn test_dense_round_trip() {
        let m = genes_by_cells();
        assert_eq!(m.shape(), (3, 4));
        let d = to_dense_cells_by_genes(&m, None);
        assert_eq!(d, array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0], [0.0, 6.0, 0.0]]);
        let d = to_dense_cells_by_genes(&m, Some(&[2, 0]));
        assert_eq!(d.column(0), array![2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_select_cols_reorders() {
        let m = genes_by_cells();
        let s = select_cols(&m, &[3, 0]);
        assert_eq!(s.shape(), (3, 2));
        let d = to_dense_cells_by_genes(&s, None);
        assert_eq!(d, array![[0.0, 6.0, 0.0], [1.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_sums_and_moments() {
        let m = genes_by_cells();
        assert_eq!(col_sums(&m), array![3.0, 3.0, 9.0, 6.0]);
        assert_eq!(row_sums(&m), array![5.0, 11.0, 5.0]);
        assert_eq!(col_nnz(&m), array![2.0, 1.0, 2.0, 1.0]);
        let (mean, var) = row_mean_var(&m);
        assert_abs_diff_eq!(mean[0], 1.25, epsilon = 1e-12);
        // values 1,0,4,0 -> sample variance 3.5833..
        assert_abs_diff_eq!(var[0], 43.0 / 12.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_rows_rejects_duplicates() {
        assert!(from_rows((1, 3), vec![vec![(1, 1.0), (1, 2.0)]]).is_err());
        let m = from_rows((2, 3), vec![vec![(2, 1.0), (0, 2.0)], vec![]]).unwrap();
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.get(0, 0), Some(&2.0));
    }

    #[test]
    fn test_select_square() {
        let g = from_rows((3, 3), vec![vec![(1, 1.0)], vec![(0, 1.0), (2, 0.5)], vec![(1, 0.5)]]).unwrap();
        let s = select_square(&g, &[2, 1]);
        assert_eq!(s.shape(), (2, 2));
        assert_eq!(s.get(0, 1), Some(&0.5));
        assert_eq!(s.get(1, 0), Some(&0.5));
    }
}
