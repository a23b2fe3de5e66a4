use crate::stats::quantile;
use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use sc_types::matrix::from_rows;
use sprs::CsMat;

/// Cosine of two vectors after removing each one's mean; 0 for a degenerate side.
pub fn centred_cosine(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    let n = a.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let ma = a.sum() / n;
    let mb = b.sum() / n;
    let mut ab = 0.0;
    let mut aa = 0.0;
    let mut bb = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x - ma, y - mb);
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    let denom = (aa * bb).sqrt();
    if denom < 1e-15 {
        0.0
    } else {
        ab / denom
    }
}

/// Candidate successors of every cell: its neighbours and their neighbours, without
/// the cell itself.
pub fn recurse_neighbors(indices: &Array2<usize>) -> Vec<Vec<usize>> {
    (0..indices.nrows())
        .map(|i| {
            let mut set = Vec::new();
            for &j in indices.row(i) {
                set.push(j);
                set.extend(indices.row(j).iter().copied());
            }
            set.sort_unstable();
            set.dedup();
            set.retain(|&j| j != i);
            set
        })
        .collect()
}

/// Signed cosine similarity between each cell's velocity and its displacement
/// `Ms_j - Ms_i` to every candidate successor, over the velocity genes.
pub fn velocity_graph(
    ms: ArrayView2<f64>,
    velocity: ArrayView2<f64>,
    genes: &[usize],
    indices: &Array2<usize>,
) -> Result<CsMat<f64>, Error> {
    let n = ms.nrows();
    if velocity.dim() != ms.dim() || indices.nrows() != n {
        bail!("moments, velocity and neighbours must describe the same {} cells", n);
    }
    if genes.is_empty() {
        bail!("no velocity genes");
    }
    let ms = ms.select(Axis(1), genes);
    let v = velocity.select(Axis(1), genes);
    let candidates = recurse_neighbors(indices);

    let rows = candidates
        .par_iter()
        .enumerate()
        .map(|(i, cands)| {
            let vi = v.row(i);
            if vi.iter().all(|&x| x == 0.0) {
                return Vec::new();
            }
            let mut row = Vec::with_capacity(cands.len());
            for &j in cands {
                let dx = &ms.row(j) - &ms.row(i);
                let cos = centred_cosine(vi, dx.view());
                if cos != 0.0 {
                    row.push((j, cos));
                }
            }
            row
        })
        .collect::<Vec<_>>();
    from_rows((n, n), rows)
}

/// Row-stochastic transition matrix from a velocity graph. Positive cosines become
/// `expm1(scale * cos)`; every cell also gets a self-transition equal to its
/// shortfall of maximal cosine against the `self_quantile` quantile of all cells.
pub fn transition_matrix(graph: &CsMat<f64>, scale: f64, self_quantile: f64) -> Result<CsMat<f64>, Error> {
    let n = graph.rows();
    if graph.cols() != n {
        bail!("velocity graph must be square");
    }
    if !(scale > 0.0) {
        bail!("transition scale must be positive, got {}", scale);
    }
    let confidence = graph
        .outer_iterator()
        .map(|row| row.iter().map(|(_, &c)| c).fold(0.0f64, f64::max))
        .collect::<Vec<_>>();
    let upper = quantile(&confidence, self_quantile);

    let rows = graph
        .outer_iterator()
        .enumerate()
        .map(|(i, row)| {
            let self_prob = (upper - confidence[i]).clamp(0.0, 1.0);
            let mut entries = row
                .iter()
                .filter(|&(j, &c)| j != i && c > 0.0)
                .map(|(j, &c)| (j, (scale * c).exp_m1()))
                .collect::<Vec<_>>();
            if self_prob > 0.0 {
                entries.push((i, (scale * self_prob).exp_m1()));
            }
            let total: f64 = entries.iter().map(|&(_, w)| w).sum();
            if total > 0.0 {
                entries.iter_mut().for_each(|(_, w)| *w /= total);
                entries
            } else {
                vec![(i, 1.0)]
            }
        })
        .collect::<Vec<_>>();
    from_rows((n, n), rows)
}

/// Dense copy of a sparse square matrix.
pub fn to_dense(graph: &CsMat<f64>) -> Array2<f64> {
    let mut dense = Array2::<f64>::zeros((graph.rows(), graph.cols()));
    for (&w, (i, j)) in graph.iter() {
        dense[(i, j)] += w;
    }
    dense
}

/// Row sums of a sparse matrix.
pub fn row_totals(graph: &CsMat<f64>) -> Array1<f64> {
    graph.outer_iterator().map(|row| row.data().iter().sum()).collect()
}
