use crate::Q;
use log::debug;
use ndarray::{ArrayView1, ArrayView2};
use sprs::{CsMat, TriMat};

const BANDWIDTH: Q = 1.0;
const NITER: usize = 64;
const SMOOTH_K_TOLERANCE: Q = 1e-5;
const MIN_K_DIST_SCALE: Q = 1e-3;

/// Build the fuzzy simplicial set (a symmetric sparse graph of membership strengths)
/// from each point's neighbours. `knn_indices` and `knn_distances` are n × k and must
/// not list a point as its own neighbour; `usize::MAX` marks a missing neighbour.
///
/// Local memberships are combined with the fuzzy union
/// `mix * (A + Aᵀ - A∘Aᵀ) + (1 - mix) * A∘Aᵀ`.
pub fn fuzzy_simplicial_set(
    knn_indices: ArrayView2<usize>,
    knn_distances: ArrayView2<Q>,
    local_connectivity: Q,
    set_op_mix_ratio: Q,
) -> CsMat<Q> {
    let n_points = knn_indices.nrows();
    let (sigmas, rhos) = smooth_knn_distances(knn_distances, local_connectivity);

    let mut triplets = TriMat::new((n_points, n_points));
    for i in 0..n_points {
        for (&j, &d) in knn_indices.row(i).iter().zip(knn_distances.row(i)) {
            if j == usize::MAX || j == i {
                continue;
            }
            let val = if d - rhos[i] <= 0.0 || sigmas[i] == 0.0 {
                1.0
            } else {
                (-((d - rhos[i]) / sigmas[i])).exp()
            };
            triplets.add_triplet(i, j, val);
        }
    }
    let local: CsMat<Q> = triplets.to_csr();
    let transpose: CsMat<Q> = local.transpose_view().to_csr();

    let product = sprs::binop::mul_mat_same_storage(&local, &transpose);
    let union = &(&local + &transpose) - &product;
    let union = union.map(|&v| v * set_op_mix_ratio);
    let intersection = product.map(|&v| v * (1.0 - set_op_mix_ratio));
    let graph = &union + &intersection;

    debug!("fuzzy simplicial set with {} edges", graph.nnz());
    graph
}

/// Per-point (sigma, rho): rho is the distance to the `local_connectivity`-th nearest
/// neighbour and sigma normalizes the remaining distances so memberships sum to log2(k).
pub(crate) fn smooth_knn_distances(knn_distances: ArrayView2<Q>, local_connectivity: Q) -> (Vec<Q>, Vec<Q>) {
    let (n_points, k) = knn_distances.dim();
    let mut rhos = vec![0.0; n_points];
    let mut sigmas = vec![0.0; n_points];
    let mean_all = if n_points * k > 0 {
        knn_distances.sum() / (n_points * k) as Q
    } else {
        0.0
    };

    for i in 0..n_points {
        let row = knn_distances.row(i);
        let non_zero = row.iter().copied().filter(|&d| d > 0.0).collect::<Vec<Q>>();
        if non_zero.len() >= local_connectivity as usize && !non_zero.is_empty() {
            let index = local_connectivity.floor() as usize;
            let interpolation = local_connectivity - local_connectivity.floor();
            if index > 0 {
                rhos[i] = non_zero[index - 1];
                if interpolation > SMOOTH_K_TOLERANCE && index < non_zero.len() {
                    rhos[i] += interpolation * (non_zero[index] - non_zero[index - 1]);
                }
            } else {
                rhos[i] = interpolation * non_zero[0];
            }
        } else if !non_zero.is_empty() {
            rhos[i] = non_zero.iter().fold(Q::MIN, |a, &b| a.max(b));
        }

        sigmas[i] = smooth_knn_dist(row, rhos[i], k);

        let floor = if rhos[i] > 0.0 {
            MIN_K_DIST_SCALE * row.sum() / k as Q
        } else {
            MIN_K_DIST_SCALE * mean_all
        };
        sigmas[i] = sigmas[i].max(floor);
    }
    (sigmas, rhos)
}

/// Binary search for the sigma of one point.
fn smooth_knn_dist(distances: ArrayView1<Q>, rho: Q, k: usize) -> Q {
    let target = (k as Q).log2() * BANDWIDTH;
    let mut lo = 0.0;
    let mut mid = 1.0;
    let mut hi = Q::MAX;

    for _ in 0..NITER {
        let psum = distances
            .iter()
            .map(|&d| (-((d - rho).max(0.0) / mid)).exp())
            .sum::<Q>();

        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            if hi == Q::MAX {
                mid *= 2.0;
            } else {
                mid = (lo + hi) / 2.0;
            }
        }
    }
    mid
}
