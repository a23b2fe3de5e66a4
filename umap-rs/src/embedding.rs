use crate::Q;
use anyhow::{bail, Error};
use log::{info, warn};
use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use rand::distributions::Uniform;
use rand::Rng;
use sprs::CsMat;

/// Largest graph laid out by a dense spectral decomposition.
pub const MAX_SPECTRAL_NODES: usize = 4000;

/// Initial coordinates are scaled so the largest absolute value equals this.
const INIT_SCALE: Q = 10.0;

/// Spectral layout: eigenvectors 1..=dim (by ascending eigenvalue) of the symmetric
/// normalized Laplacian `I - D^-1/2 W D^-1/2`. Isolated nodes get zero rows in the
/// normalized adjacency.
pub fn spectral_layout(graph: &CsMat<Q>, dim: usize) -> Result<Array2<Q>, Error> {
    let n = graph.rows();
    if dim + 1 > n {
        bail!("cannot compute a {}-dimensional spectral layout of {} points", dim, n);
    }

    let mut degree = vec![0.0; n];
    for (&v, (i, _)) in graph.iter() {
        degree[i] += v;
    }
    let inv_sqrt = degree
        .iter()
        .map(|&d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
        .collect::<Vec<_>>();

    let mut laplacian = Array2::<Q>::eye(n);
    for (&v, (i, j)) in graph.iter() {
        laplacian[(i, j)] -= v * inv_sqrt[i] * inv_sqrt[j];
    }

    let (_, vecs) = laplacian.eigh(UPLO::Lower)?;
    // eigenvalues come back ascending; skip the trivial one
    Ok(vecs.slice(s![.., 1..dim + 1]).to_owned())
}

/// Take the first `dim` columns of a precomputed embedding (e.g. PCA coordinates).
pub fn from_coordinates(coords: ArrayView2<Q>, dim: usize) -> Result<Array2<Q>, Error> {
    if coords.ncols() < dim {
        bail!("initial coordinates have {} columns, need {}", coords.ncols(), dim);
    }
    Ok(coords.slice(s![.., ..dim]).to_owned())
}

/// Uniform random layout in `[-INIT_SCALE, INIT_SCALE]`.
pub fn random_layout(n: usize, dim: usize, rng: &mut impl Rng) -> Array2<Q> {
    let dist = Uniform::new(-INIT_SCALE, INIT_SCALE);
    Array2::from_shape_simple_fn((n, dim), || rng.sample(dist))
}

/// Rescale to `[-INIT_SCALE, INIT_SCALE]` and add a little noise so coincident
/// points can separate.
pub fn rescale_with_noise(mut layout: Array2<Q>, rng: &mut impl Rng) -> Array2<Q> {
    let max_abs = layout.iter().fold(0.0 as Q, |acc, &v| acc.max(v.abs()));
    if max_abs > 0.0 {
        layout.mapv_inplace(|v| v * INIT_SCALE / max_abs);
    } else {
        warn!("degenerate initial layout, all coordinates are zero");
    }
    let noise = Uniform::new(-1e-4, 1e-4);
    layout.mapv_inplace(|v| v + rng.sample(noise));
    layout
}

/// Spectral layout when the graph is small enough, otherwise fall back to `fallback`
/// coordinates or a random layout.
pub fn initialize_embedding(
    graph: &CsMat<Q>,
    dim: usize,
    fallback: Option<ArrayView2<Q>>,
    rng: &mut impl Rng,
) -> Result<Array2<Q>, Error> {
    let n = graph.rows();
    if n <= MAX_SPECTRAL_NODES && n > dim + 1 {
        let layout = spectral_layout(graph, dim)?;
        return Ok(rescale_with_noise(layout, rng));
    }
    info!("{} points: skipping spectral initialization", n);
    match fallback {
        Some(coords) => Ok(rescale_with_noise(from_coordinates(coords, dim)?, rng)),
        None => Ok(random_layout(n, dim, rng)),
    }
}

/// Centre each embedding column on zero.
pub fn center(layout: &mut Array2<Q>) {
    if let Some(mean) = layout.mean_axis(Axis(0)) {
        *layout -= &mean;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use sprs::TriMat;

    fn two_components() -> CsMat<Q> {
        // path 0-1-2 and path 3-4-5, joined weakly by 2-3
        let mut t = TriMat::new((6, 6));
        for &(i, j, w) in &[(0, 1, 1.0), (1, 2, 1.0), (3, 4, 1.0), (4, 5, 1.0), (2, 3, 0.01)] {
            t.add_triplet(i, j, w);
            t.add_triplet(j, i, w);
        }
        t.to_csr()
    }

    #[test]
    fn spectral_separates_components() {
        let layout = spectral_layout(&two_components(), 1).unwrap();
        assert_eq!(layout.dim(), (6, 1));
        // Fiedler vector has opposite signs on the two halves
        assert!(layout[(0, 0)] * layout[(5, 0)] < 0.0);
        assert!(layout[(0, 0)] * layout[(1, 0)] > 0.0);
    }

    #[test]
    fn initial_layout_is_scaled() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let layout = initialize_embedding(&two_components(), 2, None, &mut rng).unwrap();
        let max_abs = layout.iter().fold(0.0f64, |a, &v| a.max(v.abs()));
        assert_abs_diff_eq!(max_abs, INIT_SCALE, epsilon = 1e-3);
    }

    #[test]
    fn too_many_dimensions_is_an_error() {
        assert!(spectral_layout(&two_components(), 6).is_err());
        let coords = Array2::<Q>::zeros((6, 1));
        assert!(from_coordinates(coords.view(), 2).is_err());
    }
}
