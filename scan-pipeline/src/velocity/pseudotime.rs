use super::graph::to_dense;
use crate::stats::min_max_scale;
use anyhow::{bail, Error};
use log::debug;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::Inverse;
use sprs::CsMat;

const MAX_POWER_ITERATIONS: usize = 10_000;
const POWER_TOLERANCE: f64 = 1e-12;

/// Dense chain that follows `transitions` with probability `1 - restart` and jumps to
/// a uniformly random cell otherwise, which makes it irreducible.
pub fn damped(transitions: &CsMat<f64>, restart: f64) -> Result<Array2<f64>, Error> {
    if !(0.0..1.0).contains(&restart) {
        bail!("restart probability must be in [0, 1), got {}", restart);
    }
    let n = transitions.rows();
    let mut p = to_dense(transitions);
    p.mapv_inplace(|v| (1.0 - restart) * v + restart / n as f64);
    Ok(p)
}

/// Backward chain: the transposed transitions, renormalized by row.
pub fn backward(chain: &Array2<f64>) -> Array2<f64> {
    let mut b = chain.t().to_owned();
    for mut row in b.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        }
    }
    b
}

/// Stationary distribution `pi P = pi` by power iteration from the uniform vector.
pub fn stationary(chain: &Array2<f64>) -> Array1<f64> {
    let n = chain.nrows();
    let mut pi = Array1::from_elem(n, 1.0 / n as f64);
    for it in 0..MAX_POWER_ITERATIONS {
        let mut next = pi.dot(chain);
        let total = next.sum();
        if total > 0.0 {
            next /= total;
        }
        let delta = (&next - &pi).mapv(f64::abs).sum();
        pi = next;
        if delta < POWER_TOLERANCE {
            debug!("stationary distribution after {} iterations", it + 1);
            break;
        }
    }
    pi
}

/// Root and end-point scores in [0, 1]: stationary mass of the backward and forward
/// chains.
pub fn root_end_scores(chain: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let mut end = stationary(chain);
    let mut root = stationary(&backward(chain));
    min_max_scale(&mut end);
    min_max_scale(&mut root);
    (root, end)
}

/// Diffusion distance from `root` on an irreducible chain, scaled to [0, 1]. The
/// distance between two cells is the norm of the difference of their rows of the
/// accumulated transition matrix `(I - P + 1 pi)^-1 - I`.
pub fn diffusion_pseudotime(chain: &Array2<f64>, root: usize) -> Result<Array1<f64>, Error> {
    let n = chain.nrows();
    if root >= n {
        bail!("root cell {} out of range for {} cells", root, n);
    }
    let pi = stationary(chain);
    let mut m = -chain.clone();
    for i in 0..n {
        m.row_mut(i).scaled_add(1.0, &pi);
        m[(i, i)] += 1.0;
    }
    let mut fundamental = m.inv()?;
    for i in 0..n {
        fundamental[(i, i)] -= 1.0;
    }
    let origin = fundamental.row(root).to_owned();
    let mut time = fundamental
        .outer_iter()
        .map(|row| {
            let d = &row - &origin;
            d.dot(&d).sqrt()
        })
        .collect::<Array1<f64>>();
    min_max_scale(&mut time);
    Ok(time)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use sc_types::matrix::from_rows;

    /// Forward chain along a line of cells; the last cell is absorbing.
    fn line_chain(n: usize) -> CsMat<f64> {
        let rows = (0..n)
            .map(|i| if i + 1 < n { vec![(i, 0.2), (i + 1, 0.8)] } else { vec![(i, 1.0)] })
            .collect();
        from_rows((n, n), rows).unwrap()
    }

    #[test]
    fn test_damped_rows_sum_to_one() {
        let p = damped(&line_chain(5), 0.01).unwrap();
        for row in p.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert!(damped(&line_chain(5), 1.0).is_err());
        let b = backward(&p);
        for row in b.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_scores_and_pseudotime_follow_the_line() {
        let n = 8;
        let p = damped(&line_chain(n), 0.01).unwrap();
        let pi = stationary(&p);
        assert_abs_diff_eq!(pi.sum(), 1.0, epsilon = 1e-9);
        let (root, end) = root_end_scores(&p);
        assert_eq!(end[n - 1], 1.0);
        assert_eq!(root[0], 1.0);
        assert!(end[0] < end[n - 1]);

        let time = diffusion_pseudotime(&p, 0).unwrap();
        assert_eq!(time[0], 0.0);
        assert_abs_diff_eq!(time.iter().copied().fold(0.0, f64::max), 1.0);
        for i in 1..n {
            assert!(time[i] > time[i - 1], "{time:?}");
        }
        assert!(diffusion_pseudotime(&p, n).is_err());
    }
}
