use crate::Q;
use log::debug;
use ndarray::Array1;

/// Low-dimensional similarity curve `1 / (1 + a * x^(2b))`.
fn curve(a: Q, b: Q, x: Q) -> Q {
    1.0 / (1.0 + a * x.powf(2.0 * b))
}

/// Figure of merit that is minimized during the fit procedure
fn chi2(a: Q, b: Q, x: &Array1<Q>, y: &Array1<Q>) -> Q {
    x.iter().zip(y).map(|(&x, &y)| (y - curve(a, b, x)).powi(2)).sum()
}

/// Fit `a` and `b` so the curve matches the target membership profile: 1 below
/// `min_dist`, then decaying as `exp(-(x - min_dist) / spread)`.
///
/// Levenberg-Marquardt on the two parameters: each step solves
/// `(JᵀJ + λ diag(JᵀJ)) δ = Jᵀ(y - f)`; λ shrinks after an accepted step and grows
/// after a rejected one.
pub fn find_ab_params(spread: Q, min_dist: Q) -> (Q, Q) {
    let x = Array1::range(0.0, 3.0 * spread, spread / 100.0);
    let y = x.map(|&x| if x < min_dist { 1.0 } else { (-(x - min_dist) / spread).exp() });

    let (mut a, mut b) = (1.0, 1.0);
    let mut lambda = 1e-3;
    let mut current = chi2(a, b, &x, &y);

    for iteration in 0..200 {
        let (mut jtj, mut jtr) = ([[0.0; 2]; 2], [0.0; 2]);
        for (&xi, &yi) in x.iter().zip(&y) {
            let f = curve(a, b, xi);
            let (da, db) = if xi > 0.0 {
                let p = xi.powf(2.0 * b);
                let denom = (1.0 + a * p).powi(2);
                (-p / denom, -a * p * 2.0 * xi.ln() / denom)
            } else {
                (0.0, 0.0)
            };
            let grad = [da, db];
            for r in 0..2 {
                jtr[r] += grad[r] * (yi - f);
                for c in 0..2 {
                    jtj[r][c] += grad[r] * grad[c];
                }
            }
        }

        let m00 = jtj[0][0] * (1.0 + lambda);
        let m11 = jtj[1][1] * (1.0 + lambda);
        let det = m00 * m11 - jtj[0][1] * jtj[1][0];
        if det.abs() < Q::EPSILON {
            break;
        }
        let delta_a = (m11 * jtr[0] - jtj[0][1] * jtr[1]) / det;
        let delta_b = (m00 * jtr[1] - jtj[1][0] * jtr[0]) / det;

        let updated = chi2(a + delta_a, b + delta_b, &x, &y);
        if updated < current {
            a += delta_a;
            b += delta_b;
            let improvement = current - updated;
            current = updated;
            lambda = (lambda / 9.0).max(1e-12);
            if improvement < 1e-12 * current.max(1e-12) || (delta_a.abs() < 1e-10 && delta_b.abs() < 1e-10) {
                debug!("a/b fit converged after {} iterations", iteration + 1);
                break;
            }
        } else {
            lambda *= 11.0;
            if lambda > 1e12 {
                break;
            }
        }
    }
    (a, b)
}
