use crate::PairwiseResult;
use statrs::distribution::{ContinuousCDF, Normal};

/// Mann-Whitney U of x against y, with the tie term `Σ(t³ - t)` used to correct the
/// variance.
fn u_statistic(x: &[f64], y: &[f64], shift: f64) -> (f64, f64) {
    let mut combined = Vec::with_capacity(x.len() + y.len());
    combined.extend(x.iter().map(|&v| (v - shift, true)));
    combined.extend(y.iter().map(|&v| (v, false)));
    combined.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut rank_sum_x = 0.0;
    let mut ties = 0.0;
    let mut i = 0;
    while i < combined.len() {
        let mut j = i + 1;
        while j < combined.len() && combined[j].0 == combined[i].0 {
            j += 1;
        }
        // average of 1-based ranks i+1 ..= j
        let rank = (i + j + 1) as f64 / 2.0;
        let in_x = combined[i..j].iter().filter(|(_, is_x)| *is_x).count();
        rank_sum_x += rank * in_x as f64;
        let t = (j - i) as f64;
        ties += t * t * t - t;
        i = j;
    }

    let nx = x.len() as f64;
    (rank_sum_x - nx * (nx + 1.0) / 2.0, ties)
}

/// Normal approximation of the rank sum test with continuity correction. Returns
/// (p_up, p_down) for the given U.
fn u_pvalues(u: f64, ties: f64, nx: f64, ny: f64) -> (f64, f64) {
    let n = nx + ny;
    let mean = nx * ny / 2.0;
    let var = nx * ny / 12.0 * ((n + 1.0) - ties / (n * (n - 1.0)));
    if !(var > 0.0) {
        return (1.0, 1.0);
    }
    let sd = var.sqrt();
    // N(0, 1) always constructs
    let normal = match Normal::new(0.0, 1.0) {
        Ok(n) => n,
        Err(_) => return (f64::NAN, f64::NAN),
    };
    (
        normal.sf((u - mean - 0.5) / sd),
        normal.cdf((u - mean + 0.5) / sd),
    )
}

/// Wilcoxon rank sum test of x against y. The effect is the AUC, the probability that
/// a random x exceeds a random y (ties count half). With `lfc > 0` x is shifted down
/// (up) by `lfc` before testing for an increase (decrease).
pub fn rank_sum(x: &[f64], y: &[f64], lfc: f64) -> PairwiseResult {
    let (nx, ny) = (x.len() as f64, y.len() as f64);
    if x.is_empty() || y.is_empty() {
        return PairwiseResult {
            p_up: f64::NAN,
            p_down: f64::NAN,
            effect: f64::NAN,
        };
    }

    let (u, ties) = u_statistic(x, y, 0.0);
    let effect = u / (nx * ny);

    let (p_up, p_down) = if lfc == 0.0 {
        u_pvalues(u, ties, nx, ny)
    } else {
        let (u_up, ties_up) = u_statistic(x, y, lfc);
        let (u_down, ties_down) = u_statistic(x, y, -lfc);
        (
            u_pvalues(u_up, ties_up, nx, ny).0,
            u_pvalues(u_down, ties_down, nx, ny).1,
        )
    };

    PairwiseResult { p_up, p_down, effect }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_auc() {
        let r = rank_sum(&[4.0, 5.0, 6.0], &[1.0, 2.0, 3.0], 0.0);
        assert_approx_eq!(r.effect, 1.0, 1e-12);
        let r = rank_sum(&[1.0, 2.0], &[1.0, 2.0], 0.0);
        assert_approx_eq!(r.effect, 0.5, 1e-12);
    }

    #[test]
    fn test_pvalues_match_reference() {
        // wilcox.test(x, y, alternative = "greater", exact = FALSE, correct = TRUE)
        let x = [1.83, 0.50, 1.62, 2.48, 1.68, 1.88, 1.55, 3.06, 1.30];
        let y = [0.878, 0.647, 0.598, 2.05, 1.06, 1.29, 1.06, 3.14, 1.29];
        let r = rank_sum(&x, &y, 0.0);
        assert_approx_eq!(r.p_up, 0.06646, 1e-4);
        assert!(r.p_down > 0.9);
    }

    #[test]
    fn test_all_tied() {
        let r = rank_sum(&[0.0, 0.0], &[0.0, 0.0, 0.0], 0.0);
        assert_eq!(r.p_up, 1.0);
        assert_eq!(r.p_down, 1.0);
        assert_approx_eq!(r.effect, 0.5, 1e-12);
    }

    #[test]
    fn test_shift() {
        let x = [5.0, 5.5, 6.0, 5.2, 5.9, 6.1];
        let y = [1.0, 1.5, 1.2, 0.9, 1.1, 1.3];
        assert!(rank_sum(&x, &y, 0.0).p_up < 0.01);
        assert!(rank_sum(&x, &y, 10.0).p_up > 0.5);
    }
}
