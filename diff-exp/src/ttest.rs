use crate::PairwiseResult;
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Mean, sample variance and size of one group's values for a gene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub var: f64,
    pub n: usize,
}

impl Summary {
    pub fn from_values(values: &[f64]) -> Summary {
        let n = values.len();
        if n == 0 {
            return Summary {
                mean: f64::NAN,
                var: f64::NAN,
                n,
            };
        }
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = if n > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            f64::NAN
        };
        Summary { mean, var, n }
    }
}

/// Welch t-test of x against y on log-expression values. The effect is the log-fold
/// change `mean_x - mean_y`; with `lfc > 0` the up (down) p-value tests whether the
/// change exceeds `lfc` (is below `-lfc`).
pub fn welch(x: &Summary, y: &Summary, lfc: f64) -> PairwiseResult {
    let effect = x.mean - y.mean;
    let vx = x.var / x.n as f64;
    let vy = y.var / y.n as f64;
    let se2 = vx + vy;

    if !se2.is_finite() {
        return PairwiseResult {
            p_up: f64::NAN,
            p_down: f64::NAN,
            effect,
        };
    }

    if se2 <= 0.0 {
        // no variance: the observed difference is exact
        return PairwiseResult {
            p_up: if effect > lfc { 0.0 } else { 1.0 },
            p_down: if effect < -lfc { 0.0 } else { 1.0 },
            effect,
        };
    }

    let df = se2 * se2 / (vx * vx / (x.n - 1) as f64 + vy * vy / (y.n - 1) as f64);
    let se = se2.sqrt();
    let (p_up, p_down) = match StudentsT::new(0.0, 1.0, df) {
        Ok(t) => (t.sf((effect - lfc) / se), t.cdf((effect + lfc) / se)),
        Err(_) => (f64::NAN, f64::NAN),
    };

    PairwiseResult { p_up, p_down, effect }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::markers::Direction;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_welch_matches_reference() {
        // t.test(c(1,2,3,4,5), c(2,4,6,8,10)): t = -1.897, df = 5.882, p = 0.1075
        let x = Summary::from_values(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let y = Summary::from_values(&[2.0, 4.0, 6.0, 8.0, 10.0]);
        let r = welch(&x, &y, 0.0);
        assert_approx_eq!(r.effect, -3.0, 1e-12);
        assert_approx_eq!(r.p_value(Direction::Any), 0.10753, 1e-4);
        assert!(r.p_down < r.p_up);
        assert_approx_eq!(r.p_up + r.p_down, 1.0, 1e-12);
    }

    #[test]
    fn test_lfc_threshold_raises_pvalues() {
        let x = Summary::from_values(&[3.0, 3.5, 4.0, 3.2, 3.8]);
        let y = Summary::from_values(&[1.0, 1.2, 0.8, 1.1, 0.9]);
        let plain = welch(&x, &y, 0.0);
        let shifted = welch(&x, &y, 1.0);
        assert!(shifted.p_up > plain.p_up);
        assert!(shifted.p_value(Direction::Up) < 0.05);
        assert!(welch(&x, &y, 5.0).p_up > 0.5);
    }

    #[test]
    fn test_constant_groups() {
        let x = Summary::from_values(&[2.0, 2.0]);
        let y = Summary::from_values(&[0.0, 0.0, 0.0]);
        let r = welch(&x, &y, 0.5);
        assert_eq!(r.p_up, 0.0);
        assert_eq!(r.p_down, 1.0);
        let single = Summary::from_values(&[1.0]);
        assert!(welch(&single, &y, 0.0).p_up.is_nan());
    }
}
