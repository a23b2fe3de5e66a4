use crate::PairwiseResult;
use statrs::distribution::{Binomial, DiscreteCDF};

/// Exact binomial test on the number of expressing cells. Conditioned on the total
/// number of expressing cells in both groups, the count in x is binomial with success
/// probability `n_x / (n_x + n_y)` under the null. With `lfc > 0` that probability is
/// computed after scaling x's size by `2^lfc` (up) or `2^-lfc` (down).
///
/// The effect is `log2(prop_x / prop_y)`; 0 when neither group expresses the gene.
pub fn binomial(expressing_x: u64, n_x: u64, expressing_y: u64, n_y: u64, lfc: f64) -> PairwiseResult {
    if n_x == 0 || n_y == 0 {
        return PairwiseResult {
            p_up: f64::NAN,
            p_down: f64::NAN,
            effect: f64::NAN,
        };
    }

    let prop_x = expressing_x as f64 / n_x as f64;
    let prop_y = expressing_y as f64 / n_y as f64;
    let effect = if expressing_x + expressing_y == 0 {
        0.0
    } else {
        prop_x.log2() - prop_y.log2()
    };

    let total = expressing_x + expressing_y;
    if total == 0 {
        return PairwiseResult {
            p_up: 1.0,
            p_down: 1.0,
            effect,
        };
    }

    let null_p = |scale: f64| {
        let sx = n_x as f64 * scale;
        sx / (sx + n_y as f64)
    };

    let p_up = match Binomial::new(null_p(2f64.powf(lfc)), total) {
        // P(X >= k)
        Ok(b) if expressing_x > 0 => b.sf(expressing_x - 1),
        Ok(_) => 1.0,
        Err(_) => f64::NAN,
    };
    let p_down = match Binomial::new(null_p(2f64.powf(-lfc)), total) {
        Ok(b) => b.cdf(expressing_x),
        Err(_) => f64::NAN,
    };

    PairwiseResult { p_up, p_down, effect }
}
