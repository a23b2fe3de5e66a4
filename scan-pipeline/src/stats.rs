//! Statistics functions

use anyhow::{bail, Error};
use ndarray::prelude::*;
use ndarray::DataMut;
use ndarray_stats::errors::QuantileError;
use noisy_float::prelude::{n64, N64};
use num_traits::FromPrimitive;
use std::ops::{Add, Div, Mul, Rem, Sub};

/// Return the median. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, QuantileError>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive,
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Rem<Output = T>,
{
    // ndarray-stats quantile_mut can overflow the stack on large inputs
    // (https://github.com/rust-ndarray/ndarray-stats/issues/86), so sort instead
    if xs.is_empty() {
        return Err(QuantileError::EmptyInput);
    }
    let mut sorted = xs.to_vec();
    sorted.sort_unstable();
    for (x, s) in xs.iter_mut().zip(sorted) {
        *x = s;
    }
    let two = T::from_u64(2).ok_or(QuantileError::EmptyInput)?;
    Ok(if xs.len() % 2 == 0 {
        (xs[xs.len() / 2] + xs[xs.len() / 2 - 1]) / two
    } else {
        xs[xs.len() / 2]
    })
}

fn to_n64(values: &[f64]) -> Result<Array1<N64>, Error> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        bail!("cannot take the median of a non-finite value ({})", bad);
    }
    Ok(values.iter().map(|&v| n64(v)).collect())
}

/// Median of finite floats.
pub fn median(values: &[f64]) -> Result<f64, Error> {
    let mut xs = to_n64(values)?;
    Ok(median_mut(&mut xs)?.raw())
}

/// Median absolute deviation around the median, scaled by 1.4826 to estimate a
/// normal standard deviation. Returns (median, mad).
pub fn median_mad(values: &[f64]) -> Result<(f64, f64), Error> {
    let center = median(values)?;
    let deviations = values.iter().map(|v| (v - center).abs()).collect::<Vec<_>>();
    Ok((center, 1.4826 * median(&deviations)?))
}

/// Linear-interpolated quantile (`q` in [0, 1]) of unsorted values, NaN for empty input.
pub fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.iter().copied().filter(|v| !v.is_nan()).collect::<Vec<_>>();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Pearson correlation; 0 when either side is constant.
pub fn pearson(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let n = x.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mx = x.sum() / n;
    let my = y.sum() / n;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
        syy += (b - my) * (b - my);
    }
    if sxx <= 0.0 || syy <= 0.0 {
        0.0
    } else {
        sxy / (sxx * syy).sqrt()
    }
}

/// Scale values to [0, 1]; a constant input maps to all zeros.
pub fn min_max_scale(values: &mut Array1<f64>) {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = hi - lo;
    if range > 0.0 && range.is_finite() {
        values.mapv_inplace(|v| (v - lo) / range);
    } else {
        values.fill(0.0);
    }
}

#[cfg(test)]
mod test_stats {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::array;

    #[test]
    fn test_median_mut() {
        assert_eq!(
            median_mut(&mut Array::<usize, Ix1>::from(vec![])),
            Err(QuantileError::EmptyInput)
        );
        assert_eq!(median_mut(&mut array![1]), Ok(1));
        assert_eq!(median_mut(&mut array![10, 1]), Ok(5));
        assert_eq!(median_mut(&mut array![100, 1, 10]), Ok(10));
        assert_eq!(median_mut(&mut array![1., 10.].mapv(n64)), Ok(n64(5.5)));
        assert_eq!(median_mut(&mut array![1000., 1., 10., 100.].mapv(n64)), Ok(n64(55.0)));
    }

    #[test]
    fn test_median_mad() {
        let (m, mad) = median_mad(&[1.0, 2.0, 3.0, 4.0, 100.0]).unwrap();
        assert_eq!(m, 3.0);
        assert_abs_diff_eq!(mad, 1.4826, epsilon = 1e-12);
        assert!(median(&[1.0, f64::NAN]).is_err());
        assert!(median(&[]).is_err());
    }

    #[test]
    fn test_quantile_and_pearson() {
        let v = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_abs_diff_eq!(quantile(&v, 0.5), 3.0);
        assert_abs_diff_eq!(quantile(&v, 0.1), 1.4, epsilon = 1e-12);
        assert!(quantile(&[], 0.5).is_nan());

        let x = array![1.0, 2.0, 3.0, 4.0];
        assert_abs_diff_eq!(pearson(x.view(), x.mapv(|v| 3.0 * v - 1.0).view()), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(pearson(x.view(), x.mapv(|v| -v).view()), -1.0, epsilon = 1e-12);
        assert_eq!(pearson(x.view(), Array1::ones(4).view()), 0.0);
    }

    #[test]
    fn test_min_max_scale() {
        let mut v = array![2.0, 4.0, 3.0];
        min_max_scale(&mut v);
        assert_eq!(v, array![0.0, 1.0, 0.5]);
        let mut c = array![1.0, 1.0];
        min_max_scale(&mut c);
        assert_eq!(c, array![0.0, 0.0]);
    }
}
