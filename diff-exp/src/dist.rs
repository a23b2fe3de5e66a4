use std::cmp::Ordering;

/// Benjamini-Hochberg adjustment of `(index, p-value)` pairs. Pairs come back in
/// descending p-value order with NaNs first; NaN p-values stay NaN and do not count
/// towards the number of tests.
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => b.total_cmp(&a),
    });

    let n_tests = arr.iter().filter(|(_, p)| !p.is_nan()).count() as f64;
    let n_nan = arr.len() - n_tests as usize;

    // q = min(1, cumulative minimum of n / rank * p), walking from the largest p
    let mut min = f64::MAX;
    for (idx, (_, val)) in arr.iter_mut().skip(n_nan).enumerate() {
        let rank = n_tests - idx as f64;
        min = min.min(*val * n_tests / rank);
        *val = min.min(1.0);
    }

    arr
}

/// BH-adjusted values of a p-value vector, in input order.
pub fn bh_adjust(pvalues: &[f64]) -> Vec<f64> {
    let indexed = pvalues.iter().copied().enumerate().collect::<Vec<_>>();
    let mut out = vec![f64::NAN; pvalues.len()];
    for (i, q) in adjusted_pvalue_bh(&indexed) {
        out[i] = q;
    }
    out
}

fn sorted_finite(pvalues: &[f64]) -> Vec<f64> {
    let mut p = pvalues.iter().copied().filter(|p| !p.is_nan()).collect::<Vec<_>>();
    p.sort_by(|a, b| a.total_cmp(b));
    p
}

/// Simes combined p-value: rejects when any individual null is false.
pub fn simes(pvalues: &[f64]) -> f64 {
    let p = sorted_finite(pvalues);
    if p.is_empty() {
        return f64::NAN;
    }
    let m = p.len() as f64;
    p.iter()
        .enumerate()
        .map(|(i, &p)| p * m / (i + 1) as f64)
        .fold(f64::NAN, f64::min)
        .min(1.0)
}

/// Berger intersection-union p-value: rejects only when all individual nulls are false.
pub fn berger(pvalues: &[f64]) -> f64 {
    sorted_finite(pvalues).last().copied().unwrap_or(f64::NAN)
}

/// Holm-adjust the p-values and take the one at the `min_prop` quantile: rejects when
/// at least that proportion of the individual nulls are false.
pub fn holm_middle(pvalues: &[f64], min_prop: f64) -> f64 {
    let p = sorted_finite(pvalues);
    if p.is_empty() {
        return f64::NAN;
    }
    let m = p.len();
    let mut adjusted = Vec::with_capacity(m);
    let mut running = 0.0f64;
    for (i, &v) in p.iter().enumerate() {
        running = running.max((v * (m - i) as f64).min(1.0));
        adjusted.push(running);
    }
    let k = ((m as f64 * min_prop).ceil() as usize).clamp(1, m);
    adjusted[k - 1]
}

/// 1-based ranks of p-values, smallest first; ties get the same (lowest) rank and
/// NaNs rank last.
pub fn rank_pvalues(pvalues: &[f64]) -> Vec<usize> {
    let mut order = (0..pvalues.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        let (pa, pb) = (pvalues[a], pvalues[b]);
        match (pa.is_nan(), pb.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => pa.total_cmp(&pb),
        }
    });
    let mut ranks = vec![0; pvalues.len()];
    let mut prev: Option<(f64, usize)> = None;
    for (pos, &i) in order.iter().enumerate() {
        let rank = match prev {
            Some((p, r)) if p == pvalues[i] => r,
            _ => pos + 1,
        };
        ranks[i] = rank;
        prev = Some((pvalues[i], rank));
    }
    ranks
}
