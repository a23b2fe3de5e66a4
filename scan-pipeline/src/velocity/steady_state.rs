use crate::stats::quantile;
use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};

/// Per-gene steady-state fit
#[derive(Clone, Debug)]
pub struct SteadyState {
    /// degradation to splicing rate ratio
    pub gamma: Array1<f64>,
    pub r2: Array1<f64>,
    pub velocity_genes: Vec<bool>,
}

impl SteadyState {
    pub fn velocity_gene_indices(&self) -> Vec<usize> {
        self.velocity_genes
            .iter()
            .enumerate()
            .filter_map(|(g, &keep)| keep.then_some(g))
            .collect()
    }
}

/// Slope through the origin of `mu` on `ms` over the cells in the lower and upper
/// `perc` percent of the combined max-scaled abundance, and the R² of the resulting
/// residual over all cells.
fn fit_gene(ms: ArrayView1<f64>, mu: ArrayView1<f64>, perc: f64) -> (f64, f64) {
    let max_s = ms.fold(0.0f64, |a, &b| a.max(b));
    let max_u = mu.fold(0.0f64, |a, &b| a.max(b));
    if max_s <= 0.0 || max_u <= 0.0 {
        return (0.0, 0.0);
    }
    let xy = ms
        .iter()
        .zip(mu.iter())
        .map(|(s, u)| s / max_s + u / max_u)
        .collect::<Vec<_>>();
    let lower = quantile(&xy, perc / 100.0);
    let upper = quantile(&xy, 1.0 - perc / 100.0);

    let mut sus = 0.0;
    let mut sss = 0.0;
    for ((&v, &s), &u) in xy.iter().zip(ms.iter()).zip(mu.iter()) {
        if v <= lower || v >= upper {
            sus += u * s;
            sss += s * s;
        }
    }
    if sss <= 0.0 {
        return (0.0, 0.0);
    }
    let gamma = sus / sss;

    let mean_u = mu.mean().unwrap_or(0.0);
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (&s, &u) in ms.iter().zip(mu.iter()) {
        ss_res += (u - gamma * s).powi(2);
        ss_tot += (u - mean_u).powi(2);
    }
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    (gamma, r2)
}

/// Fit every gene (columns of the cells × genes moments). Velocity genes need
/// `r2 > min_r2` and `gamma > min_gamma`.
pub fn fit_steady_state(
    ms: ArrayView2<f64>,
    mu: ArrayView2<f64>,
    perc: f64,
    min_r2: f64,
    min_gamma: f64,
) -> Result<SteadyState, Error> {
    if ms.dim() != mu.dim() {
        bail!("spliced moments {:?} and unspliced moments {:?} differ in shape", ms.dim(), mu.dim());
    }
    if !(perc > 0.0 && perc < 50.0) {
        bail!("extreme quantile must be in (0, 50) percent, got {}", perc);
    }
    let n_genes = ms.ncols();
    let mut gamma = Array1::<f64>::zeros(n_genes);
    let mut r2 = Array1::<f64>::zeros(n_genes);
    Zip::from(&mut gamma)
        .and(&mut r2)
        .and(ms.columns())
        .and(mu.columns())
        .par_for_each(|g, r, s, u| {
            let (fit_g, fit_r) = fit_gene(s, u, perc);
            *g = fit_g;
            *r = fit_r;
        });
    let velocity_genes = gamma
        .iter()
        .zip(r2.iter())
        .map(|(&g, &r)| r > min_r2 && g > min_gamma)
        .collect();
    Ok(SteadyState {
        gamma,
        r2,
        velocity_genes,
    })
}

/// `Mu - gamma * Ms` on velocity genes, zero elsewhere.
pub fn velocity(ms: ArrayView2<f64>, mu: ArrayView2<f64>, fit: &SteadyState) -> Array2<f64> {
    let mut v = Array2::<f64>::zeros(ms.dim());
    for g in fit.velocity_gene_indices() {
        let gamma = fit.gamma[g];
        Zip::from(v.column_mut(g))
            .and(ms.column(g))
            .and(mu.column(g))
            .for_each(|v, &s, &u| *v = u - gamma * s);
    }
    v
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Uniform;
    use rand_pcg::Pcg64Mcg;

    #[test]
    fn test_recovers_ratio_at_steady_state() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        let n = 200;
        let ms = Array2::random_using((n, 3), Uniform::new(0.0, 10.0), &mut rng);
        let noise = Array2::random_using((n, 3), Uniform::new(-0.05, 0.05), &mut rng);
        let mut mu = Array2::<f64>::zeros((n, 3));
        // gene 0: gamma 0.5, gene 1: gamma 2.0, gene 2: unrelated to spliced
        for c in 0..n {
            mu[(c, 0)] = 0.5 * ms[(c, 0)] + noise[(c, 0)];
            mu[(c, 1)] = 2.0 * ms[(c, 1)] + noise[(c, 1)];
            mu[(c, 2)] = 1.0 + noise[(c, 2)];
        }
        let fit = fit_steady_state(ms.view(), mu.view(), 5.0, 0.01, 0.01).unwrap();
        assert_approx_eq!(fit.gamma[0], 0.5, 0.01);
        assert_approx_eq!(fit.gamma[1], 2.0, 0.01);
        assert!(fit.r2[0] > 0.99);
        assert!(fit.r2[2] < 0.01);
        assert_eq!(fit.velocity_genes, vec![true, true, false]);

        let v = velocity(ms.view(), mu.view(), &fit);
        assert!(v.column(2).iter().all(|&x| x == 0.0));
        assert_approx_eq!(v[(0, 0)], mu[(0, 0)] - fit.gamma[0] * ms[(0, 0)]);
    }

    #[test]
    fn test_silent_gene_and_bad_quantile() {
        let ms = Array2::<f64>::zeros((10, 1));
        let mu = Array2::<f64>::ones((10, 1));
        let fit = fit_steady_state(ms.view(), mu.view(), 5.0, 0.01, 0.01).unwrap();
        assert_eq!(fit.gamma[0], 0.0);
        assert!(!fit.velocity_genes[0]);
        assert!(fit_steady_state(ms.view(), mu.view(), 60.0, 0.01, 0.01).is_err());
    }
}
