//! Per-gene variance modelling: total variance of log-expression is split into a
//! technical component, read off a mean-variance trend, and a biological remainder.

use crate::normalization::LOGCOUNTS;
use crate::stats::median;
use anyhow::{bail, Error};
use diff_exp::dist::bh_adjust;
use log::info;
use ndarray::Array1;
use sc_types::matrix::row_mean_var;
use sc_types::{Column, Dataset, Layer};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Trend fitting settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceParams {
    /// fraction of genes in each local regression window
    pub span: f64,
    /// robustness iterations
    pub iterations: usize,
    /// genes with a lower mean are left out of the fit
    pub min_mean: f64,
}

impl Default for VarianceParams {
    fn default() -> Self {
        VarianceParams {
            span: 0.3,
            iterations: 3,
            min_mean: 0.1,
        }
    }
}

/// Per-gene decomposition, one entry per gene.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneVarStats {
    pub mean: Array1<f64>,
    pub total: Array1<f64>,
    pub tech: Array1<f64>,
    pub bio: Array1<f64>,
    pub p_value: Array1<f64>,
    pub fdr: Array1<f64>,
}

fn tricube(d: f64) -> f64 {
    if d >= 1.0 {
        0.0
    } else {
        let t = 1.0 - d * d * d;
        t * t * t
    }
}

fn bisquare(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u;
        t * t
    }
}

/// Locally weighted linear regression of `y` on `x` (Cleveland's LOWESS) with
/// `iterations` robustness passes. `x` must be sorted ascending; returns the fit at
/// every `x`.
pub fn lowess(x: &[f64], y: &[f64], span: f64, iterations: usize) -> Result<Vec<f64>, Error> {
    let n = x.len();
    if n != y.len() {
        bail!("lowess: {} x values but {} y values", n, y.len());
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    if x.windows(2).any(|w| w[0] > w[1]) {
        bail!("lowess: x values must be sorted");
    }
    let q = ((span * n as f64).ceil() as usize).clamp(2.min(n), n);
    let y_scale = y.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
    let mut robustness = vec![1.0; n];
    let mut fitted = vec![0.0; n];

    for pass in 0..=iterations {
        let mut lo = 0;
        for i in 0..n {
            while lo + q < n && x[lo + q] - x[i] < x[i] - x[lo] {
                lo += 1;
            }
            let hi = lo + q;
            let radius = (x[i] - x[lo]).max(x[hi - 1] - x[i]);

            let mut sw = 0.0;
            let mut sx = 0.0;
            let mut sy = 0.0;
            for j in lo..hi {
                let w = if radius > 0.0 { tricube((x[j] - x[i]).abs() / radius) } else { 1.0 } * robustness[j];
                sw += w;
                sx += w * x[j];
                sy += w * y[j];
            }
            if sw <= 0.0 {
                fitted[i] = y[i];
                continue;
            }
            let mx = sx / sw;
            let my = sy / sw;
            let mut sxx = 0.0;
            let mut sxy = 0.0;
            for j in lo..hi {
                let w = if radius > 0.0 { tricube((x[j] - x[i]).abs() / radius) } else { 1.0 } * robustness[j];
                sxx += w * (x[j] - mx) * (x[j] - mx);
                sxy += w * (x[j] - mx) * (y[j] - my);
            }
            let slope = if sxx > 1e-12 * (radius * radius).max(1e-300) { sxy / sxx } else { 0.0 };
            fitted[i] = my + slope * (x[i] - mx);
        }

        if pass == iterations {
            break;
        }
        let residuals = y.iter().zip(&fitted).map(|(a, b)| (a - b).abs()).collect::<Vec<_>>();
        let scale = 6.0 * median(&residuals)?;
        if scale <= 1e-7 * y_scale {
            break;
        }
        for (r, res) in robustness.iter_mut().zip(&residuals) {
            *r = bisquare(res / scale);
        }
    }
    Ok(fitted)
}

/// Evaluate a trend known at sorted points `(xs, ys)`: linear interpolation inside,
/// the right-edge value above, and a line through the origin below the left edge.
fn evaluate_trend(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len();
    if x <= xs[0] {
        return if xs[0] > 0.0 { ys[0] * x / xs[0] } else { ys[0] };
    }
    if x >= xs[n - 1] {
        return ys[n - 1];
    }
    let hi = xs.partition_point(|&v| v < x);
    let lo = hi - 1;
    let t = (x - xs[lo]) / (xs[hi] - xs[lo]);
    ys[lo] + t * (ys[hi] - ys[lo])
}

/// Model per-gene variance of a log-expression layer (genes × cells).
pub fn model_gene_var(logcounts: &Layer, params: &VarianceParams) -> Result<GeneVarStats, Error> {
    let n_cells = logcounts.cols();
    if n_cells < 3 {
        bail!("variance modelling needs at least 3 cells, got {}", n_cells);
    }
    let (mean, total) = row_mean_var(logcounts);

    let mut fit_genes = (0..mean.len())
        .filter(|&g| mean[g] >= params.min_mean && total[g] > 0.0)
        .collect::<Vec<_>>();
    if fit_genes.len() < 3 {
        bail!(
            "only {} genes have mean >= {} and positive variance; cannot fit a trend",
            fit_genes.len(),
            params.min_mean
        );
    }
    fit_genes.sort_by(|&a, &b| mean[a].total_cmp(&mean[b]).then(a.cmp(&b)));
    let xs = fit_genes.iter().map(|&g| mean[g]).collect::<Vec<_>>();
    let ys = fit_genes.iter().map(|&g| total[g]).collect::<Vec<_>>();
    let trend = lowess(&xs, &ys, params.span, params.iterations)?;

    let tech = mean.mapv(|m| evaluate_trend(&xs, &trend, m).max(0.0));
    let bio = &total - &tech;

    let df = (n_cells - 1) as f64;
    let chi2 = ChiSquared::new(df)?;
    let p_value = total
        .iter()
        .zip(&tech)
        .map(|(&t, &tech)| if tech > 0.0 { chi2.sf(df * t / tech) } else { f64::NAN })
        .collect::<Array1<f64>>();
    let fdr = Array1::from(bh_adjust(&p_value.to_vec()));

    info!(
        "variance model: trend fitted on {} of {} genes, {} with positive biological component",
        fit_genes.len(),
        mean.len(),
        bio.iter().filter(|&&b| b > 0.0).count()
    );
    Ok(GeneVarStats {
        mean,
        total,
        tech,
        bio,
        p_value,
        fdr,
    })
}

/// Run `model_gene_var` on `logcounts` and store the decomposition as var columns.
pub fn model_dataset_gene_var(dataset: &mut Dataset, params: &VarianceParams) -> Result<GeneVarStats, Error> {
    let stats = model_gene_var(dataset.layer(LOGCOUNTS)?, params)?;
    let var = dataset.var_mut();
    var.insert("mean", Column::Numeric(stats.mean.clone()))?;
    var.insert("total", Column::Numeric(stats.total.clone()))?;
    var.insert("tech", Column::Numeric(stats.tech.clone()))?;
    var.insert("bio", Column::Numeric(stats.bio.clone()))?;
    var.insert("p_value", Column::Numeric(stats.p_value.clone()))?;
    var.insert("fdr", Column::Numeric(stats.fdr.clone()))?;
    Ok(stats)
}

/// Read a decomposition previously stored by `model_dataset_gene_var`.
pub fn stored_gene_var(dataset: &Dataset) -> Result<GeneVarStats, Error> {
    let var = dataset.var();
    Ok(GeneVarStats {
        mean: var.numeric("mean")?.clone(),
        total: var.numeric("total")?.clone(),
        tech: var.numeric("tech")?.clone(),
        bio: var.numeric("bio")?.clone(),
        p_value: var.numeric("p_value")?.clone(),
        fdr: var.numeric("fdr")?.clone(),
    })
}
