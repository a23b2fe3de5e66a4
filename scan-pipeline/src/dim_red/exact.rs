use super::{Pca, SvdResult};
use anyhow::{bail, format_err, Error};
use ndarray::{s, Array2};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::SVDDCInto;

/// Full divide-and-conquer SVD, truncated to the leading `k` components.
pub struct ExactSvd;

impl Pca<Array2<f64>> for ExactSvd {
    fn run_pca(&self, matrix: &Array2<f64>, k: usize) -> Result<SvdResult, Error> {
        let (m, n) = matrix.dim();
        if k > m.min(n) {
            bail!("invalid k: {} for a {}x{} matrix", k, m, n);
        }
        let (u, sigma, vt) = matrix.clone().svddc_into(JobSvd::Some)?;
        let u = u.ok_or_else(|| format_err!("SVD returned no left singular vectors"))?;
        let vt = vt.ok_or_else(|| format_err!("SVD returned no right singular vectors"))?;
        Ok((
            u.slice(s![.., ..k]).to_owned(),
            sigma.slice(s![..k]).to_owned(),
            vt.slice(s![..k, ..]).to_owned().reversed_axes(),
        ))
    }
}
