//! Macrostates and fate probabilities of a cell-cell Markov chain.
//!
//! The chain is coarse-grained with PCCA+: a real basis of the dominant invariant
//! subspace (constant vector first) is mapped onto the vertices of a simplex, giving
//! fuzzy memberships of every cell in `m` macrostates. Macrostates that keep most of
//! their probability mass under the coarse-grained chain are terminal, and the
//! absorption probabilities of all other cells into them are the fate probabilities.

use crate::stats::pearson;
use anyhow::{bail, Error};
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use ndarray_linalg::{Eig, FactorizeInto, Inverse, Solve, QR};
use sc_types::Categorical;
use std::collections::BTreeMap;

const DEGENERATE: f64 = 1e-10;

/// Orthonormal real basis (scaled so that the first column is all ones) of the
/// invariant subspace of the `m` eigenvalues of `chain` with largest real part.
/// Complex pairs enter as their real and imaginary parts; a pair straddling the
/// `m`-th position is kept whole, giving `m + 1` vectors.
pub fn schur_basis(chain: &Array2<f64>, m: usize) -> Result<Array2<f64>, Error> {
    let n = chain.nrows();
    if m < 2 || m > n {
        bail!("need between 2 and {} macrostates, got {}", n, m);
    }
    let (values, vectors) = chain.eig()?;
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &b| values[b].re.total_cmp(&values[a].re));
    debug!(
        "leading eigenvalues {:?}",
        order.iter().take(m + 1).map(|&i| values[i]).collect::<Vec<_>>()
    );

    let mut columns: Vec<Array1<f64>> = vec![Array1::ones(n)];
    for &i in order.iter().skip(1) {
        if columns.len() >= m {
            break;
        }
        let v = vectors.column(i);
        if values[i].im.abs() < DEGENERATE {
            columns.push(v.mapv(|z| z.re));
        } else if values[i].im > 0.0 {
            if columns.len() + 2 > m {
                warn!("eigenvalue {} has a conjugate partner, using {} macrostates", values[i], m + 1);
            }
            columns.push(v.mapv(|z| z.re));
            columns.push(v.mapv(|z| z.im));
        }
    }
    if columns.len() < 2 {
        bail!("no invariant subspace beyond the stationary vector");
    }

    let k = columns.len();
    let mut x = Array2::<f64>::zeros((n, k));
    for (j, col) in columns.iter().enumerate() {
        x.column_mut(j).assign(col);
    }
    let (q, r) = x.qr()?;
    if (0..k).any(|j| r[(j, j)].abs() < DEGENERATE) {
        bail!("invariant subspace basis is rank deficient");
    }
    let mut basis = q * (n as f64).sqrt();
    if basis[(0, 0)] < 0.0 {
        basis.column_mut(0).mapv_inplace(|v| -v);
    }
    Ok(basis)
}

/// Rows of the basis that span the largest simplex: the farthest row from the
/// origin, then repeatedly the row farthest from the span of those already taken.
fn index_search(basis: &Array2<f64>) -> Result<Vec<usize>, Error> {
    let (n, m) = basis.dim();
    let norm = |row: ndarray::ArrayView1<f64>| row.dot(&row).sqrt();
    let mut first = 0;
    let mut best = f64::NEG_INFINITY;
    for (i, row) in basis.outer_iter().enumerate() {
        let d = norm(row);
        if d > best {
            best = d;
            first = i;
        }
    }
    let mut ortho = basis.clone();
    let origin = ortho.row(first).to_owned();
    for mut row in ortho.outer_iter_mut() {
        row -= &origin;
    }

    let mut index = vec![first];
    for j in 1..m {
        let temp = ortho.row(index[j - 1]).to_owned();
        let mut max_dist = 0.0;
        let mut next = 0;
        for i in 0..n {
            let mut row = ortho.row_mut(i);
            let proj = row.dot(&temp);
            row.scaled_add(-proj, &temp);
            let d = norm(row.view());
            if d > max_dist {
                max_dist = d;
                next = i;
            }
        }
        if max_dist < DEGENERATE {
            bail!("cannot find {} distinct simplex vertices", m);
        }
        ortho /= max_dist;
        index.push(next);
    }
    Ok(index)
}

/// PCCA+ memberships (cells × m, rows on the simplex) from the inner simplex of
/// the basis, made feasible by adjusting the first row and column of the
/// transformation.
pub fn pcca_memberships(basis: &Array2<f64>) -> Result<Array2<f64>, Error> {
    let (n, m) = basis.dim();
    if n < m {
        bail!("{} cells cannot hold {} macrostates", n, m);
    }
    let vertices = index_search(basis)?;
    let mut a = basis.select(Axis(0), &vertices).inv()?;

    for i in 1..m {
        let rest: f64 = a.slice(s![i, 1..]).sum();
        a[(i, 0)] = -rest;
    }
    let dummy = basis.slice(s![.., 1..]).dot(&a.slice(s![1.., ..]));
    for j in 0..m {
        let min = dummy.column(j).fold(f64::INFINITY, |acc, &v| acc.min(v));
        a[(0, j)] = -min;
    }
    let total = a.row(0).sum();
    if !(total > DEGENERATE) {
        bail!("degenerate PCCA+ transformation");
    }
    a /= total;

    let mut chi = basis.dot(&a);
    for mut row in chi.outer_iter_mut() {
        row.mapv_inplace(|v| v.max(0.0));
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        }
    }
    Ok(chi)
}

/// Index of the largest membership of every cell.
pub fn assign_macrostates(memberships: &Array2<f64>) -> Vec<usize> {
    memberships
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (j, &v)| if v > best.1 { (j, v) } else { best })
                .0
        })
        .collect()
}

/// Coarse-grained transitions between macrostates: `(chi' chi)^-1 chi' P chi`.
pub fn coarse_grain(chain: &Array2<f64>, memberships: &Array2<f64>) -> Result<Array2<f64>, Error> {
    let overlap = memberships.t().dot(memberships);
    let flux = memberships.t().dot(&chain.dot(memberships));
    Ok(overlap.inv()?.dot(&flux))
}

/// Macrostates whose coarse self-transition reaches `threshold`; the most stable one
/// when none does.
pub fn terminal_macrostates(coarse: &Array2<f64>, threshold: f64) -> Vec<usize> {
    let diag = coarse.diag();
    let stable = (0..diag.len()).filter(|&i| diag[i] >= threshold).collect::<Vec<_>>();
    if !stable.is_empty() {
        return stable;
    }
    let best = (0..diag.len()).fold(0, |b, i| if diag[i] > diag[b] { i } else { b });
    warn!(
        "no macrostate reaches stability {}, using the most stable one ({:.3})",
        threshold, diag[best]
    );
    vec![best]
}

/// Representative cells of every terminal macrostate: the cells assigned to it,
/// at most `n_cells` of them, by decreasing membership. A terminal state without
/// assigned cells is represented by its highest-membership cell among those not
/// assigned to another terminal state.
pub fn terminal_cells(
    memberships: &Array2<f64>,
    assignment: &[usize],
    terminal: &[usize],
    n_cells: usize,
) -> Vec<Vec<usize>> {
    let by_membership = |state: usize, cells: &mut Vec<usize>| {
        let col = memberships.column(state);
        cells.sort_by(|&a, &b| col[b].total_cmp(&col[a]).then(a.cmp(&b)));
    };
    terminal
        .iter()
        .map(|&state| {
            let mut own = (0..assignment.len())
                .filter(|&c| assignment[c] == state)
                .collect::<Vec<_>>();
            if own.is_empty() {
                let mut free = (0..assignment.len())
                    .filter(|&c| !terminal.contains(&assignment[c]))
                    .collect::<Vec<_>>();
                by_membership(state, &mut free);
                warn!("terminal macrostate {} has no assigned cells", state);
                free.truncate(1);
                return free;
            }
            by_membership(state, &mut own);
            own.truncate(n_cells.max(1));
            own
        })
        .collect()
}

/// Probability of every cell to be absorbed in each group of terminal cells, from
/// `(I - Q) X = R` over the transient cells. Rows sum to one.
pub fn absorption_probabilities(chain: &Array2<f64>, lineages: &[Vec<usize>]) -> Result<Array2<f64>, Error> {
    let n = chain.nrows();
    let n_lineages = lineages.len();
    if n_lineages == 0 {
        bail!("no terminal states");
    }
    let mut lineage_of = vec![None; n];
    for (l, cells) in lineages.iter().enumerate() {
        if cells.is_empty() {
            bail!("terminal state {} has no cells", l);
        }
        for &c in cells {
            lineage_of[c] = Some(l);
        }
    }
    let transient = (0..n).filter(|&c| lineage_of[c].is_none()).collect::<Vec<_>>();

    let mut probs = Array2::<f64>::zeros((n, n_lineages));
    for (c, l) in lineage_of.iter().enumerate() {
        if let Some(l) = l {
            probs[(c, *l)] = 1.0;
        }
    }
    if !transient.is_empty() {
        let t = transient.len();
        let mut lhs = Array2::<f64>::eye(t);
        let mut rhs = Array2::<f64>::zeros((t, n_lineages));
        for (a, &i) in transient.iter().enumerate() {
            for (b, &j) in transient.iter().enumerate() {
                lhs[(a, b)] -= chain[(i, j)];
            }
            for (l, cells) in lineages.iter().enumerate() {
                rhs[(a, l)] = cells.iter().map(|&c| chain[(i, c)]).sum();
            }
        }
        let lu = lhs.factorize_into()?;
        for l in 0..n_lineages {
            let x = lu.solve(&rhs.column(l).to_owned())?;
            for (a, &i) in transient.iter().enumerate() {
                probs[(i, l)] = x[a].max(0.0);
            }
        }
    }
    for mut row in probs.outer_iter_mut() {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        } else {
            row.fill(1.0 / n_lineages as f64);
        }
    }
    Ok(probs)
}

/// Pearson correlation of every gene (columns of `expression`) with every lineage's
/// fate probability; genes × lineages.
pub fn lineage_drivers(expression: ArrayView2<f64>, fate: &Array2<f64>) -> Result<Array2<f64>, Error> {
    if expression.nrows() != fate.nrows() {
        bail!("expression has {} cells, fate probabilities {}", expression.nrows(), fate.nrows());
    }
    let mut drivers = Array2::<f64>::zeros((expression.ncols(), fate.ncols()));
    for (g, gene) in expression.axis_iter(Axis(1)).enumerate() {
        for (l, lineage) in fate.axis_iter(Axis(1)).enumerate() {
            drivers[(g, l)] = pearson(gene, lineage);
        }
    }
    Ok(drivers)
}

/// Name macrostates after the most frequent label of their assigned cells, with a
/// numeric suffix when several states share a label. Without labels states are
/// numbered.
pub fn name_macrostates(assignment: &[usize], n_states: usize, labels: Option<&Categorical>) -> Vec<String> {
    let mut names = (0..n_states)
        .map(|state| {
            let Some(labels) = labels else {
                return state.to_string();
            };
            let mut tally = BTreeMap::<&str, usize>::new();
            for (c, _) in assignment.iter().enumerate().filter(|&(_, &a)| a == state) {
                if let Some(label) = labels.label(c) {
                    *tally.entry(label).or_default() += 1;
                }
            }
            tally
                .into_iter()
                .fold(None, |best: Option<(&str, usize)>, (l, n)| match best {
                    Some((_, m)) if m >= n => best,
                    _ => Some((l, n)),
                })
                .map_or_else(|| state.to_string(), |(l, _)| l.to_string())
        })
        .collect::<Vec<_>>();

    let mut seen = BTreeMap::<String, usize>::new();
    for name in &names {
        *seen.entry(name.clone()).or_default() += 1;
    }
    let mut suffix = BTreeMap::<String, usize>::new();
    for name in names.iter_mut() {
        if seen[name.as_str()] > 1 {
            let k = suffix.entry(name.clone()).or_default();
            *k += 1;
            *name = format!("{}_{}", name, k);
        }
    }
    names
}

/// Output of the fate computation
#[derive(Clone, Debug)]
pub struct Fate {
    pub memberships: Array2<f64>,
    pub assignment: Vec<usize>,
    pub names: Vec<String>,
    pub coarse: Array2<f64>,
    /// indices of the terminal macrostates
    pub terminal: Vec<usize>,
    pub terminal_cells: Vec<Vec<usize>>,
    /// cells × terminal states
    pub probabilities: Array2<f64>,
}

/// Macrostates, terminal states and fate probabilities of an irreducible chain.
pub fn compute_fate(
    chain: &Array2<f64>,
    n_states: usize,
    stability: f64,
    n_cells: usize,
    labels: Option<&Categorical>,
) -> Result<Fate, Error> {
    let basis = schur_basis(chain, n_states)?;
    let memberships = pcca_memberships(&basis)?;
    let m = memberships.ncols();
    let assignment = assign_macrostates(&memberships);
    let names = name_macrostates(&assignment, m, labels);
    let coarse = coarse_grain(chain, &memberships)?;
    let terminal = terminal_macrostates(&coarse, stability);
    let cells = terminal_cells(&memberships, &assignment, &terminal, n_cells);
    let probabilities = absorption_probabilities(chain, &cells)?;
    info!(
        "{} macrostates {:?}, terminal {:?}",
        m,
        names,
        terminal.iter().map(|&t| names[t].as_str()).collect::<Vec<_>>()
    );
    Ok(Fate {
        memberships,
        assignment,
        names,
        coarse,
        terminal,
        terminal_cells: cells,
        probabilities,
    })
}
