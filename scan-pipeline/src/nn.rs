//! Nearest neighbours and the cell graphs built from them.

use anyhow::{bail, Error};
use ball_tree::{BallTree, Point};
use log::info;
use ndarray::parallel::prelude::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
use ndarray::{Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use std::str::FromStr;

#[derive(PartialEq)]
struct Pt(Vec<f64>);

impl Point for Pt {
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|p| (p.1 - p.0).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total_dist = self.distance(other);
        let frac = if total_dist == 0.0 { 0.0 } else { d / total_dist };

        Pt(self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(&s, &o)| s + frac * (o - s))
            .collect())
    }
}

/// k nearest neighbours of every point, closest first, self excluded.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbors {
    /// n × k neighbour indices
    pub indices: Array2<usize>,
    /// n × k Euclidean distances
    pub distances: Array2<f64>,
}

impl Neighbors {
    pub fn n_points(&self) -> usize {
        self.indices.nrows()
    }

    pub fn k(&self) -> usize {
        self.indices.ncols()
    }
}

/// Compute the `k` nearest neighbors of each row in `v`, using Euclidean distance.
/// Each row represents a n-dimensional vector where n is the number of columns in `v`.
pub fn knn(v: &ArrayView2<f64>, k: usize) -> Result<Neighbors, Error> {
    let (cells, _) = v.dim();
    if k == 0 || k >= cells {
        bail!("cannot find {} neighbours among {} points", k, cells);
    }
    if v.iter().any(|x| !x.is_finite()) {
        bail!("neighbour search input contains non-finite coordinates");
    }

    let points = v.outer_iter().map(|row| Pt(row.to_vec())).collect::<Vec<_>>();
    let values = (0..cells).collect::<Vec<_>>();
    info!("constructing ball tree of {} points", cells);
    let ball_tree = BallTree::new(points, values);

    info!("querying points for {} neighbors", k);
    let mut indices = Array2::from_elem((cells, k), usize::MAX);
    let mut distances = Array2::<f64>::zeros((cells, k));
    indices
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(distances.axis_iter_mut(Axis(0)).into_par_iter())
        .enumerate()
        .for_each_init(
            || ball_tree.query(),
            |query, (cell, (mut idx, mut dist))| {
                let pt = Pt(v.row(cell).to_vec());
                let mut ind = 0;
                for (other, _, &j) in query.nn(&pt).take(k + 1) {
                    if j != cell && ind < k {
                        idx[ind] = j;
                        dist[ind] = pt.distance(other);
                        ind += 1;
                    }
                }
            },
        );

    if indices.iter().any(|&i| i == usize::MAX) {
        bail!("neighbour search returned fewer than {} neighbours for some points", k);
    }
    Ok(Neighbors { indices, distances })
}

/// Edge weights of the shared-nearest-neighbour graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnnWeighting {
    /// `k - r/2` with `r` the smallest rank sum of a shared neighbour
    Rank,
    /// number of shared neighbours
    Number,
    /// Jaccard index of the neighbour sets
    Jaccard,
}

impl FromStr for SnnWeighting {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "rank" => SnnWeighting::Rank,
            "number" => SnnWeighting::Number,
            "jaccard" => SnnWeighting::Jaccard,
            _ => bail!("SNN weighting not recognized: {}", s),
        })
    }
}

/// Shared-nearest-neighbour graph. Each point's set holds itself (rank 0) and its
/// neighbours (ranks 1..=k); two points are joined when their sets intersect. The
/// result is symmetric with an empty diagonal.
pub fn snn_graph(neighbors: &Neighbors, weighting: SnnWeighting) -> Result<CsMat<f64>, Error> {
    let n = neighbors.n_points();
    let k = neighbors.k();
    if neighbors.indices.iter().any(|&j| j >= n) {
        bail!("neighbour index out of range for {} points", n);
    }

    // for every point, the sets it belongs to and its rank there
    let mut holders: Vec<Vec<(usize, usize)>> = (0..n).map(|i| vec![(i, 0)]).collect();
    for (i, row) in neighbors.indices.outer_iter().enumerate() {
        for (r, &j) in row.iter().enumerate() {
            holders[j].push((i, r + 1));
        }
    }

    let mut triplets = TriMat::new((n, n));
    let mut shared: HashMap<usize, (usize, usize)> = HashMap::new();
    for i in 0..n {
        shared.clear();
        let members = std::iter::once((i, 0)).chain(
            neighbors
                .indices
                .row(i)
                .iter()
                .enumerate()
                .map(|(r, &j)| (j, r + 1)),
        );
        for (member, rank_i) in members {
            for &(j, rank_j) in &holders[member] {
                if j <= i {
                    continue;
                }
                let entry = shared.entry(j).or_insert((usize::MAX, 0));
                entry.0 = entry.0.min(rank_i + rank_j);
                entry.1 += 1;
            }
        }
        for (&j, &(min_rank, count)) in &shared {
            let w = match weighting {
                SnnWeighting::Rank => (k as f64 - 0.5 * min_rank as f64).max(1e-6),
                SnnWeighting::Number => count as f64,
                SnnWeighting::Jaccard => count as f64 / (2 * (k + 1) - count) as f64,
            };
            triplets.add_triplet(i, j, w);
            triplets.add_triplet(j, i, w);
        }
    }
    let graph: CsMat<f64> = triplets.to_csr();
    info!("SNN graph: {} nodes, {} edges", n, graph.nnz() / 2);
    Ok(graph)
}

/// Directed kNN distance graph (row i holds the distances to i's neighbours).
pub fn distance_graph(neighbors: &Neighbors) -> CsMat<f64> {
    let n = neighbors.n_points();
    let mut triplets = TriMat::new((n, n));
    Zip::indexed(&neighbors.indices)
        .and(&neighbors.distances)
        .for_each(|(i, _), &j, &d| triplets.add_triplet(i, j, d));
    triplets.to_csr()
}

/// UMAP-style fuzzy connectivities of the kNN graph.
pub fn connectivities(neighbors: &Neighbors) -> CsMat<f64> {
    umap_rs::fuzzy::fuzzy_simplicial_set(neighbors.indices.view(), neighbors.distances.view(), 1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_distr::Normal;
    use rand_pcg::Pcg64Mcg;

    // Basic n^2 knn algorithm, for testing purposes
    fn exhaustive_knn(v: &ArrayView2<f64>, k: usize) -> Array2<usize> {
        let cells = v.nrows();
        let mut output = Array2::zeros((cells, k));
        for cell in 0..cells {
            let mut nns = (0..cells)
                .filter(|&o| o != cell)
                .map(|o| {
                    let d = (&v.row(cell) - &v.row(o)).mapv(|x| x * x).sum().sqrt();
                    (d, o)
                })
                .collect::<Vec<_>>();
            nns.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            for i in 0..k {
                output[(cell, i)] = nns[i].1;
            }
        }
        output
    }

    #[test]
    fn test_knn() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for ncells in [3, 5, 50, 100] {
            for d in [1, 2, 3, 5, 10, 20] {
                let dist = Normal::new(0.0f64, 1.0f64).unwrap();
                let v = Array2::<f64>::random_using((ncells, d), dist, &mut rng);
                let full = exhaustive_knn(&v.view(), ncells.min(26) - 1);
                for k in [1, 5, 10, 25] {
                    if k >= ncells {
                        continue;
                    }
                    let fast = knn(&v.view(), k).unwrap();
                    assert_eq!(fast.indices, full.slice(s![.., 0..k]).to_owned());
                    // distances ascend along each row
                    for row in fast.distances.outer_iter() {
                        assert!((1..row.len()).all(|i| row[i - 1] <= row[i]));
                    }
                }
            }
        }
    }

    #[test]
    fn test_knn_bad_k() {
        let v = Array2::<f64>::eye(4);
        assert!(knn(&v.view(), 4).is_err());
        assert!(knn(&v.view(), 0).is_err());
    }

    fn line_neighbors() -> Neighbors {
        // points 0..5 on a line, k = 2
        let indices = ndarray::arr2(&[[1, 2], [0, 2], [1, 3], [2, 4], [3, 2]]);
        let distances = ndarray::arr2(&[[1.0, 2.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 2.0]]);
        Neighbors { indices, distances }
    }

    #[test]
    fn test_snn_rank_weights() {
        let g = snn_graph(&line_neighbors(), SnnWeighting::Rank).unwrap();
        // symmetric, no self loops
        for (&w, (i, j)) in g.iter() {
            assert_ne!(i, j);
            assert_eq!(g.get(j, i), Some(&w));
        }
        // 0 and 1 are each other's first neighbour: ranks 0 + 1
        assert_eq!(g.get(0, 1), Some(&1.5));
        // 0 and 4 share only point 2 (rank 2 for 0, rank 2 for 4)
        assert_eq!(g.get(0, 4), Some(&1e-6));
    }

    #[test]
    fn test_snn_number_and_jaccard() {
        let n = line_neighbors();
        let number = snn_graph(&n, SnnWeighting::Number).unwrap();
        // sets {0,1,2} and {1,0,2} are identical
        assert_eq!(number.get(0, 1), Some(&3.0));
        let jaccard = snn_graph(&n, SnnWeighting::Jaccard).unwrap();
        assert_eq!(jaccard.get(0, 1), Some(&1.0));
        assert_eq!(jaccard.get(0, 3), Some(&0.2));
    }

    #[test]
    fn test_graphs_from_neighbors() {
        let n = line_neighbors();
        let d = distance_graph(&n);
        assert_eq!(d.get(0, 2), Some(&2.0));
        assert_eq!(d.nnz(), 10);
        let c = connectivities(&n);
        assert_eq!(c.rows(), 5);
        assert!(c.iter().all(|(&w, _)| w > 0.0 && w <= 1.0));
    }
}
