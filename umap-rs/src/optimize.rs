//! Stochastic gradient descent on the fuzzy set cross entropy between the
//! high-dimensional graph and the low-dimensional layout. Updates are applied
//! immediately, so a run is sequential and reproducible for a given seed.

use crate::Q;
use ndarray::Array2;
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use sprs::CsMat;

/// Edge list of the graph with per-edge sampling schedule.
pub struct EdgeSchedule {
    pub head: Vec<usize>,
    pub tail: Vec<usize>,
    pub epochs_per_sample: Vec<Q>,
}

impl EdgeSchedule {
    /// Edges weaker than `max_weight / n_epochs` would never be sampled and are dropped.
    /// Every remaining edge is sampled once every `max_weight / weight` epochs.
    pub fn new(graph: &CsMat<Q>, n_epochs: usize) -> EdgeSchedule {
        let graph_max = graph.iter().fold(0.0 as Q, |acc, (&v, _)| acc.max(v));
        let threshold = graph_max / n_epochs as Q;

        let mut head = Vec::new();
        let mut tail = Vec::new();
        let mut epochs_per_sample = Vec::new();
        for (&w, (i, j)) in graph.iter() {
            if w > 0.0 && w >= threshold {
                head.push(i);
                tail.push(j);
                epochs_per_sample.push(graph_max / w);
            }
        }
        EdgeSchedule {
            head,
            tail,
            epochs_per_sample,
        }
    }

    pub fn len(&self) -> usize {
        self.head.len()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }
}

/// Optimizer state
pub struct State {
    pub a: Q,
    pub b: Q,
    pub gamma: Q,
    pub initial_alpha: Q,
    pub alpha: Q,
    pub negative_sample_rate: usize,
    pub n_epochs: usize,
    pub current_epoch: usize,
    pub embedding: Array2<Q>,

    edges: EdgeSchedule,
    epoch_of_next_sample: Vec<Q>,
    epochs_per_negative_sample: Vec<Q>,
    epoch_of_next_negative_sample: Vec<Q>,
    rng: Pcg64Mcg,
}

impl State {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedding: Array2<Q>,
        edges: EdgeSchedule,
        a: Q,
        b: Q,
        learning_rate: Q,
        repulsion_strength: Q,
        negative_sample_rate: usize,
        n_epochs: usize,
        rng: Pcg64Mcg,
    ) -> State {
        let epochs_per_negative_sample = edges
            .epochs_per_sample
            .iter()
            .map(|&e| e / negative_sample_rate.max(1) as Q)
            .collect::<Vec<_>>();

        State {
            a,
            b,
            gamma: repulsion_strength,
            initial_alpha: learning_rate,
            alpha: learning_rate,
            negative_sample_rate,
            n_epochs,
            current_epoch: 0,
            embedding,
            epoch_of_next_sample: edges.epochs_per_sample.clone(),
            epoch_of_next_negative_sample: epochs_per_negative_sample.clone(),
            epochs_per_negative_sample,
            edges,
            rng,
        }
    }

    pub fn optimize(&mut self) {
        while self.step() {}
    }

    /// Run one epoch. Returns false once all epochs are done.
    pub fn step(&mut self) -> bool {
        if self.current_epoch >= self.n_epochs {
            return false;
        }
        for i in 0..self.edges.len() {
            self.sample_edge(i);
        }
        self.current_epoch += 1;
        self.alpha = self.initial_alpha * (1.0 - self.current_epoch as Q / self.n_epochs as Q);
        true
    }

    fn sample_edge(&mut self, i: usize) {
        let epoch = self.current_epoch as Q;
        if self.epoch_of_next_sample[i] > epoch {
            return;
        }

        let (a, b, gamma, alpha) = (self.a, self.b, self.gamma, self.alpha);
        let j = self.edges.head[i];
        let k = self.edges.tail[i];
        let dim = self.embedding.ncols();
        let n_points = self.embedding.nrows();

        // attraction along the edge
        let dist_sq = euclidean_sq(&self.embedding, j, k);
        let grad_coeff = if dist_sq > 0.0 {
            (-2.0 * a * b * dist_sq.powf(b - 1.0)) / (1.0 + a * dist_sq.powf(b))
        } else {
            0.0
        };
        for d in 0..dim {
            let grad_d = (grad_coeff * (self.embedding[(j, d)] - self.embedding[(k, d)])).clamp(-4.0, 4.0);
            self.embedding[(j, d)] += grad_d * alpha;
            self.embedding[(k, d)] -= grad_d * alpha;
        }
        self.epoch_of_next_sample[i] += self.edges.epochs_per_sample[i];

        // repulsion from random points
        let n_neg_samples =
            ((epoch - self.epoch_of_next_negative_sample[i]) / self.epochs_per_negative_sample[i]).floor();
        for _ in 0..n_neg_samples.max(0.0) as usize {
            let k = self.rng.gen_range(0..n_points);
            if j == k {
                continue;
            }
            let dist_sq = euclidean_sq(&self.embedding, j, k);
            let grad_coeff = if dist_sq > 0.0 {
                (2.0 * gamma * b) / ((1e-3 + dist_sq) * (1.0 + a * dist_sq.powf(b)))
            } else {
                0.0
            };
            for d in 0..dim {
                let grad_d = if grad_coeff > 0.0 {
                    (grad_coeff * (self.embedding[(j, d)] - self.embedding[(k, d)])).clamp(-4.0, 4.0)
                } else {
                    4.0
                };
                self.embedding[(j, d)] += grad_d * alpha;
            }
        }
        self.epoch_of_next_negative_sample[i] += n_neg_samples.max(0.0) * self.epochs_per_negative_sample[i];
    }
}

/// Squared Euclidean distance between rows `j` and `k`
#[inline]
fn euclidean_sq(embedding: &Array2<Q>, j: usize, k: usize) -> Q {
    embedding
        .row(j)
        .iter()
        .zip(embedding.row(k))
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use sprs::TriMat;

    #[test]
    fn weak_edges_are_dropped() {
        let mut t = TriMat::new((3, 3));
        t.add_triplet(0, 1, 1.0);
        t.add_triplet(1, 0, 1.0);
        t.add_triplet(1, 2, 0.001);
        t.add_triplet(2, 1, 0.001);
        let graph: CsMat<Q> = t.to_csr();
        let edges = EdgeSchedule::new(&graph, 200);
        assert_eq!(edges.len(), 2);
        assert!(edges.epochs_per_sample.iter().all(|&e| e == 1.0));
    }

    #[test]
    fn connected_points_attract() {
        let mut t = TriMat::new((4, 4));
        t.add_triplet(0, 1, 1.0);
        t.add_triplet(1, 0, 1.0);
        t.add_triplet(2, 3, 1.0);
        t.add_triplet(3, 2, 1.0);
        let graph: CsMat<Q> = t.to_csr();
        let init = array![[0.0, 0.0], [5.0, 0.0], [0.0, 5.0], [5.0, 5.0]];
        let before = euclidean_sq(&init, 0, 1);
        let mut state = State::new(
            init,
            EdgeSchedule::new(&graph, 50),
            1.577,
            0.895,
            1.0,
            1.0,
            5,
            50,
            Pcg64Mcg::seed_from_u64(0),
        );
        state.optimize();
        assert_eq!(state.current_epoch, 50);
        assert!(euclidean_sq(&state.embedding, 0, 1) < before);
        assert!(state.embedding.iter().all(|v| v.is_finite()));
    }
}
