//! Pons & Latapy random-walk agglomerative clustering.
//!
//! Every community carries the distribution of a `steps`-long random walk started
//! uniformly inside it. Adjacent communities whose walk distributions are closest
//! (weighted by inverse node degree) are merged first; the dendrogram is then cut
//! where modularity peaks. Walk distributions are dense, so memory grows with the
//! square of the node count.

use crate::{Clustering, Network, SimpleClustering};
use log::info;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

/// Default random walk length
pub const DEFAULT_STEPS: usize = 4;

/// Walktrap settings
#[derive(Debug, Clone, Copy)]
pub struct Walktrap {
    /// Length of the random walks
    pub steps: usize,
}

impl Default for Walktrap {
    fn default() -> Self {
        Walktrap { steps: DEFAULT_STEPS }
    }
}

/// Merge history of a Walktrap run. Leaves are the nodes `0..n`; merge `k` creates
/// community `n + k`.
#[derive(Debug, Clone)]
pub struct Dendrogram {
    n_nodes: usize,
    /// Pairs of community ids merged at each step
    pub merges: Vec<(usize, usize)>,
    /// Modularity after 0, 1, .. merges
    pub modularity: Vec<f64>,
}

impl Dendrogram {
    /// Number of leaves
    pub fn nodes(&self) -> usize {
        self.n_nodes
    }

    /// Clustering obtained after applying the first `n_merges` merges.
    pub fn cut_after(&self, n_merges: usize) -> SimpleClustering {
        let n_merges = n_merges.min(self.merges.len());
        let total = self.n_nodes + self.merges.len();
        let mut parent = (0..total).collect::<Vec<_>>();
        for (k, &(a, b)) in self.merges[..n_merges].iter().enumerate() {
            parent[a] = self.n_nodes + k;
            parent[b] = self.n_nodes + k;
        }
        let labels = (0..self.n_nodes)
            .map(|mut i| {
                while parent[i] != i {
                    i = parent[i];
                }
                i
            })
            .collect::<Vec<_>>();
        SimpleClustering::new_from_labels(&labels)
    }

    /// Clustering with `n_clusters` clusters, or the closest available when the graph
    /// has more connected components than that.
    pub fn cut(&self, n_clusters: usize) -> SimpleClustering {
        self.cut_after(self.n_nodes.saturating_sub(n_clusters.max(1)))
    }

    /// Clustering at the first merge step reaching the highest modularity.
    pub fn cut_at_max_modularity(&self) -> SimpleClustering {
        let mut best = 0;
        for (k, &q) in self.modularity.iter().enumerate() {
            if q > self.modularity[best] {
                best = k;
            }
        }
        self.cut_after(best)
    }
}

#[derive(PartialEq)]
struct Candidate {
    delta_sigma: f64,
    a: usize,
    b: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    // BinaryHeap is a max-heap: smaller delta_sigma sorts higher
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .delta_sigma
            .total_cmp(&self.delta_sigma)
            .then_with(|| (other.a, other.b).cmp(&(self.a, self.b)))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Community {
    size: usize,
    walk: Vec<f64>,
    neighbors: BTreeMap<usize, f64>,
    strength: f64,
}

impl Walktrap {
    /// Walktrap with walks of the given length
    pub fn new(steps: usize) -> Walktrap {
        Walktrap { steps: steps.max(1) }
    }

    /// Cluster the network, cutting the dendrogram at maximum modularity.
    pub fn run(&self, n: &Network) -> SimpleClustering {
        let dendrogram = self.dendrogram(n);
        let c = dendrogram.cut_at_max_modularity();
        info!("walktrap: {} clusters from {} nodes", c.num_clusters(), n.nodes());
        c
    }

    /// Full merge history of the network.
    pub fn dendrogram(&self, n: &Network) -> Dendrogram {
        let n_nodes = n.nodes();
        let two_m = 2.0 * n.get_total_edge_weight();

        // Walks run on the graph with a self-loop added at every node, weighted by the
        // node's mean edge weight.
        let loops = (0..n_nodes)
            .map(|i| if n.degree(i) == 0 { 1.0 } else { n.weight(i) / n.degree(i) as f64 })
            .collect::<Vec<_>>();
        let walk_degree = (0..n_nodes).map(|i| n.weight(i) + loops[i]).collect::<Vec<_>>();

        let mut communities: Vec<Option<Community>> = (0..n_nodes)
            .map(|i| {
                Some(Community {
                    size: 1,
                    walk: self.walk_from(n, &loops, &walk_degree, i),
                    neighbors: n.neighbors(i).collect(),
                    strength: n.weight(i),
                })
            })
            .collect();

        let mut q = if two_m > 0.0 {
            -communities
                .iter()
                .flatten()
                .map(|c| (c.strength / two_m).powi(2))
                .sum::<f64>()
        } else {
            0.0
        };

        let mut heap = BinaryHeap::new();
        for i in 0..n_nodes {
            for (j, _) in n.neighbors(i) {
                if i < j {
                    if let (Some(ci), Some(cj)) = (&communities[i], &communities[j]) {
                        heap.push(Candidate {
                            delta_sigma: delta_sigma(ci, cj, &walk_degree, n_nodes),
                            a: i,
                            b: j,
                        });
                    }
                }
            }
        }

        let mut merges = Vec::new();
        let mut modularity = vec![q];

        while let Some(Candidate { a, b, .. }) = heap.pop() {
            let (ca, cb) = match (communities[a].take(), communities[b].take()) {
                (Some(ca), Some(cb)) => (ca, cb),
                (ca, cb) => {
                    // stale entry: one side was already merged away
                    communities[a] = ca;
                    communities[b] = cb;
                    continue;
                }
            };

            let new_id = communities.len();
            let between = ca.neighbors.get(&b).copied().unwrap_or(0.0);
            if two_m > 0.0 {
                q += 2.0 * between / two_m - 2.0 * ca.strength * cb.strength / (two_m * two_m);
            }

            let size = ca.size + cb.size;
            let walk = ca
                .walk
                .iter()
                .zip(cb.walk.iter())
                .map(|(&x, &y)| (ca.size as f64 * x + cb.size as f64 * y) / size as f64)
                .collect::<Vec<_>>();

            let mut neighbors = ca.neighbors;
            for (k, w) in cb.neighbors {
                *neighbors.entry(k).or_insert(0.0) += w;
            }
            neighbors.remove(&a);
            neighbors.remove(&b);

            let merged = Community {
                size,
                walk,
                neighbors,
                strength: ca.strength + cb.strength,
            };

            for (&k, &w) in merged.neighbors.iter() {
                if let Some(ck) = communities[k].as_mut() {
                    ck.neighbors.remove(&a);
                    ck.neighbors.remove(&b);
                    ck.neighbors.insert(new_id, w);
                }
                if let Some(ck) = communities[k].as_ref() {
                    heap.push(Candidate {
                        delta_sigma: delta_sigma(&merged, ck, &walk_degree, n_nodes),
                        a: k,
                        b: new_id,
                    });
                }
            }

            communities.push(Some(merged));
            merges.push((a, b));
            modularity.push(q);
        }

        Dendrogram {
            n_nodes,
            merges,
            modularity,
        }
    }

    fn walk_from(&self, n: &Network, loops: &[f64], walk_degree: &[f64], start: usize) -> Vec<f64> {
        let mut p = vec![0.0; n.nodes()];
        p[start] = 1.0;
        let mut next = vec![0.0; n.nodes()];
        for _ in 0..self.steps {
            next.iter_mut().for_each(|v| *v = 0.0);
            for (l, &pl) in p.iter().enumerate() {
                if pl == 0.0 {
                    continue;
                }
                let scale = pl / walk_degree[l];
                next[l] += scale * loops[l];
                for (j, w) in n.neighbors(l) {
                    next[j] += scale * w;
                }
            }
            std::mem::swap(&mut p, &mut next);
        }
        p
    }
}

fn delta_sigma(c1: &Community, c2: &Community, walk_degree: &[f64], n_nodes: usize) -> f64 {
    let r2 = c1
        .walk
        .iter()
        .zip(c2.walk.iter())
        .zip(walk_degree.iter())
        .map(|((&x, &y), &d)| (x - y) * (x - y) / d)
        .sum::<f64>();
    let (s1, s2) = (c1.size as f64, c2.size as f64);
    s1 * s2 / (s1 + s2) * r2 / n_nodes as f64
}
