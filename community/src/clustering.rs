/// Trait representing a clustering over a set of items
/// Each item is assigned a single integer label
pub trait Clustering: std::fmt::Debug {
    /// Initialize a fresh clustering with each node in its own cluster
    fn init_different_clusters(num_nodes: usize) -> Self;

    /// Initialize the clustering with a known set of labels
    fn new_from_labels(labels: &[usize]) -> Self;

    /// Member nodes of each cluster, in label order
    fn nodes_per_cluster(&self) -> Vec<Vec<usize>>;

    /// Get the label of node `i`
    fn get(&self, i: usize) -> usize;

    /// Set the label of node `i`. Must keep the number of clusters current.
    fn set(&mut self, i: usize, cluster: usize);

    /// Total number of nodes
    fn nodes(&self) -> usize;

    /// Number of distinct labels in use (after `remove_empty_clusters`)
    fn num_clusters(&self) -> usize;

    /// Reassign node labels, removing unused labels
    fn remove_empty_clusters(&mut self);

    /// Take a clustering of the cluster labels and relabel every node with its
    /// cluster's higher-order label
    fn merge_clusters<C: Clustering>(&mut self, cluster_clusterings: &C) {
        for i in 0..self.nodes() {
            self.set(i, cluster_clusterings.get(self.get(i)))
        }

        self.remove_empty_clusters();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A basic Vec-backed implementation of `Clustering`
pub struct SimpleClustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl SimpleClustering {
    /// Labels of every node
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Consume the clustering, returning node labels
    pub fn into_labels(self) -> Vec<usize> {
        self.labels
    }

    /// Number of nodes in each cluster
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_clusters];
        for &l in &self.labels {
            sizes[l] += 1;
        }
        sizes
    }

    /// Relabel so that cluster 0 is the largest. Equal-sized clusters keep the order
    /// of their first member.
    pub fn sort_by_size(&mut self) {
        self.remove_empty_clusters();
        let sizes = self.sizes();
        let mut first_member = vec![usize::MAX; self.num_clusters];
        for (i, &l) in self.labels.iter().enumerate() {
            first_member[l] = first_member[l].min(i);
        }
        let mut order = (0..self.num_clusters).collect::<Vec<_>>();
        order.sort_by_key(|&c| (std::cmp::Reverse(sizes[c]), first_member[c]));
        let mut new_label = vec![0; self.num_clusters];
        for (rank, &c) in order.iter().enumerate() {
            new_label[c] = rank;
        }
        for l in self.labels.iter_mut() {
            *l = new_label[*l];
        }
    }
}

impl Clustering for SimpleClustering {
    fn init_different_clusters(num_nodes: usize) -> Self {
        SimpleClustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    fn new_from_labels(input_labels: &[usize]) -> Self {
        let max_cluster = input_labels.iter().copied().max().unwrap_or(0);

        let mut r = SimpleClustering {
            labels: input_labels.to_vec(),
            num_clusters: if input_labels.is_empty() { 0 } else { max_cluster + 1 },
        };

        r.remove_empty_clusters();
        r
    }

    fn nodes_per_cluster(&self) -> Vec<Vec<usize>> {
        let mut cluster_lists = vec![Vec::new(); self.num_clusters()];

        for (node, label) in self.labels.iter().enumerate() {
            cluster_lists[*label].push(node)
        }

        cluster_lists
    }

    fn get(&self, node: usize) -> usize {
        self.labels[node]
    }

    fn set(&mut self, node: usize, label: usize) {
        self.labels[node] = label;
        if label >= self.num_clusters {
            self.num_clusters = label + 1;
        }
    }

    fn nodes(&self) -> usize {
        self.labels.len()
    }

    fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    fn remove_empty_clusters(&mut self) {
        let mut counts = vec![0usize; self.num_clusters];
        for &l in self.labels.iter() {
            counts[l] += 1;
        }

        let mut new_labels = vec![None; self.num_clusters];
        let mut next = 0;
        for (old, &count) in counts.iter().enumerate() {
            if count > 0 {
                new_labels[old] = Some(next);
                next += 1;
            }
        }

        for l in self.labels.iter_mut() {
            // every label in use was assigned a slot above
            *l = new_labels[*l].unwrap_or(0);
        }

        self.num_clusters = next;
    }
}
