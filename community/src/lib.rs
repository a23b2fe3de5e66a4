//! Community detection on weighted, undirected cell graphs: Louvain multilevel
//! modularity optimisation and Walktrap random-walk agglomeration.
#![deny(missing_docs)]

/// Data structure for storing a clustering of nodes
pub mod clustering;

/// Data structure for storing a weighted, undirected graph (aka network)
pub mod network;

/// Louvain clustering algorithm
pub mod louvain;

/// Walktrap clustering algorithm
pub mod walktrap;

/// Clustering objective functions
pub mod objective;

mod local_moving;

#[cfg(test)]
mod test;

pub use clustering::{Clustering, SimpleClustering};
pub use louvain::Louvain;
pub use network::Network;
pub use walktrap::{Dendrogram, Walktrap};

trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.resize_with(len, T::default)
    }
}
