//! UMAP layout from a precomputed k-nearest-neighbour graph.

#[allow(unused_extern_crates)]
extern crate blas_src;

pub mod curve_fit;
pub mod embedding;
pub mod fuzzy;
pub mod optimize;
pub mod umap;

pub use umap::{InitMethod, Umap};

pub type Q = f64;
