//! Exploratory single-cell RNA-seq analysis: loading, quality control,
//! normalization, feature selection, PCA and UMAP embeddings, graph clustering,
//! marker detection, RNA velocity and cell fate.

extern crate blas_src;

pub mod cluster;
pub mod dim_red;
pub mod embedding;
pub mod export;
#[cfg(feature = "hdf5")]
pub mod h5ad;
pub mod hvg;
pub mod loader;
pub mod markers;
pub mod mtx;
pub mod nn;
pub mod normalization;
pub mod pipeline;
pub mod qc;
pub mod stats;
pub mod variance;
pub mod velocity;
