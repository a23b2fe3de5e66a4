// Command line utility for running the analysis pipeline on a registered dataset

use anyhow::{format_err, Error};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use ndarray::prelude::*;
use scan_pipeline::cluster::ClusterMethod;
use scan_pipeline::dim_red::choose::ComponentChoice;
use scan_pipeline::dim_red::PcaAlgorithm;
use scan_pipeline::hvg::HvgPolicy;
use scan_pipeline::loader::DatasetRegistry;
use scan_pipeline::pipeline::{run_registered, PipelineParams};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

fn required<'a, T: Clone + Send + Sync + 'static>(matches: &'a ArgMatches, name: &str) -> Result<&'a T, Error> {
    matches
        .get_one::<T>(name)
        .ok_or_else(|| format_err!("missing argument {}", name))
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = Command::new("scan-pipeline-cmd")
        .arg(
            Arg::new("DATASET")
                .help("Dataset identifier, a directory under the data directory")
                .required_unless_present("LIST")
                .index(1),
        )
        .arg(
            Arg::new("DATA_DIR")
                .help("Directory holding one sub-directory per dataset")
                .short('i')
                .long("data_dir")
                .default_value("data")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value(".")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("PARAMS")
                .help("JSON file with pipeline settings; options below override it")
                .short('p')
                .long("params")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("HVG")
                .help("Highly variable gene policy: count:N, prop:P or fdr:T")
                .long("hvg"),
        )
        .arg(
            Arg::new("NUM_PCS")
                .help("Number of PCA dimensions to compute")
                .short('d')
                .long("num_pcs")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("PCA")
                .help("SVD back-end")
                .long("pca")
                .value_parser(["exact", "randomized"]),
        )
        .arg(
            Arg::new("COMPONENTS")
                .help("How many components to keep: all, elbow, stability, denoise or fixed:N")
                .long("components"),
        )
        .arg(
            Arg::new("CLUSTERING")
                .help("Community detection algorithm")
                .short('c')
                .long("clustering")
                .value_parser(["walktrap", "louvain"]),
        )
        .arg(
            Arg::new("NO_VELOCITY")
                .help("Skip velocity and fate even when spliced/unspliced counts exist")
                .long("no_velocity")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("LIST")
                .help("List the registered datasets and exit")
                .long("list")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let data_dir: &PathBuf = required(&matches, "DATA_DIR")?;
    let registry = DatasetRegistry::with_known_datasets(data_dir);
    if matches.get_flag("LIST") {
        for id in registry.ids() {
            println!("{}\t{}", id, registry.descriptor(id)?.description);
        }
        return Ok(());
    }

    let id: &String = required(&matches, "DATASET")?;
    let out_dir: &PathBuf = required(&matches, "OUT_DIR")?;
    let mut params = match matches.get_one::<PathBuf>("PARAMS") {
        Some(path) => PipelineParams::from_json_file(path)?,
        None => PipelineParams::default(),
    };
    if let Some(hvg) = matches.get_one::<String>("HVG") {
        params.hvg = hvg.parse::<HvgPolicy>()?;
    }
    if let Some(&num_pcs) = matches.get_one::<usize>("NUM_PCS") {
        params.n_pcs = num_pcs;
    }
    if let Some(pca) = matches.get_one::<String>("PCA") {
        params.pca_algorithm = pca.parse::<PcaAlgorithm>()?;
    }
    if let Some(components) = matches.get_one::<String>("COMPONENTS") {
        params.components = components.parse::<ComponentChoice>()?;
    }
    if let Some(method) = matches.get_one::<String>("CLUSTERING") {
        params.cluster.method = method.parse::<ClusterMethod>()?;
    }
    if matches.get_flag("NO_VELOCITY") {
        params.velocity = None;
        params.fate = None;
    }

    let output = run_registered(&registry, id, &params, out_dir)?;
    for (name, embedding) in output.dataset.obsm_entries() {
        array_to_csv(embedding.view(), out_dir.join(format!("{name}.csv.gz")))?;
    }
    info!(
        "{}: {} cells, {} clusters, lineages {:?}",
        id,
        output.dataset.n_cells(),
        output.n_clusters,
        output.lineages.as_deref().unwrap_or_default()
    );
    Ok(())
}

/// Gzipped csv of a cells × dimensions embedding, one row per cell.
pub fn array_to_csv(array: ArrayView2<f64>, path: impl AsRef<Path>) -> Result<(), Error> {
    let mut writer = BufWriter::new(GzEncoder::new(File::create(path)?, Compression::default()));
    let num_cols = array.shape()[1];
    for row in array.axis_iter(Axis(0)) {
        for (i, entry) in row.iter().enumerate() {
            write!(writer, "{}", *entry)?;
            if i + 1 < num_cols {
                write!(writer, ",")?;
            }
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
