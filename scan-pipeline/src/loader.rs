//! Dataset registry and loading of 10x-style directories.
//!
//! A dataset directory holds `matrix.mtx[.gz]` (features × barcodes),
//! `features.tsv[.gz]`, `barcodes.tsv[.gz]`, optionally `spliced.mtx[.gz]` and
//! `unspliced.mtx[.gz]` of the same shape, and optionally `cell_metadata.csv` whose
//! first column is the barcode.

use crate::mtx::{load_mtx, read_tsv_column};
use anyhow::{bail, format_err, Context, Error};
use log::{info, warn};
use ndarray::Array1;
use sc_types::{Categorical, Column, Dataset, Layer};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Name of the spliced count layer
pub const SPLICED: &str = "spliced";
/// Name of the unspliced count layer
pub const UNSPLICED: &str = "unspliced";

/// What is known about a dataset before loading it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetDescriptor {
    /// obs column holding the curated cell labels, if any
    pub label_column: Option<String>,
    /// spliced/unspliced layers must be present
    pub velocity: bool,
    pub description: String,
}

/// Maps dataset identifiers to descriptors; identifier `id` lives in `<data_dir>/<id>/`.
#[derive(Clone, Debug)]
pub struct DatasetRegistry {
    data_dir: PathBuf,
    entries: BTreeMap<String, DatasetDescriptor>,
}

impl DatasetRegistry {
    pub fn new(data_dir: impl AsRef<Path>) -> DatasetRegistry {
        DatasetRegistry {
            data_dir: data_dir.as_ref().to_path_buf(),
            entries: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with the public datasets the pipeline is usually run on.
    pub fn with_known_datasets(data_dir: impl AsRef<Path>) -> DatasetRegistry {
        let mut registry = DatasetRegistry::new(data_dir);
        let known = [
            ("pancreas", Some("clusters"), true, "mouse endocrine pancreas development"),
            ("dentategyrus", Some("clusters"), true, "mouse hippocampal dentate gyrus"),
            ("zeisel", Some("level1class"), false, "mouse cortex and hippocampus"),
            ("baron", Some("label"), false, "human pancreas"),
            ("pbmc3k", None, false, "human peripheral blood mononuclear cells"),
        ];
        for (id, label, velocity, description) in known {
            registry.register(
                id,
                DatasetDescriptor {
                    label_column: label.map(String::from),
                    velocity,
                    description: description.to_string(),
                },
            );
        }
        registry
    }

    pub fn register(&mut self, id: &str, descriptor: DatasetDescriptor) {
        self.entries.insert(id.to_string(), descriptor);
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn descriptor(&self, id: &str) -> Result<&DatasetDescriptor, Error> {
        self.entries.get(id).ok_or_else(|| {
            format_err!(
                "unknown dataset '{}' (known: {})",
                id,
                self.entries.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn path(&self, id: &str) -> Result<PathBuf, Error> {
        self.descriptor(id)?;
        Ok(self.data_dir.join(id))
    }

    /// Resolve and load a registered dataset.
    pub fn load(&self, id: &str) -> Result<Dataset, Error> {
        let descriptor = self.descriptor(id)?;
        load_dataset_dir(self.data_dir.join(id), id, descriptor)
    }
}

/// `<dir>/<stem>.gz` if present, else `<dir>/<stem>`.
fn find_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    let gz = dir.join(format!("{stem}.gz"));
    if gz.exists() {
        return Some(gz);
    }
    let plain = dir.join(stem);
    plain.exists().then_some(plain)
}

fn require_file(dir: &Path, stem: &str) -> Result<PathBuf, Error> {
    find_file(dir, stem).ok_or_else(|| format_err!("{}: missing {}[.gz]", dir.display(), stem))
}

/// Matrices on disk are features × barcodes, which is already the layer orientation.
fn load_layer(path: &Path, shape: (usize, usize)) -> Result<Layer, Error> {
    let layer = load_mtx(path)?;
    if layer.shape() != shape {
        bail!(
            "{} has shape {:?}, expected {:?} to match the count matrix",
            path.display(),
            layer.shape(),
            shape
        );
    }
    Ok(layer)
}

/// Load one dataset directory.
pub fn load_dataset_dir(dir: impl AsRef<Path>, name: &str, descriptor: &DatasetDescriptor) -> Result<Dataset, Error> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        bail!("dataset directory {} does not exist", dir.display());
    }

    let counts = load_mtx(require_file(dir, "matrix.mtx")?)?;
    let genes = read_tsv_column(require_file(dir, "features.tsv")?, 1)?;
    let cells = read_tsv_column(require_file(dir, "barcodes.tsv")?, 0)?;
    info!(
        "loaded {}: {} genes x {} cells, {} non-zero counts",
        name,
        genes.len(),
        cells.len(),
        counts.nnz()
    );

    let shape = counts.shape();
    let mut dataset = Dataset::new(name, counts, genes, cells)?;

    for layer in [SPLICED, UNSPLICED] {
        match find_file(dir, &format!("{layer}.mtx")) {
            Some(path) => dataset.insert_layer(layer, load_layer(&path, shape)?)?,
            None if descriptor.velocity => {
                bail!("{}: dataset '{}' needs a {} layer", dir.display(), name, layer)
            }
            None => {}
        }
    }

    let metadata = dir.join("cell_metadata.csv");
    if metadata.exists() {
        attach_metadata(&mut dataset, &metadata)?;
    }

    if let Some(label) = &descriptor.label_column {
        if !dataset.obs().contains(label) {
            bail!("dataset '{}' has no label column '{}'", name, label);
        }
        // labels are categorical even when they look numeric
        let as_text = match dataset.obs().get(label)? {
            Column::Numeric(values) => Some(
                values
                    .iter()
                    .map(|v| (!v.is_nan()).then(|| v.to_string()))
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        if let Some(as_text) = as_text {
            dataset
                .obs_mut()
                .insert(label, Column::Categorical(Categorical::from_labels(&as_text)))?;
        }
    }

    dataset.insert_uns(
        "dataset",
        json!({
            "id": name,
            "label_column": descriptor.label_column,
            "velocity": descriptor.velocity,
        }),
    );
    Ok(dataset)
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value == "NA" || value == "nan" || value == "NaN"
}

/// Read `cell_metadata.csv` and add one obs column per metadata column. Columns whose
/// every non-missing value parses as a float become numeric, others categorical.
pub fn attach_metadata(dataset: &mut Dataset, path: &Path) -> Result<(), Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| path.display().to_string())?;
    let headers = reader.headers()?.iter().map(String::from).collect::<Vec<_>>();
    if headers.len() < 2 {
        warn!("{} has no metadata columns", path.display());
        return Ok(());
    }

    let position = dataset
        .cell_names()
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect::<HashMap<_, _>>();
    let n_cells = dataset.n_cells();
    let mut rows: Vec<Option<Vec<String>>> = vec![None; n_cells];

    for record in reader.records() {
        let record = record.with_context(|| path.display().to_string())?;
        let barcode = record.get(0).unwrap_or_default();
        let Some(&cell) = position.get(barcode) else {
            bail!("{}: barcode '{}' is not in the count matrix", path.display(), barcode);
        };
        if rows[cell].is_some() {
            bail!("{}: barcode '{}' appears twice", path.display(), barcode);
        }
        rows[cell] = Some(record.iter().skip(1).map(String::from).collect());
    }
    let missing = rows.iter().filter(|r| r.is_none()).count();
    if missing > 0 {
        bail!("{}: {} of {} cells have no metadata row", path.display(), missing, n_cells);
    }
    let rows = rows.into_iter().flatten().collect::<Vec<_>>();

    for (c, name) in headers.iter().enumerate().skip(1) {
        let values = rows
            .iter()
            .map(|r| r.get(c - 1).map(|s| s.trim()).unwrap_or_default())
            .collect::<Vec<_>>();
        let numeric = values
            .iter()
            .map(|v| if is_missing(v) { Some(f64::NAN) } else { v.parse::<f64>().ok() })
            .collect::<Option<Vec<_>>>();
        let column = match numeric {
            Some(v) if values.iter().any(|v| !is_missing(v)) => Column::Numeric(Array1::from(v)),
            _ => {
                let labels = values
                    .iter()
                    .map(|v| (!is_missing(v)).then_some(*v))
                    .collect::<Vec<_>>();
                Column::Categorical(Categorical::from_labels(&labels))
            }
        };
        dataset.obs_mut().insert(name, column)?;
    }
    info!("attached {} metadata columns from {}", headers.len() - 1, path.display());
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::mtx::write_mtx;
    use sc_types::dataset::COUNTS;
    use sc_types::matrix::from_rows;
    use std::fs;

    /// Write a tiny 3 genes x 4 cells dataset directory.
    pub(crate) fn write_tiny(dir: &Path, with_velocity: bool) {
        let counts = from_rows(
            (3, 4),
            vec![
                vec![(0, 1.0), (1, 2.0), (3, 5.0)],
                vec![(2, 4.0)],
                vec![(0, 3.0), (1, 1.0), (2, 1.0)],
            ],
        )
        .unwrap();
        write_mtx(&counts, dir.join("matrix.mtx.gz")).unwrap();
        if with_velocity {
            write_mtx(&counts, dir.join("spliced.mtx.gz")).unwrap();
            write_mtx(&counts, dir.join("unspliced.mtx.gz")).unwrap();
        }
        fs::write(
            dir.join("features.tsv"),
            "G1\tActb\tGene Expression\nG2\tGapdh\tGene Expression\nG3\tmt-Co1\tGene Expression\n",
        )
        .unwrap();
        fs::write(dir.join("barcodes.tsv"), "c1\nc2\nc3\nc4\n").unwrap();
        fs::write(
            dir.join("cell_metadata.csv"),
            "barcode,clusters,score\nc3,beta,0.5\nc1,alpha,1.5\nc2,NA,2\nc4,alpha,NA\n",
        )
        .unwrap();
    }

    #[test]
    fn test_load_registered_dataset() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("pancreas")).unwrap();
        write_tiny(&root.path().join("pancreas"), true);

        let registry = DatasetRegistry::with_known_datasets(root.path());
        let d = registry.load("pancreas").unwrap();
        assert_eq!(d.n_genes(), 3);
        assert_eq!(d.n_cells(), 4);
        assert_eq!(d.gene_names()[2], "mt-Co1");
        assert!(d.has_layer(SPLICED) && d.has_layer(UNSPLICED));
        assert_eq!(d.layer(COUNTS).unwrap().get(0, 3), Some(&5.0));

        let clusters = d.obs().categorical("clusters").unwrap();
        assert_eq!(clusters.label(0), Some("alpha"));
        assert_eq!(clusters.label(1), None);
        assert_eq!(clusters.label(2), Some("beta"));
        let score = d.obs().numeric("score").unwrap();
        assert_eq!(score[0], 1.5);
        assert!(score[3].is_nan());
    }

    #[test]
    fn test_load_errors() {
        let root = tempfile::tempdir().unwrap();
        let registry = DatasetRegistry::with_known_datasets(root.path());
        assert!(registry.load("no-such-dataset").is_err());
        // registered but absent on disk
        assert!(registry.load("zeisel").is_err());

        // velocity layers required
        fs::create_dir(root.path().join("dentategyrus")).unwrap();
        write_tiny(&root.path().join("dentategyrus"), false);
        assert!(registry.load("dentategyrus").is_err());

        // label column missing
        let mut custom = DatasetRegistry::new(root.path());
        custom.register(
            "dentategyrus",
            DatasetDescriptor {
                label_column: Some("celltype".into()),
                ..DatasetDescriptor::default()
            },
        );
        assert!(custom.load("dentategyrus").is_err());
    }

    #[test]
    fn test_metadata_must_match_barcodes() {
        let root = tempfile::tempdir().unwrap();
        write_tiny(root.path(), false);
        fs::write(root.path().join("cell_metadata.csv"), "barcode,x\nc1,a\nc9,b\n").unwrap();
        assert!(load_dataset_dir(root.path(), "tiny", &DatasetDescriptor::default()).is_err());

        let bad_shape = from_rows((2, 4), vec![vec![], vec![]]).unwrap();
        write_tiny(root.path(), false);
        write_mtx(&bad_shape, root.path().join("spliced.mtx.gz")).unwrap();
        assert!(load_dataset_dir(root.path(), "tiny", &DatasetDescriptor::default()).is_err());
    }
}
