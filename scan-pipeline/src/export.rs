//! Writing a dataset and its analysis results to disk.
//!
//! Layout of an output directory:
//! - `matrices.npz`: every layer and cell graph as CSR triplets
//!   (`<kind>/<name>/data`, `indices`, `indptr`, `shape`) and every obsm / varm array
//! - `obs.csv`, `var.csv`: annotation tables keyed by cell / gene name
//! - `uns.json`: unstructured results
//! - `markers_<group>.csv`: ranked marker tables

use anyhow::{bail, Context, Error};
use diff_exp::markers::GroupMarkers;
use log::info;
use ndarray::Array1;
use ndarray_npy::NpzWriter;
use sc_types::{Dataset, Frame};
use serde_json::{Map, Value};
use sprs::CsMat;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

pub const MATRICES_NPZ: &str = "matrices.npz";
pub const OBS_CSV: &str = "obs.csv";
pub const VAR_CSV: &str = "var.csv";
pub const UNS_JSON: &str = "uns.json";

fn add_csr<W: Write + Seek>(npz: &mut NpzWriter<W>, prefix: &str, mat: &CsMat<f64>) -> Result<(), Error> {
    let shape = Array1::from(vec![mat.rows() as i64, mat.cols() as i64]);
    let mat = if mat.is_csr() { mat.clone() } else { mat.to_csr() };
    let (indptr, indices, data) = mat.into_raw_storage();
    npz.add_array(format!("{prefix}/data"), &Array1::from(data))?;
    npz.add_array(
        format!("{prefix}/indices"),
        &indices.into_iter().map(|i| i as i64).collect::<Array1<i64>>(),
    )?;
    npz.add_array(
        format!("{prefix}/indptr"),
        &indptr.into_iter().map(|i| i as i64).collect::<Array1<i64>>(),
    )?;
    npz.add_array(format!("{prefix}/shape"), &shape)?;
    Ok(())
}

/// Write layers, cell graphs and embeddings to a compressed npz archive.
pub fn write_matrices(dataset: &Dataset, path: &Path) -> Result<(), Error> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut npz = NpzWriter::new_compressed(file);
    for name in dataset.layer_names() {
        let layer = dataset.layer(name)?;
        add_csr(&mut npz, &format!("layers/{name}"), layer)?;
    }
    for (name, graph) in dataset.obsp_entries() {
        add_csr(&mut npz, &format!("obsp/{name}"), graph)?;
    }
    for (name, embedding) in dataset.obsm_entries() {
        npz.add_array(format!("obsm/{name}"), embedding)?;
    }
    for (name, loadings) in dataset.varm_entries() {
        npz.add_array(format!("varm/{name}"), loadings)?;
    }
    npz.finish()?;
    Ok(())
}

/// Write an annotation frame as csv, index first.
pub fn write_frame(frame: &Frame, index_name: &str, path: &Path) -> Result<(), Error> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut wtr = csv::WriterBuilder::new().from_writer(BufWriter::new(file));
    let columns = frame.columns().collect::<Vec<_>>();
    let mut header = vec![index_name.to_string()];
    header.extend(columns.iter().map(|(name, _)| name.to_string()));
    wtr.write_record(&header)?;
    for (i, id) in frame.index().iter().enumerate() {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(id.clone());
        record.extend(columns.iter().map(|(_, col)| col.display(i)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write the unstructured results as one pretty-printed JSON object.
pub fn write_uns(dataset: &Dataset, path: &Path) -> Result<(), Error> {
    let uns = dataset
        .uns_entries()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Map<String, Value>>();
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &Value::Object(uns))?;
    Ok(())
}

/// File-name safe version of a group label.
fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// `markers_<group>.csv` for every group; groups whose sanitized names clash are
/// prefixed with their position.
fn marker_file_names(markers: &[GroupMarkers]) -> Result<Vec<String>, Error> {
    let sanitized = markers.iter().map(|g| sanitize(&g.group)).collect::<Vec<_>>();
    let mut uses = HashMap::<&str, usize>::new();
    for name in &sanitized {
        *uses.entry(name.as_str()).or_default() += 1;
    }
    let names = sanitized
        .iter()
        .enumerate()
        .map(|(i, name)| {
            if uses[name.as_str()] > 1 {
                format!("markers_{i}_{name}.csv")
            } else {
                format!("markers_{name}.csv")
            }
        })
        .collect::<Vec<_>>();
    let mut seen = HashSet::new();
    for (group, name) in markers.iter().zip(&names) {
        if !seen.insert(name.as_str()) {
            bail!("marker table for group '{}' would overwrite {}", group.group, name);
        }
    }
    Ok(names)
}

/// One `markers_<group>.csv` per group: gene, p-value, FDR, Simes rank, summary
/// effect and the effect against every other group.
pub fn write_markers(markers: &[GroupMarkers], genes: &[String], dir: &Path) -> Result<(), Error> {
    let file_names = marker_file_names(markers)?;
    for (group, file_name) in markers.iter().zip(&file_names) {
        let path = dir.join(file_name);
        let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut wtr = csv::WriterBuilder::new().from_writer(BufWriter::new(file));
        let mut header = ["gene", "p_value", "fdr", "top", "summary_effect"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        header.extend(group.others.iter().map(|o| format!("effect_{o}")));
        wtr.write_record(&header)?;
        for row in &group.rows {
            let mut record = vec![
                genes[row.gene].clone(),
                row.p_value.to_string(),
                row.fdr.to_string(),
                row.top.map(|t| t.to_string()).unwrap_or_default(),
                row.summary_effect.to_string(),
            ];
            record.extend(row.effects.iter().map(|e| e.to_string()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
    }
    Ok(())
}

/// Write the full dataset into `dir` (created if needed).
pub fn write_dataset(dataset: &Dataset, dir: &Path) -> Result<(), Error> {
    fs::create_dir_all(dir).with_context(|| format!("creating output directory {}", dir.display()))?;
    write_matrices(dataset, &dir.join(MATRICES_NPZ))?;
    write_frame(dataset.obs(), "cell", &dir.join(OBS_CSV))?;
    write_frame(dataset.var(), "gene", &dir.join(VAR_CSV))?;
    write_uns(dataset, &dir.join(UNS_JSON))?;
    info!(
        "wrote {} ({} cells x {} genes) to {}",
        dataset.name(),
        dataset.n_cells(),
        dataset.n_genes(),
        dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use diff_exp::markers::MarkerRow;
    use ndarray::{array, Array2};
    use ndarray_npy::NpzReader;
    use sc_types::matrix::from_dense_cells_by_genes;
    use sc_types::{Categorical, Column};
    use serde_json::json;

    fn small() -> Dataset {
        let dense = array![[1.0, 0.0, 2.0], [0.0, 3.0, 0.0]];
        let mut d = Dataset::new(
            "small",
            from_dense_cells_by_genes(dense.view()),
            vec!["Actb".into(), "Gapdh".into(), "Ins1".into()],
            vec!["AAAC".into(), "TTTG".into()],
        )
        .unwrap();
        d.obs_mut()
            .insert("cell_type", Column::Categorical(Categorical::from_labels(&[Some("beta"), None])))
            .unwrap();
        d.var_mut().insert("hvg", Column::Flag(vec![true, false, true])).unwrap();
        d.insert_obsm("X_pca", array![[0.5, 1.0], [-0.5, -1.0]]).unwrap();
        d.insert_uns("note", json!({"k": 3}));
        d
    }

    fn csr_from_npz_parts(
        data: Array1<f64>,
        indices: Array1<i64>,
        indptr: Array1<i64>,
        shape: Array1<i64>,
    ) -> Result<Array2<f64>, Error> {
        let (rows, cols) = (shape[0] as usize, shape[1] as usize);
        let mut dense = Array2::<f64>::zeros((rows, cols));
        for r in 0..rows {
            for k in indptr[r] as usize..indptr[r + 1] as usize {
                dense[(r, indices[k] as usize)] = data[k];
            }
        }
        Ok(dense)
    }

    #[test]
    fn test_write_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let d = small();
        write_dataset(&d, dir.path()).unwrap();

        let mut npz = NpzReader::new(File::open(dir.path().join(MATRICES_NPZ)).unwrap()).unwrap();
        let data: Array1<f64> = npz.by_name("layers/counts/data.npy").unwrap();
        let indices: Array1<i64> = npz.by_name("layers/counts/indices.npy").unwrap();
        let indptr: Array1<i64> = npz.by_name("layers/counts/indptr.npy").unwrap();
        let shape: Array1<i64> = npz.by_name("layers/counts/shape.npy").unwrap();
        assert_eq!(shape.to_vec(), vec![3, 2]);
        let counts = csr_from_npz_parts(data, indices, indptr, shape).unwrap();
        assert_eq!(counts, array![[1.0, 0.0], [0.0, 3.0], [2.0, 0.0]]);
        let pca: Array2<f64> = npz.by_name("obsm/X_pca.npy").unwrap();
        assert_eq!(pca[(1, 1)], -1.0);

        let obs = fs::read_to_string(dir.path().join(OBS_CSV)).unwrap();
        assert_eq!(obs, "cell,cell_type\nAAAC,beta\nTTTG,\n");
        let var = fs::read_to_string(dir.path().join(VAR_CSV)).unwrap();
        assert_eq!(var.lines().nth(2), Some("Gapdh,false"));
        let uns: Value = serde_json::from_str(&fs::read_to_string(dir.path().join(UNS_JSON)).unwrap()).unwrap();
        assert_eq!(uns["note"]["k"], 3);
    }

    #[test]
    fn test_write_markers() {
        let dir = tempfile::tempdir().unwrap();
        let markers = vec![GroupMarkers {
            group: "beta cells".to_string(),
            others: vec!["alpha".to_string()],
            rows: vec![MarkerRow {
                gene: 2,
                p_value: 0.001,
                fdr: 0.003,
                top: Some(1),
                summary_effect: 2.5,
                effects: vec![2.5],
            }],
        }];
        let genes = vec!["Actb".to_string(), "Gapdh".to_string(), "Ins1".to_string()];
        write_markers(&markers, &genes, dir.path()).unwrap();
        let table = fs::read_to_string(dir.path().join("markers_beta_cells.csv")).unwrap();
        let mut lines = table.lines();
        assert_eq!(lines.next(), Some("gene,p_value,fdr,top,summary_effect,effect_alpha"));
        assert_eq!(lines.next(), Some("Ins1,0.001,0.003,1,2.5,2.5"));
    }

    #[test]
    fn test_marker_tables_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let group = |name: &str, gene: usize| GroupMarkers {
            group: name.to_string(),
            others: vec![],
            rows: vec![MarkerRow {
                gene,
                p_value: 0.01,
                fdr: 0.02,
                top: Some(1),
                summary_effect: 1.0,
                effects: vec![],
            }],
        };
        let markers = vec![group("a b", 0), group("a_b", 1), group("c", 2)];
        let genes = vec!["Actb".to_string(), "Gapdh".to_string(), "Ins1".to_string()];
        write_markers(&markers, &genes, dir.path()).unwrap();
        let first = fs::read_to_string(dir.path().join("markers_0_a_b.csv")).unwrap();
        let second = fs::read_to_string(dir.path().join("markers_1_a_b.csv")).unwrap();
        assert!(first.lines().nth(1).unwrap().starts_with("Actb,"));
        assert!(second.lines().nth(1).unwrap().starts_with("Gapdh,"));
        assert!(dir.path().join("markers_c.csv").exists());
        assert!(!dir.path().join("markers_a_b.csv").exists());

        // a literal group name equal to a disambiguated one
        let clash = vec![group("a b", 0), group("a_b", 1), group("0 a b", 2)];
        assert!(write_markers(&clash, &genes, dir.path()).is_err());
    }

    #[test]
    fn test_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        assert!(write_dataset(&small(), &blocker.join("out")).is_err());
    }
}
