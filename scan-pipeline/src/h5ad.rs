//! AnnData-style `.h5ad` output: `X` and `layers` as CSR groups (cells × genes),
//! `obs`/`var` as column datasets with `_index`, categorical codes with their
//! categories under `__categories`, and `obsm`, `varm`, `obsp` arrays. Unstructured
//! results are stored as one JSON string attribute.

use crate::normalization::LOGCOUNTS;
use anyhow::{Context, Error};
use hdf5::types::VarLenUnicode;
use hdf5::{File, Group};
use ndarray::{Array1, Array2};
use sc_types::dataset::COUNTS;
use sc_types::{Column, Dataset, Frame};
use serde_json::{Map, Value};
use sprs::CsMat;
use std::path::Path;
use std::str::FromStr;

fn unicode(values: &[String]) -> Result<Array1<VarLenUnicode>, Error> {
    values
        .iter()
        .map(|s| VarLenUnicode::from_str(s).map_err(|e| anyhow::format_err!("cannot store '{}': {}", s, e)))
        .collect()
}

fn write_str_attr(group: &Group, name: &str, value: &str) -> Result<(), Error> {
    let value = VarLenUnicode::from_str(value).map_err(|e| anyhow::format_err!("{}", e))?;
    group.new_attr::<VarLenUnicode>().create(name)?.write_scalar(&value)?;
    Ok(())
}

fn write_array1<T: hdf5::H5Type>(group: &Group, name: &str, data: &Array1<T>) -> Result<(), Error> {
    // filters need chunking, which needs a non-empty extent
    let ds = if data.is_empty() {
        group.new_dataset::<T>().create(name, 0)?
    } else {
        group
            .new_dataset::<T>()
            .shuffle(true)
            .gzip(1)
            .chunk(data.len().min(1 << 16))
            .create(name, data.len())?
    };
    ds.write(data)?;
    Ok(())
}

fn write_array2(group: &Group, name: &str, data: &Array2<f64>) -> Result<(), Error> {
    let ds = group.new_dataset::<f64>().create(name, data.dim())?;
    ds.write(data)?;
    Ok(())
}

/// A genes × cells layer, stored transposed as a cells × genes CSR group.
fn write_layer(parent: &Group, name: &str, layer: &CsMat<f64>) -> Result<(), Error> {
    let cells_by_genes: CsMat<f64> = layer.transpose_view().to_csr();
    write_csr(parent, name, &cells_by_genes)
}

fn write_csr(parent: &Group, name: &str, mat: &CsMat<f64>) -> Result<(), Error> {
    let group = parent.create_group(name)?;
    write_str_attr(&group, "encoding-type", "csr_matrix")?;
    write_str_attr(&group, "encoding-version", "0.1.0")?;
    let shape = Array1::from(vec![mat.rows() as i64, mat.cols() as i64]);
    group.new_attr::<i64>().shape(2).create("shape")?.write(&shape)?;
    write_array1(&group, "data", &Array1::from(mat.data().to_vec()))?;
    write_array1(&group, "indices", &mat.indices().iter().map(|&i| i as i64).collect())?;
    write_array1(&group, "indptr", &mat.indptr().raw_storage().iter().map(|&i| i as i64).collect())?;
    Ok(())
}

fn write_frame(parent: &Group, name: &str, frame: &Frame) -> Result<(), Error> {
    let group = parent.create_group(name)?;
    write_str_attr(&group, "encoding-type", "dataframe")?;
    write_str_attr(&group, "_index", "_index")?;
    write_array1(&group, "_index", &unicode(frame.index())?)?;
    for (col_name, column) in frame.columns() {
        match column {
            Column::Numeric(values) => write_array1(&group, col_name, values)?,
            Column::Flag(values) => {
                let as_int = values.iter().map(|&b| b as u8).collect::<Array1<u8>>();
                write_array1(&group, col_name, &as_int)?;
            }
            Column::Text(values) => write_array1(&group, col_name, &unicode(values)?)?,
            Column::Categorical(cat) => {
                let codes = cat
                    .codes
                    .iter()
                    .map(|c| c.map_or(-1, |c| c as i32))
                    .collect::<Array1<i32>>();
                write_array1(&group, col_name, &codes)?;
                if !group.link_exists("__categories") {
                    group.create_group("__categories")?;
                }
                write_array1(&group.group("__categories")?, col_name, &unicode(&cat.categories)?)?;
            }
        }
    }
    Ok(())
}

/// Write the dataset as `.h5ad`. `X` holds `logcounts` when present, `counts`
/// otherwise; every layer is also written under `layers`.
pub fn write_h5ad(dataset: &Dataset, path: &Path) -> Result<(), Error> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let x = if dataset.has_layer(LOGCOUNTS) { LOGCOUNTS } else { COUNTS };
    write_layer(&file, "X", dataset.layer(x)?)?;

    let layers = file.create_group("layers")?;
    for name in dataset.layer_names() {
        write_layer(&layers, name, dataset.layer(name)?)?;
    }
    write_frame(&file, "obs", dataset.obs())?;
    write_frame(&file, "var", dataset.var())?;

    let obsm = file.create_group("obsm")?;
    for (name, embedding) in dataset.obsm_entries() {
        write_array2(&obsm, name, embedding)?;
    }
    let varm = file.create_group("varm")?;
    for (name, loadings) in dataset.varm_entries() {
        write_array2(&varm, name, loadings)?;
    }
    let obsp = file.create_group("obsp")?;
    for (name, graph) in dataset.obsp_entries() {
        write_csr(&obsp, name, graph)?;
    }

    let uns = dataset
        .uns_entries()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<Map<String, Value>>();
    let uns_group = file.create_group("uns")?;
    write_str_attr(&uns_group, "json", &serde_json::to_string(&Value::Object(uns))?)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use sc_types::matrix::from_dense_cells_by_genes;
    use sc_types::Categorical;

    #[test]
    fn test_write_h5ad() {
        let dir = tempfile::tempdir().unwrap();
        let dense = array![[1.0, 0.0, 2.0], [0.0, 3.0, 0.0]];
        let mut d = Dataset::new(
            "h5",
            from_dense_cells_by_genes(dense.view()),
            vec!["a".into(), "b".into(), "c".into()],
            vec!["c1".into(), "c2".into()],
        )
        .unwrap();
        d.obs_mut()
            .insert("type", Column::Categorical(Categorical::from_labels(&[Some("x"), None])))
            .unwrap();
        d.insert_obsm("X_pca", array![[0.1], [0.2]]).unwrap();
        let path = dir.path().join("out.h5ad");
        write_h5ad(&d, &path).unwrap();

        let file = File::open(&path).unwrap();
        let x = file.group("X").unwrap();
        let data = x.dataset("data").unwrap().read_1d::<f64>().unwrap();
        assert_eq!(data.to_vec(), vec![1.0, 2.0, 3.0]);
        let codes = file.group("obs").unwrap().dataset("type").unwrap().read_1d::<i32>().unwrap();
        assert_eq!(codes.to_vec(), vec![0, -1]);
        let pca = file.group("obsm").unwrap().dataset("X_pca").unwrap().read_2d::<f64>().unwrap();
        assert_eq!(pca.dim(), (2, 1));
    }
}
