use crate::check_selection;
use crate::frame::Frame;
use crate::matrix::{ensure_csr, select_cols, select_rows, select_square, Layer};
use anyhow::{bail, format_err, Error};
use ndarray::{Array2, Axis};
use serde_json::Value;
use sprs::CsMat;
use std::collections::BTreeMap;

/// Name of the raw count layer every dataset starts with.
pub const COUNTS: &str = "counts";

/// The evolving analysis object: expression layers plus everything derived from them,
/// aligned on cell order (`obs`, `obsm`, `obsp`) and gene order (`var`, `varm`).
#[derive(Clone, Debug)]
pub struct Dataset {
    name: String,
    layers: BTreeMap<String, Layer>,
    obs: Frame,
    var: Frame,
    obsm: BTreeMap<String, Array2<f64>>,
    varm: BTreeMap<String, Array2<f64>>,
    obsp: BTreeMap<String, CsMat<f64>>,
    uns: BTreeMap<String, Value>,
}

impl Dataset {
    /// Create a dataset from a genes × cells count matrix.
    pub fn new(name: &str, counts: Layer, genes: Vec<String>, cells: Vec<String>) -> Result<Dataset, Error> {
        if counts.rows() != genes.len() || counts.cols() != cells.len() {
            bail!(
                "count matrix is {:?} but there are {} genes and {} cells",
                counts.shape(),
                genes.len(),
                cells.len()
            );
        }
        let mut layers = BTreeMap::new();
        layers.insert(COUNTS.to_string(), ensure_csr(counts));
        Ok(Dataset {
            name: name.to_string(),
            layers,
            obs: Frame::new(cells),
            var: Frame::new(genes),
            obsm: BTreeMap::new(),
            varm: BTreeMap::new(),
            obsp: BTreeMap::new(),
            uns: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_cells(&self) -> usize {
        self.obs.len()
    }

    pub fn n_genes(&self) -> usize {
        self.var.len()
    }

    pub fn cell_names(&self) -> &[String] {
        self.obs.index()
    }

    pub fn gene_names(&self) -> &[String] {
        self.var.index()
    }

    pub fn layer(&self, name: &str) -> Result<&Layer, Error> {
        self.layers
            .get(name)
            .ok_or_else(|| format_err!("dataset '{}' has no layer '{}'", self.name, name))
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.contains_key(name)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &String> {
        self.layers.keys()
    }

    pub fn insert_layer(&mut self, name: &str, layer: Layer) -> Result<(), Error> {
        if layer.shape() != (self.n_genes(), self.n_cells()) {
            bail!(
                "layer '{}' has shape {:?}, expected ({}, {})",
                name,
                layer.shape(),
                self.n_genes(),
                self.n_cells()
            );
        }
        self.layers.insert(name.to_string(), ensure_csr(layer));
        Ok(())
    }

    pub fn obs(&self) -> &Frame {
        &self.obs
    }

    pub fn obs_mut(&mut self) -> &mut Frame {
        &mut self.obs
    }

    pub fn var(&self) -> &Frame {
        &self.var
    }

    pub fn var_mut(&mut self) -> &mut Frame {
        &mut self.var
    }

    pub fn obsm(&self, name: &str) -> Result<&Array2<f64>, Error> {
        self.obsm
            .get(name)
            .ok_or_else(|| format_err!("dataset '{}' has no cell embedding '{}'", self.name, name))
    }

    pub fn obsm_entries(&self) -> impl Iterator<Item = (&String, &Array2<f64>)> {
        self.obsm.iter()
    }

    pub fn insert_obsm(&mut self, name: &str, embedding: Array2<f64>) -> Result<(), Error> {
        if embedding.nrows() != self.n_cells() {
            bail!(
                "embedding '{}' has {} rows, expected {} cells",
                name,
                embedding.nrows(),
                self.n_cells()
            );
        }
        self.obsm.insert(name.to_string(), embedding);
        Ok(())
    }

    pub fn varm(&self, name: &str) -> Result<&Array2<f64>, Error> {
        self.varm
            .get(name)
            .ok_or_else(|| format_err!("dataset '{}' has no gene loading '{}'", self.name, name))
    }

    pub fn varm_entries(&self) -> impl Iterator<Item = (&String, &Array2<f64>)> {
        self.varm.iter()
    }

    pub fn insert_varm(&mut self, name: &str, loadings: Array2<f64>) -> Result<(), Error> {
        if loadings.nrows() != self.n_genes() {
            bail!(
                "gene loading '{}' has {} rows, expected {} genes",
                name,
                loadings.nrows(),
                self.n_genes()
            );
        }
        self.varm.insert(name.to_string(), loadings);
        Ok(())
    }

    pub fn obsp(&self, name: &str) -> Result<&CsMat<f64>, Error> {
        self.obsp
            .get(name)
            .ok_or_else(|| format_err!("dataset '{}' has no cell graph '{}'", self.name, name))
    }

    pub fn obsp_entries(&self) -> impl Iterator<Item = (&String, &CsMat<f64>)> {
        self.obsp.iter()
    }

    pub fn insert_obsp(&mut self, name: &str, graph: CsMat<f64>) -> Result<(), Error> {
        let n = self.n_cells();
        if graph.shape() != (n, n) {
            bail!("cell graph '{}' has shape {:?}, expected ({}, {})", name, graph.shape(), n, n);
        }
        self.obsp.insert(name.to_string(), ensure_csr(graph));
        Ok(())
    }

    pub fn uns(&self, key: &str) -> Option<&Value> {
        self.uns.get(key)
    }

    pub fn uns_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.uns.iter()
    }

    pub fn insert_uns(&mut self, key: &str, value: Value) {
        self.uns.insert(key.to_string(), value);
    }

    /// Restrict every cell-aligned structure to `cells`, in the given order. Layers lose
    /// columns, obs/obsm lose rows, obsp graphs are restricted to the kept nodes.
    pub fn subset_cells(&self, cells: &[usize]) -> Result<Dataset, Error> {
        check_selection(cells, self.n_cells())?;
        Ok(Dataset {
            name: self.name.clone(),
            layers: self
                .layers
                .iter()
                .map(|(k, l)| (k.clone(), select_cols(l, cells)))
                .collect(),
            obs: self.obs.select(cells),
            var: self.var.clone(),
            obsm: self
                .obsm
                .iter()
                .map(|(k, m)| (k.clone(), m.select(Axis(0), cells)))
                .collect(),
            varm: self.varm.clone(),
            obsp: self
                .obsp
                .iter()
                .map(|(k, g)| (k.clone(), select_square(g, cells)))
                .collect(),
            uns: self.uns.clone(),
        })
    }

    /// Restrict every gene-aligned structure to `genes`, in the given order.
    pub fn subset_genes(&self, genes: &[usize]) -> Result<Dataset, Error> {
        check_selection(genes, self.n_genes())?;
        Ok(Dataset {
            name: self.name.clone(),
            layers: self
                .layers
                .iter()
                .map(|(k, l)| (k.clone(), select_rows(l, genes)))
                .collect(),
            obs: self.obs.clone(),
            var: self.var.select(genes),
            obsm: self.obsm.clone(),
            varm: self
                .varm
                .iter()
                .map(|(k, m)| (k.clone(), m.select(Axis(0), genes)))
                .collect(),
            obsp: self.obsp.clone(),
            uns: self.uns.clone(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::categorical::Categorical;
    use crate::frame::Column;
    use crate::matrix::{from_dense_cells_by_genes, from_rows, to_dense_cells_by_genes};
    use ndarray::{array, Array1};

    fn small() -> Dataset {
        let counts = from_dense_cells_by_genes(
            array![[1.0, 0.0], [2.0, 5.0], [0.0, 3.0], [4.0, 4.0]].view(),
        );
        let mut d = Dataset::new(
            "small",
            counts,
            vec!["g1".into(), "g2".into()],
            (1..=4).map(|i| format!("cell{i}")).collect(),
        )
        .unwrap();
        let labels = Categorical::from_labels(&[Some("a"), Some("b"), Some("a"), None]);
        d.obs_mut().insert("label", Column::Categorical(labels)).unwrap();
        d.obs_mut()
            .insert("total", Column::Numeric(Array1::from(vec![1.0, 7.0, 3.0, 8.0])))
            .unwrap();
        d.insert_obsm("X_pca", array![[0.0, 1.0], [1.0, 1.0], [2.0, 1.0], [3.0, 1.0]])
            .unwrap();
        let graph = from_rows(
            (4, 4),
            vec![vec![(1, 1.0)], vec![(0, 1.0), (3, 2.0)], vec![], vec![(1, 2.0)]],
        )
        .unwrap();
        d.insert_obsp("connectivities", graph).unwrap();
        d
    }

    #[test]
    fn test_shape_checks() {
        let mut d = small();
        assert!(d.insert_obsm("bad", Array2::zeros((3, 2))).is_err());
        assert!(d.insert_varm("bad", Array2::zeros((4, 2))).is_err());
        assert!(d.insert_layer("bad", from_dense_cells_by_genes(Array2::zeros((4, 3)).view())).is_err());
        assert!(d.insert_obsp("bad", from_rows((3, 3), vec![vec![], vec![], vec![]]).unwrap()).is_err());
        assert!(d.layer("logcounts").is_err());
    }

    #[test]
    fn test_subset_cells_keeps_alignment() {
        let d = small();
        let s = d.subset_cells(&[3, 1]).unwrap();
        assert_eq!(s.n_cells(), 2);
        assert_eq!(s.cell_names(), &["cell4".to_string(), "cell2".to_string()]);
        assert_eq!(s.obs().numeric("total").unwrap(), &array![8.0, 7.0]);
        assert_eq!(s.obs().categorical("label").unwrap().label(1), Some("b"));
        assert_eq!(s.obsm("X_pca").unwrap().column(0), array![3.0, 1.0]);
        let counts = to_dense_cells_by_genes(s.layer(COUNTS).unwrap(), None);
        assert_eq!(counts, array![[4.0, 4.0], [2.0, 5.0]]);
        let g = s.obsp("connectivities").unwrap();
        assert_eq!(g.get(0, 1), Some(&2.0));
        assert_eq!(g.get(1, 0), Some(&2.0));
    }

    #[test]
    fn test_subset_rejects_bad_selection() {
        let d = small();
        assert!(d.subset_cells(&[]).is_err());
        assert!(d.subset_cells(&[0, 0]).is_err());
        assert!(d.subset_cells(&[4]).is_err());
        assert!(d.subset_genes(&[2]).is_err());
    }

    #[test]
    fn test_subset_genes() {
        let mut d = small();
        d.insert_varm("PCs", array![[1.0], [2.0]]).unwrap();
        let s = d.subset_genes(&[1]).unwrap();
        assert_eq!(s.gene_names(), &["g2".to_string()]);
        assert_eq!(s.varm("PCs").unwrap(), &array![[2.0]]);
        assert_eq!(s.layer(COUNTS).unwrap().shape(), (1, 4));
        assert_eq!(s.n_cells(), 4);
    }
}
