use crate::categorical::Categorical;
use anyhow::{bail, format_err, Error};
use ndarray::Array1;
use std::collections::BTreeMap;

/// One annotation column of a `Frame`
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    Categorical(Categorical),
    Numeric(Array1<f64>),
    Text(Vec<String>),
    Flag(Vec<bool>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Categorical(c) => c.len(),
            Column::Numeric(v) => v.len(),
            Column::Text(v) => v.len(),
            Column::Flag(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, indices: &[usize]) -> Column {
        match self {
            Column::Categorical(c) => Column::Categorical(c.select(indices)),
            Column::Numeric(v) => Column::Numeric(indices.iter().map(|&i| v[i]).collect()),
            Column::Text(v) => Column::Text(indices.iter().map(|&i| v[i].clone()).collect()),
            Column::Flag(v) => Column::Flag(indices.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Render entry `i` for tabular export. Missing categorical values render empty.
    pub fn display(&self, i: usize) -> String {
        match self {
            Column::Categorical(c) => c.label(i).unwrap_or_default().to_string(),
            Column::Numeric(v) => v[i].to_string(),
            Column::Text(v) => v[i].clone(),
            Column::Flag(v) => v[i].to_string(),
        }
    }
}

/// A table with one row per entry of `index` (cells for `obs`, genes for `var`).
/// Every column has exactly `index.len()` entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    index: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    pub fn new(index: Vec<String>) -> Frame {
        Frame {
            index,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[String] {
        &self.index
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.iter().position(|n| n == name)
    }

    /// Insert or replace a column. Fails if its length differs from the index.
    pub fn insert(&mut self, name: &str, column: Column) -> Result<(), Error> {
        if column.len() != self.index.len() {
            bail!(
                "column '{}' has {} entries, expected {}",
                name,
                column.len(),
                self.index.len()
            );
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&Column, Error> {
        self.columns
            .get(name)
            .ok_or_else(|| format_err!("no column named '{}'", name))
    }

    pub fn categorical(&self, name: &str) -> Result<&Categorical, Error> {
        match self.get(name)? {
            Column::Categorical(c) => Ok(c),
            _ => bail!("column '{}' is not categorical", name),
        }
    }

    pub fn numeric(&self, name: &str) -> Result<&Array1<f64>, Error> {
        match self.get(name)? {
            Column::Numeric(v) => Ok(v),
            _ => bail!("column '{}' is not numeric", name),
        }
    }

    pub fn flag(&self, name: &str) -> Result<&[bool], Error> {
        match self.get(name)? {
            Column::Flag(v) => Ok(v),
            _ => bail!("column '{}' is not a flag column", name),
        }
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Column)> {
        self.columns.iter()
    }

    /// Subset rows; positions are assumed validated by the caller.
    pub fn select(&self, indices: &[usize]) -> Frame {
        Frame {
            index: indices.iter().map(|&i| self.index[i].clone()).collect(),
            columns: self
                .columns
                .iter()
                .map(|(k, c)| (k.clone(), c.select(indices)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_insert_checks_length() {
        let mut f = Frame::new(vec!["c1".into(), "c2".into(), "c3".into()]);
        assert!(f.insert("total", Column::Numeric(array![1.0, 2.0])).is_err());
        f.insert("total", Column::Numeric(array![1.0, 2.0, 3.0])).unwrap();
        assert!(f.numeric("total").is_ok());
        assert!(f.categorical("total").is_err());
        assert!(f.get("missing").is_err());
    }

    #[test]
    fn test_select_rows() {
        let mut f = Frame::new(vec!["c1".into(), "c2".into(), "c3".into()]);
        f.insert("total", Column::Numeric(array![1.0, 2.0, 3.0])).unwrap();
        f.insert("keep", Column::Flag(vec![true, false, true])).unwrap();
        let s = f.select(&[2, 0]);
        assert_eq!(s.index(), &["c3".to_string(), "c1".to_string()]);
        assert_eq!(s.numeric("total").unwrap(), &array![3.0, 1.0]);
        assert_eq!(s.flag("keep").unwrap(), &[true, true]);
    }
}
