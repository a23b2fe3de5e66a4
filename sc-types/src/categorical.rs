use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A per-cell categorical annotation (cell type, cluster, macrostate ...). Codes index
/// into `categories`; `None` marks a missing label.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Categorical {
    pub categories: Vec<String>,
    pub codes: Vec<Option<u32>>,
}

impl Categorical {
    pub fn new(categories: Vec<String>, codes: Vec<Option<u32>>) -> Result<Categorical, Error> {
        let n = categories.len() as u32;
        if let Some(bad) = codes.iter().flatten().find(|&&c| c >= n) {
            bail!("category code {} out of range for {} categories", bad, n);
        }
        let unique = categories.iter().collect::<BTreeSet<_>>();
        if unique.len() != categories.len() {
            bail!("duplicate category names");
        }
        Ok(Categorical { categories, codes })
    }

    /// Build from raw labels. Categories are sorted lexically, like factor levels.
    pub fn from_labels<S: AsRef<str>>(labels: &[Option<S>]) -> Categorical {
        let categories = labels
            .iter()
            .flatten()
            .map(|s| s.as_ref().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        let lookup = categories
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_str(), i as u32))
            .collect::<BTreeMap<_, _>>();
        let codes = labels
            .iter()
            .map(|l| l.as_ref().map(|s| lookup[s.as_ref()]))
            .collect();
        Categorical { categories, codes }
    }

    /// Build from integer group assignments, naming each category by its number.
    pub fn from_assignments(assignments: &[usize]) -> Categorical {
        let n = assignments.iter().max().map_or(0, |&m| m + 1);
        Categorical {
            categories: (0..n).map(|c| c.to_string()).collect(),
            codes: assignments.iter().map(|&a| Some(a as u32)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn n_categories(&self) -> usize {
        self.categories.len()
    }

    pub fn label(&self, i: usize) -> Option<&str> {
        self.codes[i].map(|c| self.categories[c as usize].as_str())
    }

    /// Number of members in each category, in category order.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.categories.len()];
        for c in self.codes.iter().flatten() {
            counts[*c as usize] += 1;
        }
        counts
    }

    pub fn n_missing(&self) -> usize {
        self.codes.iter().filter(|c| c.is_none()).count()
    }

    /// Positions of the members of each category, in category order.
    pub fn groups(&self) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.categories.len()];
        for (i, c) in self.codes.iter().enumerate() {
            if let Some(c) = c {
                groups[*c as usize].push(i);
            }
        }
        groups
    }

    /// Replace missing labels by `placeholder`, adding it as a category if needed.
    pub fn fill_missing(&mut self, placeholder: &str) {
        if self.n_missing() == 0 {
            return;
        }
        let code = match self.categories.iter().position(|c| c == placeholder) {
            Some(p) => p as u32,
            None => {
                self.categories.push(placeholder.to_string());
                (self.categories.len() - 1) as u32
            }
        };
        for c in self.codes.iter_mut().filter(|c| c.is_none()) {
            *c = Some(code);
        }
    }

    /// Rename categories. Several old categories mapping to the same new name are merged.
    /// Categories absent from `map` keep their name.
    pub fn rename(&mut self, map: &BTreeMap<String, String>) {
        let renamed = self
            .categories
            .iter()
            .map(|c| map.get(c).cloned().unwrap_or_else(|| c.clone()))
            .collect::<Vec<_>>();
        let labels = self
            .codes
            .iter()
            .map(|c| c.map(|c| renamed[c as usize].as_str()))
            .collect::<Vec<_>>();
        *self = Categorical::from_labels(&labels);
    }

    /// Subset to the given positions; the category list is kept as is.
    pub fn select(&self, indices: &[usize]) -> Categorical {
        Categorical {
            categories: self.categories.clone(),
            codes: indices.iter().map(|&i| self.codes[i]).collect(),
        }
    }

    /// Drop categories with no members and re-code.
    pub fn remove_unused(&mut self) {
        let counts = self.counts();
        let mut remap = vec![None; self.categories.len()];
        let mut kept = Vec::new();
        for (i, cat) in self.categories.iter().enumerate() {
            if counts[i] > 0 {
                remap[i] = Some(kept.len() as u32);
                kept.push(cat.clone());
            }
        }
        for c in self.codes.iter_mut() {
            *c = c.and_then(|v| remap[v as usize]);
        }
        self.categories = kept;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cell_types() -> Categorical {
        Categorical::from_labels(&[
            Some("neuron"),
            Some("astro"),
            None,
            Some("neuron"),
            Some("oligo"),
            Some("neuron"),
        ])
    }

    #[test]
    fn test_from_labels() {
        let c = cell_types();
        assert_eq!(c.categories, vec!["astro", "neuron", "oligo"]);
        assert_eq!(c.counts(), vec![1, 3, 1]);
        assert_eq!(c.n_missing(), 1);
        assert_eq!(c.label(4), Some("oligo"));
        assert_eq!(c.label(2), None);
        assert_eq!(c.groups()[1], vec![0, 3, 5]);
    }

    #[test]
    fn test_fill_missing() {
        let mut c = cell_types();
        c.fill_missing("Unknown");
        assert_eq!(c.n_missing(), 0);
        assert_eq!(c.label(2), Some("Unknown"));
        assert_eq!(c.categories.len(), 4);

        // an existing placeholder category is reused
        let mut c = Categorical::from_labels(&[Some("Unknown"), None]);
        c.fill_missing("Unknown");
        assert_eq!(c.categories, vec!["Unknown"]);
        assert_eq!(c.counts(), vec![2]);
    }

    #[test]
    fn test_rename_merges() {
        let mut c = cell_types();
        let map = [("astro", "glia"), ("oligo", "glia")]
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect();
        c.rename(&map);
        assert_eq!(c.categories, vec!["glia", "neuron"]);
        assert_eq!(c.counts(), vec![2, 3]);
        assert_eq!(c.label(2), None);
    }

    #[test]
    fn test_select_and_remove_unused() {
        let c = cell_types();
        let mut s = c.select(&[0, 3, 4]);
        assert_eq!(s.counts(), vec![0, 2, 1]);
        s.remove_unused();
        assert_eq!(s.categories, vec!["neuron", "oligo"]);
        assert_eq!(s.codes, vec![Some(0), Some(0), Some(1)]);
    }

    #[test]
    fn test_new_rejects_bad_codes() {
        assert!(Categorical::new(vec!["a".into()], vec![Some(1)]).is_err());
        assert!(Categorical::new(vec!["a".into(), "a".into()], vec![]).is_err());
        assert!(Categorical::new(vec!["a".into()], vec![Some(0), None]).is_ok());
    }
}
