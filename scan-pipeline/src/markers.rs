use crate::cluster::CLUSTER;
use crate::normalization::LOGCOUNTS;
use anyhow::Error;
use diff_exp::markers::{find_markers, GroupMarkers, MarkerParams, TestType};
use log::info;
use sc_types::dataset::COUNTS;
use sc_types::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Marker detection on a dataset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerSettings {
    /// categorical obs column defining the groups
    pub groupby: String,
    pub params: MarkerParams,
    /// genes per group listed in uns `markers`
    pub top_n: usize,
}

impl Default for MarkerSettings {
    fn default() -> Self {
        MarkerSettings {
            groupby: CLUSTER.to_string(),
            params: MarkerParams::default(),
            top_n: 10,
        }
    }
}

/// Rank marker genes of every group of `settings.groupby`. The binomial test runs on
/// raw counts, the others on `logcounts`. The top genes per group are recorded in
/// uns `markers`.
pub fn find_dataset_markers(dataset: &mut Dataset, settings: &MarkerSettings) -> Result<Vec<GroupMarkers>, Error> {
    let layer = match settings.params.test {
        TestType::Binomial => COUNTS,
        TestType::TTest | TestType::Wilcoxon => LOGCOUNTS,
    };
    let groups = dataset.obs().categorical(&settings.groupby)?;
    let markers = find_markers(dataset.layer(layer)?, groups, &settings.params)?;

    let genes = dataset.gene_names();
    let mut top = Map::new();
    for group in &markers {
        let names = group
            .rows
            .iter()
            .take(settings.top_n)
            .map(|row| Value::from(genes[row.gene].as_str()))
            .collect::<Vec<_>>();
        top.insert(group.group.clone(), Value::Array(names));
    }
    info!(
        "markers for {} groups of '{}' ({:?} test)",
        markers.len(),
        settings.groupby,
        settings.params.test
    );
    dataset.insert_uns(
        "markers",
        json!({
            "groupby": settings.groupby,
            "params": settings.params,
            "top": top,
        }),
    );
    Ok(markers)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::normalization::{normalize, NormalizationParams};
    use ndarray::Array2;
    use sc_types::matrix::from_dense_cells_by_genes;
    use sc_types::{Categorical, Column};

    #[test]
    fn test_dataset_markers() {
        // gene 0 marks group a, gene 1 marks group b, gene 2 is flat
        let n = 12;
        let dense = Array2::from_shape_fn((n, 3), |(c, g)| {
            let in_a = c < 6;
            match g {
                0 => if in_a { 20.0 + (c % 3) as f64 } else { (c % 2) as f64 },
                1 => if in_a { (c % 2) as f64 } else { 15.0 + (c % 4) as f64 },
                _ => 5.0 + (c % 3) as f64,
            }
        });
        let mut d = Dataset::new(
            "m",
            from_dense_cells_by_genes(dense.view()),
            vec!["Ins1".into(), "Gcg".into(), "Actb".into()],
            (0..n).map(|i| format!("c{i}")).collect(),
        )
        .unwrap();
        let labels = (0..n).map(|c| Some(if c < 6 { "a" } else { "b" })).collect::<Vec<_>>();
        d.obs_mut()
            .insert("cell_type", Column::Categorical(Categorical::from_labels(&labels)))
            .unwrap();
        normalize(&mut d, &NormalizationParams::default()).unwrap();

        let settings = MarkerSettings {
            groupby: "cell_type".to_string(),
            top_n: 1,
            ..MarkerSettings::default()
        };
        let markers = find_dataset_markers(&mut d, &settings).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].rows[0].gene, 0);
        assert_eq!(markers[1].rows[0].gene, 1);
        let top = &d.uns("markers").unwrap()["top"];
        assert_eq!(top["a"][0], "Ins1");
        assert_eq!(top["b"][0], "Gcg");

        let binomial = MarkerSettings {
            groupby: "cell_type".to_string(),
            params: MarkerParams {
                test: TestType::Binomial,
                ..MarkerParams::default()
            },
            ..MarkerSettings::default()
        };
        assert_eq!(find_dataset_markers(&mut d, &binomial).unwrap().len(), 2);

        let missing = MarkerSettings {
            groupby: "nope".to_string(),
            ..MarkerSettings::default()
        };
        assert!(find_dataset_markers(&mut d, &missing).is_err());
    }
}
