use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView2};
use sprs::CsMat;

/// Project velocities into a low-dimensional embedding. Each cell's arrow is the
/// transition-weighted sum of unit displacements to its candidate successors (the
/// non-zero pattern of `graph` and of `transitions`), minus the displacement expected
/// if the same outgoing mass were spread evenly over all candidates. Self-transitions
/// are ignored.
pub fn project_velocity(
    transitions: &CsMat<f64>,
    graph: &CsMat<f64>,
    embedding: ArrayView2<f64>,
) -> Result<Array2<f64>, Error> {
    let n = transitions.rows();
    if embedding.nrows() != n || graph.rows() != n {
        bail!(
            "embedding has {} cells, velocity graph {}, transitions {}",
            embedding.nrows(),
            graph.rows(),
            n
        );
    }
    let transitions = if transitions.is_csr() { transitions.clone() } else { transitions.to_csr() };
    let dims = embedding.ncols();
    let mut arrows = Array2::<f64>::zeros((n, dims));
    for (i, row) in transitions.outer_iterator().enumerate() {
        let mut candidates = row.indices().to_vec();
        if let Some(g) = graph.outer_view(i) {
            candidates.extend_from_slice(g.indices());
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates.retain(|&j| j != i);

        let mut weighted = Array1::<f64>::zeros(dims);
        let mut displacement = Array1::<f64>::zeros(dims);
        let mut mass = 0.0;
        for &j in &candidates {
            let p = row.get(j).copied().unwrap_or(0.0);
            let mut dx = &embedding.row(j) - &embedding.row(i);
            let norm = dx.dot(&dx).sqrt();
            if norm > 0.0 {
                dx /= norm;
            }
            weighted.scaled_add(p, &dx);
            displacement += &dx;
            mass += p;
        }
        if !candidates.is_empty() {
            weighted.scaled_add(-mass / candidates.len() as f64, &displacement);
            arrows.row_mut(i).assign(&weighted);
        }
    }
    Ok(arrows)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use sc_types::matrix::from_rows;

    #[test]
    fn test_arrow_follows_transitions() {
        let emb = array![[0.0, 0.0], [1.0, 0.0], [-1.0, 0.0], [0.0, 2.0]];
        // cell 0 moves to cell 1 with probability 0.8
        let t = from_rows(
            (4, 4),
            vec![
                vec![(0, 0.1), (1, 0.8), (2, 0.1)],
                vec![(1, 1.0)],
                vec![(2, 1.0)],
                vec![(0, 0.5), (3, 0.5)],
            ],
        )
        .unwrap();
        let arrows = project_velocity(&t, &t, emb.view()).unwrap();
        assert_abs_diff_eq!(arrows[(0, 0)], 0.7, epsilon = 1e-12);
        assert_abs_diff_eq!(arrows[(0, 1)], 0.0, epsilon = 1e-12);
        assert_eq!(arrows.row(1).to_vec(), vec![0.0, 0.0]);
        // a single successor carries no direction beyond the uniform expectation
        assert_abs_diff_eq!(arrows[(3, 0)], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(arrows[(3, 1)], 0.0, epsilon = 1e-12);
        assert!(project_velocity(&t, &t, emb.slice(ndarray::s![..2, ..])).is_err());
    }

    #[test]
    fn test_arrow_never_points_behind_successors() {
        let emb = array![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [3.0, 0.0]];
        let t = from_rows(
            (4, 4),
            vec![
                vec![(0, 0.2), (1, 0.8)],
                // both successors ahead, half the mass stays put
                vec![(1, 0.5), (2, 0.25), (3, 0.25)],
                vec![(1, 0.1), (2, 0.3), (3, 0.6)],
                vec![(3, 1.0)],
            ],
        )
        .unwrap();
        let arrows = project_velocity(&t, &t, emb.view()).unwrap();
        for i in 0..4 {
            assert!(arrows[(i, 0)] >= -1e-12, "cell {i} points backward: {}", arrows[(i, 0)]);
        }
        assert_abs_diff_eq!(arrows[(1, 0)], 0.0, epsilon = 1e-12);
        // successors on both sides, most mass ahead
        assert_abs_diff_eq!(arrows[(2, 0)], 0.5, epsilon = 1e-12);

        // neighbours behind the cell that receive no transition pull the arrow forward
        let graph = from_rows(
            (4, 4),
            vec![
                vec![(1, 0.9)],
                vec![(0, -0.8), (2, 0.7), (3, 0.6)],
                vec![(0, -0.5), (1, -0.4), (3, 0.9)],
                vec![(2, -0.3)],
            ],
        )
        .unwrap();
        let arrows = project_velocity(&t, &graph, emb.view()).unwrap();
        // cell 1: 0.5 * (1, 0) - 0.5 / 3 * (1, 0)
        assert_abs_diff_eq!(arrows[(1, 0)], 1.0 / 3.0, epsilon = 1e-12);
        assert!(arrows[(1, 0)] > 0.0);
        // cell 3 only keeps itself
        assert_abs_diff_eq!(arrows[(3, 0)], 0.0, epsilon = 1e-12);
    }
}
