use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{ProtspaceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        }
    }

    fn between(&self, data: &DMatrix<f64>, norms: &[f64], i: usize, j: usize) -> f64 {
        match self {
            Metric::Euclidean => (data.row(i) - data.row(j)).norm(),
            Metric::Cosine => {
                let denom = norms[i] * norms[j];
                if denom == 0.0 {
                    // Zero vectors have no direction; treat them as unrelated.
                    return 1.0;
                }
                (1.0 - data.row(i).dot(&data.row(j)) / denom).clamp(0.0, 2.0)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ProtspaceError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(ProtspaceError::schema(format!(
                "unknown metric '{other}' (expected euclidean or cosine)"
            ))),
        }
    }
}

pub(crate) fn pairwise(data: &DMatrix<f64>, metric: Metric) -> DMatrix<f64> {
    let n = data.nrows();
    let norms = data.row_iter().map(|row| row.norm()).collect::<Vec<_>>();
    let mut out = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in (i + 1)..n {
            let d = metric.between(data, &norms, i, j);
            out[(i, j)] = d;
            out[(j, i)] = d;
        }
    }
    out
}

/// The `k` nearest other rows of every row, closest first. Ties resolve to
/// the lower index.
pub(crate) fn nearest_neighbors(dist: &DMatrix<f64>, k: usize) -> Vec<Vec<usize>> {
    let n = dist.nrows();
    (0..n)
        .map(|i| {
            let mut others = (0..n).filter(|&j| j != i).collect::<Vec<_>>();
            others.sort_by(|&a, &b| {
                dist[(i, a)]
                    .total_cmp(&dist[(i, b)])
                    .then_with(|| a.cmp(&b))
            });
            others.truncate(k);
            others
        })
        .collect()
}

/// Squared euclidean distance between two rows of a layout.
pub(crate) fn squared(points: &DMatrix<f64>, i: usize, j: usize) -> f64 {
    (points.row(i) - points.row(j)).norm_squared()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn euclidean_and_cosine() {
        let data = DMatrix::from_row_slice(3, 2, &[0.0, 1.0, 1.0, 0.0, 0.0, 2.0]);
        let euclid = pairwise(&data, Metric::Euclidean);
        assert!((euclid[(0, 1)] - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(euclid[(1, 0)], euclid[(0, 1)]);
        let cosine = pairwise(&data, Metric::Cosine);
        assert!((cosine[(0, 1)] - 1.0).abs() < 1e-12);
        assert!(cosine[(0, 2)].abs() < 1e-12);
    }

    #[test]
    fn neighbors_exclude_self_and_break_ties_by_index() {
        let data = DMatrix::from_row_slice(4, 1, &[0.0, 1.0, -1.0, 5.0]);
        let dist = pairwise(&data, Metric::Euclidean);
        let nn = nearest_neighbors(&dist, 2);
        assert_eq!(nn[0], vec![1, 2]);
        assert_eq!(nn[3], vec![1, 0]);
    }

    #[test]
    fn metric_parses_case_insensitively() {
        assert_eq!("Cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert!("manhattan".parse::<Metric>().is_err());
    }
}
