use nalgebra::{DMatrix, SymmetricEigen};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tracing::debug;

use super::{base_params, InputKind, Reducer, ReducerInput, ReducerParams, Reduction};
use crate::document::Dimensions;
use crate::error::{ProtspaceError, Result};

/// Metric multidimensional scaling: a classical (Torgerson) start refined
/// with SMACOF, keeping the best of `n_init` runs.
pub struct Mds;

impl Reducer for Mds {
    fn name(&self) -> &'static str {
        "mds"
    }

    fn accepts(&self, input: InputKind) -> bool {
        input == InputKind::Matrix
    }

    fn reduce(
        &self,
        input: &ReducerInput,
        dims: Dimensions,
        params: &ReducerParams,
    ) -> Result<Reduction> {
        let ReducerInput::Dissimilarities(dissimilarities) = input else {
            return Err(ProtspaceError::MethodUnsupported {
                method: self.name().to_string(),
                input: input.kind(),
            });
        };
        let k = dims.count();
        let mut rng = StdRng::seed_from_u64(params.random_state);
        let scale = dissimilarities.max().max(1.0);

        let mut best: Option<(DMatrix<f64>, f64)> = None;
        for run in 0..params.n_init {
            let start = if run == 0 {
                classical(dissimilarities, k)
            } else {
                DMatrix::from_fn(dissimilarities.nrows(), k, |_, _| {
                    rng.gen_range(-scale..scale)
                })
            };
            let (points, stress) = smacof(dissimilarities, start, params.max_iter, params.eps);
            debug!(run, stress, "mds run finished");
            if best.as_ref().map_or(true, |(_, s)| stress < *s) {
                best = Some((points, stress));
            }
        }
        let (points, stress) = best.ok_or_else(|| ProtspaceError::reducer("mds", "no runs"))?;

        let mut out = base_params(dims);
        out.insert("dissimilarity".into(), json!("precomputed"));
        out.insert("n_init".into(), json!(params.n_init));
        out.insert("max_iter".into(), json!(params.max_iter));
        out.insert("eps".into(), json!(params.eps));
        out.insert("stress".into(), json!(stress));
        Ok(Reduction {
            points,
            params: out,
        })
    }
}

/// Torgerson scaling: eigenvectors of the double-centered squared
/// dissimilarities.
pub(crate) fn classical(dissimilarities: &DMatrix<f64>, k: usize) -> DMatrix<f64> {
    let n = dissimilarities.nrows();
    let squared = dissimilarities.map(|d| d * d);
    let row_means = squared.column_mean();
    let col_means = squared.row_mean();
    let grand = squared.mean();
    let b = DMatrix::from_fn(n, n, |i, j| {
        -0.5 * (squared[(i, j)] - row_means[i] - col_means[j] + grand)
    });
    let eigen = SymmetricEigen::new(b);
    let mut order = (0..n).collect::<Vec<_>>();
    order.sort_by(|&a, &c| {
        eigen.eigenvalues[c]
            .total_cmp(&eigen.eigenvalues[a])
            .then_with(|| a.cmp(&c))
    });
    let mut points = DMatrix::zeros(n, k);
    for (component, &idx) in order.iter().take(k).enumerate() {
        let lambda = eigen.eigenvalues[idx];
        if lambda <= 0.0 {
            continue;
        }
        let column = eigen.eigenvectors.column(idx) * lambda.sqrt();
        points.set_column(component, &column);
    }
    points
}

fn layout_distances(points: &DMatrix<f64>) -> DMatrix<f64> {
    let n = points.nrows();
    DMatrix::from_fn(n, n, |i, j| super::distance::squared(points, i, j).sqrt())
}

fn raw_stress(dissimilarities: &DMatrix<f64>, distances: &DMatrix<f64>) -> f64 {
    let n = dissimilarities.nrows();
    let mut stress = 0.0;
    for i in 0..n {
        for j in (i + 1)..n {
            let diff = distances[(i, j)] - dissimilarities[(i, j)];
            stress += diff * diff;
        }
    }
    stress
}

/// Guttman-transform iterations until the relative stress improvement drops
/// below `eps`.
fn smacof(
    dissimilarities: &DMatrix<f64>,
    mut points: DMatrix<f64>,
    max_iter: usize,
    eps: f64,
) -> (DMatrix<f64>, f64) {
    let n = dissimilarities.nrows();
    if n < 2 {
        return (DMatrix::zeros(n, points.ncols()), 0.0);
    }
    let mut distances = layout_distances(&points);
    let mut stress = raw_stress(dissimilarities, &distances);
    for _ in 0..max_iter {
        let mut b = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..n {
                if i != j && distances[(i, j)] > 1e-12 {
                    b[(i, j)] = -dissimilarities[(i, j)] / distances[(i, j)];
                }
            }
        }
        for i in 0..n {
            let row_sum: f64 = (0..n).filter(|&j| j != i).map(|j| b[(i, j)]).sum();
            b[(i, i)] = -row_sum;
        }
        points = (&b * &points) / n as f64;
        distances = layout_distances(&points);
        let next = raw_stress(dissimilarities, &distances);
        let improvement = (stress - next) / stress.max(f64::MIN_POSITIVE);
        stress = next;
        if improvement < eps {
            break;
        }
    }
    (points, stress)
}
