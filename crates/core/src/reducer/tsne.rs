use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use super::{
    base_params, clamp_float, InputKind, Reducer, ReducerInput, ReducerParams, Reduction,
};
use crate::document::Dimensions;
use crate::error::Result;

const ITERATIONS: usize = 1000;
const EXAGGERATION_ITERS: usize = 250;
const EARLY_EXAGGERATION: f64 = 12.0;
const MIN_GAIN: f64 = 0.01;

/// Exact t-SNE (no Barnes-Hut approximation), quadratic in the number of
/// entities.
pub struct TSne;

impl Reducer for TSne {
    fn name(&self) -> &'static str {
        "tsne"
    }

    fn accepts(&self, _input: InputKind) -> bool {
        true
    }

    fn reduce(
        &self,
        input: &ReducerInput,
        dims: Dimensions,
        params: &ReducerParams,
    ) -> Result<Reduction> {
        let n = input.len();
        let k = dims.count();
        let max_perplexity = ((n.saturating_sub(1)) as f64).max(1.0);
        let perplexity = clamp_float(self.name(), "perplexity", params.perplexity, max_perplexity);

        let mut out = base_params(dims);
        out.insert("perplexity".into(), json!(perplexity));
        out.insert("learning_rate".into(), json!(params.learning_rate));
        out.insert("metric".into(), json!(input.metric_label(params.metric)));

        if n < 2 {
            return Ok(Reduction {
                points: DMatrix::zeros(n, k),
                params: out,
            });
        }
        let distances = input.pairwise(params.metric);
        let affinities = joint_probabilities(&distances, perplexity);
        let points = optimize(&affinities, k, params.learning_rate, params.random_state);
        Ok(Reduction {
            points,
            params: out,
        })
    }
}

/// Symmetrized conditional probabilities, each row calibrated by binary
/// search on the Gaussian precision to match `perplexity`.
fn joint_probabilities(distances: &DMatrix<f64>, perplexity: f64) -> DMatrix<f64> {
    let n = distances.nrows();
    let target = perplexity.ln();
    let mut conditional = DMatrix::zeros(n, n);
    for i in 0..n {
        let sq = (0..n)
            .map(|j| distances[(i, j)] * distances[(i, j)])
            .collect::<Vec<_>>();
        let mut beta = 1.0;
        let (mut lo, mut hi) = (f64::NEG_INFINITY, f64::INFINITY);
        let mut row = vec![0.0; n];
        for _ in 0..64 {
            let min_sq = (0..n)
                .filter(|&j| j != i)
                .map(|j| sq[j])
                .fold(f64::INFINITY, f64::min);
            let mut sum = 0.0;
            for j in 0..n {
                row[j] = if j == i {
                    0.0
                } else {
                    (-(sq[j] - min_sq) * beta).exp()
                };
                sum += row[j];
            }
            let mut entropy = 0.0;
            for j in 0..n {
                row[j] /= sum;
                if row[j] > 1e-300 {
                    entropy -= row[j] * row[j].ln();
                }
            }
            let diff = entropy - target;
            if diff.abs() < 1e-5 {
                break;
            }
            if diff > 0.0 {
                lo = beta;
                beta = if hi.is_finite() { (beta + hi) / 2.0 } else { beta * 2.0 };
            } else {
                hi = beta;
                beta = if lo.is_finite() { (beta + lo) / 2.0 } else { beta / 2.0 };
            }
        }
        for j in 0..n {
            conditional[(i, j)] = row[j];
        }
    }
    let joint = (&conditional + conditional.transpose()) / (2.0 * n as f64);
    joint.map(|p| p.max(1e-12))
}

fn optimize(p: &DMatrix<f64>, k: usize, learning_rate: f64, seed: u64) -> DMatrix<f64> {
    let n = p.nrows();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut y = DMatrix::from_fn(n, k, |_, _| rng.gen_range(-1e-4..1e-4));
    let mut update = DMatrix::<f64>::zeros(n, k);
    let mut gains = DMatrix::<f64>::from_element(n, k, 1.0);

    for iter in 0..ITERATIONS {
        let exaggeration = if iter < EXAGGERATION_ITERS {
            EARLY_EXAGGERATION
        } else {
            1.0
        };
        let momentum = if iter < EXAGGERATION_ITERS { 0.5 } else { 0.8 };

        let mut kernel = DMatrix::zeros(n, n);
        let mut z = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let q = 1.0 / (1.0 + super::distance::squared(&y, i, j));
                kernel[(i, j)] = q;
                kernel[(j, i)] = q;
                z += 2.0 * q;
            }
        }
        let z = z.max(f64::MIN_POSITIVE);

        let mut grad: DMatrix<f64> = DMatrix::zeros(n, k);
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let q = kernel[(i, j)];
                let coeff = 4.0 * (exaggeration * p[(i, j)] - q / z) * q;
                for c in 0..k {
                    grad[(i, c)] += coeff * (y[(i, c)] - y[(j, c)]);
                }
            }
        }

        for idx in 0..n * k {
            let same_sign = (grad[idx] > 0.0) == (update[idx] > 0.0);
            gains[idx] = if same_sign {
                (gains[idx] * 0.8).max(MIN_GAIN)
            } else {
                gains[idx] + 0.2
            };
            update[idx] = momentum * update[idx] - learning_rate * gains[idx] * grad[idx];
            y[idx] += update[idx];
        }

        // Keep the layout centered.
        for c in 0..k {
            let mean = y.column(c).mean();
            y.column_mut(c).add_scalar_mut(-mean);
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::distance::{pairwise, squared};
    use crate::reducer::tests::clusters;
    use crate::reducer::Metric;

    #[test]
    fn affinities_are_symmetric_and_normalized() {
        let dist = pairwise(&clusters(), Metric::Euclidean);
        let p = joint_probabilities(&dist, 5.0);
        assert!((p.sum() - 1.0).abs() < 1e-3);
        assert!((p[(0, 3)] - p[(3, 0)]).abs() < 1e-15);
    }

    #[test]
    fn perplexity_is_clamped_for_small_inputs() {
        let input = ReducerInput::Embeddings(DMatrix::from_row_slice(
            3,
            2,
            &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0],
        ));
        let reduction = TSne
            .reduce(&input, Dimensions::Two, &ReducerParams::default())
            .unwrap();
        assert_eq!(reduction.params["perplexity"], json!(2.0));
        assert_eq!(reduction.params["metric"], json!("euclidean"));
    }

    #[test]
    fn keeps_clusters_apart() {
        let input = ReducerInput::Embeddings(clusters());
        let params = ReducerParams {
            perplexity: 4.0,
            ..ReducerParams::default()
        };
        let points = TSne.reduce(&input, Dimensions::Two, &params).unwrap().points;
        let mean_within = (1..6).map(|j| squared(&points, 0, j).sqrt()).sum::<f64>() / 5.0;
        let mean_across = (6..12).map(|j| squared(&points, 0, j).sqrt()).sum::<f64>() / 6.0;
        assert!(mean_across > mean_within);
    }

    #[test]
    fn seeded_runs_repeat() {
        let input = ReducerInput::Embeddings(clusters());
        let params = ReducerParams::default();
        let a = TSne.reduce(&input, Dimensions::Two, &params).unwrap().points;
        let b = TSne.reduce(&input, Dimensions::Two, &params).unwrap().points;
        assert_eq!(a, b);
    }
}
