use std::collections::HashSet;

use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use super::distance::{nearest_neighbors, squared};
use super::{
    base_params, clamp_count, InputKind, Reducer, ReducerInput, ReducerParams, Reduction,
};
use crate::document::Dimensions;
use crate::error::Result;

const ITERATIONS: usize = 450;
const LEARNING_RATE: f64 = 1.0;
const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const MID_NEAR_CANDIDATES: usize = 6;

/// Pairwise controlled manifold approximation with near, mid-near and
/// further pairs and the three-phase weight schedule.
pub struct PaCMap;

impl Reducer for PaCMap {
    fn name(&self) -> &'static str {
        "pacmap"
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
        let neighbors = clamp_count(
            self.name(),
            "n_neighbors",
            params.n_neighbors,
            n.saturating_sub(1),
        );

        let mut out = base_params(dims);
        out.insert("n_neighbors".into(), json!(neighbors));
        out.insert("MN_ratio".into(), json!(params.mn_ratio));
        out.insert("FP_ratio".into(), json!(params.fp_ratio));
        out.insert("metric".into(), json!(input.metric_label(params.metric)));

        if neighbors == 0 {
            return Ok(Reduction {
                points: DMatrix::zeros(n, k),
                params: out,
            });
        }
        let mut rng = StdRng::seed_from_u64(params.random_state);
        let distances = input.pairwise(params.metric);
        let pairs = sample_pairs(&distances, neighbors, params, &mut rng);
        let points = optimize(n, k, &pairs, &mut rng);
        Ok(Reduction {
            points,
            params: out,
        })
    }
}

#[derive(Debug, Default)]
struct Pairs {
    near: Vec<(usize, usize)>,
    mid_near: Vec<(usize, usize)>,
    further: Vec<(usize, usize)>,
}

fn sample_pairs(
    distances: &DMatrix<f64>,
    neighbors: usize,
    params: &ReducerParams,
    rng: &mut StdRng,
) -> Pairs {
    let n = distances.nrows();
    let knn = nearest_neighbors(distances, neighbors);
    let n_mid = (neighbors as f64 * params.mn_ratio).round() as usize;
    let n_far = (neighbors as f64 * params.fp_ratio).round() as usize;
    let mut pairs = Pairs::default();

    for (i, row) in knn.iter().enumerate() {
        let close = row.iter().copied().collect::<HashSet<_>>();
        pairs.near.extend(row.iter().map(|&j| (i, j)));

        // Second closest of a handful of random candidates.
        for _ in 0..n_mid {
            let mut candidates = (0..MID_NEAR_CANDIDATES)
                .map(|_| rng.gen_range(0..n))
                .filter(|&j| j != i)
                .collect::<Vec<_>>();
            if candidates.len() < 2 {
                continue;
            }
            candidates.sort_by(|&a, &b| distances[(i, a)].total_cmp(&distances[(i, b)]));
            pairs.mid_near.push((i, candidates[1]));
        }

        let far_pool = n - 1 - close.len();
        for _ in 0..n_far.min(far_pool) {
            // Bounded retries keep tiny inputs from spinning.
            for _ in 0..16 {
                let j = rng.gen_range(0..n);
                if j != i && !close.contains(&j) {
                    pairs.further.push((i, j));
                    break;
                }
            }
        }
    }
    pairs
}

/// `(w_near, w_mid_near, w_further)` for an iteration.
fn weights(iter: usize) -> (f64, f64, f64) {
    match iter {
        0..=99 => {
            let t = iter as f64 / 100.0;
            (2.0, 1000.0 * (1.0 - t) + 3.0 * t, 1.0)
        }
        100..=199 => (3.0, 3.0, 1.0),
        _ => (1.0, 0.0, 1.0),
    }
}

fn optimize(n: usize, k: usize, pairs: &Pairs, rng: &mut StdRng) -> DMatrix<f64> {
    let mut y = DMatrix::from_fn(n, k, |_, _| rng.gen_range(-1e-2..1e-2));
    let mut m = DMatrix::<f64>::zeros(n, k);
    let mut v = DMatrix::<f64>::zeros(n, k);

    for iter in 0..ITERATIONS {
        let (w_near, w_mid, w_far) = weights(iter);
        let mut grad = DMatrix::<f64>::zeros(n, k);
        let mut accumulate = |i: usize, j: usize, coeff: f64, y: &DMatrix<f64>| {
            for c in 0..k {
                let g = coeff * (y[(i, c)] - y[(j, c)]);
                grad[(i, c)] += g;
                grad[(j, c)] -= g;
            }
        };
        for &(i, j) in &pairs.near {
            let d = 1.0 + squared(&y, i, j);
            accumulate(i, j, w_near * 20.0 / ((10.0 + d) * (10.0 + d)), &y);
        }
        if w_mid > 0.0 {
            for &(i, j) in &pairs.mid_near {
                let d = 1.0 + squared(&y, i, j);
                accumulate(i, j, w_mid * 20_000.0 / ((10_000.0 + d) * (10_000.0 + d)), &y);
            }
        }
        for &(i, j) in &pairs.further {
            let d = 1.0 + squared(&y, i, j);
            accumulate(i, j, -w_far * 2.0 / ((1.0 + d) * (1.0 + d)), &y);
        }

        let step = (iter + 1) as i32;
        let lr = LEARNING_RATE * (1.0 - BETA2.powi(step)).sqrt() / (1.0 - BETA1.powi(step));
        for idx in 0..n * k {
            m[idx] += (1.0 - BETA1) * (grad[idx] - m[idx]);
            v[idx] += (1.0 - BETA2) * (grad[idx] * grad[idx] - v[idx]);
            y[idx] -= lr * m[idx] / (v[idx].sqrt() + 1e-7);
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducer::distance::pairwise;
    use crate::reducer::tests::clusters;
    use crate::reducer::Metric;

    #[test]
    fn pair_counts_follow_ratios() {
        let dist = pairwise(&clusters(), Metric::Euclidean);
        let mut rng = StdRng::seed_from_u64(7);
        let params = ReducerParams::default();
        let pairs = sample_pairs(&dist, 4, &params, &mut rng);
        assert_eq!(pairs.near.len(), 12 * 4);
        assert!(pairs.mid_near.len() <= 12 * 2);
        assert!(pairs.further.iter().all(|(i, j)| i != j));
        assert!(pairs.further.len() <= 12 * 7);
    }

    #[test]
    fn schedule_hands_over_from_global_to_local() {
        assert_eq!(weights(0), (2.0, 1000.0, 1.0));
        assert_eq!(weights(150), (3.0, 3.0, 1.0));
        assert_eq!(weights(300), (1.0, 0.0, 1.0));
    }

    #[test]
    fn keeps_clusters_apart() {
        let input = ReducerInput::Embeddings(clusters());
        let params = ReducerParams {
            n_neighbors: 4,
            ..ReducerParams::default()
        };
        let reduction = PaCMap.reduce(&input, Dimensions::Two, &params).unwrap();
        assert_eq!(reduction.params["MN_ratio"], json!(0.5));
        let points = reduction.points;
        let mean_within = (1..6).map(|j| squared(&points, 0, j).sqrt()).sum::<f64>() / 5.0;
        let mean_across = (6..12).map(|j| squared(&points, 0, j).sqrt()).sum::<f64>() / 6.0;
        assert!(mean_across > mean_within);
    }
}
