use std::collections::BTreeMap;

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

const EPOCHS: usize = 200;
const NEGATIVE_SAMPLES: usize = 5;
const SPREAD: f64 = 1.0;
const GRAD_CLIP: f64 = 4.0;

/// Uniform manifold approximation: fuzzy kNN graph plus stochastic layout
/// with negative sampling, initialized at random.
pub struct Umap;

impl Reducer for Umap {
    fn name(&self) -> &'static str {
        "umap"
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
        out.insert("min_dist".into(), json!(params.min_dist));
        out.insert("metric".into(), json!(input.metric_label(params.metric)));

        if neighbors == 0 {
            return Ok(Reduction {
                points: DMatrix::zeros(n, k),
                params: out,
            });
        }
        let distances = input.pairwise(params.metric);
        let graph = fuzzy_graph(&distances, neighbors);
        let (a, b) = fit_curve(params.min_dist);
        let points = layout(n, k, &graph, a, b, params.random_state);
        Ok(Reduction {
            points,
            params: out,
        })
    }
}

/// Edge weights of the symmetrized fuzzy simplicial set, `(i, j)` with
/// `i < j`.
fn fuzzy_graph(distances: &DMatrix<f64>, k: usize) -> BTreeMap<(usize, usize), f64> {
    let knn = nearest_neighbors(distances, k);
    let target = (k as f64).log2().max(f64::MIN_POSITIVE);
    let mut directed: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for (i, row) in knn.iter().enumerate() {
        let dists = row.iter().map(|&j| distances[(i, j)]).collect::<Vec<_>>();
        let rho = dists.iter().copied().find(|d| *d > 0.0).unwrap_or(0.0);
        let sigma = calibrate_sigma(&dists, rho, target);
        for (&j, &d) in row.iter().zip(&dists) {
            let w = (-((d - rho).max(0.0)) / sigma).exp();
            directed.insert((i, j), w);
        }
    }
    let mut graph = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        let combined = w + back - w * back;
        let key = (i.min(j), i.max(j));
        graph.insert(key, combined);
    }
    graph
}

fn calibrate_sigma(dists: &[f64], rho: f64, target: f64) -> f64 {
    let (mut lo, mut hi, mut sigma) = (0.0, f64::INFINITY, 1.0);
    for _ in 0..64 {
        let sum: f64 = dists
            .iter()
            .map(|d| (-((d - rho).max(0.0)) / sigma).exp())
            .sum();
        if (sum - target).abs() < 1e-5 {
            break;
        }
        if sum > target {
            hi = sigma;
            sigma = (lo + hi) / 2.0;
        } else {
            lo = sigma;
            sigma = if hi.is_finite() { (lo + hi) / 2.0 } else { sigma * 2.0 };
        }
    }
    sigma.max(1e-3)
}

/// Fits `1 / (1 + a x^(2b))` to the offset exponential implied by
/// `min_dist` with a coarse-then-fine grid search.
fn fit_curve(min_dist: f64) -> (f64, f64) {
    let xs = (1..=300).map(|i| i as f64 * 0.01).collect::<Vec<_>>();
    let target = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / SPREAD).exp()
            }
        })
        .collect::<Vec<_>>();
    let cost = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&target)
            .map(|(&x, &t)| {
                let y = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (y - t) * (y - t)
            })
            .sum()
    };
    let mut best = (1.0, 1.0, f64::INFINITY);
    let search = |a_range: (f64, f64), b_range: (f64, f64), best: &mut (f64, f64, f64)| {
        const STEPS: usize = 40;
        for ia in 0..=STEPS {
            let a = a_range.0 + (a_range.1 - a_range.0) * ia as f64 / STEPS as f64;
            for ib in 0..=STEPS {
                let b = b_range.0 + (b_range.1 - b_range.0) * ib as f64 / STEPS as f64;
                let c = cost(a, b);
                if c < best.2 {
                    *best = (a, b, c);
                }
            }
        }
    };
    search((0.05, 5.0), (0.3, 2.0), &mut best);
    let (a, b) = (best.0, best.1);
    search(
        ((a - 0.15).max(0.01), a + 0.15),
        ((b - 0.05).max(0.05), b + 0.05),
        &mut best,
    );
    (best.0, best.1)
}

fn layout(
    n: usize,
    k: usize,
    graph: &BTreeMap<(usize, usize), f64>,
    a: f64,
    b: f64,
    seed: u64,
) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut y = DMatrix::from_fn(n, k, |_, _| rng.gen_range(-10.0..10.0));
    let max_weight = graph.values().copied().fold(0.0, f64::max);
    if max_weight <= 0.0 {
        return y;
    }
    let edges = graph
        .iter()
        .map(|(&(i, j), &w)| (i, j, max_weight / w.max(1e-12)))
        .collect::<Vec<_>>();
    let mut next_sample = edges.iter().map(|e| e.2).collect::<Vec<_>>();

    for epoch in 0..EPOCHS {
        let alpha = 1.0 - epoch as f64 / EPOCHS as f64;
        for (edge, &(i, j, period)) in edges.iter().enumerate() {
            if next_sample[edge] > (epoch + 1) as f64 {
                continue;
            }
            next_sample[edge] += period;

            let d2 = squared(&y, i, j);
            if d2 > 0.0 {
                let coeff = -2.0 * a * b * d2.powf(b - 1.0) / (1.0 + a * d2.powf(b));
                move_pair(&mut y, i, j, coeff, alpha, true);
            }
            for _ in 0..NEGATIVE_SAMPLES {
                let other = rng.gen_range(0..n);
                if other == i {
                    continue;
                }
                let d2 = squared(&y, i, other);
                let coeff = if d2 > 0.0 {
                    2.0 * b / ((0.001 + d2) * (1.0 + a * d2.powf(b)))
                } else {
                    0.0
                };
                if coeff > 0.0 {
                    move_pair(&mut y, i, other, coeff, alpha, false);
                } else {
                    for c in 0..k {
                        y[(i, c)] += GRAD_CLIP * alpha;
                    }
                }
            }
        }
    }
    y
}

fn move_pair(y: &mut DMatrix<f64>, i: usize, j: usize, coeff: f64, alpha: f64, both: bool) {
    for c in 0..y.ncols() {
        let grad = (coeff * (y[(i, c)] - y[(j, c)])).clamp(-GRAD_CLIP, GRAD_CLIP);
        y[(i, c)] += grad * alpha;
        if both {
            y[(j, c)] -= grad * alpha;
        }
    }
}
