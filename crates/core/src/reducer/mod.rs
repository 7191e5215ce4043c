//! Dimensionality-reduction adapters.
//!
//! Every method implements [`Reducer`] and is looked up by name in a
//! [`ReducerRegistry`]. The bundled implementations are compact reference
//! versions of the usual algorithms; callers should rely on the shape of
//! their output (one finite tuple per identifier, in input order), not on
//! exact coordinates.

mod distance;
mod mds;
mod pacmap;
mod pca;
mod tsne;
mod umap;

use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use nalgebra::DMatrix;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::document::{Coordinates, Dimensions, Projection, ProjectionInfo};
use crate::error::{ProtspaceError, Result};

pub use distance::Metric;
pub use mds::Mds;
pub use pacmap::PaCMap;
pub use pca::Pca;
pub use tsne::TSne;
pub use umap::Umap;

static METHOD_SPEC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z][a-z_]*?)(\d+)$").expect("valid regex"));

/// What a reducer is fed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Embeddings,
    Matrix,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Embeddings => f.write_str("embedding"),
            InputKind::Matrix => f.write_str("dissimilarity matrix"),
        }
    }
}

/// How a precomputed square matrix should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatrixKind {
    #[default]
    Similarity,
    Distance,
}

impl FromStr for MatrixKind {
    type Err = ProtspaceError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "similarity" => Ok(MatrixKind::Similarity),
            "distance" | "dissimilarity" => Ok(MatrixKind::Distance),
            other => Err(ProtspaceError::schema(format!(
                "unknown matrix kind '{other}' (expected similarity or distance)"
            ))),
        }
    }
}

/// Aligned numeric input, one row per identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum ReducerInput {
    Embeddings(DMatrix<f64>),
    /// Symmetric, zero diagonal, non-negative.
    Dissimilarities(DMatrix<f64>),
}

impl ReducerInput {
    pub fn kind(&self) -> InputKind {
        match self {
            ReducerInput::Embeddings(_) => InputKind::Embeddings,
            ReducerInput::Dissimilarities(_) => InputKind::Matrix,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ReducerInput::Embeddings(data) | ReducerInput::Dissimilarities(data) => data.nrows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Full pairwise distance matrix; embeddings use `metric`.
    pub(crate) fn pairwise(&self, metric: Metric) -> DMatrix<f64> {
        match self {
            ReducerInput::Embeddings(data) => distance::pairwise(data, metric),
            ReducerInput::Dissimilarities(matrix) => matrix.clone(),
        }
    }

    fn metric_label(&self, metric: Metric) -> &'static str {
        match self {
            ReducerInput::Embeddings(_) => metric.as_str(),
            ReducerInput::Dissimilarities(_) => "precomputed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducerParams {
    pub n_neighbors: usize,
    pub metric: Metric,
    pub random_state: u64,
    pub min_dist: f64,
    pub perplexity: f64,
    pub learning_rate: f64,
    pub mn_ratio: f64,
    pub fp_ratio: f64,
    pub n_init: usize,
    pub max_iter: usize,
    pub eps: f64,
}

impl Default for ReducerParams {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            metric: Metric::Euclidean,
            random_state: 42,
            min_dist: 0.1,
            perplexity: 30.0,
            learning_rate: 200.0,
            mn_ratio: 0.5,
            fp_ratio: 2.0,
            n_init: 4,
            max_iter: 300,
            eps: 1e-3,
        }
    }
}

impl ReducerParams {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("perplexity", self.perplexity),
            ("learning_rate", self.learning_rate),
            ("eps", self.eps),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ProtspaceError::schema(format!(
                    "reducer parameter {name} must be positive, got {value}"
                )));
            }
        }
        let non_negative = [
            ("min_dist", self.min_dist),
            ("mn_ratio", self.mn_ratio),
            ("fp_ratio", self.fp_ratio),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ProtspaceError::schema(format!(
                    "reducer parameter {name} must not be negative, got {value}"
                )));
            }
        }
        if self.n_neighbors == 0 || self.n_init == 0 || self.max_iter == 0 {
            return Err(ProtspaceError::schema(
                "n_neighbors, n_init and max_iter must be at least 1",
            ));
        }
        Ok(())
    }
}

/// `<method><dims>`, e.g. `pca2` or `umap3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    pub method: String,
    pub dimensions: Dimensions,
}

impl MethodSpec {
    pub fn new(method: impl Into<String>, dimensions: Dimensions) -> Self {
        Self {
            method: method.into(),
            dimensions,
        }
    }

    pub fn projection_name(&self) -> String {
        format!("{}{}", self.method, self.dimensions)
    }

    /// Comma- or whitespace-separated list of specs.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        let specs = raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Self>>>()?;
        if specs.is_empty() {
            return Err(ProtspaceError::schema("no reduction methods requested"));
        }
        Self::check_unique(&specs)?;
        Ok(specs)
    }

    /// Each projection name may be requested once per run.
    pub fn check_unique(specs: &[Self]) -> Result<()> {
        let mut seen = HashSet::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(spec) {
                return Err(ProtspaceError::DuplicateProjection(spec.projection_name()));
            }
        }
        Ok(())
    }
}

impl FromStr for MethodSpec {
    type Err = ProtspaceError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        let captures = METHOD_SPEC_RE.captures(&normalized).ok_or_else(|| {
            ProtspaceError::schema(format!(
                "invalid method spec '{raw}' (expected <method><dims>, e.g. pca2)"
            ))
        })?;
        let dims = captures[2]
            .parse::<u32>()
            .map_err(|_| ProtspaceError::Dimensionality(captures[2].to_string()))?;
        Ok(Self {
            method: captures[1].to_string(),
            dimensions: Dimensions::try_from(dims)?,
        })
    }
}

impl fmt::Display for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.projection_name())
    }
}

/// Output of one reducer run: `n x dims` coordinates and the parameters that
/// actually applied.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub points: DMatrix<f64>,
    pub params: Map<String, Value>,
}

pub trait Reducer: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, input: InputKind) -> bool;

    fn reduce(
        &self,
        input: &ReducerInput,
        dims: Dimensions,
        params: &ReducerParams,
    ) -> Result<Reduction>;
}

pub struct ReducerRegistry {
    reducers: IndexMap<&'static str, Box<dyn Reducer>>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ReducerRegistry {
    pub fn empty() -> Self {
        Self {
            reducers: IndexMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(Pca));
        registry.register(Box::new(TSne));
        registry.register(Box::new(Umap));
        registry.register(Box::new(PaCMap));
        registry.register(Box::new(Mds));
        registry
    }

    pub fn register(&mut self, reducer: Box<dyn Reducer>) {
        self.reducers.insert(reducer.name(), reducer);
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.reducers.keys().copied()
    }

    pub fn get(&self, method: &str) -> Result<&dyn Reducer> {
        self.reducers
            .get(method)
            .map(|reducer| reducer.as_ref())
            .ok_or_else(|| ProtspaceError::UnknownMethod(method.to_string()))
    }

    /// Looks up the reducer for `spec` and checks it can consume `input`.
    pub fn check(&self, spec: &MethodSpec, input: InputKind) -> Result<&dyn Reducer> {
        let reducer = self.get(&spec.method)?;
        if !reducer.accepts(input) {
            return Err(ProtspaceError::MethodUnsupported {
                method: spec.method.clone(),
                input,
            });
        }
        Ok(reducer)
    }

    pub fn project(
        &self,
        spec: &MethodSpec,
        input: &ReducerInput,
        params: &ReducerParams,
    ) -> Result<Projection> {
        let reducer = self.check(spec, input.kind())?;
        if input.is_empty() {
            return Err(ProtspaceError::reducer(&spec.method, "input has no rows"));
        }
        let started = std::time::Instant::now();
        let Reduction { points, params } = reducer.reduce(input, spec.dimensions, params)?;
        let dims = spec.dimensions.count();
        if points.nrows() != input.len() || points.ncols() != dims {
            return Err(ProtspaceError::reducer(
                &spec.method,
                format!(
                    "produced a {}x{} result for {} rows at {dims} dimensions",
                    points.nrows(),
                    points.ncols(),
                    input.len()
                ),
            ));
        }
        let mut coordinates = Vec::with_capacity(points.nrows());
        for row in points.row_iter() {
            let values = row.iter().copied().collect::<Vec<_>>();
            let coords = Coordinates::from_slice(&values)
                .filter(Coordinates::is_finite)
                .ok_or_else(|| {
                    ProtspaceError::reducer(&spec.method, "produced non-finite coordinates")
                })?;
            coordinates.push(coords);
        }
        info!(
            projection = %spec,
            rows = input.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reduction finished"
        );
        Ok(Projection {
            name: spec.projection_name(),
            dimensions: spec.dimensions,
            info: ProjectionInfo::new(spec.method.clone(), params),
            coordinates,
        })
    }

    /// Runs every spec on worker threads. All specs are checked before any
    /// work starts; results come back in request order.
    pub fn project_all(
        &self,
        specs: &[MethodSpec],
        input: &ReducerInput,
        params: &ReducerParams,
    ) -> Result<Vec<Projection>> {
        params.validate()?;
        for spec in specs {
            self.check(spec, input.kind())?;
        }
        specs
            .par_iter()
            .map(|spec| self.project(spec, input, params))
            .collect()
    }
}

fn base_params(dims: Dimensions) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("n_components".into(), json!(dims.count()));
    params
}

/// Clamps a count parameter to what `n` rows allow, logging the change.
fn clamp_count(method: &str, name: &str, requested: usize, max: usize) -> usize {
    let effective = requested.min(max);
    if effective != requested {
        debug!(method, parameter = name, requested, effective, "clamped for small input");
    }
    effective
}

fn clamp_float(method: &str, name: &str, requested: f64, max: f64) -> f64 {
    if requested > max {
        debug!(method, parameter = name, requested, effective = max, "clamped for small input");
        max
    } else {
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight clusters far apart.
    pub(crate) fn clusters() -> DMatrix<f64> {
        let mut rows = Vec::new();
        for i in 0..6 {
            let jitter = i as f64 * 0.01;
            rows.extend_from_slice(&[jitter, 0.1 + jitter, -jitter, 0.05]);
        }
        for i in 0..6 {
            let jitter = i as f64 * 0.01;
            rows.extend_from_slice(&[10.0 + jitter, 9.9 - jitter, 10.0, 10.05 + jitter]);
        }
        DMatrix::from_row_slice(12, 4, &rows)
    }

    #[test]
    fn parses_method_specs() {
        let spec: MethodSpec = "UMAP3".parse().unwrap();
        assert_eq!(spec, MethodSpec::new("umap", Dimensions::Three));
        assert_eq!(spec.projection_name(), "umap3");
        assert!(matches!(
            "pca4".parse::<MethodSpec>(),
            Err(ProtspaceError::Dimensionality(ref d)) if d == "4"
        ));
        assert!(matches!(
            "pca99999999999".parse::<MethodSpec>(),
            Err(ProtspaceError::Dimensionality(ref d)) if d == "99999999999"
        ));
        assert!(matches!(
            "pca".parse::<MethodSpec>(),
            Err(ProtspaceError::Schema(_))
        ));
        let list = MethodSpec::parse_list("pca2, tsne3 mds2").unwrap();
        assert_eq!(list.len(), 3);
        assert!(matches!(
            MethodSpec::parse_list("pca2,umap3,PCA2"),
            Err(ProtspaceError::DuplicateProjection(ref name)) if name == "pca2"
        ));
    }

    #[test]
    fn unknown_and_unsupported_methods() {
        let registry = ReducerRegistry::with_defaults();
        let input = ReducerInput::Embeddings(clusters());
        let params = ReducerParams::default();
        let err = registry
            .project(&"isomap2".parse().unwrap(), &input, &params)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::UnknownMethod(m) if m == "isomap"));
        let err = registry
            .project(&"mds2".parse().unwrap(), &input, &params)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtspaceError::MethodUnsupported {
                input: InputKind::Embeddings,
                ..
            }
        ));
        let matrix = ReducerInput::Dissimilarities(input.pairwise(Metric::Euclidean));
        let err = registry
            .project(&"pca2".parse().unwrap(), &matrix, &params)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtspaceError::MethodUnsupported {
                input: InputKind::Matrix,
                ..
            }
        ));
    }

    #[test]
    fn empty_input_is_a_reducer_error() {
        let registry = ReducerRegistry::with_defaults();
        let input = ReducerInput::Embeddings(DMatrix::zeros(0, 4));
        let err = registry
            .project(&"pca2".parse().unwrap(), &input, &ReducerParams::default())
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::Reducer { .. }));
    }

    #[test]
    fn every_embedding_method_covers_every_row() {
        let registry = ReducerRegistry::with_defaults();
        let input = ReducerInput::Embeddings(clusters());
        let specs = MethodSpec::parse_list("pca2,tsne3,umap2,pacmap2").unwrap();
        let projections = registry
            .project_all(&specs, &input, &ReducerParams::default())
            .unwrap();
        let names = projections
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["pca2", "tsne3", "umap2", "pacmap2"]);
        for projection in &projections {
            assert_eq!(projection.coordinates.len(), 12);
            assert!(projection
                .coordinates
                .iter()
                .all(|c| c.dimensions() == projection.dimensions && c.is_finite()));
        }
    }

    #[test]
    fn project_all_checks_before_running() {
        let registry = ReducerRegistry::with_defaults();
        let input = ReducerInput::Embeddings(clusters());
        let specs = MethodSpec::parse_list("pca2,mds2").unwrap();
        let err = registry
            .project_all(&specs, &input, &ReducerParams::default())
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::MethodUnsupported { .. }));
    }

    #[test]
    fn invalid_params_are_schema_errors() {
        let params = ReducerParams {
            perplexity: -1.0,
            ..ReducerParams::default()
        };
        assert!(matches!(params.validate(), Err(ProtspaceError::Schema(_))));
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: ReducerParams = toml::from_str("n_neighbors = 5\nmetric = \"cosine\"").unwrap();
        assert_eq!(params.n_neighbors, 5);
        assert_eq!(params.metric, Metric::Cosine);
        assert_eq!(params.random_state, 42);
    }
}
