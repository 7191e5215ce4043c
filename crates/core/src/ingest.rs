//! Loading and strict alignment of embeddings, similarity matrices and
//! feature tables.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use flate2::read::MultiGzDecoder;
use indexmap::{IndexMap, IndexSet};
use nalgebra::DMatrix;
use tracing::{info, warn};

use crate::document::{FeatureValue, MISSING_KEY};
use crate::error::{IdentifierDiff, ProtspaceError, Result};
use crate::reducer::{InputKind, MatrixKind, ReducerInput};
use crate::serializer::Entries;

pub const IDENTIFIER_COLUMN: &str = "identifier";

const SYMMETRY_RTOL: f64 = 1e-5;
const SYMMETRY_ATOL: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Embeddings(PathBuf),
    Matrix { path: PathBuf, kind: MatrixKind },
}

impl InputSource {
    pub fn path(&self) -> &Path {
        match self {
            InputSource::Embeddings(path) => path,
            InputSource::Matrix { path, .. } => path,
        }
    }

    pub fn input_kind(&self) -> InputKind {
        match self {
            InputSource::Embeddings(_) => InputKind::Embeddings,
            InputSource::Matrix { .. } => InputKind::Matrix,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingTable {
    pub identifiers: IndexSet<String>,
    pub vectors: DMatrix<f64>,
}

/// A square matrix already converted to dissimilarities.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixTable {
    pub identifiers: IndexSet<String>,
    pub dissimilarities: DMatrix<f64>,
    pub symmetrized: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureTable {
    pub names: Vec<String>,
    pub rows: IndexMap<String, Vec<FeatureValue>>,
}

/// Identifiers, numeric input and feature columns, all in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedInput {
    pub identifiers: IndexSet<String>,
    pub input: ReducerInput,
    pub features: IndexMap<String, Vec<FeatureValue>>,
}

pub fn load_aligned(source: &InputSource, features: Option<&Path>) -> Result<AlignedInput> {
    let (identifiers, input) = match source {
        InputSource::Embeddings(path) => {
            let table = load_embeddings(path)?;
            info!(
                path = %path.display(),
                entities = table.identifiers.len(),
                components = table.vectors.ncols(),
                "loaded embeddings"
            );
            (table.identifiers, ReducerInput::Embeddings(table.vectors))
        }
        InputSource::Matrix { path, kind } => {
            let table = load_matrix(path, *kind)?;
            info!(
                path = %path.display(),
                entities = table.identifiers.len(),
                symmetrized = table.symmetrized,
                "loaded matrix"
            );
            (
                table.identifiers,
                ReducerInput::Dissimilarities(table.dissimilarities),
            )
        }
    };
    let table = match features {
        Some(path) => {
            let table = load_features(path)?;
            info!(
                path = %path.display(),
                rows = table.rows.len(),
                features = table.names.len(),
                "loaded feature table"
            );
            Some(table)
        }
        None => None,
    };
    align(identifiers, input, table)
}

/// Strict join: the feature table must describe exactly the identifiers of
/// the numeric source. Columns come back in source order.
pub fn align(
    identifiers: IndexSet<String>,
    input: ReducerInput,
    features: Option<FeatureTable>,
) -> Result<AlignedInput> {
    let Some(table) = features else {
        return Ok(AlignedInput {
            identifiers,
            input,
            features: IndexMap::new(),
        });
    };
    let diff = IdentifierDiff {
        missing: identifiers
            .iter()
            .filter(|id| !table.rows.contains_key(*id))
            .cloned()
            .collect(),
        unexpected: table
            .rows
            .keys()
            .filter(|id| !identifiers.contains(*id))
            .cloned()
            .collect(),
    };
    if !diff.is_empty() {
        return Err(ProtspaceError::Alignment {
            context: "feature table",
            diff,
        });
    }
    let mut columns = table
        .names
        .iter()
        .map(|name| (name.clone(), Vec::with_capacity(identifiers.len())))
        .collect::<IndexMap<_, _>>();
    for id in &identifiers {
        let row = &table.rows[id.as_str()];
        for (column, value) in columns.values_mut().zip(row) {
            column.push(value.clone());
        }
    }
    Ok(AlignedInput {
        identifiers,
        input,
        features: columns,
    })
}

/// The first row is a header when its first cell is `identifier` or empty
/// (an unnamed index column); component labels are never inspected, so
/// numeric labels such as `0,1,2` do not turn the header into an entity.
pub fn load_embeddings(path: &Path) -> Result<EmbeddingTable> {
    if file_name(path).ends_with(".json") {
        let raw = std::fs::read_to_string(path)?;
        let Entries(rows) = serde_json::from_str::<Entries<Vec<f64>>>(&raw)?;
        return build_embeddings(rows.into_iter());
    }
    let mut reader = delimited_reader(path, false)?;
    let mut rows = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let line = record.position().map_or(idx as u64 + 1, |pos| pos.line());
        let mut cells = record.iter();
        let Some(id) = cells.next() else { continue };
        if idx == 0 && is_header_cell(id) {
            continue;
        }
        let mut values = Vec::with_capacity(record.len().saturating_sub(1));
        for cell in cells {
            let value = cell.trim().parse::<f64>().map_err(|_| {
                ProtspaceError::schema(format!(
                    "line {line}: embedding for '{id}' has non-numeric component '{cell}'"
                ))
            })?;
            values.push(value);
        }
        rows.push((id.to_string(), values));
    }
    build_embeddings(rows.into_iter())
}

fn is_header_cell(cell: &str) -> bool {
    let cell = cell.trim();
    cell.is_empty() || cell.eq_ignore_ascii_case(IDENTIFIER_COLUMN)
}

fn build_embeddings(rows: impl Iterator<Item = (String, Vec<f64>)>) -> Result<EmbeddingTable> {
    let mut identifiers = IndexSet::new();
    let mut flat = Vec::new();
    let mut width = None;
    for (id, values) in rows {
        check_identifier(&id)?;
        if values.is_empty() {
            return Err(ProtspaceError::schema(format!(
                "embedding for '{id}' is empty"
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ProtspaceError::schema(format!(
                "embedding for '{id}' has a non-finite component"
            )));
        }
        match width {
            None => width = Some(values.len()),
            Some(expected) if expected != values.len() => {
                return Err(ProtspaceError::schema(format!(
                    "embedding for '{id}' has {} components, expected {expected}",
                    values.len()
                )))
            }
            Some(_) => {}
        }
        if !identifiers.insert(id.clone()) {
            return Err(duplicate("embeddings", &id));
        }
        flat.extend(values);
    }
    let width = width.unwrap_or(0);
    Ok(EmbeddingTable {
        vectors: DMatrix::from_row_slice(identifiers.len(), width, &flat),
        identifiers,
    })
}

pub fn load_matrix(path: &Path, kind: MatrixKind) -> Result<MatrixTable> {
    let mut reader = delimited_reader(path, true)?;
    let columns = reader
        .headers()?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut identifiers = IndexSet::new();
    let mut flat = Vec::with_capacity(columns.len() * columns.len());
    for record in reader.records() {
        let record = record?;
        let mut cells = record.iter();
        let id = cells.next().unwrap_or_default().to_string();
        check_identifier(&id)?;
        if record.len() != columns.len() + 1 {
            return Err(ProtspaceError::schema(format!(
                "matrix row '{id}' has {} entries for {} columns",
                record.len() - 1,
                columns.len()
            )));
        }
        for cell in cells {
            let value = cell.trim().parse::<f64>().map_err(|_| {
                ProtspaceError::schema(format!("matrix row '{id}' has non-numeric entry '{cell}'"))
            })?;
            if !value.is_finite() {
                return Err(ProtspaceError::schema(format!(
                    "matrix row '{id}' has a non-finite entry"
                )));
            }
            flat.push(value);
        }
        if !identifiers.insert(id.clone()) {
            return Err(duplicate("matrix", &id));
        }
    }
    let n = identifiers.len();
    if n == 0 {
        return Err(ProtspaceError::schema(format!(
            "matrix {} has no rows",
            path.display()
        )));
    }
    if columns.len() != n || flat.len() != n * n {
        return Err(ProtspaceError::schema(format!(
            "matrix must be square: {n} rows, {} columns",
            columns.len()
        )));
    }
    if let Some((row, column)) = identifiers
        .iter()
        .zip(&columns)
        .find(|(row, column)| row != column)
    {
        return Err(ProtspaceError::schema(format!(
            "matrix row and column labels differ: row '{row}' vs column '{column}'"
        )));
    }

    let mut values = DMatrix::from_row_slice(n, n, &flat);
    let symmetrized = !is_symmetric(&values);
    if symmetrized {
        warn!(path = %path.display(), "matrix is not symmetric, using (A + A^T) / 2");
        values = (&values + values.transpose()) / 2.0;
    }
    let mut dissimilarities = match kind {
        MatrixKind::Similarity => {
            let max = values.max();
            values.map(|s| max - s)
        }
        MatrixKind::Distance => {
            if let Some(negative) = values.iter().find(|v| **v < 0.0) {
                return Err(ProtspaceError::schema(format!(
                    "distance matrix has a negative entry ({negative})"
                )));
            }
            values
        }
    };
    dissimilarities.fill_diagonal(0.0);
    Ok(MatrixTable {
        identifiers,
        dissimilarities,
        symmetrized,
    })
}

fn is_symmetric(values: &DMatrix<f64>) -> bool {
    let n = values.nrows();
    (0..n).all(|i| {
        (0..n).all(|j| {
            let (a, b) = (values[(i, j)], values[(j, i)]);
            (a - b).abs() <= SYMMETRY_ATOL + SYMMETRY_RTOL * b.abs()
        })
    })
}

pub fn load_features(path: &Path) -> Result<FeatureTable> {
    let mut reader = delimited_reader(path, true)?;
    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect::<Vec<_>>();
    let id_column = headers
        .iter()
        .position(|h| h == IDENTIFIER_COLUMN)
        .ok_or_else(|| {
            ProtspaceError::schema(format!(
                "feature table {} has no '{IDENTIFIER_COLUMN}' column",
                path.display()
            ))
        })?;
    let mut seen = HashSet::new();
    for name in &headers {
        if name.is_empty() {
            return Err(ProtspaceError::schema("feature table has an unnamed column"));
        }
        if !seen.insert(name.as_str()) {
            return Err(ProtspaceError::schema(format!(
                "feature table repeats column '{name}'"
            )));
        }
    }
    let names = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != id_column)
        .map(|(_, name)| name.clone())
        .collect::<Vec<_>>();

    let mut rows = IndexMap::new();
    for record in reader.records() {
        let record = record?;
        let id = record.get(id_column).unwrap_or_default().to_string();
        check_identifier(&id)?;
        if record.len() != headers.len() {
            return Err(ProtspaceError::schema(format!(
                "feature row '{id}' has {} cells for {} columns",
                record.len(),
                headers.len()
            )));
        }
        let mut values = Vec::with_capacity(names.len());
        for (idx, cell) in record.iter().enumerate() {
            if idx == id_column {
                continue;
            }
            let value = FeatureValue::from_cell(cell);
            if value.as_str() == Some(MISSING_KEY) {
                return Err(ProtspaceError::schema(format!(
                    "feature '{}' of '{id}' uses the reserved value '{MISSING_KEY}'",
                    headers[idx]
                )));
            }
            values.push(value);
        }
        if rows.insert(id.clone(), values).is_some() {
            return Err(duplicate("feature table", &id));
        }
    }
    Ok(FeatureTable { names, rows })
}

fn check_identifier(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(ProtspaceError::schema("empty identifier"));
    }
    Ok(())
}

fn duplicate(source: &str, id: &str) -> ProtspaceError {
    ProtspaceError::schema(format!("{source} list identifier '{id}' more than once"))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_lowercase()
}

/// Comma-separated unless the name says `.tsv`; gzip when it ends in `.gz`.
fn delimited_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<Box<dyn Read>>> {
    let name = file_name(path);
    let file = File::open(path)?;
    let (source, plain): (Box<dyn Read>, &str) = match name.strip_suffix(".gz") {
        Some(plain) => (Box::new(MultiGzDecoder::new(file)), plain),
        None => (Box::new(file), name.as_str()),
    };
    let delimiter = if plain.ends_with(".tsv") || plain.ends_with(".tab") {
        b'\t'
    } else {
        b','
    };
    Ok(ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(source))
}
