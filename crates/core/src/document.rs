use std::collections::{BTreeSet, HashSet};
use std::convert::TryFrom;
use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProtspaceError, Result};
use crate::natural::natural_cmp;
use crate::shape::MarkerShape;
use crate::style::StyleState;

/// Style-map key of the missing sentinel in the persisted artifact.
pub const MISSING_KEY: &str = "<NaN>";

/// One cell of a feature column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum FeatureValue {
    Missing,
    Value(String),
}

impl FeatureValue {
    pub fn value(raw: impl Into<String>) -> Self {
        FeatureValue::Value(raw.into())
    }

    /// Empty (or whitespace-only) table cells are missing; everything else,
    /// including the literal `NaN`, is a value.
    pub fn from_cell(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            FeatureValue::Missing
        } else {
            FeatureValue::Value(trimmed.to_string())
        }
    }

    /// Inverse of [`FeatureValue::style_key`].
    pub fn from_style_key(key: &str) -> Self {
        if key == MISSING_KEY {
            FeatureValue::Missing
        } else {
            FeatureValue::Value(key.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, FeatureValue::Missing)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Missing => None,
            FeatureValue::Value(value) => Some(value.as_str()),
        }
    }

    pub fn style_key(&self) -> &str {
        match self {
            FeatureValue::Missing => MISSING_KEY,
            FeatureValue::Value(value) => value.as_str(),
        }
    }

    /// Legend order: natural key over values, missing sentinel last.
    pub fn legend_cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (FeatureValue::Missing, FeatureValue::Missing) => Ordering::Equal,
            (FeatureValue::Missing, _) => Ordering::Greater,
            (_, FeatureValue::Missing) => Ordering::Less,
            (FeatureValue::Value(a), FeatureValue::Value(b)) => natural_cmp(a, b),
        }
    }
}

impl From<Option<String>> for FeatureValue {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(value) => FeatureValue::Value(value),
            None => FeatureValue::Missing,
        }
    }
}

impl From<FeatureValue> for Option<String> {
    fn from(value: FeatureValue) -> Self {
        match value {
            FeatureValue::Missing => None,
            FeatureValue::Value(value) => Some(value),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Missing => write!(f, "{MISSING_KEY}"),
            FeatureValue::Value(value) => write!(f, "'{value}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Dimensions {
    Two,
    Three,
}

impl Dimensions {
    pub fn count(self) -> usize {
        match self {
            Dimensions::Two => 2,
            Dimensions::Three => 3,
        }
    }
}

impl TryFrom<u32> for Dimensions {
    type Error = ProtspaceError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            2 => Ok(Dimensions::Two),
            3 => Ok(Dimensions::Three),
            other => Err(ProtspaceError::Dimensionality(other.to_string())),
        }
    }
}

impl From<Dimensions> for u32 {
    fn from(value: Dimensions) -> Self {
        value.count() as u32
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.count())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinates {
    Planar([f64; 2]),
    Spatial([f64; 3]),
}

impl Coordinates {
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [x, y] => Some(Coordinates::Planar([*x, *y])),
            [x, y, z] => Some(Coordinates::Spatial([*x, *y, *z])),
            _ => None,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        match self {
            Coordinates::Planar(_) => Dimensions::Two,
            Coordinates::Spatial(_) => Dimensions::Three,
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Coordinates::Planar(values) => values,
            Coordinates::Spatial(values) => values,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }
}

/// Opaque projection metadata. Keys besides `method` and `params` are kept
/// verbatim so artifacts written by other tools survive a rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionInfo {
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectionInfo {
    pub fn new(method: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }
}

/// Coordinates are stored in the owning document's identifier order.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub name: String,
    pub dimensions: Dimensions,
    pub info: ProjectionInfo,
    pub coordinates: Vec<Coordinates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegendEntry<'a> {
    pub value: &'a FeatureValue,
    pub color: Option<&'a str>,
    pub shape: Option<MarkerShape>,
}

/// Root aggregate of the artifact.
///
/// Feature columns and projection coordinates are vectors aligned with
/// `identifiers`, so coverage of the entity set holds by construction once
/// the lengths check out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    identifiers: IndexSet<String>,
    features: IndexMap<String, Vec<FeatureValue>>,
    projections: Vec<Projection>,
    styles: StyleState,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assembles a document and checks every structural invariant.
    pub fn from_parts(
        identifiers: IndexSet<String>,
        features: IndexMap<String, Vec<FeatureValue>>,
        projections: Vec<Projection>,
        styles: StyleState,
    ) -> Result<Self> {
        let document = Self {
            identifiers,
            features,
            projections,
            styles,
        };
        document.validate()?;
        Ok(document)
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.identifiers.len();
        for (name, values) in &self.features {
            if values.len() != expected {
                return Err(ProtspaceError::corrupt(format!(
                    "feature '{name}' has {} values for {expected} identifiers",
                    values.len()
                )));
            }
            if values
                .iter()
                .any(|v| v.as_str().map(|s| s == MISSING_KEY).unwrap_or(false))
            {
                return Err(ProtspaceError::corrupt(format!(
                    "feature '{name}' uses the reserved value '{MISSING_KEY}'"
                )));
            }
        }
        let mut names = HashSet::new();
        for projection in &self.projections {
            if !names.insert(projection.name.as_str()) {
                return Err(ProtspaceError::corrupt(format!(
                    "projection '{}' appears more than once",
                    projection.name
                )));
            }
            if projection.coordinates.len() != expected {
                return Err(ProtspaceError::corrupt(format!(
                    "projection '{}' has {} coordinates for {expected} identifiers",
                    projection.name,
                    projection.coordinates.len()
                )));
            }
            for (idx, coords) in projection.coordinates.iter().enumerate() {
                if coords.dimensions() != projection.dimensions || !coords.is_finite() {
                    let id = self.identifiers.get_index(idx).map(String::as_str);
                    return Err(ProtspaceError::corrupt(format!(
                        "projection '{}' has invalid coordinates for '{}'",
                        projection.name,
                        id.unwrap_or("?")
                    )));
                }
            }
        }
        self.styles.validate_against(self)
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    pub fn identifiers(&self) -> &IndexSet<String> {
        &self.identifiers
    }

    pub fn position(&self, identifier: &str) -> Option<usize> {
        self.identifiers.get_index_of(identifier)
    }

    pub fn feature_names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn features(&self) -> &IndexMap<String, Vec<FeatureValue>> {
        &self.features
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    pub fn feature(&self, name: &str) -> Result<&[FeatureValue]> {
        self.features
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| ProtspaceError::UnknownFeature(name.to_string()))
    }

    pub fn value(&self, identifier: &str, feature: &str) -> Option<&FeatureValue> {
        let idx = self.position(identifier)?;
        self.features.get(feature).and_then(|values| values.get(idx))
    }

    /// Distinct values of a feature in order of first occurrence.
    pub fn distinct_values(&self, feature: &str) -> Result<Vec<&FeatureValue>> {
        let values = self.feature(feature)?;
        let mut seen = IndexSet::new();
        for value in values {
            seen.insert(value);
        }
        Ok(seen.into_iter().collect())
    }

    pub fn contains_value(&self, feature: &str, value: &FeatureValue) -> Result<bool> {
        Ok(self.feature(feature)?.iter().any(|v| v == value))
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn projection(&self, name: &str) -> Option<&Projection> {
        self.projections.iter().find(|p| p.name == name)
    }

    pub fn projection_names(&self) -> impl Iterator<Item = &str> {
        self.projections.iter().map(|p| p.name.as_str())
    }

    pub fn dimensionalities(&self) -> BTreeSet<Dimensions> {
        self.projections.iter().map(|p| p.dimensions).collect()
    }

    pub fn styles(&self) -> &StyleState {
        &self.styles
    }

    /// Legend of a feature: distinct values in natural-key order (missing
    /// last) with whatever style is currently stored for them.
    pub fn legend(&self, feature: &str) -> Result<Vec<LegendEntry<'_>>> {
        let mut values = self.distinct_values(feature)?;
        values.sort_by(|a, b| a.legend_cmp(b));
        Ok(values
            .into_iter()
            .map(|value| LegendEntry {
                value,
                color: self.styles.color(feature, value),
                shape: self.styles.shape(feature, value),
            })
            .collect())
    }

    pub(crate) fn styles_mut(&mut self) -> &mut StyleState {
        &mut self.styles
    }

    pub(crate) fn adopt_identifiers(&mut self, identifiers: IndexSet<String>) {
        debug_assert!(self.identifiers.is_empty());
        self.identifiers = identifiers;
    }

    pub(crate) fn insert_feature(&mut self, name: String, values: Vec<FeatureValue>) {
        debug_assert_eq!(values.len(), self.identifiers.len());
        self.features.insert(name, values);
    }

    /// Appends, or replaces in place when a projection of the same name exists.
    /// Returns true when an existing projection was replaced.
    pub(crate) fn upsert_projection(&mut self, projection: Projection) -> bool {
        debug_assert_eq!(projection.coordinates.len(), self.identifiers.len());
        match self
            .projections
            .iter_mut()
            .find(|p| p.name == projection.name)
        {
            Some(slot) => {
                *slot = projection;
                true
            }
            None => {
                self.projections.push(projection);
                false
            }
        }
    }
}
