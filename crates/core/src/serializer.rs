use std::borrow::Cow;
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fmt;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::document::{
    Coordinates, Dimensions, Document, FeatureValue, Projection, ProjectionInfo,
};
use crate::error::{ProtspaceError, Result};
use crate::shape::MarkerShape;
use crate::style::StyleState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireDocument {
    #[serde(deserialize_with = "unique_keys")]
    protein_data: IndexMap<String, WireProtein>,
    #[serde(default)]
    projections: Vec<WireProjection>,
    #[serde(default)]
    visualization_state: WireStyles,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireProtein {
    #[serde(default, deserialize_with = "unique_keys")]
    features: IndexMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireProjection {
    name: String,
    dimensions: u32,
    #[serde(default)]
    info: Map<String, Value>,
    data: Vec<WirePoint>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WirePoint {
    identifier: String,
    coordinates: WireCoordinates,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireCoordinates {
    Array(Vec<f64>),
    Named(NamedCoordinates),
}

/// `{"x": .., "y": .., "z": ..}` as written by older versions of the tool.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamedCoordinates {
    x: f64,
    y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    z: Option<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireStyles {
    #[serde(default)]
    feature_colors: IndexMap<String, IndexMap<String, String>>,
    #[serde(default)]
    marker_shapes: IndexMap<String, IndexMap<String, String>>,
}

/// JSON object entries in file order. Repeated keys are kept so the caller
/// can reject them instead of silently keeping the last one.
#[derive(Debug)]
pub(crate) struct Entries<V>(pub Vec<(String, V)>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Entries<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = Entries<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object keyed by identifier")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, V>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn unique_keys<'de, D, V>(deserializer: D) -> std::result::Result<IndexMap<String, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    let Entries(entries) = Entries::deserialize(deserializer)?;
    let mut map = IndexMap::with_capacity(entries.len());
    for (key, value) in entries {
        if map.contains_key(&key) {
            return Err(de::Error::custom(format_args!("duplicate key '{key}'")));
        }
        map.insert(key, value);
    }
    Ok(map)
}

#[derive(Debug, Clone)]
pub struct SerializerConfig {
    pub pretty: bool,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self { pretty: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactSerializer {
    config: SerializerConfig,
}

impl ArtifactSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SerializerConfig) -> Self {
        Self { config }
    }

    pub fn to_string(&self, document: &Document) -> Result<String> {
        document.validate()?;
        let wire = to_wire(document)?;
        let mut out = if self.config.pretty {
            serde_json::to_string_pretty(&wire)?
        } else {
            serde_json::to_string(&wire)?
        };
        out.push('\n');
        Ok(out)
    }

    /// Serializes next to `path` and renames over it, so readers only ever
    /// see a complete artifact.
    pub fn write_atomic(&self, document: &Document, path: &Path) -> Result<()> {
        let body = self.to_string(document)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| ProtspaceError::Io(err.error))?;
        debug!(path = %path.display(), bytes = body.len(), "wrote artifact");
        Ok(())
    }
}

pub fn read_artifact(path: &Path) -> Result<Document> {
    let raw = fs::read_to_string(path)?;
    parse_artifact(&raw)
}

pub fn parse_artifact(raw: &str) -> Result<Document> {
    let raw = null_bare_nan(raw);
    let wire: WireDocument =
        serde_json::from_str(&raw).map_err(|err| ProtspaceError::corrupt(err.to_string()))?;
    from_wire(wire)
}

/// Artifacts written through pandas carry missing metadata as a bare `NaN`
/// token, which is not JSON. Those tokens read as `null`; the quoted string
/// `"NaN"` is an ordinary value and stays as it is.
fn null_bare_nan(raw: &str) -> Cow<'_, str> {
    if !raw.contains("NaN") {
        return Cow::Borrowed(raw);
    }
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut copied = 0;
    let mut replaced = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let byte = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
        } else if byte == b'"' {
            in_string = true;
        } else if bytes[i..].starts_with(b"NaN") {
            out.push_str(&raw[copied..i]);
            out.push_str("null");
            i += 3;
            copied = i;
            replaced += 1;
            continue;
        }
        i += 1;
    }
    if replaced == 0 {
        return Cow::Borrowed(raw);
    }
    out.push_str(&raw[copied..]);
    debug!(tokens = replaced, "read bare NaN tokens as missing");
    Cow::Owned(out)
}

fn from_wire(wire: WireDocument) -> Result<Document> {
    let identifiers = wire.protein_data.keys().cloned().collect::<IndexSet<_>>();

    let feature_names: Vec<String> = wire
        .protein_data
        .values()
        .next()
        .map(|protein| protein.features.keys().cloned().collect())
        .unwrap_or_default();
    let expected = feature_names.iter().map(String::as_str).collect::<HashSet<_>>();
    for (id, protein) in &wire.protein_data {
        let names = protein.features.keys().map(String::as_str).collect::<HashSet<_>>();
        if names != expected {
            return Err(ProtspaceError::corrupt(format!(
                "'{id}' does not carry the document's feature set"
            )));
        }
    }
    let mut features = feature_names
        .into_iter()
        .map(|name| (name, Vec::with_capacity(identifiers.len())))
        .collect::<IndexMap<_, _>>();
    for (id, protein) in &wire.protein_data {
        for (name, column) in features.iter_mut() {
            let raw = protein.features.get(name).unwrap_or(&Value::Null);
            column.push(feature_value(id, name, raw)?);
        }
    }

    let mut projections = Vec::with_capacity(wire.projections.len());
    for projection in wire.projections {
        projections.push(projection_from_wire(projection, &identifiers)?);
    }

    let styles = styles_from_wire(wire.visualization_state)?;
    Document::from_parts(identifiers, features, projections, styles)
}

fn feature_value(id: &str, feature: &str, raw: &Value) -> Result<FeatureValue> {
    match raw {
        Value::Null => Ok(FeatureValue::Missing),
        Value::String(value) => Ok(FeatureValue::value(value.as_str())),
        Value::Number(number) => Ok(FeatureValue::value(number.to_string())),
        Value::Bool(flag) => Ok(FeatureValue::value(flag.to_string())),
        _ => Err(ProtspaceError::corrupt(format!(
            "feature '{feature}' of '{id}' is not a scalar"
        ))),
    }
}

fn projection_from_wire(wire: WireProjection, identifiers: &IndexSet<String>) -> Result<Projection> {
    let dimensions = Dimensions::try_from(wire.dimensions).map_err(|_| {
        ProtspaceError::corrupt(format!(
            "projection '{}' declares {} dimensions",
            wire.name, wire.dimensions
        ))
    })?;
    let mut slots: Vec<Option<Coordinates>> = vec![None; identifiers.len()];
    for point in wire.data {
        let idx = identifiers.get_index_of(&point.identifier).ok_or_else(|| {
            ProtspaceError::corrupt(format!(
                "projection '{}' places unknown identifier '{}'",
                wire.name, point.identifier
            ))
        })?;
        let values = match point.coordinates {
            WireCoordinates::Array(values) => values,
            WireCoordinates::Named(named) => {
                let mut values = vec![named.x, named.y];
                values.extend(named.z);
                values
            }
        };
        let coords = Coordinates::from_slice(&values)
            .filter(|c| c.dimensions() == dimensions)
            .ok_or_else(|| {
                ProtspaceError::corrupt(format!(
                    "projection '{}' has {} coordinates for '{}', expected {dimensions}",
                    wire.name,
                    values.len(),
                    point.identifier
                ))
            })?;
        if slots[idx].replace(coords).is_some() {
            return Err(ProtspaceError::corrupt(format!(
                "projection '{}' places '{}' twice",
                wire.name, point.identifier
            )));
        }
    }
    let mut coordinates = Vec::with_capacity(slots.len());
    for (idx, slot) in slots.into_iter().enumerate() {
        let coords = slot.ok_or_else(|| {
            ProtspaceError::corrupt(format!(
                "projection '{}' has no coordinates for '{}'",
                wire.name,
                identifiers.get_index(idx).map(String::as_str).unwrap_or("?")
            ))
        })?;
        coordinates.push(coords);
    }
    Ok(Projection {
        info: info_from_wire(&wire.name, wire.info)?,
        name: wire.name,
        dimensions,
        coordinates,
    })
}

/// Current artifacts carry `{"method", "params", ...}`; older ones put the
/// parameters directly into `info`, so the method comes from the name.
fn info_from_wire(name: &str, mut info: Map<String, Value>) -> Result<ProjectionInfo> {
    match info.remove("method") {
        Some(Value::String(method)) => {
            let params = match info.remove("params") {
                None => Map::new(),
                Some(Value::Object(params)) => params,
                Some(_) => {
                    return Err(ProtspaceError::corrupt(format!(
                        "projection '{name}' has non-object params"
                    )))
                }
            };
            Ok(ProjectionInfo {
                method,
                params,
                extra: info,
            })
        }
        Some(_) => Err(ProtspaceError::corrupt(format!(
            "projection '{name}' has a non-string method"
        ))),
        None => {
            let method = name
                .trim_end_matches(|c: char| c.is_ascii_digit())
                .to_lowercase();
            Ok(ProjectionInfo::new(method, info))
        }
    }
}

fn styles_from_wire(wire: WireStyles) -> Result<StyleState> {
    let colors = wire
        .feature_colors
        .into_iter()
        .map(|(feature, map)| {
            let map = map
                .into_iter()
                .map(|(key, color)| (FeatureValue::from_style_key(&key), color))
                .collect::<IndexMap<_, _>>();
            (feature, map)
        })
        .collect::<IndexMap<_, _>>();
    let mut shapes = IndexMap::new();
    for (feature, map) in wire.marker_shapes {
        let mut parsed = IndexMap::new();
        for (key, raw) in map {
            let shape = raw.parse::<MarkerShape>().map_err(|_| {
                ProtspaceError::corrupt(format!(
                    "unknown marker shape '{raw}' for {feature}.{key}"
                ))
            })?;
            parsed.insert(FeatureValue::from_style_key(&key), shape);
        }
        shapes.insert(feature, parsed);
    }
    Ok(StyleState::from_maps(colors, shapes))
}

fn to_wire(document: &Document) -> Result<WireDocument> {
    let mut protein_data = IndexMap::with_capacity(document.len());
    for (idx, id) in document.identifiers().iter().enumerate() {
        let features = document
            .features()
            .iter()
            .map(|(name, values)| {
                let value = match &values[idx] {
                    FeatureValue::Missing => Value::Null,
                    FeatureValue::Value(value) => Value::String(value.clone()),
                };
                (name.clone(), value)
            })
            .collect();
        protein_data.insert(id.clone(), WireProtein { features });
    }

    let mut projections = Vec::with_capacity(document.projections().len());
    for projection in document.projections() {
        let info = match serde_json::to_value(&projection.info)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let data = document
            .identifiers()
            .iter()
            .zip(&projection.coordinates)
            .map(|(id, coords)| WirePoint {
                identifier: id.clone(),
                coordinates: WireCoordinates::Array(coords.as_slice().to_vec()),
            })
            .collect();
        projections.push(WireProjection {
            name: projection.name.clone(),
            dimensions: projection.dimensions.into(),
            info,
            data,
        });
    }

    let styles = document.styles();
    let visualization_state = WireStyles {
        feature_colors: styles
            .colors()
            .iter()
            .map(|(feature, map)| {
                let map = map
                    .iter()
                    .map(|(value, color)| (value.style_key().to_string(), color.clone()))
                    .collect();
                (feature.clone(), map)
            })
            .collect(),
        marker_shapes: styles
            .shapes()
            .iter()
            .map(|(feature, map)| {
                let map = map
                    .iter()
                    .map(|(value, shape)| (value.style_key().to_string(), shape.to_string()))
                    .collect();
                (feature.clone(), map)
            })
            .collect(),
    };
    Ok(WireDocument {
        protein_data,
        projections,
        visualization_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = r#"{
      "protein_data": {
        "P1.1": {"features": {"family": "Elapidae", "length": 61}},
        "P2": {"features": {"family": null, "length": 70}}
      },
      "projections": [
        {"name": "PCA2", "dimensions": 2,
         "info": {"n_components": 2, "explained_variance_ratio": [0.7, 0.2]},
         "data": [
           {"identifier": "P2", "coordinates": {"x": 1.0, "y": 2.0}},
           {"identifier": "P1.1", "coordinates": {"x": -1.0, "y": 0.5}}
         ]}
      ]
    }"#;

    #[test]
    fn reads_legacy_artifacts() {
        let doc = parse_artifact(LEGACY).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.value("P2", "family"), Some(&FeatureValue::Missing));
        assert_eq!(doc.value("P1.1", "length"), Some(&FeatureValue::value("61")));
        let projection = doc.projection("PCA2").unwrap();
        assert_eq!(projection.info.method, "pca");
        assert_eq!(projection.info.params["n_components"], 2);
        assert_eq!(projection.coordinates[0], Coordinates::Planar([-1.0, 0.5]));
        assert!(doc.styles().is_empty());
    }

    #[test]
    fn rewrites_in_current_format() {
        let doc = parse_artifact(LEGACY).unwrap();
        let text = ArtifactSerializer::new().to_string(&doc).unwrap();
        assert!(text.contains("\"method\": \"pca\""));
        assert!(text.contains("\"visualization_state\""));
        let again = parse_artifact(&text).unwrap();
        assert_eq!(again, doc);
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = r#"{"protein_data": {}, "projections": [], "extra": 1}"#;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn rejects_short_projection() {
        let raw = r#"{"protein_data": {"A": {"features": {}}, "B": {"features": {}}},
          "projections": [{"name": "pca2", "dimensions": 2, "info": {"method": "pca"},
            "data": [{"identifier": "A", "coordinates": [0, 0]}]}]}"#;
        let err = parse_artifact(raw).unwrap_err();
        assert!(matches!(err, ProtspaceError::CorruptArtifact(ref m) if m.contains("'B'")));
    }

    #[test]
    fn rejects_wrong_dimensionality() {
        let raw = r#"{"protein_data": {"A": {"features": {}}},
          "projections": [{"name": "pca4", "dimensions": 4, "info": {"method": "pca"},
            "data": [{"identifier": "A", "coordinates": [0, 0, 0, 0]}]}]}"#;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
        let raw = r#"{"protein_data": {"A": {"features": {}}},
          "projections": [{"name": "umap3", "dimensions": 3, "info": {"method": "umap"},
            "data": [{"identifier": "A", "coordinates": [0, 0]}]}]}"#;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn rejects_uneven_feature_sets_and_stale_styles() {
        let raw = r#"{"protein_data": {"A": {"features": {"g": "x"}}, "B": {"features": {}}}}"#;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
        let raw = r##"{"protein_data": {"A": {"features": {"g": "x"}}},
          "visualization_state": {"feature_colors": {"g": {"y": "#000000"}}}}"##;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
        let raw = r#"{"protein_data": {"A": {"features": {"g": "x"}}},
          "visualization_state": {"marker_shapes": {"g": {"x": "blob"}}}}"#;
        assert!(matches!(
            parse_artifact(raw),
            Err(ProtspaceError::CorruptArtifact(_))
        ));
    }

    #[test]
    fn missing_style_key_maps_to_sentinel() {
        let raw = r#"{"protein_data": {"A": {"features": {"g": null}}, "B": {"features": {"g": "NaN"}}},
          "visualization_state": {
            "feature_colors": {"g": {"<NaN>": "rgba(200, 200, 200, 0.4)", "NaN": "red"}},
            "marker_shapes": {"g": {"<NaN>": "circle", "NaN": "x"}}}}"#;
        let doc = parse_artifact(raw).unwrap();
        assert_eq!(
            doc.styles().color("g", &FeatureValue::Missing),
            Some("rgba(200, 200, 200, 0.4)")
        );
        assert_eq!(doc.styles().color("g", &FeatureValue::value("NaN")), Some("red"));
        assert_eq!(
            doc.styles().shape("g", &FeatureValue::value("NaN")),
            Some(MarkerShape::X)
        );
    }

    #[test]
    fn bare_nan_tokens_read_as_missing() {
        let raw = r#"{"protein_data": {
            "A": {"features": {"g": NaN, "note": "says \"NaN\""}},
            "B": {"features": {"g": "NaN", "note": "x"}}}}"#;
        let doc = parse_artifact(raw).unwrap();
        assert_eq!(doc.value("A", "g"), Some(&FeatureValue::Missing));
        assert_eq!(doc.value("B", "g"), Some(&FeatureValue::value("NaN")));
        assert_eq!(
            doc.value("A", "note"),
            Some(&FeatureValue::value("says \"NaN\""))
        );
        assert!(matches!(null_bare_nan("{\"a\": 1}"), Cow::Borrowed(_)));
    }

    #[test]
    fn repeated_feature_keys_are_corrupt() {
        let raw = r#"{"protein_data": {"A": {"features": {"g": "x", "g": "y"}}}}"#;
        let err = parse_artifact(raw).unwrap_err();
        assert!(matches!(err, ProtspaceError::CorruptArtifact(ref m) if m.contains("duplicate key 'g'")));
    }

    #[test]
    fn atomic_write_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        std::fs::write(&path, "stale").unwrap();
        let doc = parse_artifact(LEGACY).unwrap();
        ArtifactSerializer::new().write_atomic(&doc, &path).unwrap();
        assert_eq!(read_artifact(&path).unwrap(), doc);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
