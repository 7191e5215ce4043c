use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::document::{Document, FeatureValue};
use crate::error::{ProtspaceError, Result};
use crate::palette;
use crate::shape::MarkerShape;

/// User-supplied colors and shapes, keyed by feature and then by value.
/// The missing sentinel is addressed with `<NaN>`.
///
/// ```json
/// {"family": {"colors": {"Elapidae": "#FF0000"}, "shapes": {"<NaN>": "x"}}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StyleOverrides {
    features: IndexMap<String, FeatureOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureOverride {
    #[serde(default)]
    pub colors: IndexMap<String, String>,
    #[serde(default)]
    pub shapes: IndexMap<String, String>,
}

impl StyleOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Accepts either inline JSON or a path to a JSON file.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim_start();
        if trimmed.starts_with('{') {
            Self::from_json_str(trimmed)
        } else {
            Self::load(Path::new(input))
        }
    }

    pub fn color(mut self, feature: &str, value: &str, color: &str) -> Self {
        self.features
            .entry(feature.to_string())
            .or_default()
            .colors
            .insert(value.to_string(), color.to_string());
        self
    }

    pub fn shape(mut self, feature: &str, value: &str, shape: &str) -> Self {
        self.features
            .entry(feature.to_string())
            .or_default()
            .shapes
            .insert(value.to_string(), shape.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.features
            .values()
            .all(|f| f.colors.is_empty() && f.shapes.is_empty())
    }

    /// Checks every entry against the document, then writes them all.
    /// Nothing is applied when any entry is invalid. Returns the number of
    /// entries written.
    pub fn apply(&self, document: &mut Document) -> Result<usize> {
        let resolved = self.resolve(document)?;
        let styles = document.styles_mut();
        let mut applied = 0;
        for (feature, colors, shapes) in resolved {
            for (value, color) in colors {
                debug!(feature = %feature, value = %value, color = %color, "color override");
                styles.set_color(feature, value, color);
                applied += 1;
            }
            for (value, shape) in shapes {
                debug!(feature = %feature, value = %value, shape = %shape, "shape override");
                styles.set_shape(feature, value, shape);
                applied += 1;
            }
        }
        styles.sort_legends();
        info!(entries = applied, "applied style overrides");
        Ok(applied)
    }

    #[allow(clippy::type_complexity)]
    fn resolve<'s>(
        &'s self,
        document: &Document,
    ) -> Result<
        Vec<(
            &'s str,
            Vec<(FeatureValue, String)>,
            Vec<(FeatureValue, MarkerShape)>,
        )>,
    > {
        let present = document.dimensionalities();
        let mut resolved = Vec::with_capacity(self.features.len());
        for (feature, entries) in &self.features {
            if !document.has_feature(feature) {
                return Err(ProtspaceError::UnknownFeature(feature.clone()));
            }
            let lookup = |key: &str| -> Result<FeatureValue> {
                let value = FeatureValue::from_style_key(key);
                if document.contains_value(feature, &value)? {
                    Ok(value)
                } else {
                    Err(ProtspaceError::UnknownValue {
                        feature: feature.clone(),
                        value: key.to_string(),
                    })
                }
            };
            let mut colors = Vec::with_capacity(entries.colors.len());
            for (key, color) in &entries.colors {
                let value = lookup(key)?;
                let color = color.trim();
                if !palette::is_color(color) {
                    return Err(ProtspaceError::schema(format!(
                        "color '{color}' for {feature}.{key} is not #rrggbb, rgb() or rgba()"
                    )));
                }
                colors.push((value, color.to_string()));
            }
            let mut shapes = Vec::with_capacity(entries.shapes.len());
            for (key, raw) in &entries.shapes {
                let value = lookup(key)?;
                let shape: MarkerShape = raw.parse()?;
                if !shape.is_legal_for(&present) {
                    return Err(ProtspaceError::IllegalShape {
                        feature: feature.clone(),
                        value: key.clone(),
                        shape: shape.to_string(),
                    });
                }
                shapes.push((value, shape));
            }
            resolved.push((feature.as_str(), colors, shapes));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Coordinates, Dimensions, Projection, ProjectionInfo};
    use crate::style::StyleState;
    use indexmap::IndexSet;
    use serde_json::Map;

    fn document(with_3d: bool) -> Document {
        let ids = ["a", "b", "c"]
            .iter()
            .map(|s| s.to_string())
            .collect::<IndexSet<_>>();
        let mut features = IndexMap::new();
        features.insert(
            "group".to_string(),
            vec![
                FeatureValue::value("x"),
                FeatureValue::value("y"),
                FeatureValue::Missing,
            ],
        );
        let projections = if with_3d {
            vec![Projection {
                name: "pca3".into(),
                dimensions: Dimensions::Three,
                info: ProjectionInfo::new("pca", Map::new()),
                coordinates: vec![Coordinates::Spatial([0.0, 0.0, 0.0]); 3],
            }]
        } else {
            Vec::new()
        };
        Document::from_parts(ids, features, projections, StyleState::default()).unwrap()
    }

    #[test]
    fn parses_inline_json_and_files() {
        let raw = r##"{"group": {"colors": {"x": "#FF0000"}, "shapes": {"<NaN>": "cross"}}}"##;
        let inline = StyleOverrides::parse(raw).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("styles.json");
        std::fs::write(&path, raw).unwrap();
        let from_file = StyleOverrides::parse(path.to_str().unwrap()).unwrap();
        assert_eq!(inline, from_file);
        assert!(!inline.is_empty());
    }

    #[test]
    fn rejects_unknown_sections() {
        let err = StyleOverrides::from_json_str(r#"{"group": {"sizes": {}}}"#).unwrap_err();
        assert!(matches!(err, ProtspaceError::SerdeJson(_)));
    }

    #[test]
    fn applies_colors_and_missing_shape() {
        let mut doc = document(false);
        let applied = StyleOverrides::new()
            .color("group", "x", "#FF0000")
            .shape("group", "<NaN>", "star")
            .apply(&mut doc)
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(
            doc.styles().color("group", &FeatureValue::value("x")),
            Some("#FF0000")
        );
        assert_eq!(
            doc.styles().shape("group", &FeatureValue::Missing),
            Some(MarkerShape::Star)
        );
    }

    #[test]
    fn unknown_value_leaves_document_untouched() {
        let mut doc = document(false);
        let before = doc.clone();
        let err = StyleOverrides::new()
            .color("group", "y", "#00FF00")
            .color("group", "z", "#FF0000")
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::UnknownValue { .. }));
        assert_eq!(doc, before);
    }

    #[test]
    fn malformed_colors_are_rejected() {
        let mut doc = document(false);
        let before = doc.clone();
        let err = StyleOverrides::new()
            .color("group", "x", "#FF0000")
            .color("group", "y", "blue-ish")
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::Schema(ref m) if m.contains("blue-ish")));
        assert_eq!(doc, before);
        StyleOverrides::new()
            .color("group", "y", "rgba(10, 20, 30, 0.5)")
            .apply(&mut doc)
            .unwrap();
    }

    #[test]
    fn unknown_feature_is_reported() {
        let mut doc = document(false);
        let err = StyleOverrides::new()
            .color("taxon", "x", "#FF0000")
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::UnknownFeature(name) if name == "taxon"));
    }

    #[test]
    fn two_d_only_shape_rejected_with_three_d_projection() {
        let mut doc = document(true);
        let err = StyleOverrides::new()
            .shape("group", "x", "star")
            .apply(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::IllegalShape { .. }));
        StyleOverrides::new()
            .shape("group", "x", "diamond-open")
            .apply(&mut doc)
            .unwrap();
    }
}
