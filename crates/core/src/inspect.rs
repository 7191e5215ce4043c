use std::fmt;

use itertools::Itertools;
use serde::Serialize;

use crate::document::Document;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectionSummary {
    pub name: String,
    pub method: String,
    pub dimensions: u32,
    /// `(min, max)` per axis.
    pub extent: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureSummary {
    pub name: String,
    pub distinct: usize,
    pub missing: usize,
    pub colored: usize,
    pub shaped: usize,
    /// Most frequent values, most common first.
    pub top_values: Vec<(String, usize)>,
}

impl FeatureSummary {
    pub fn fully_styled(&self) -> bool {
        self.colored == self.distinct && self.shaped == self.distinct
    }
}

/// Summary of an artifact: entity count, projections, and per-feature
/// value and style coverage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inspection {
    pub entities: usize,
    pub projections: Vec<ProjectionSummary>,
    pub features: Vec<FeatureSummary>,
}

impl Inspection {
    pub fn measure(document: &Document, top: usize) -> Result<Self> {
        let projections = document
            .projections()
            .iter()
            .map(|projection| {
                let axes = projection.dimensions.count();
                let extent = (0..axes)
                    .map(|axis| {
                        projection.coordinates.iter().fold(
                            (f64::INFINITY, f64::NEG_INFINITY),
                            |(lo, hi), c| {
                                let v = c.as_slice()[axis];
                                (lo.min(v), hi.max(v))
                            },
                        )
                    })
                    .collect();
                ProjectionSummary {
                    name: projection.name.clone(),
                    method: projection.info.method.clone(),
                    dimensions: projection.dimensions.into(),
                    extent,
                }
            })
            .collect();

        let mut features = Vec::new();
        for name in document.feature_names() {
            let column = document.feature(name)?;
            let legend = document.legend(name)?;
            let mut counts = legend
                .iter()
                .map(|entry| {
                    let count = column.iter().filter(|v| *v == entry.value).count();
                    (entry.value.style_key().to_string(), count)
                })
                .collect::<Vec<_>>();
            // Stable sort keeps legend order among ties.
            counts.sort_by(|a, b| b.1.cmp(&a.1));
            counts.truncate(top);
            features.push(FeatureSummary {
                name: name.to_string(),
                distinct: legend.len(),
                missing: column.iter().filter(|v| v.is_missing()).count(),
                colored: legend.iter().filter(|e| e.color.is_some()).count(),
                shaped: legend.iter().filter(|e| e.shape.is_some()).count(),
                top_values: counts,
            });
        }

        Ok(Self {
            entities: document.len(),
            projections,
            features,
        })
    }
}

impl fmt::Display for Inspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entities: {}", self.entities)?;
        writeln!(f, "projections: {}", self.projections.len())?;
        for projection in &self.projections {
            let extent = projection
                .extent
                .iter()
                .map(|(lo, hi)| format!("[{lo:.3}, {hi:.3}]"))
                .join(" x ");
            writeln!(
                f,
                "  {} ({}, {}d) {}",
                projection.name, projection.method, projection.dimensions, extent
            )?;
        }
        writeln!(f, "features: {}", self.features.len())?;
        for feature in &self.features {
            writeln!(
                f,
                "  {}: {} values, {} missing, styled {}/{} colors {}/{} shapes",
                feature.name,
                feature.distinct,
                feature.missing,
                feature.colored,
                feature.distinct,
                feature.shaped,
                feature.distinct
            )?;
            for (value, count) in &feature.top_values {
                writeln!(f, "    {value}: {count}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indexmap::{IndexMap, IndexSet};
    use serde_json::Map;

    use super::*;
    use crate::document::{Coordinates, Dimensions, FeatureValue, Projection, ProjectionInfo};
    use crate::style::StyleState;

    fn sample() -> Document {
        let ids = ["a", "b", "c", "d"]
            .iter()
            .map(|s| s.to_string())
            .collect::<IndexSet<_>>();
        let mut features = IndexMap::new();
        features.insert(
            "kingdom".to_string(),
            vec![
                FeatureValue::value("Animalia"),
                FeatureValue::value("Plantae"),
                FeatureValue::Missing,
                FeatureValue::value("Animalia"),
            ],
        );
        let projection = Projection {
            name: "pca2".into(),
            dimensions: Dimensions::Two,
            info: ProjectionInfo::new("pca", Map::new()),
            coordinates: vec![
                Coordinates::Planar([0.0, -1.0]),
                Coordinates::Planar([2.0, 1.0]),
                Coordinates::Planar([1.0, 0.0]),
                Coordinates::Planar([-3.0, 0.5]),
            ],
        };
        Document::from_parts(ids, features, vec![projection], StyleState::default()).unwrap()
    }

    #[test]
    fn summarizes_features_and_extent() {
        let report = Inspection::measure(&sample(), 2).unwrap();
        assert_eq!(report.entities, 4);
        assert_eq!(report.projections[0].extent, vec![(-3.0, 2.0), (-1.0, 1.0)]);
        let kingdom = &report.features[0];
        assert_eq!(kingdom.distinct, 3);
        assert_eq!(kingdom.missing, 1);
        assert_eq!(kingdom.colored, 0);
        assert!(!kingdom.fully_styled());
        assert_eq!(
            kingdom.top_values,
            vec![("Animalia".to_string(), 2), ("Plantae".to_string(), 1)]
        );
        let text = report.to_string();
        assert!(text.contains("pca2 (pca, 2d)"));
        assert!(text.contains("kingdom: 3 values, 1 missing"));
    }
}
