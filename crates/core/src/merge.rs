use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, info};

use crate::document::{Document, FeatureValue, Projection};
use crate::error::{IdentifierDiff, ProtspaceError, Result};
use crate::ingest::AlignedInput;
use crate::style::{StyleAssigner, StyleReport};

/// Identifiers, features and projections produced by one run, before
/// merging. Columns and coordinates follow `identifiers`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub identifiers: IndexSet<String>,
    pub features: IndexMap<String, Vec<FeatureValue>>,
    pub projections: Vec<Projection>,
}

impl Batch {
    pub fn new(identifiers: IndexSet<String>) -> Self {
        Self {
            identifiers,
            ..Self::default()
        }
    }

    pub fn from_aligned(aligned: AlignedInput, projections: Vec<Projection>) -> Self {
        Self {
            identifiers: aligned.identifiers,
            features: aligned.features,
            projections,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, values: Vec<FeatureValue>) -> Self {
        self.features.insert(name.into(), values);
        self
    }

    pub fn with_projection(mut self, projection: Projection) -> Self {
        self.projections.push(projection);
        self
    }

    pub fn validate(&self) -> Result<()> {
        let n = self.identifiers.len();
        for (name, values) in &self.features {
            if values.len() != n {
                return Err(ProtspaceError::schema(format!(
                    "batch feature '{name}' has {} values for {n} identifiers",
                    values.len()
                )));
            }
        }
        let mut names = HashSet::new();
        for projection in &self.projections {
            if !names.insert(projection.name.as_str()) {
                return Err(ProtspaceError::schema(format!(
                    "batch computes projection '{}' twice",
                    projection.name
                )));
            }
            if projection.coordinates.len() != n {
                return Err(ProtspaceError::schema(format!(
                    "batch projection '{}' has {} coordinates for {n} identifiers",
                    projection.name,
                    projection.coordinates.len()
                )));
            }
            if let Some(bad) = projection
                .coordinates
                .iter()
                .position(|c| c.dimensions() != projection.dimensions || !c.is_finite())
            {
                return Err(ProtspaceError::schema(format!(
                    "batch projection '{}' has invalid coordinates for '{}'",
                    projection.name,
                    self.identifiers.get_index(bad).map(String::as_str).unwrap_or("?")
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Replace projections that already exist instead of failing.
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub entities_adopted: usize,
    pub projections_added: Vec<String>,
    pub projections_replaced: Vec<String>,
    pub features_added: Vec<String>,
    pub style: StyleReport,
}

/// Merges `batch` into `document` and backfills styles.
///
/// Everything is checked before the document changes: on error the target
/// is exactly as it was.
pub fn merge(
    document: &mut Document,
    batch: Batch,
    options: MergeOptions,
    assigner: &StyleAssigner<'_>,
) -> Result<MergeReport> {
    batch.validate()?;
    let adopting = document.is_empty()
        && document.features().is_empty()
        && document.projections().is_empty();
    let order = if adopting {
        (0..batch.identifiers.len()).collect::<Vec<_>>()
    } else {
        realignment(document.identifiers(), &batch.identifiers)?
    };

    for projection in &batch.projections {
        if document.projection(&projection.name).is_some() && !options.overwrite {
            return Err(ProtspaceError::DuplicateProjection(projection.name.clone()));
        }
    }

    let mut new_features = Vec::new();
    for (name, values) in batch.features {
        let values = order.iter().map(|&i| values[i].clone()).collect::<Vec<_>>();
        match document.features().get(&name) {
            Some(existing) => {
                check_conflicts(document, &name, existing, &values)?;
                debug!(feature = %name, "feature already present with identical values");
            }
            None => new_features.push((name, values)),
        }
    }

    let mut working = document.clone();
    let mut report = MergeReport::default();
    if adopting {
        report.entities_adopted = batch.identifiers.len();
        working.adopt_identifiers(batch.identifiers);
    }
    for (name, values) in new_features {
        report.features_added.push(name.clone());
        working.insert_feature(name, values);
    }
    for mut projection in batch.projections {
        projection.coordinates = order.iter().map(|&i| projection.coordinates[i]).collect();
        let name = projection.name.clone();
        if working.upsert_projection(projection) {
            report.projections_replaced.push(name);
        } else {
            report.projections_added.push(name);
        }
    }
    report.style = assigner.assign(&mut working)?;
    *document = working;

    info!(
        entities = document.len(),
        adopted = report.entities_adopted,
        added = ?report.projections_added,
        replaced = ?report.projections_replaced,
        features = report.features_added.len(),
        colors = report.style.colors_added,
        shapes = report.style.shapes_added,
        revalidated = report.style.shapes_revalidated.len(),
        "merged batch"
    );
    Ok(report)
}

/// Position in `incoming` of every identifier of `existing`, or the
/// difference between the two sets.
fn realignment(existing: &IndexSet<String>, incoming: &IndexSet<String>) -> Result<Vec<usize>> {
    let diff = IdentifierDiff {
        missing: existing
            .iter()
            .filter(|id| !incoming.contains(*id))
            .cloned()
            .collect(),
        unexpected: incoming
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect(),
    };
    if !diff.is_empty() {
        return Err(ProtspaceError::Alignment {
            context: "merge",
            diff,
        });
    }
    Ok(existing
        .iter()
        .filter_map(|id| incoming.get_index_of(id))
        .collect())
}

fn check_conflicts(
    document: &Document,
    feature: &str,
    existing: &[FeatureValue],
    incoming: &[FeatureValue],
) -> Result<()> {
    for (idx, (old, new)) in existing.iter().zip(incoming).enumerate() {
        if old != new {
            let identifier = document
                .identifiers()
                .get_index(idx)
                .cloned()
                .unwrap_or_default();
            return Err(ProtspaceError::FeatureConflict {
                feature: feature.to_string(),
                identifier,
                existing: old.to_string(),
                incoming: new.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Coordinates, Dimensions, ProjectionInfo};
    use crate::style::{Hierarchy, StylePolicy};
    use serde_json::Map;

    fn ids(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn planar(name: &str, points: &[[f64; 2]]) -> Projection {
        Projection {
            name: name.to_string(),
            dimensions: Dimensions::Two,
            info: ProjectionInfo::new(name.trim_end_matches(char::is_numeric), Map::new()),
            coordinates: points.iter().map(|p| Coordinates::Planar(*p)).collect(),
        }
    }

    fn values(items: &[&str]) -> Vec<FeatureValue> {
        items.iter().map(|v| FeatureValue::from_cell(v)).collect()
    }

    fn run(document: &mut Document, batch: Batch, overwrite: bool) -> Result<MergeReport> {
        let hierarchies: IndexMap<String, Hierarchy> = IndexMap::new();
        let policy = StylePolicy::default();
        let assigner = StyleAssigner::new(&hierarchies, &policy);
        merge(document, batch, MergeOptions { overwrite }, &assigner)
    }

    fn seeded() -> Document {
        let mut doc = Document::new();
        let batch = Batch::new(ids(&["A", "B"]))
            .with_feature("group", values(&["x", "y"]))
            .with_projection(planar("pca2", &[[0.0, 1.0], [2.0, 3.0]]));
        run(&mut doc, batch, false).unwrap();
        doc
    }

    #[test]
    fn first_merge_adopts_and_styles() {
        let doc = seeded();
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.projection_names().collect::<Vec<_>>(), vec!["pca2"]);
        let x = FeatureValue::value("x");
        let y = FeatureValue::value("y");
        let styles = doc.styles();
        assert_ne!(
            (styles.color("group", &x), styles.shape("group", &x)),
            (styles.color("group", &y), styles.shape("group", &y))
        );
    }

    #[test]
    fn append_keeps_existing_projection_and_styles() {
        let mut doc = seeded();
        let before_pca = doc.projection("pca2").cloned();
        let before_styles = doc.styles().clone();
        let batch = Batch::new(ids(&["B", "A"])).with_projection(planar(
            "tsne2",
            &[[5.0, 5.0], [-5.0, -5.0]],
        ));
        let report = run(&mut doc, batch, false).unwrap();
        assert_eq!(report.projections_added, vec!["tsne2".to_string()]);
        assert_eq!(doc.projection("pca2").cloned(), before_pca);
        assert_eq!(doc.styles(), &before_styles);
        // realigned to the document's identifier order
        assert_eq!(
            doc.projection("tsne2").unwrap().coordinates[0],
            Coordinates::Planar([-5.0, -5.0])
        );
    }

    #[test]
    fn identifier_sets_must_match_exactly() {
        let mut doc = seeded();
        let before = doc.clone();
        let batch = Batch::new(ids(&["A", "B", "C"])).with_projection(planar(
            "tsne2",
            &[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]],
        ));
        let err = run(&mut doc, batch, false).unwrap_err();
        assert!(matches!(err, ProtspaceError::Alignment { .. }));
        assert!(err.to_string().contains('C'));
        assert_eq!(doc, before);
    }

    #[test]
    fn duplicate_projection_needs_overwrite() {
        let mut doc = seeded();
        let batch = Batch::new(ids(&["A", "B"]))
            .with_projection(planar("pca2", &[[9.0, 9.0], [8.0, 8.0]]));
        let err = run(&mut doc, batch.clone(), false).unwrap_err();
        assert!(matches!(err, ProtspaceError::DuplicateProjection(ref n) if n == "pca2"));

        let styles = doc.styles().clone();
        let report = run(&mut doc, batch, true).unwrap();
        assert_eq!(report.projections_replaced, vec!["pca2".to_string()]);
        assert_eq!(doc.projections().len(), 1);
        assert_eq!(
            doc.projection("pca2").unwrap().coordinates[0],
            Coordinates::Planar([9.0, 9.0])
        );
        assert_eq!(doc.styles(), &styles);
    }

    #[test]
    fn differing_feature_values_conflict() {
        let mut doc = seeded();
        let before = doc.clone();
        let batch = Batch::new(ids(&["A", "B"]))
            .with_feature("group", values(&["x", ""]))
            .with_projection(planar("umap2", &[[0.0, 0.0], [1.0, 1.0]]));
        let err = run(&mut doc, batch, false).unwrap_err();
        match err {
            ProtspaceError::FeatureConflict {
                feature,
                identifier,
                existing,
                incoming,
            } => {
                assert_eq!(feature, "group");
                assert_eq!(identifier, "B");
                assert_eq!(existing, "'y'");
                assert_eq!(incoming, "<NaN>");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(doc, before);
    }

    #[test]
    fn identical_features_and_new_features_merge() {
        let mut doc = seeded();
        let batch = Batch::new(ids(&["B", "A"]))
            .with_feature("group", values(&["y", "x"]))
            .with_feature("family", values(&["Elapidae", ""]));
        let report = run(&mut doc, batch, false).unwrap();
        assert_eq!(report.features_added, vec!["family".to_string()]);
        assert_eq!(doc.feature("family").unwrap(), &values(&["", "Elapidae"])[..]);
        assert!(doc
            .styles()
            .color("family", &FeatureValue::Missing)
            .is_some());
    }

    #[test]
    fn inconsistent_batches_are_rejected() {
        let mut doc = Document::new();
        let batch = Batch::new(ids(&["A", "B"])).with_feature("group", values(&["x"]));
        assert!(matches!(
            run(&mut doc, batch, false),
            Err(ProtspaceError::Schema(_))
        ));
        assert!(doc.is_empty());
    }
}
