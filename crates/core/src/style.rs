//! Deterministic color/shape assignment for feature values.
//!
//! The assigner only ever fills gaps: a value that already has a color or a
//! shape keeps it. The one exception is shape re-validation, which replaces
//! shapes that the document can no longer draw (2D-only markers once a 3D
//! projection exists).

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{Dimensions, Document, FeatureValue};
use crate::error::{ProtspaceError, Result};
use crate::palette::{
    family_shades, qualitative_for, GROUP_BASES, MISSING_COLOR, NEUTRAL_BASES,
};
use crate::shape::{MarkerShape, ShapePool};

type ValueMap<T> = IndexMap<FeatureValue, T>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StyleState {
    colors: IndexMap<String, ValueMap<String>>,
    shapes: IndexMap<String, ValueMap<MarkerShape>>,
}

impl StyleState {
    pub(crate) fn from_maps(
        colors: IndexMap<String, ValueMap<String>>,
        shapes: IndexMap<String, ValueMap<MarkerShape>>,
    ) -> Self {
        Self { colors, shapes }
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty() && self.shapes.is_empty()
    }

    pub fn colors(&self) -> &IndexMap<String, ValueMap<String>> {
        &self.colors
    }

    pub fn shapes(&self) -> &IndexMap<String, ValueMap<MarkerShape>> {
        &self.shapes
    }

    pub fn color(&self, feature: &str, value: &FeatureValue) -> Option<&str> {
        self.colors
            .get(feature)
            .and_then(|map| map.get(value))
            .map(String::as_str)
    }

    pub fn shape(&self, feature: &str, value: &FeatureValue) -> Option<MarkerShape> {
        self.shapes
            .get(feature)
            .and_then(|map| map.get(value))
            .copied()
    }

    pub(crate) fn set_color(&mut self, feature: &str, value: FeatureValue, color: String) {
        self.colors
            .entry(feature.to_string())
            .or_default()
            .insert(value, color);
    }

    pub(crate) fn set_shape(&mut self, feature: &str, value: FeatureValue, shape: MarkerShape) {
        self.shapes
            .entry(feature.to_string())
            .or_default()
            .insert(value, shape);
    }

    fn remove_shape(&mut self, feature: &str, value: &FeatureValue) {
        if let Some(map) = self.shapes.get_mut(feature) {
            map.shift_remove(value);
        }
    }

    /// Every style entry must name an existing feature and a value that
    /// occurs in it.
    pub(crate) fn validate_against(&self, document: &Document) -> Result<()> {
        for (feature, map) in &self.colors {
            check_entries(document, feature, map.keys())?;
        }
        for (feature, map) in &self.shapes {
            check_entries(document, feature, map.keys())?;
        }
        Ok(())
    }

    /// Keeps every feature's legend in natural-key order, missing last.
    pub(crate) fn sort_legends(&mut self) {
        for map in self.colors.values_mut() {
            map.sort_by(|a, _, b, _| a.legend_cmp(b));
        }
        for map in self.shapes.values_mut() {
            map.sort_by(|a, _, b, _| a.legend_cmp(b));
        }
    }
}

fn check_entries<'v>(
    document: &Document,
    feature: &str,
    values: impl Iterator<Item = &'v FeatureValue>,
) -> Result<()> {
    let column = document.features().get(feature).ok_or_else(|| {
        ProtspaceError::corrupt(format!("styles refer to unknown feature '{feature}'"))
    })?;
    for value in values {
        if !column.contains(value) {
            return Err(ProtspaceError::corrupt(format!(
                "styles refer to value {value} that does not occur in feature '{feature}'"
            )));
        }
    }
    Ok(())
}

/// Where a value sits in a feature's hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub level: String,
    pub group: String,
}

/// Ordered category levels, coarse to fine, plus the placement of known
/// values (e.g. `order -> family -> function`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub levels: Vec<String>,
    #[serde(default)]
    pub placements: IndexMap<String, Placement>,
}

impl Hierarchy {
    pub fn validate(&self, feature: &str) -> Result<()> {
        if self.levels.is_empty() {
            return Err(ProtspaceError::schema(format!(
                "hierarchy for feature '{feature}' declares no levels"
            )));
        }
        for (value, placement) in &self.placements {
            if !self.levels.contains(&placement.level) {
                return Err(ProtspaceError::schema(format!(
                    "hierarchy for feature '{feature}' places '{value}' on unknown level '{}'",
                    placement.level
                )));
            }
        }
        Ok(())
    }

    fn place(&self, value: &FeatureValue) -> Option<(usize, &str)> {
        let placement = self.placements.get(value.as_str()?)?;
        let level = self.levels.iter().position(|l| *l == placement.level)?;
        Some((level, placement.group.as_str()))
    }

    fn is_finest(&self, level: usize) -> bool {
        level + 1 >= self.levels.len()
    }
}

/// What to do once a pool runs out of unused entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOrder {
    /// Start over from the first entry.
    #[default]
    Repeat,
    /// Walk back and forth through the pool.
    Bounce,
}

impl CycleOrder {
    fn index(self, n: usize, len: usize) -> usize {
        match self {
            CycleOrder::Repeat => n % len,
            CycleOrder::Bounce => {
                if len == 1 {
                    return 0;
                }
                let period = 2 * (len - 1);
                let pos = n % period;
                if pos < len {
                    pos
                } else {
                    period - pos
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylePolicy {
    pub shade_step: f64,
    pub shades_per_family: usize,
    pub coarse_opacity: f64,
    pub rotate_palette: bool,
    pub cycle: CycleOrder,
}

impl Default for StylePolicy {
    fn default() -> Self {
        Self {
            shade_step: 0.18,
            shades_per_family: 4,
            coarse_opacity: 0.5,
            rotate_palette: true,
            cycle: CycleOrder::Repeat,
        }
    }
}

impl StylePolicy {
    // The lightest shade must stay clearly colored, or families would
    // converge on white.
    fn effective_step(&self) -> f64 {
        let shades = self.shades_per_family.max(1);
        if shades == 1 {
            return 0.0;
        }
        self.shade_step.clamp(0.0, 0.8 / (shades - 1) as f64)
    }

    fn level_opacity(&self, hierarchy: &Hierarchy, level: usize) -> f64 {
        let levels = hierarchy.levels.len();
        if levels <= 1 {
            return 1.0;
        }
        let floor = self.coarse_opacity.clamp(0.05, 1.0);
        floor + (1.0 - floor) * level as f64 / (levels - 1) as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Family {
    Missing,
    Qualitative,
    Group { rank: usize, level: usize },
    Neutral,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StyleReport {
    pub colors_added: usize,
    pub shapes_added: usize,
    /// (feature, value, replaced shape, new shape)
    pub shapes_revalidated: Vec<(String, FeatureValue, MarkerShape, MarkerShape)>,
}

impl StyleReport {
    pub fn changed(&self) -> bool {
        self.colors_added > 0 || self.shapes_added > 0 || !self.shapes_revalidated.is_empty()
    }
}

pub struct StyleAssigner<'a> {
    hierarchies: &'a IndexMap<String, Hierarchy>,
    policy: &'a StylePolicy,
}

impl<'a> StyleAssigner<'a> {
    pub fn new(hierarchies: &'a IndexMap<String, Hierarchy>, policy: &'a StylePolicy) -> Self {
        Self {
            hierarchies,
            policy,
        }
    }

    /// Fills in a color and a shape for every feature value that lacks one.
    pub fn assign(&self, document: &mut Document) -> Result<StyleReport> {
        for (feature, hierarchy) in self.hierarchies {
            hierarchy.validate(feature)?;
            if !document.has_feature(feature) {
                debug!(feature = %feature, "hierarchy configured for absent feature");
            }
        }
        let present = document.dimensionalities();
        let mut report = StyleReport::default();
        let features = document
            .feature_names()
            .map(str::to_string)
            .collect::<Vec<_>>();
        for feature in &features {
            let plan = self.plan_feature(document, feature, &present)?;
            let styles = document.styles_mut();
            for (value, old) in plan.stale_shapes {
                styles.remove_shape(feature, &value);
                if let Some(new) = plan
                    .shapes
                    .iter()
                    .find(|(v, _)| *v == value)
                    .map(|(_, s)| *s)
                {
                    warn!(
                        feature = %feature,
                        value = %value,
                        from = %old,
                        to = %new,
                        "replacing marker shape not drawable in 3D"
                    );
                    report
                        .shapes_revalidated
                        .push((feature.clone(), value, old, new));
                }
            }
            let revalidated = report
                .shapes_revalidated
                .iter()
                .filter(|(f, ..)| f == feature)
                .count();
            for (value, color) in plan.colors {
                styles.set_color(feature, value, color);
                report.colors_added += 1;
            }
            let new_shapes = plan.shapes.len();
            for (value, shape) in plan.shapes {
                styles.set_shape(feature, value, shape);
            }
            report.shapes_added += new_shapes - revalidated;
        }
        document.styles_mut().sort_legends();
        Ok(report)
    }

    fn plan_feature(
        &self,
        document: &Document,
        feature: &str,
        present: &BTreeSet<Dimensions>,
    ) -> Result<FeaturePlan> {
        let styles = document.styles();
        let values = document.distinct_values(feature)?;
        let hierarchy = self.hierarchies.get(feature);

        let mut group_ranks: HashMap<&str, usize> = HashMap::new();
        let families = values
            .iter()
            .map(|value| {
                classify(value, hierarchy, &mut group_ranks)
            })
            .collect::<Vec<_>>();

        let mut stale_shapes = Vec::new();
        let mut used_colors: HashSet<String> = values
            .iter()
            .filter_map(|v| styles.color(feature, v).map(str::to_string))
            .collect();
        let mut used_shapes: HashSet<MarkerShape> = HashSet::new();
        for value in values.iter().filter(|v| !v.is_missing()) {
            if let Some(shape) = styles.shape(feature, value) {
                if shape.is_legal_for(present) {
                    used_shapes.insert(shape);
                }
            }
        }

        let mut colors = Vec::new();
        let mut shapes = Vec::new();
        let mut family_seen: HashMap<&Family, usize> = HashMap::new();
        let mut pool_seen: HashMap<ShapePool, usize> = HashMap::new();
        for (value, family) in values.iter().zip(families.iter()) {
            let family_index = *family_seen
                .entry(family)
                .and_modify(|n| *n += 1)
                .or_insert(0);

            if styles.color(feature, value).is_none() {
                let candidates = self.family_colors(feature, family, hierarchy);
                let color = candidates
                    .iter()
                    .find(|c| !used_colors.contains(*c))
                    .cloned()
                    .unwrap_or_else(|| {
                        candidates[self.policy.cycle.index(family_index, candidates.len())]
                            .clone()
                    });
                used_colors.insert(color.clone());
                colors.push(((*value).clone(), color));
            }

            let pool = shape_pool(family, hierarchy);
            let pool_index = pool.map(|pool| {
                *pool_seen
                    .entry(pool)
                    .and_modify(|n| *n += 1)
                    .or_insert(0)
            });
            if let Some(shape) = styles.shape(feature, value) {
                if shape.is_legal_for(present) {
                    continue;
                }
                stale_shapes.push(((*value).clone(), shape));
            }
            let shape = match (pool, pool_index) {
                (Some(pool), Some(pool_index)) => {
                    let candidates = pool.shapes(present);
                    let shape = candidates
                        .iter()
                        .copied()
                        .find(|s| !used_shapes.contains(s))
                        .unwrap_or_else(|| {
                            candidates[self.policy.cycle.index(pool_index, candidates.len())]
                        });
                    used_shapes.insert(shape);
                    shape
                }
                _ => MarkerShape::Circle,
            };
            shapes.push(((*value).clone(), shape));
        }
        Ok(FeaturePlan {
            colors,
            shapes,
            stale_shapes,
        })
    }

    fn family_colors(
        &self,
        feature: &str,
        family: &Family,
        hierarchy: Option<&Hierarchy>,
    ) -> Vec<String> {
        let step = self.policy.effective_step();
        let shades = self.policy.shades_per_family;
        match family {
            Family::Missing => vec![MISSING_COLOR.to_string()],
            Family::Qualitative => qualitative_for(feature, self.policy.rotate_palette),
            Family::Neutral => NEUTRAL_BASES
                .iter()
                .flat_map(|base| family_shades(*base, 1, 0.0, 1.0))
                .collect(),
            Family::Group { rank, level } => {
                let alpha = hierarchy
                    .map(|h| self.policy.level_opacity(h, *level))
                    .unwrap_or(1.0);
                let base = GROUP_BASES[rank % GROUP_BASES.len()];
                family_shades(base, shades, step, alpha)
            }
        }
    }
}

struct FeaturePlan {
    colors: Vec<(FeatureValue, String)>,
    shapes: Vec<(FeatureValue, MarkerShape)>,
    stale_shapes: Vec<(FeatureValue, MarkerShape)>,
}

fn classify<'h>(
    value: &FeatureValue,
    hierarchy: Option<&'h Hierarchy>,
    group_ranks: &mut HashMap<&'h str, usize>,
) -> Family {
    if value.is_missing() {
        return Family::Missing;
    }
    let Some(hierarchy) = hierarchy else {
        return Family::Qualitative;
    };
    match hierarchy.place(value) {
        Some((level, group)) => {
            let next = group_ranks.len();
            let rank = *group_ranks.entry(group).or_insert(next);
            Family::Group { rank, level }
        }
        None => Family::Neutral,
    }
}

fn shape_pool(family: &Family, hierarchy: Option<&Hierarchy>) -> Option<ShapePool> {
    match family {
        Family::Missing => None,
        Family::Qualitative => Some(ShapePool::General),
        Family::Neutral => Some(ShapePool::Fallback),
        Family::Group { level, .. } => match hierarchy {
            Some(h) if !h.is_finest(*level) => Some(ShapePool::Open),
            _ => Some(ShapePool::Filled),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Coordinates, Projection, ProjectionInfo};
    use indexmap::IndexSet;
    use serde_json::Map;

    fn document(values: &[Option<&str>]) -> Document {
        let ids = (0..values.len())
            .map(|i| format!("P{i}"))
            .collect::<IndexSet<_>>();
        let mut features = IndexMap::new();
        features.insert(
            "group".to_string(),
            values
                .iter()
                .map(|v| FeatureValue::from(v.map(str::to_string)))
                .collect(),
        );
        Document::from_parts(ids, features, Vec::new(), StyleState::default()).unwrap()
    }

    fn pairs(doc: &Document) -> Vec<(String, MarkerShape)> {
        doc.distinct_values("group")
            .unwrap()
            .into_iter()
            .map(|v| {
                (
                    doc.styles().color("group", v).unwrap().to_string(),
                    doc.styles().shape("group", v).unwrap(),
                )
            })
            .collect()
    }

    fn toxin_hierarchy() -> IndexMap<String, Hierarchy> {
        let mut placements = IndexMap::new();
        for (value, level, group) in [
            ("Squamata", "order", "reptile"),
            ("Elapidae", "family", "reptile"),
            ("Viperidae", "family", "reptile"),
            ("Conidae", "family", "mollusc"),
        ] {
            placements.insert(
                value.to_string(),
                Placement {
                    level: level.to_string(),
                    group: group.to_string(),
                },
            );
        }
        let mut map = IndexMap::new();
        map.insert(
            "group".to_string(),
            Hierarchy {
                levels: vec!["order".into(), "family".into()],
                placements,
            },
        );
        map
    }

    #[test]
    fn assigns_distinct_styles_per_value() {
        let mut doc = document(&[Some("x"), Some("y")]);
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        let report = StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap();
        assert_eq!(report.colors_added, 2);
        assert_eq!(report.shapes_added, 2);
        let styles = pairs(&doc);
        assert_ne!(styles[0], styles[1]);
    }

    #[test]
    fn assignment_is_idempotent() {
        let mut doc = document(&[Some("b"), None, Some("a"), Some("NaN"), Some("b")]);
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        let assigner = StyleAssigner::new(&hierarchies, &policy);
        assigner.assign(&mut doc).unwrap();
        let first = doc.styles().clone();
        let report = assigner.assign(&mut doc).unwrap();
        assert!(!report.changed());
        assert_eq!(&first, doc.styles());
    }

    #[test]
    fn missing_and_literal_nan_get_separate_entries() {
        let mut doc = document(&[Some("NaN"), None]);
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap();
        let colors = doc.styles().colors().get("group").unwrap();
        assert_eq!(colors.len(), 2);
        assert_eq!(
            colors.get(&FeatureValue::Missing).map(String::as_str),
            Some(MISSING_COLOR)
        );
        assert_ne!(
            colors.get(&FeatureValue::value("NaN")).map(String::as_str),
            Some(MISSING_COLOR)
        );
    }

    #[test]
    fn existing_styles_survive_new_values() {
        let mut doc = document(&[Some("x"), Some("y")]);
        doc.styles_mut()
            .set_color("group", FeatureValue::value("x"), "#123456".into());
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap();
        assert_eq!(
            doc.styles().color("group", &FeatureValue::value("x")),
            Some("#123456")
        );
        assert!(doc.styles().color("group", &FeatureValue::value("y")).is_some());
    }

    #[test]
    fn colors_exhaust_family_before_cycling() {
        let labels = (0..12).map(|i| format!("v{i}")).collect::<Vec<_>>();
        let values = labels.iter().map(|l| Some(l.as_str())).collect::<Vec<_>>();
        let mut doc = document(&values);
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap();
        let colors = labels
            .iter()
            .map(|l| {
                doc.styles()
                    .color("group", &FeatureValue::value(l.as_str()))
                    .unwrap()
                    .to_string()
            })
            .collect::<Vec<_>>();
        let first_ten = colors[..10].iter().collect::<HashSet<_>>();
        assert_eq!(first_ten.len(), 10);
        assert_eq!(colors[10], colors[0]);
        assert_eq!(colors[11], colors[1]);
    }

    #[test]
    fn hierarchy_controls_opacity_and_shapes() {
        let mut doc = document(&[
            Some("Squamata"),
            Some("Elapidae"),
            Some("Conidae"),
            Some("unplaced"),
        ]);
        let hierarchies = toxin_hierarchy();
        let policy = StylePolicy::default();
        StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap();
        let styles = doc.styles();
        let order = FeatureValue::value("Squamata");
        let family = FeatureValue::value("Elapidae");
        let other_group = FeatureValue::value("Conidae");
        let unplaced = FeatureValue::value("unplaced");
        assert!(styles.shape("group", &order).unwrap().is_open());
        assert!(!styles.shape("group", &family).unwrap().is_open());
        assert!(styles.color("group", &order).unwrap().ends_with(", 0.5)"));
        assert!(styles.color("group", &family).unwrap().ends_with(", 1)"));
        assert!(styles
            .color("group", &family)
            .unwrap()
            .starts_with("rgba(31, 119, 180"));
        assert!(styles
            .color("group", &other_group)
            .unwrap()
            .starts_with("rgba(255, 127, 14"));
        assert_eq!(
            styles.color("group", &unplaced),
            Some("rgba(99, 99, 99, 1)")
        );
        assert_eq!(styles.shape("group", &unplaced), Some(MarkerShape::Cross));
    }

    #[test]
    fn three_d_projection_replaces_two_d_only_shapes() {
        let labels = (0..10).map(|i| format!("v{i}")).collect::<Vec<_>>();
        let values = labels.iter().map(|l| Some(l.as_str())).collect::<Vec<_>>();
        let mut doc = document(&values);
        let hierarchies = IndexMap::new();
        let policy = StylePolicy::default();
        let assigner = StyleAssigner::new(&hierarchies, &policy);
        assigner.assign(&mut doc).unwrap();
        let v8 = FeatureValue::value("v8");
        assert_eq!(doc.styles().shape("group", &v8), Some(MarkerShape::TriangleUp));
        let v0_before = doc.styles().shape("group", &FeatureValue::value("v0"));

        doc.upsert_projection(Projection {
            name: "umap3".into(),
            dimensions: Dimensions::Three,
            info: ProjectionInfo::new("umap", Map::new()),
            coordinates: vec![Coordinates::Spatial([0.0; 3]); 10],
        });
        let report = assigner.assign(&mut doc).unwrap();
        assert_eq!(report.shapes_revalidated.len(), 2);
        assert_eq!(report.colors_added, 0);
        assert_eq!(report.shapes_added, 0);
        let present = doc.dimensionalities();
        for label in &labels {
            let shape = doc
                .styles()
                .shape("group", &FeatureValue::value(label.as_str()))
                .unwrap();
            assert!(shape.is_legal_for(&present));
        }
        assert_eq!(
            doc.styles().shape("group", &FeatureValue::value("v0")),
            v0_before
        );
    }

    #[test]
    fn bounce_cycle_walks_back() {
        assert_eq!(
            (0..7)
                .map(|n| CycleOrder::Bounce.index(n, 3))
                .collect::<Vec<_>>(),
            vec![0, 1, 2, 1, 0, 1, 2]
        );
        assert_eq!(CycleOrder::Repeat.index(4, 3), 1);
    }

    #[test]
    fn hierarchy_with_unknown_level_is_rejected() {
        let mut hierarchies = toxin_hierarchy();
        hierarchies.get_mut("group").unwrap().placements.insert(
            "x".into(),
            Placement {
                level: "genus".into(),
                group: "g".into(),
            },
        );
        let mut doc = document(&[Some("x")]);
        let policy = StylePolicy::default();
        let err = StyleAssigner::new(&hierarchies, &policy)
            .assign(&mut doc)
            .unwrap_err();
        assert!(matches!(err, ProtspaceError::Schema(_)));
        assert!(err.to_string().contains("genus"));
    }
}
