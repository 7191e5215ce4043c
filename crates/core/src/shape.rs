use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::document::Dimensions;
use crate::error::{ProtspaceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkerShape {
    Circle,
    CircleOpen,
    Square,
    SquareOpen,
    Diamond,
    DiamondOpen,
    Cross,
    X,
    TriangleUp,
    TriangleUpOpen,
    TriangleDown,
    TriangleDownOpen,
    Star,
    StarOpen,
    Hexagon,
    HexagonOpen,
    Pentagon,
    PentagonOpen,
}

pub const ALL_SHAPES: [MarkerShape; 18] = [
    MarkerShape::Circle,
    MarkerShape::CircleOpen,
    MarkerShape::Square,
    MarkerShape::SquareOpen,
    MarkerShape::Diamond,
    MarkerShape::DiamondOpen,
    MarkerShape::Cross,
    MarkerShape::X,
    MarkerShape::TriangleUp,
    MarkerShape::TriangleUpOpen,
    MarkerShape::TriangleDown,
    MarkerShape::TriangleDownOpen,
    MarkerShape::Star,
    MarkerShape::StarOpen,
    MarkerShape::Hexagon,
    MarkerShape::HexagonOpen,
    MarkerShape::Pentagon,
    MarkerShape::PentagonOpen,
];

impl MarkerShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerShape::Circle => "circle",
            MarkerShape::CircleOpen => "circle-open",
            MarkerShape::Square => "square",
            MarkerShape::SquareOpen => "square-open",
            MarkerShape::Diamond => "diamond",
            MarkerShape::DiamondOpen => "diamond-open",
            MarkerShape::Cross => "cross",
            MarkerShape::X => "x",
            MarkerShape::TriangleUp => "triangle-up",
            MarkerShape::TriangleUpOpen => "triangle-up-open",
            MarkerShape::TriangleDown => "triangle-down",
            MarkerShape::TriangleDownOpen => "triangle-down-open",
            MarkerShape::Star => "star",
            MarkerShape::StarOpen => "star-open",
            MarkerShape::Hexagon => "hexagon",
            MarkerShape::HexagonOpen => "hexagon-open",
            MarkerShape::Pentagon => "pentagon",
            MarkerShape::PentagonOpen => "pentagon-open",
        }
    }

    /// 3D scatter markers only come in the first eight variants.
    pub fn supports(&self, dims: Dimensions) -> bool {
        match dims {
            Dimensions::Two => true,
            Dimensions::Three => matches!(
                self,
                MarkerShape::Circle
                    | MarkerShape::CircleOpen
                    | MarkerShape::Square
                    | MarkerShape::SquareOpen
                    | MarkerShape::Diamond
                    | MarkerShape::DiamondOpen
                    | MarkerShape::Cross
                    | MarkerShape::X
            ),
        }
    }

    /// Legal when every dimensionality present can draw it. A document
    /// without projections is treated as 2D.
    pub fn is_legal_for(&self, present: &BTreeSet<Dimensions>) -> bool {
        if present.is_empty() {
            return self.supports(Dimensions::Two);
        }
        present.iter().all(|dims| self.supports(*dims))
    }

    pub fn is_open(&self) -> bool {
        self.as_str().ends_with("-open")
    }
}

impl fmt::Display for MarkerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarkerShape {
    type Err = ProtspaceError;

    fn from_str(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_lowercase();
        ALL_SHAPES
            .iter()
            .copied()
            .find(|shape| shape.as_str() == normalized)
            .ok_or_else(|| {
                ProtspaceError::schema(format!(
                    "unknown marker shape '{raw}' (known: {})",
                    ALL_SHAPES
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Ordered shape pools the style assigner draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShapePool {
    /// Features without a hierarchy descriptor.
    General,
    /// Finest hierarchy level.
    Filled,
    /// Coarser hierarchy levels.
    Open,
    /// Values with no hierarchy placement.
    Fallback,
}

impl ShapePool {
    fn candidates(self) -> &'static [MarkerShape] {
        use MarkerShape::*;
        match self {
            ShapePool::General => &[
                Circle,
                Square,
                Diamond,
                Cross,
                X,
                CircleOpen,
                SquareOpen,
                DiamondOpen,
                TriangleUp,
                TriangleDown,
                Star,
                Hexagon,
                Pentagon,
                TriangleUpOpen,
                TriangleDownOpen,
                StarOpen,
                HexagonOpen,
                PentagonOpen,
            ],
            ShapePool::Filled => &[
                Circle,
                Square,
                Diamond,
                TriangleUp,
                TriangleDown,
                Star,
                Hexagon,
                Pentagon,
            ],
            ShapePool::Open => &[
                CircleOpen,
                SquareOpen,
                DiamondOpen,
                TriangleUpOpen,
                TriangleDownOpen,
                StarOpen,
                HexagonOpen,
                PentagonOpen,
            ],
            ShapePool::Fallback => &[Cross, X],
        }
    }

    /// Shapes of the pool that are legal for the given dimensionalities,
    /// in pool order. Never empty: every pool has at least one shape that
    /// 3D markers support.
    pub fn shapes(self, present: &BTreeSet<Dimensions>) -> Vec<MarkerShape> {
        self.candidates()
            .iter()
            .copied()
            .filter(|shape| shape.is_legal_for(present))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(items: &[Dimensions]) -> BTreeSet<Dimensions> {
        items.iter().copied().collect()
    }

    #[test]
    fn parses_plotly_names() {
        assert_eq!(
            "diamond-open".parse::<MarkerShape>().unwrap(),
            MarkerShape::DiamondOpen
        );
        assert_eq!(" X ".parse::<MarkerShape>().unwrap(), MarkerShape::X);
        let err = "blob".parse::<MarkerShape>().unwrap_err();
        assert!(err.to_string().contains("blob"));
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_string(&MarkerShape::TriangleUpOpen).unwrap();
        assert_eq!(json, "\"triangle-up-open\"");
    }

    #[test]
    fn three_d_projection_shrinks_pools() {
        let two = dims(&[Dimensions::Two]);
        let both = dims(&[Dimensions::Two, Dimensions::Three]);
        let three = dims(&[Dimensions::Three]);
        assert_eq!(ShapePool::General.shapes(&two).len(), 18);
        assert_eq!(ShapePool::General.shapes(&both).len(), 8);
        assert_eq!(ShapePool::General.shapes(&three).len(), 8);
        assert_eq!(ShapePool::Filled.shapes(&both).len(), 3);
        assert_eq!(ShapePool::Open.shapes(&both).len(), 3);
        assert!(!MarkerShape::Star.is_legal_for(&both));
        assert!(MarkerShape::Star.is_legal_for(&BTreeSet::new()));
    }

    #[test]
    fn open_variants_are_flagged() {
        assert!(MarkerShape::CircleOpen.is_open());
        assert!(!MarkerShape::Cross.is_open());
    }
}
