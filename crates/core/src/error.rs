use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::reducer::InputKind;

#[derive(Error, Debug)]
pub enum ProtspaceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid config {path:?}: {source}")]
    Config {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("schema error: {0}")]
    Schema(String),
    #[error("alignment error ({context}): {diff}")]
    Alignment {
        context: &'static str,
        diff: IdentifierDiff,
    },
    #[error("unsupported dimensionality '{0}': projections must have 2 or 3 dimensions")]
    Dimensionality(String),
    #[error("unknown reduction method '{0}'")]
    UnknownMethod(String),
    #[error("method '{method}' cannot consume {input} input")]
    MethodUnsupported { method: String, input: InputKind },
    #[error("projection '{0}' already exists (request an overwrite to replace it)")]
    DuplicateProjection(String),
    #[error(
        "feature '{feature}' conflicts for identifier '{identifier}': existing {existing}, incoming {incoming}"
    )]
    FeatureConflict {
        feature: String,
        identifier: String,
        existing: String,
        incoming: String,
    },
    #[error("unknown feature '{0}'")]
    UnknownFeature(String),
    #[error("value '{value}' does not occur in feature '{feature}'")]
    UnknownValue { feature: String, value: String },
    #[error("shape '{shape}' for {feature}.{value} is not available once a 3D projection exists")]
    IllegalShape {
        feature: String,
        value: String,
        shape: String,
    },
    #[error("corrupt artifact: {0}")]
    CorruptArtifact(String),
    #[error("{method} reduction failed: {reason}")]
    Reducer { method: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ProtspaceError>;

impl ProtspaceError {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptArtifact(message.into())
    }

    pub(crate) fn reducer(method: &str, reason: impl Into<String>) -> Self {
        Self::Reducer {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

const DIFF_PREVIEW: usize = 8;

/// Identifiers present on only one side of a strict join.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierDiff {
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

impl IdentifierDiff {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for IdentifierDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!(
                "{} missing [{}]",
                self.missing.len(),
                preview(&self.missing)
            ));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!(
                "{} unexpected [{}]",
                self.unexpected.len(),
                preview(&self.unexpected)
            ));
        }
        if parts.is_empty() {
            parts.push("identifier sets differ".to_string());
        }
        write!(f, "{}", parts.join("; "))
    }
}

fn preview(ids: &[String]) -> String {
    let mut shown = ids
        .iter()
        .take(DIFF_PREVIEW)
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    if ids.len() > DIFF_PREVIEW {
        shown.push_str(&format!(", ... (+{})", ids.len() - DIFF_PREVIEW));
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_error_names_identifiers() {
        let err = ProtspaceError::Alignment {
            context: "merge",
            diff: IdentifierDiff {
                missing: vec!["P12345".into()],
                unexpected: vec!["Q9.1".into(), "Q9.2".into()],
            },
        };
        let text = err.to_string();
        assert!(text.contains("P12345"));
        assert!(text.contains("2 unexpected [Q9.1, Q9.2]"));
    }

    #[test]
    fn long_diffs_are_truncated() {
        let ids = (0..20).map(|i| format!("id{i}")).collect::<Vec<_>>();
        let diff = IdentifierDiff {
            missing: ids,
            unexpected: Vec::new(),
        };
        let text = diff.to_string();
        assert!(text.contains("(+12)"));
        assert!(!text.contains("id19"));
    }
}
