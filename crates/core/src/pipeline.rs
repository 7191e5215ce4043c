use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::info;

use crate::config::ProtspaceConfig;
use crate::document::Document;
use crate::error::{ProtspaceError, Result};
use crate::ingest::{load_aligned, InputSource};
use crate::merge::{merge, Batch, MergeOptions, MergeReport};
use crate::overrides::StyleOverrides;
use crate::reducer::{MethodSpec, ReducerRegistry};
use crate::serializer::{read_artifact, ArtifactSerializer};

/// One `prepare` run.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub source: InputSource,
    pub features: Option<PathBuf>,
    pub methods: Vec<MethodSpec>,
    pub output: PathBuf,
    pub overwrite: bool,
    pub overrides: Option<StyleOverrides>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareSummary {
    pub output: PathBuf,
    pub appended: bool,
    pub merge: MergeReport,
    pub overrides_applied: usize,
    pub elapsed_ms: u64,
}

pub struct Pipeline<'a> {
    config: &'a ProtspaceConfig,
    registry: ReducerRegistry,
    serializer: ArtifactSerializer,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a ProtspaceConfig) -> Self {
        Self {
            config,
            registry: ReducerRegistry::with_defaults(),
            serializer: ArtifactSerializer::new(),
        }
    }

    pub fn with_registry(mut self, registry: ReducerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ReducerRegistry {
        &self.registry
    }

    /// Load, reduce, merge into the artifact at `request.output` (if any),
    /// apply overrides and write. Nothing is written when a step fails.
    pub fn prepare(&self, request: &PrepareRequest) -> Result<PrepareSummary> {
        let started = Instant::now();
        let input_kind = request.source.input_kind();
        MethodSpec::check_unique(&request.methods)?;
        for spec in &request.methods {
            self.registry.check(spec, input_kind)?;
        }

        let appended = request.output.exists();
        let mut document = if appended {
            let document = read_artifact(&request.output)?;
            info!(
                path = %request.output.display(),
                entities = document.len(),
                projections = document.projections().len(),
                "stage: load artifact"
            );
            document
        } else {
            Document::new()
        };

        if !request.overwrite {
            if let Some(spec) = request
                .methods
                .iter()
                .find(|spec| document.projection(&spec.projection_name()).is_some())
            {
                return Err(ProtspaceError::DuplicateProjection(spec.projection_name()));
            }
        }

        let aligned = load_aligned(&request.source, request.features.as_deref())?;
        info!(
            entities = aligned.identifiers.len(),
            features = aligned.features.len(),
            "stage: load"
        );

        let projections =
            self.registry
                .project_all(&request.methods, &aligned.input, &self.config.reducer)?;
        info!(projections = projections.len(), "stage: reduce");

        let batch = Batch::from_aligned(aligned, projections);
        let options = MergeOptions {
            overwrite: request.overwrite,
        };
        let report = merge(&mut document, batch, options, &self.config.assigner())?;
        info!(
            added = report.projections_added.len(),
            replaced = report.projections_replaced.len(),
            "stage: merge"
        );

        let overrides_applied = match &request.overrides {
            Some(overrides) if !overrides.is_empty() => overrides.apply(&mut document)?,
            _ => 0,
        };

        self.serializer.write_atomic(&document, &request.output)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            path = %request.output.display(),
            entities = document.len(),
            elapsed_ms,
            "stage: write"
        );

        Ok(PrepareSummary {
            output: request.output.clone(),
            appended,
            merge: report,
            overrides_applied,
            elapsed_ms,
        })
    }

    /// Applies overrides to an existing artifact and writes the result to
    /// `output` (in place when equal to `input`).
    pub fn restyle(
        &self,
        input: &Path,
        overrides: &StyleOverrides,
        output: &Path,
    ) -> Result<usize> {
        let mut document = read_artifact(input)?;
        let report = self.config.assigner().assign(&mut document)?;
        if report.changed() {
            info!(
                colors = report.colors_added,
                shapes = report.shapes_added,
                "backfilled styles before overrides"
            );
        }
        let applied = overrides.apply(&mut document)?;
        self.serializer.write_atomic(&document, output)?;
        info!(path = %output.display(), entries = applied, "stage: write");
        Ok(applied)
    }
}
