mod config;
mod document;
mod error;
mod ingest;
mod inspect;
mod merge;
mod natural;
mod overrides;
mod palette;
mod pipeline;
pub mod reducer;
mod serializer;
mod shape;
mod structure;
mod style;

pub use config::{ProtspaceConfig, DEFAULT_CONFIG, RANDOM_STATE_ENV};
pub use document::{
    Coordinates, Dimensions, Document, FeatureValue, LegendEntry, Projection, ProjectionInfo,
    MISSING_KEY,
};
pub use error::{IdentifierDiff, ProtspaceError, Result};
pub use ingest::{
    align, load_aligned, load_embeddings, load_features, load_matrix, AlignedInput,
    EmbeddingTable, FeatureTable, InputSource, MatrixTable, IDENTIFIER_COLUMN,
};
pub use inspect::{FeatureSummary, Inspection, ProjectionSummary};
pub use merge::{merge, Batch, MergeOptions, MergeReport};
pub use natural::{natural_cmp, natural_sort};
pub use overrides::{FeatureOverride, StyleOverrides};
pub use palette::{family_shades, qualitative_for, Rgb, Rgba, MISSING_COLOR, QUALITATIVE};
pub use pipeline::{Pipeline, PrepareRequest, PrepareSummary};
pub use reducer::{
    InputKind, MatrixKind, MethodSpec, Metric, Reducer, ReducerInput, ReducerParams,
    ReducerRegistry, Reduction,
};
pub use serializer::{parse_artifact, read_artifact, ArtifactSerializer, SerializerConfig};
pub use shape::{MarkerShape, ShapePool, ALL_SHAPES};
pub use structure::{match_structure_files, structure_key, structure_stem, StructureMatches};
pub use style::{
    CycleOrder, Hierarchy, Placement, StyleAssigner, StylePolicy, StyleReport, StyleState,
};
