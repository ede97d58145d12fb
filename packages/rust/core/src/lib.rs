//! Core orchestration for PatternLink.
//!
//! Ties segmentation, similarity scoring, the knowledge store and the oracle
//! together into the linkage resolver and the batch pipeline.

pub mod input;
pub mod pipeline;
pub mod report;
pub mod resolver;

pub use input::{LoadedInputs, load_file, load_inputs};
pub use pipeline::{
    BatchOutput, DocumentFailure, DocumentRecord, PatternRecord, Pipeline, ProgressReporter,
    RunSummary, SilentProgress, VariationRecord,
};
pub use report::{ReportPaths, render_markdown, write_reports};
pub use resolver::{
    AuditEntry, AuditLog, DefaultStage, FuzzyStage, IndexStage, KnowledgeBaseStage, OracleStage,
    ResolutionStage, Resolver, SemanticStage, StageContext, StageMatch,
};
