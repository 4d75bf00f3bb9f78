//! The draft pipeline: runs, artifacts, stages, the revision loop and the
//! orchestrator that sequences them.

pub mod artifact;
pub mod context;
pub mod db;
pub mod evaluation;
pub mod job;
pub mod orchestrator;
pub mod revision;
pub mod stages;
pub mod store;

pub use artifact::{MAX_ARTIFACT_BYTES, Stage, cap_payload, write_artifact};
pub use context::{ChunkCache, InMemoryChunkCache, NoChunkCache};
pub use evaluation::{DraftEvaluator, Evaluation, EvaluationError};
pub use job::DraftPipelineHandler;
pub use orchestrator::{
    FinalDraft, PipelineDeps, PipelineError, PipelineOrchestrator, PipelineOutcome, PipelineSettings, RunDecision,
    decide,
};
pub use revision::{DraftReviser, LoopOutcome, LoopSettings, RevisionLoop};
pub use stages::{DraftStages, PromptStages, RunContext, StageError};
pub use store::{InMemoryPipelineStore, PipelineStore};
