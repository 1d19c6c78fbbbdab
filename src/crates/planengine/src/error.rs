//! Top-level error type for the plan execution engine.

use thiserror::Error;

/// Result type used throughout `planengine`.
pub type Result<T> = std::result::Result<T, PlanEngineError>;

/// Errors surfaced by the engine's core subsystems.
///
/// Handlers and internal helpers prefer narrower, local error types (see
/// [`crate::commit_graph::CommitGraphError`], [`crate::api::error::ApiError`])
/// and convert into this one at subsystem boundaries.
#[derive(Debug, Error)]
pub enum PlanEngineError {
    /// The plan generator or parser could not produce a usable plan.
    #[error("plan unavailable: {0}")]
    PlanUnavailable(String),

    /// A step handler failed; carries the failing instruction's context.
    #[error("step {seq_no} ({instruction}) failed: {message}")]
    StepFailed {
        seq_no: i64,
        instruction: String,
        message: String,
    },

    /// The requested task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The requested branch does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// The requested commit does not exist.
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// A tool referenced by a plan step is not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Underlying commit graph failure.
    #[error("commit graph error: {0}")]
    CommitGraph(#[from] crate::commit_graph::CommitGraphError),

    /// Underlying LLM provider failure.
    #[error("llm error: {0}")]
    Llm(#[from] llm::LlmError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A task operation was attempted while another was already in flight.
    #[error("task {0} is busy")]
    TaskBusy(String),

    /// Generic I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for conditions that don't warrant a dedicated variant.
    #[error("{0}")]
    Other(String),
}
