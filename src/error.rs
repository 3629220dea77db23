//! Crate-wide error type.

/// Errors surfaced by tool dispatch, document mutation, and the backends.
///
/// Nothing in the completion loop catches these: a failure during a sweep
/// aborts the scheduler and terminates the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for tool {tool}: {source}")]
    InvalidArguments {
        tool: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("named range not found: {0}")]
    RangeNotFound(String),

    #[error("template copy failed: {0}")]
    TemplateCopyFailed(String),

    #[error("document update failed: {0}")]
    StructuralUpdateFailed(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
