//! Named failures that callers are expected to match on.
//!
//! Everything else travels as [`anyhow::Error`] with context attached at
//! the call site.

/// Errors with a stable identity across the crate boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A migration would change the embedding column type, which wipes
    /// stored vectors, and the operator did not consent.
    #[error(
        "embedding dimensions changed ({from} -> {to}), but clearing embedding is not allowed; \
         rerun with --allow-clear-embedding"
    )]
    NotAllowedToClearEmbedding { from: String, to: String },

    #[error("unknown embedding provider: {0}")]
    UnknownProvider(String),

    /// A provider returned vectors of a different length than configured.
    #[error("embedding dimensions mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding count mismatch: sent {expected} texts, got {actual} vectors")]
    EmbeddingCountMismatch { expected: usize, actual: usize },

    #[error("unknown dialog type: {0}")]
    UnknownDialogType(String),

    #[error("dialog {0} already exists")]
    DialogExists(i64),

    #[error("dialog {0} not found")]
    DialogNotFound(i64),

    /// A peer or dialog id falls outside the range the bot-API id space
    /// can represent.
    #[error("peer id {0} is out of range")]
    InvalidPeerId(i64),
}
