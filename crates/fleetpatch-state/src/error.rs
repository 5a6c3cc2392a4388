//! Error types for the campaign journal.

use thiserror::Error;

/// Result type alias for journal operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open journal: {0}")]
    Open(String),

    /// A redb transaction, table, read, or write failed.
    #[error("journal {stage} failed: {message}")]
    Storage {
        stage: &'static str,
        message: String,
    },

    #[error("cannot encode journal entry {key}: {message}")]
    Encode { key: String, message: String },

    /// A stored value no longer decodes into its record type.
    #[error("corrupt journal entry {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),
}

impl StateError {
    /// Whether the error only says the campaign does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::CampaignNotFound(_))
    }
}
