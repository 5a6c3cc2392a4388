//! Saga error types.

use fleetpatch_state::StateError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A step that ran out of attempts or hit a non-retryable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("step {step} failed after {attempts_made} attempt(s): {last_error}")]
pub struct StepFailure {
    /// Journal key of the failed step.
    pub step: String,
    pub last_error: String,
    pub attempts_made: u32,
    /// True when the failure ended retries before the policy was exhausted.
    pub non_retryable: bool,
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Failed(StepFailure),

    #[error("step {step} rejected its input: {message}")]
    HardFault { step: String, message: String },

    #[error("step {step} abandoned: campaign terminated")]
    Terminated { step: String },

    #[error("step {step} output could not be journaled: {message}")]
    Codec { step: String, message: String },

    #[error("journal error: {0}")]
    Journal(#[from] StateError),
}

impl StepError {
    pub fn is_terminated(&self) -> bool {
        matches!(self, StepError::Terminated { .. })
    }
}

pub type StepResult<T> = Result<T, StepError>;

/// Why a campaign did not complete.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("approval not received within {timeout_secs}s")]
    ApprovalTimedOut { timeout_secs: u64 },

    #[error("credential fetch failed: {0}")]
    Credentials(StepError),

    #[error("campaign terminated: {reason}")]
    Terminated { reason: String },

    #[error("journal error: {0}")]
    Journal(#[from] StateError),
}

pub type SagaResult<T> = Result<T, SagaError>;

/// Errors surfaced by the campaign engine's control operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("campaign {0} is already running")]
    AlreadyRunning(String),

    #[error("campaign not found: {0}")]
    NotFound(String),

    #[error("campaign {0} is not running")]
    NotRunning(String),

    #[error("invalid campaign: {0}")]
    InvalidSpec(String),

    #[error("state error: {0}")]
    State(#[from] StateError),
}

pub type EngineResult<T> = Result<T, EngineError>;
