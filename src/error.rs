use thiserror::Error;

use crate::alert::Severity;
use crate::conversation::ConversationError;
use crate::page::PageError;
use crate::patch::ApplyError;
use crate::sandbox::SandboxError;
use crate::synth::SynthesisError;

/// Why a probe's repair attempt stopped.
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("execution failure: {0}")]
    ExecutionFailure(String),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("apply failure: {0}")]
    ApplyFailure(String),

    #[error("inconclusive judgment: {0}")]
    Inconclusive(String),
}

impl RepairError {
    /// Network and timeout problems are transient; everything else needs a person.
    pub fn severity(&self) -> Severity {
        match self {
            RepairError::NetworkFailure(_) | RepairError::TimeoutExceeded(_) => Severity::Error,
            _ => Severity::Critical,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RepairError::NetworkFailure(_) => "network_failure",
            RepairError::TimeoutExceeded(_) => "timeout_exceeded",
            RepairError::ParseFailure(_) => "parse_failure",
            RepairError::ExecutionFailure(_) => "execution_failure",
            RepairError::ValidationFailure(_) => "validation_failure",
            RepairError::ApplyFailure(_) => "apply_failure",
            RepairError::Inconclusive(_) => "inconclusive",
        }
    }
}

impl From<ConversationError> for RepairError {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::TimeoutExceeded(_) => RepairError::TimeoutExceeded(err.to_string()),
            ConversationError::EmptyReply => RepairError::Inconclusive(err.to_string()),
            _ => RepairError::NetworkFailure(err.to_string()),
        }
    }
}

impl From<PageError> for RepairError {
    fn from(err: PageError) -> Self {
        RepairError::NetworkFailure(err.to_string())
    }
}

impl From<SynthesisError> for RepairError {
    fn from(err: SynthesisError) -> Self {
        RepairError::ParseFailure(err.to_string())
    }
}

impl From<SandboxError> for RepairError {
    fn from(err: SandboxError) -> Self {
        RepairError::ExecutionFailure(err.to_string())
    }
}

impl From<ApplyError> for RepairError {
    fn from(err: ApplyError) -> Self {
        RepairError::ApplyFailure(err.to_string())
    }
}
