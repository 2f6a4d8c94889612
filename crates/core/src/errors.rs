use thiserror::Error;

use crate::domain::session::FlowBranch;
use crate::domain::slots::GroupKey;
use crate::flows::FlowError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("flow branch is already `{}` and cannot change to `{}`", .current.as_str(), .requested.as_str())]
    FlowImmutable { current: FlowBranch, requested: FlowBranch },
    #[error("slot group `{group}` is committed and cannot be overwritten")]
    CommittedGroupOverwrite { group: GroupKey },
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failure classes a turn can end in. Each maps to a fixed user-facing message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Extraction,
    Upstream,
    Validation,
    CorruptSession,
    Config,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Upstream => "upstream",
            Self::Validation => "validation",
            Self::CorruptSession => "corrupt_session",
            Self::Config => "config",
        }
    }

    /// Whether the session stays resumable after this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Extraction | Self::Upstream | Self::Validation)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Extraction => {
                "Sorry, I didn't quite catch that. Could you rephrase or add a bit more detail?"
            }
            Self::Upstream => {
                "Sorry, the booking system isn't responding right now. Please send any message \
                 to try again."
            }
            Self::Validation => "Some of those details don't look right. Please check them.",
            Self::CorruptSession => {
                "Sorry, something went wrong with this conversation and I can't continue it. \
                 Please start a new session."
            }
            Self::Config => "The booking assistant is not configured correctly.",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "No session exists with that id.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(_) => Self::BadRequest {
                message: "domain validation failed".to_owned(),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::NotFound(message) => {
                Self::NotFound { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
