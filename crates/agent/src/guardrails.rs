use concierge_core::errors::FailureKind;

use crate::nodes::NodeFailure;

/// What the runtime does with a failed node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    /// Keep the session; the failing node stays the continuation point.
    Reprompt { reason_code: &'static str, user_message: String },
    /// End the session. Nothing after the failure point runs.
    Abort { reason_code: &'static str, user_message: String },
}

impl GuardrailDecision {
    pub fn user_message(&self) -> &str {
        match self {
            Self::Reprompt { user_message, .. } | Self::Abort { user_message, .. } => user_message,
        }
    }

    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Reprompt { reason_code, .. } | Self::Abort { reason_code, .. } => reason_code,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GuardrailPolicy {
    /// Consecutive extraction failures tolerated before the session is aborted.
    /// `None` never aborts.
    pub max_extraction_retries: Option<u32>,
}

impl GuardrailPolicy {
    pub fn new(max_extraction_retries: Option<u32>) -> Self {
        Self { max_extraction_retries }
    }

    /// `extraction_failures` already counts the failure being evaluated.
    pub fn evaluate(&self, failure: &NodeFailure, extraction_failures: u32) -> GuardrailDecision {
        let kind = failure.kind();
        match kind {
            FailureKind::Extraction => match self.max_extraction_retries {
                Some(limit) if extraction_failures > limit => GuardrailDecision::Abort {
                    reason_code: "extraction_retries_exhausted",
                    user_message: "Sorry, I'm having trouble understanding and can't continue this \
                                   booking. Please start a new session."
                        .to_owned(),
                },
                _ => GuardrailDecision::Reprompt {
                    reason_code: "extraction_failed",
                    user_message: kind.user_message().to_owned(),
                },
            },
            FailureKind::Upstream => GuardrailDecision::Reprompt {
                reason_code: "upstream_failed",
                user_message: kind.user_message().to_owned(),
            },
            FailureKind::Validation => GuardrailDecision::Reprompt {
                reason_code: "validation_failed",
                user_message: kind.user_message().to_owned(),
            },
            FailureKind::CorruptSession => GuardrailDecision::Abort {
                reason_code: "corrupt_session",
                user_message: kind.user_message().to_owned(),
            },
            FailureKind::Config => GuardrailDecision::Abort {
                reason_code: "configuration_error",
                user_message: kind.user_message().to_owned(),
            },
        }
    }
}
