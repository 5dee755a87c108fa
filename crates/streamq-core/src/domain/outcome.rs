//! Outcome model: what a handler reports back for one attempt.
//!
//! `Outcome::Failure` is an *expected* task failure (the handler decided the
//! work did not succeed). Unexpected problems travel as `HandlerError`
//! instead; both end up in the retry engine, but they are logged differently.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure { reason: String },
}

impl Outcome {
    pub fn success() -> Self {
        Self::Success
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}
