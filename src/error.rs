//! Error taxonomy for user-visible failures.
//!
//! Most internal plumbing propagates `anyhow::Error`; this enum exists for
//! the failure classes that change what the *user* is told: bad input gets
//! the expected syntax, missing names get a not-found notice, and
//! everything else is reported generically while the detail goes to the
//! log.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChimeError {
    /// Malformed user input (non-positive duration, bad clock string).
    /// Rejected at the command boundary before any side effect; the
    /// message describes the expected syntax.
    #[error("{0}")]
    Validation(String),

    /// Cancel or lookup on a name that does not exist. No side effect.
    #[error("not found: {0}")]
    NotFound(String),

    /// A model, store, or transport call failed. Already-persisted state
    /// is left intact.
    #[error("service failure: {0}")]
    Transient(String),

    /// Unknown tool name or arguments that do not match the advertised
    /// schema. Unreachable at runtime once the registry validates at
    /// startup, so this is a programming error, not a user error.
    #[error("contract violation: {0}")]
    Contract(String),

    /// The durable store is unavailable. Fatal at boot; degraded
    /// (in-memory only, warned) at runtime.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl ChimeError {
    /// Text safe to show the user for this failure class. Validation and
    /// not-found messages are relayed verbatim; internal failures are
    /// reported generically.
    pub fn user_message(&self) -> String {
        match self {
            ChimeError::Validation(m) => m.clone(),
            ChimeError::NotFound(m) => format!("Not found: {m}"),
            _ => "Something went wrong on my side, please try again.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_is_verbatim() {
        let e = ChimeError::Validation("minutes must be a positive number".into());
        assert_eq!(e.user_message(), "minutes must be a positive number");
    }

    #[test]
    fn internal_errors_are_generic() {
        let e = ChimeError::Transient("connection refused".into());
        assert!(!e.user_message().contains("connection refused"));
    }
}
