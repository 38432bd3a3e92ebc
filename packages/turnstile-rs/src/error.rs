//! Structured error types for turnstile.
//!
//! `StoreError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **User code speaks `anyhow`, the store speaks `StoreError`.**
//!
//! - Thunk bodies, middleware and feature-module loads return `anyhow::Result`
//!   (ergonomic for application code).
//! - Everything the store itself reports back to a caller (timeouts, rejected
//!   tokens, bad configuration) is a `StoreError` variant.
//!
//! # Example
//!
//! ```ignore
//! use turnstile::StoreError;
//!
//! let token = store.dispatch(save.create(draft)).await;
//! match token.outcome().await {
//!     Ok(()) => println!("saved"),
//!     Err(StoreError::Rejected { action_type, reason }) => {
//!         eprintln!("{action_type} was rejected: {reason}");
//!     }
//!     Err(other) => eprintln!("store error: {other}"),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

/// Errors reported by the store and its supporting types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Timed out waiting for the ledger to drain.
    #[error("store did not become idle within {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },

    /// A completion token was settled as rejected.
    #[error("action {action_type} was rejected: {reason}")]
    Rejected {
        /// Type of the rejected action.
        action_type: String,
        /// Reason passed to `reject`.
        reason: String,
    },

    /// An admission strategy name could not be parsed.
    #[error("unknown strategy {value:?} (expected \"exclusive\" or \"concurrent\")")]
    InvalidStrategy {
        /// The rejected input.
        value: String,
    },

    /// A bound creator was looked up by a name that was never bound.
    #[error("no bound action creator named {name:?}")]
    UnknownCreator {
        /// The requested name.
        name: String,
    },

    /// Arguments given to a bound creator did not fit its input type.
    #[error("invalid arguments for {name:?}: {message}")]
    InvalidArguments {
        /// The creator's bound name.
        name: String,
        /// Why the arguments were refused.
        message: String,
    },

    /// Configuration could not be loaded.
    #[error("invalid store configuration: {message}")]
    Config {
        /// What went wrong.
        message: String,
    },
}

impl StoreError {
    /// Returns true if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }

    /// Returns true if this is a rejected token.
    pub fn is_rejected(&self) -> bool {
        matches!(self, StoreError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = StoreError::Timeout {
            duration: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
        assert!(err.is_timeout());
        assert!(!err.is_rejected());
    }

    #[test]
    fn test_rejected_display_names_action() {
        let err = StoreError::Rejected {
            action_type: "SAVE".into(),
            reason: "disk full".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SAVE"));
        assert!(msg.contains("disk full"));
        assert!(err.is_rejected());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = StoreError::InvalidStrategy {
            value: "parallel".into(),
        }
        .into();

        match err.downcast_ref::<StoreError>() {
            Some(StoreError::InvalidStrategy { value }) => assert_eq!(value, "parallel"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
