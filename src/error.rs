//! Error types shared by the driver contract and the hook layer.

use std::fmt;

use thiserror::Error;

/// Result type alias for driver collaborator calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by a driver object or by the wrapper around it.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver declines to handle this call and asks the caller to take the
    /// generic path instead (e.g. prepare + execute). Not a failure.
    #[error("driver declined the call")]
    Skip,

    /// Named parameters reached a capability that only accepts positional ones.
    #[error("driver does not support named parameters")]
    NamedParameters,

    /// A positional argument ordinal is outside the argument list.
    #[error("argument ordinal {0} out of range")]
    BadOrdinal(usize),

    /// The driver object lacks every variant of a capability.
    #[error("driver does not support {0}")]
    Unsupported(&'static str),

    /// A hook refused or failed the call.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Driver-specific failure.
    #[error("driver error: {0}")]
    Driver(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl DriverError {
    /// Wrap a driver-specific error.
    pub fn driver(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Driver(err.into())
    }

    /// Whether this is the "take the generic path" sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, DriverError::Skip)
    }
}

/// Errors raised inside the instrumentation path itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// A `before` hook refused to let the call reach the driver.
    #[error("call rejected by hook: {0}")]
    Rejected(String),

    /// An `after` hook could not deliver its metrics or logs.
    #[error("observability sink failed: {0}")]
    Sink(String),
}

/// An error the hook layer can observe.
///
/// `on_error` hooks receive errors through this trait so the same hook works
/// for every client library. `is_decline` identifies non-error signals that
/// must never be reported as failures.
pub trait ObservedError: fmt::Display {
    /// Whether the error is a "decline / not found" signal rather than a failure.
    fn is_decline(&self) -> bool {
        false
    }
}

impl ObservedError for DriverError {
    fn is_decline(&self) -> bool {
        self.is_skip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_is_a_decline() {
        assert!(DriverError::Skip.is_decline());
        assert!(!DriverError::NamedParameters.is_decline());
        assert!(!DriverError::driver("connection reset").is_decline());
    }

    #[test]
    fn test_hook_error_converts_transparently() {
        let err: DriverError = HookError::Rejected("read only".into()).into();
        assert_eq!(err.to_string(), "call rejected by hook: read only");
        assert!(matches!(err, DriverError::Hook(HookError::Rejected(_))));
    }
}
