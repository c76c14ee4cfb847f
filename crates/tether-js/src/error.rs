//! Error Types
//!
//! Script exceptions are translated into [`JsError`] before they leave the engine;
//! everything else a caller can get wrong surfaces as an [`EngineError`] variant.

use serde::Serialize;
use thiserror::Error;

/// Message reported when execution was forcibly stopped.
pub const TERMINATED_MESSAGE: &str = "ExecutionTerminated: script execution has been terminated";

/// JavaScript exception captured at the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{message}")]
pub struct JsError {
    /// Stringified thrown value
    pub message: String,

    /// `resource:line:column` of the throw site, when the engine could resolve it
    pub location: Option<String>,

    /// Stack trace captured by the engine
    pub stack: Option<String>,
}

impl JsError {
    /// Error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
            stack: None,
        }
    }

    /// The termination sentinel.
    pub fn terminated() -> Self {
        Self::new(TERMINATED_MESSAGE)
    }

    /// True if this error reports forced termination.
    pub fn is_terminated(&self) -> bool {
        self.message == TERMINATED_MESSAGE && self.location.is_none() && self.stack.is_none()
    }
}

/// Engine operation error
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("JavaScript error: {0}")]
    Js(#[from] JsError),

    #[error("engine has been disposed")]
    Disposed,

    #[error("context {0} has been disposed")]
    ContextDisposed(u64),

    #[error("value {0} has been released")]
    Released(u64),

    #[error("handle belongs to a different engine")]
    ForeignEngine,

    #[error("{0} is not allowed while a script is executing")]
    Reentrant(&'static str),

    #[error("expected {expected}, found {found}")]
    Type {
        expected: &'static str,
        found: String,
    },

    #[error("engine setup failed: {0}")]
    Setup(String),
}

impl EngineError {
    /// The script exception, if this error carries one.
    pub fn js(&self) -> Option<&JsError> {
        match self {
            EngineError::Js(err) => Some(err),
            _ => None,
        }
    }

    /// True if the operation was cut short by a termination request.
    pub fn is_terminated(&self) -> bool {
        self.js().is_some_and(JsError::is_terminated)
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_sentinel() {
        let err = JsError::terminated();
        assert!(err.is_terminated());
        assert_eq!(err.to_string(), TERMINATED_MESSAGE);

        let located = JsError {
            location: Some("t.js:1:1".into()),
            ..JsError::terminated()
        };
        assert!(!located.is_terminated());
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::from(JsError::new("boom"));
        assert_eq!(err.to_string(), "JavaScript error: boom");
        assert_eq!(err.js().map(|e| e.message.as_str()), Some("boom"));
        assert!(EngineError::Disposed.js().is_none());
        assert_eq!(EngineError::Released(3).to_string(), "value 3 has been released");
    }
}
