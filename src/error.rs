//! Error types for tessera units.

use std::any::Any;

/// Error type returned by event handlers.
///
/// Handlers may fail with any error; the pipeline boxes it and reports it on
/// the unit's error channel without stopping dispatch.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for event handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// Result type for unit operations.
pub type Result<T> = std::result::Result<T, UnitError>;

/// Errors reported by a unit.
///
/// Handler failures are non-fatal and only ever surface on the error channel.
/// Pipeline failures close the unit.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    /// A handler returned an error.
    #[error("handler for '{kind}' failed: {source}")]
    Handler {
        kind: String,
        #[source]
        source: HandlerError,
    },

    /// A handler panicked while being invoked or polled.
    #[error("handler for '{kind}' panicked: {message}")]
    HandlerPanicked { kind: String, message: String },

    /// The classification machinery failed. Always fatal.
    #[error("dispatch pipeline failed: {0}")]
    Pipeline(String),

    /// The unit has been closed.
    #[error("unit is closed")]
    Closed,
}

impl UnitError {
    /// Returns true if this error closed the unit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, UnitError::Pipeline(_))
    }

    /// Returns the event kind of the failing handler, if any.
    pub fn kind(&self) -> Option<&str> {
        match self {
            UnitError::Handler { kind, .. } | UnitError::HandlerPanicked { kind, .. } => {
                Some(kind)
            }
            _ => None,
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
