//! Error type shared by the bridge components.

/// Errors raised by the execution/comm bridge.
///
/// Every variant is terminal for the operation that produced it and never
/// fatal to the process. Callers log and move on.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("kernel not initialized")]
    KernelNotInitialized,

    #[error("output not initialized")]
    OutputNotInitialized,

    #[error("no editor mounted")]
    EditorNotMounted,

    #[error("output sink was taken by another execution before {0} could bind")]
    OutputSuperseded(String),

    #[error("kernel connection closed")]
    ConnectionClosed,

    #[error("comm {0} is closed")]
    CommClosed(String),

    #[error("malformed widget state: {0}")]
    MalformedWidgetState(String),

    #[error("widget runtime rejected state: {0}")]
    WidgetRuntime(String),

    #[error("failed to build {msg_type} message: {reason}")]
    Protocol { msg_type: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_messages() {
        assert_eq!(
            BridgeError::KernelNotInitialized.to_string(),
            "kernel not initialized"
        );
        assert_eq!(
            BridgeError::OutputNotInitialized.to_string(),
            "output not initialized"
        );
    }

    #[test]
    fn test_json_error_converts() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let bridge: BridgeError = err.into();
        assert!(matches!(bridge, BridgeError::Json(_)));
    }
}
