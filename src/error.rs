//! Error taxonomy of the execution engine.

/// Errors produced by the engine.
///
/// Only [`EngineError::Validation`] and [`EngineError::RuntimeUnavailable`] are
/// checked before a sandbox exists. Everything else is converted into an
/// [`crate::request::ExecutionResponse`] at the coordinator boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    #[error("execution exited with code {exit_code}")]
    ExecutionFailure { exit_code: i32 },

    #[error("execution timed out after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("metrics collection failed: {0}")]
    MetricsCollection(String),

    #[error("sandbox cleanup failed: {0}")]
    Cleanup(String),

    #[error("internal engine failure: {0}")]
    Internal(String),

    #[error("invalid engine configuration: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Text carried by a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
