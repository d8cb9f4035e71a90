use thiserror::Error;

use crate::security::Severity;

#[derive(Debug, Error)]
pub enum LoomError {
    // Graph errors
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("No implementation registered for node: {0}")]
    NoImplementation(String),

    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Node panicked: {0}")]
    NodePanic(String),

    #[error("Edge decision failed: {edge}: {message}")]
    EdgeDecision { edge: String, message: String },

    // Runtime errors
    #[error("Entry point not found: {0}")]
    EntryPointNotFound(String),

    #[error("Entry point already registered: {0}")]
    EntryPointExists(String),

    #[error("Runtime is running; entry points can only change while stopped")]
    RuntimeRunning,

    #[error("Runtime is not running")]
    RuntimeNotRunning,

    #[error("Execution stream not running: {0}")]
    StreamNotRunning(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Security errors
    #[error("Input rejected by security policy: {label} ({severity})")]
    SecurityViolation { label: String, severity: Severity },

    #[error("Input payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LoomError>;
