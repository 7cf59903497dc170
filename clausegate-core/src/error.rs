//! Error types for the ClauseGate core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering admission, work-unit execution, collaborators, analysis
//! backends, and configuration.

use std::path::PathBuf;

/// Top-level error type for the ClauseGate core library.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error("Request queue is full ({capacity} waiting)")]
    QueueFull { capacity: usize },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Work unit timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Work unit {request_id} panicked")]
    WorkUnitPanicked { request_id: String },

    #[error("Work unit {request_id} was dropped before settling")]
    WorkUnitDropped { request_id: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors reported by a registered model-manager collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("Memory optimization failed for '{model}': {message}")]
    OptimizationFailed { model: String, message: String },

    #[error("Model '{model}' is not loaded")]
    NotLoaded { model: String },
}

/// Errors from an analysis backend (local model or remote API).
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error("Backend '{backend}' request failed: {message}")]
    Backend { backend: String, message: String },

    #[error("Backend '{backend}' is unavailable")]
    Unavailable { backend: String },

    #[error("No analysis backend available: {message}")]
    NoBackend { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {}", problems.join("; "))]
    Invalid { problems: Vec<String> },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `GovernorError`.
pub type Result<T> = std::result::Result<T, GovernorError>;
