//! Common error types for Voice Insight
//!
//! This module defines the error taxonomy shared by the worker manager, its
//! HTTP surface and its client. Every error maps to an HTTP status code so the
//! API layer can surface it without re-classifying.

use thiserror::Error;

/// Main error type for Voice Insight
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Alias not present in the model catalog
    #[error("Model not found: {0}")]
    NotFound(String),

    /// Not enough memory even after evicting every evictable worker
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A spawned worker exited or never became healthy
    #[error("Worker {alias} failed to start: {reason}")]
    StartupFailure {
        alias: String,
        reason: String,
        /// Tail of the worker's combined stdout/stderr
        output: String,
    },

    /// Connection errors talking to the manager or a worker
    #[error("Connection error: {0}")]
    Connection(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ManagerError {
    /// HTTP status code this error is surfaced with
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::NotFound(_) => 404,
            ManagerError::ResourceExhausted(_) => 503,
            ManagerError::Connection(_) => 502,
            ManagerError::StartupFailure { .. }
            | ManagerError::Config(_)
            | ManagerError::Io(_)
            | ManagerError::Internal(_) => 500,
        }
    }

    /// Message for an HTTP error body. Startup failures include the captured
    /// worker output.
    pub fn detail(&self) -> String {
        match self {
            ManagerError::StartupFailure { output, .. } if !output.is_empty() => {
                format!("{}\n{}", self, output)
            }
            _ => self.to_string(),
        }
    }

    /// Rebuild a startup failure from the [`detail`](Self::detail) of one:
    /// the first line carries the reason, the rest is worker output
    pub fn startup_failure_from_detail(alias: impl Into<String>, detail: &str) -> Self {
        let alias = alias.into();
        let (first, output) = detail.split_once('\n').unwrap_or((detail, ""));
        let prefix = format!("Worker {} failed to start: ", alias);
        let reason = first.strip_prefix(prefix.as_str()).unwrap_or(first).to_string();

        ManagerError::StartupFailure {
            alias,
            reason,
            output: output.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ManagerError::Config(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(alias: impl Into<String>) -> Self {
        ManagerError::NotFound(alias.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        ManagerError::ResourceExhausted(msg.into())
    }

    /// Create a startup failure
    pub fn startup_failure(
        alias: impl Into<String>,
        reason: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        ManagerError::StartupFailure {
            alias: alias.into(),
            reason: reason.into(),
            output: output.into(),
        }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        ManagerError::Connection(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ManagerError::Internal(msg.into())
    }
}

/// Result type alias for Voice Insight operations
pub type Result<T> = std::result::Result<T, ManagerError>;
