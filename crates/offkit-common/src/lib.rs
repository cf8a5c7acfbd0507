//! # OffKit Common
//!
//! Shared error types, logging configuration, and retry utilities for the
//! OffKit interception-and-cache engine.
//!
//! ## Features
//!
//! - Unified error type with per-subsystem categories
//! - Logging configuration and setup on top of `tracing`
//! - Retry and timeout helpers for network-bound operations
//! - Result/Option extension traits

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for OffKit.
#[derive(Error, Debug)]
pub enum OffKitError {
    /// Cache store errors (open, write, delete).
    #[error("Store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Network fetch errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Message delivery errors (context gone, port closed).
    #[error("Message error: {message}")]
    Message {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Lifecycle transition errors.
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Deferred task errors.
    #[error("Task error: {message}")]
    Task {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Push delivery errors.
    #[error("Push error: {message}")]
    Push {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OffKitError {
    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// Create a store error with source.
    pub fn store_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a message error.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: None,
        }
    }

    /// Create a task error.
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
            source: None,
        }
    }

    /// Create a push error.
    pub fn push(message: impl Into<String>) -> Self {
        Self::Push {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OffKitError::Network { .. }
                | OffKitError::Task { .. }
                | OffKitError::Timeout(_)
                | OffKitError::Io(_)
        )
    }

    /// Get the error category for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            OffKitError::Store { .. } => "store",
            OffKitError::Network { .. } => "network",
            OffKitError::Message { .. } => "message",
            OffKitError::Lifecycle { .. } => "lifecycle",
            OffKitError::Task { .. } => "task",
            OffKitError::Push { .. } => "push",
            OffKitError::Config { .. } => "config",
            OffKitError::Io(_) => "io",
            OffKitError::Timeout(_) => "timeout",
            OffKitError::Cancelled => "cancelled",
            OffKitError::NotFound(_) => "not_found",
            OffKitError::InvalidArgument(_) => "invalid_argument",
            OffKitError::Internal(_) => "internal",
        }
    }
}

/// Result type alias for OffKit operations.
pub type Result<T> = std::result::Result<T, OffKitError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error, folding it into an internal error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| OffKitError::Internal(format!("{}: {}", message.into(), e)))
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| OffKitError::NotFound(resource.into()))
    }
}
