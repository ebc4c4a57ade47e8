// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every stage of the pipeline: sampling, broker transport,
// publishing, configuration and startup.
// ============================================================================

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Core Agent Errors
// ----------------------------------------------------------------------------

/// Fatal startup errors. Anything raised once the loop is running is handled
/// per category and never reaches this type.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unable to reach broker at '{address}': {reason}")]
    StartupConnectivity { address: String, reason: String },

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl AgentError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::StartupConnectivity { .. } => "startup",
            AgentError::Logging(_) => "logging",
        }
    }

    pub fn startup_connectivity(address: impl Into<String>, reason: impl ToString) -> Self {
        AgentError::StartupConnectivity {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String, source: Option<Box<dyn StdError + Send + Sync>> },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn parse_error<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConfigError::ParseError {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

// ----------------------------------------------------------------------------
// Sampling Errors
// ----------------------------------------------------------------------------

/// Errors raised while reading OS counters. Both kinds are scoped to a single
/// category and a single cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("Permission denied reading {resource}")]
    PermissionDenied { resource: String },

    #[error("Counters unavailable for {resource}: {reason}")]
    CollectionUnavailable { resource: String, reason: String },
}

impl SampleError {
    pub fn permission_denied(resource: impl Into<String>) -> Self {
        SampleError::PermissionDenied {
            resource: resource.into(),
        }
    }

    pub fn unavailable(resource: impl Into<String>, reason: impl ToString) -> Self {
        SampleError::CollectionUnavailable {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Classify an I/O failure on `resource`.
    pub fn from_io(resource: impl Into<String>, error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => SampleError::permission_denied(resource),
            _ => SampleError::unavailable(resource, error),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SampleError::PermissionDenied { .. } => "permission_denied",
            SampleError::CollectionUnavailable { .. } => "collection_unavailable",
        }
    }
}

// ----------------------------------------------------------------------------
// Broker Errors
// ----------------------------------------------------------------------------

/// Errors reported by a broker client
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Broker rejected message: {reason}")]
    Rejected { reason: String },

    #[error("Broker connection lost: {reason}")]
    Disconnected { reason: String },

    #[error("Broker IO error: {0}")]
    Io(#[from] io::Error),
}

impl BrokerError {
    /// Only timeouts are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Timeout { .. })
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        BrokerError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        BrokerError::Rejected {
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl ToString) -> Self {
        BrokerError::Disconnected {
            reason: reason.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Publish Errors
// ----------------------------------------------------------------------------

/// Why a publish call ended in the `Failed` state
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Serialization failed for channel '{channel}': {message}")]
    Serialization { channel: String, message: String },

    #[error("Timed out sending to channel '{channel}' after {attempts} attempts")]
    SendTimeout { channel: String, attempts: u32 },

    #[error("Broker error on channel '{channel}': {source}")]
    Broker {
        channel: String,
        #[source]
        source: BrokerError,
    },
}

// ----------------------------------------------------------------------------
// Result Aliases
// ----------------------------------------------------------------------------

pub type AgentResult<T> = Result<T, AgentError>;
pub type SampleResult<T> = Result<T, SampleError>;
pub type BrokerResult<T> = Result<T, BrokerError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
