//! Error types for shard migration
//!
//! Two tiers of failures exist:
//!
//! - [`ShardError`] is returned by construction-time operations (filter
//!   building, validation, engine and verifier initialization) and by the
//!   individual collaborator calls.
//! - [`FatalError`] is what [`ShardingOrchestrator::run`] reports. It carries
//!   the [`Stage`] tag the failure was escalated under and the last
//!   [`Phase`] the migration reached before aborting.
//!
//! [`ShardingOrchestrator::run`]: crate::ShardingOrchestrator::run

use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid settings, patterns or table layouts
    Configuration,
    /// Copy/stream engine failures
    Engine,
    /// Verifier failures and data discrepancies
    Verification,
    /// Lock, unlock and error-callback webhooks
    Webhook,
    /// Serialization errors (YAML, JSON)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Shard migration errors
#[derive(Error, Debug)]
pub enum ShardError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// An ignored-table pattern failed to compile
    #[error("Filter error: invalid ignored table pattern '{pattern}': {source}")]
    Filter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Configuration failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Copy/stream engine error
    #[error("Engine error: {0}")]
    Engine(String),

    /// Verifier error
    #[error("Verifier error: {0}")]
    Verifier(String),

    /// The verifier completed but found mismatching rows
    #[error("verifier detected data discrepancy: {0}")]
    DataDiscrepancy(String),

    /// A primary-key table does not have exactly one primary key column
    #[error(
        "table '{table}' has primary key columns {columns:?}; \
         primary key tables must have exactly one primary key column"
    )]
    CompositePrimaryKey { table: String, columns: Vec<String> },

    /// A streamed change moved a row from one shard to another
    #[error("sharding key of {table} changed from {old} to {new}")]
    ShardingKeyChanged {
        table: String,
        old: String,
        new: String,
    },

    /// Throttler error
    #[error("Throttle error: {0}")]
    Throttle(String),

    /// A webhook answered with a non-success status
    #[error("Webhook {uri} returned status {status}")]
    Webhook { uri: String, status: u16 },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Operation attempted in the wrong phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ShardError {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new engine error
    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }

    /// Create a new verifier error
    pub fn verifier(msg: impl Into<String>) -> Self {
        Self::Verifier(msg.into())
    }

    /// Create a new throttle error
    pub fn throttle(msg: impl Into<String>) -> Self {
        Self::Throttle(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::Filter { .. }
            | Self::Validation(_)
            | Self::CompositePrimaryKey { .. } => ErrorCategory::Configuration,
            Self::Engine(_) | Self::Throttle(_) | Self::ShardingKeyChanged { .. } => {
                ErrorCategory::Engine
            }
            Self::Verifier(_) | Self::DataDiscrepancy(_) => ErrorCategory::Verification,
            Self::Webhook { .. } | Self::Http(_) => ErrorCategory::Webhook,
            Self::Yaml(_) | Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) | Self::Io(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Filter { .. } => "filter_error",
            Self::Validation(_) => "validation_error",
            Self::Engine(_) => "engine_error",
            Self::Verifier(_) => "verifier_error",
            Self::DataDiscrepancy(_) => "data_discrepancy",
            Self::CompositePrimaryKey { .. } => "composite_primary_key",
            Self::ShardingKeyChanged { .. } => "sharding_key_changed",
            Self::Throttle(_) => "throttle_error",
            Self::Webhook { .. } => "webhook_status",
            Self::Http(_) => "http_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Io(_) => "io_error",
            Self::Yaml(_) => "yaml_error",
            Self::Json(_) => "json_error",
        }
    }
}

/// Result type for shard migration operations
pub type Result<T> = std::result::Result<T, ShardError>;

/// Tag naming the subsystem a fatal error is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The cutover protocol itself (locking, draining, delta copies)
    Sharding,
    /// The authoritative cutover verification
    IterativeVerifier,
    /// The background bulk copy task
    BulkCopy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sharding => "sharding",
            Self::IterativeVerifier => "iterative_verifier",
            Self::BulkCopy => "bulk_copy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a migration run.
///
/// Once produced the migration is over: no phase is re-entered and nothing is
/// compensated. In particular an external write lock acquired before the
/// failure stays held until an operator releases it.
#[derive(Error, Debug)]
#[error("[{stage}] migration aborted after phase {phase}: {source}")]
pub struct FatalError {
    /// Tag the failure was escalated under
    pub stage: Stage,
    /// Last phase completed before the failure
    pub phase: Phase,
    /// Underlying cause
    #[source]
    pub source: ShardError,
}

impl FatalError {
    pub fn new(stage: Stage, phase: Phase, source: ShardError) -> Self {
        Self {
            stage,
            phase,
            source,
        }
    }

    /// True when the failure happened while the external write lock was held.
    pub fn lock_held(&self) -> bool {
        self.phase.holds_lock()
    }
}
