//! Error types for the replicated storage orchestrator
//!
//! Provides structured error types for the controller (reconciliation,
//! placement, persistence, security) and the satellite (device layers).

use crate::domain::api_rc::{codes, RcEntry};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Layer Failure
// =============================================================================

/// Failure raised by a device layer, carrying the texts that end up in a
/// structured result entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerFailure {
    /// Short description of what went wrong
    pub message: String,
    /// Why it went wrong
    pub cause: Option<String>,
    /// What the operator can do about it
    pub correction: Option<String>,
    /// Additional details (command output, device paths, ...)
    pub details: Option<String>,
}

impl LayerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
            correction: None,
            details: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_correction(mut self, correction: impl Into<String>) -> Self {
        self.correction = Some(correction.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for LayerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

// =============================================================================
// Error
// =============================================================================

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    /// A condition that must be unreachable was reached
    #[error("Implementation error: {0}")]
    ImplementationError(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Security Errors
    // =========================================================================
    #[error("Access denied: {operation}")]
    AccessDenied { operation: String, code: u64 },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database load failed for table {table}: {reason}")]
    DatabaseLoad { table: String, reason: String },

    // =========================================================================
    // Device Layer Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(LayerFailure),

    #[error("Resource layer error: {0}")]
    ResourceLayer(LayerFailure),

    #[error("Volume layer error: {0}")]
    VolumeLayer(LayerFailure),

    #[error("Invalid layer stack: {0}")]
    LayerStack(String),

    // =========================================================================
    // API Errors
    // =========================================================================
    /// Rejection of an API-level operation (conflicting state, missing objects)
    #[error("API call rejected: {0}")]
    ApiRc(Box<RcEntry>),

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid property {key}: {reason}")]
    InvalidProperty { key: String, reason: String },

    #[error("Node not found: {name}")]
    NodeNotFound { name: String },

    #[error("Resource definition not found: {name}")]
    ResourceDefinitionNotFound { name: String },

    #[error("Resource group not found: {name}")]
    ResourceGroupNotFound { name: String },

    #[error("Resource not found: {rsc_name} on node {node_name}")]
    ResourceNotFound { rsc_name: String, node_name: String },

    #[error("Storage pool not found: {pool_name} on node {node_name}")]
    StorPoolNotFound { pool_name: String, node_name: String },

    // =========================================================================
    // Satellite Communication Errors
    // =========================================================================
    #[error("Satellite not connected: {node}")]
    SatelliteNotConnected { node: String },

    #[error("Satellite response timeout: {node} after {timeout:?}")]
    SatelliteTimeout { node: String, timeout: Duration },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid IP address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap an API rejection entry
    pub fn api_rc(entry: RcEntry) -> Self {
        Error::ApiRc(Box::new(entry))
    }

    /// Shorthand for an access denial on a named operation
    pub fn access_denied(operation: impl Into<String>, code: u64) -> Self {
        Error::AccessDenied {
            operation: operation.into(),
            code,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Database(_)
            | Error::SatelliteNotConnected { .. }
            | Error::SatelliteTimeout { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Conflicting concurrent state - try again next cycle
            Error::ApiRc(_) => ErrorAction::RequeueAfter(Duration::from_secs(10)),

            // Device trouble - medium retry
            Error::Storage(_) | Error::ResourceLayer(_) | Error::VolumeLayer(_) => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            // Configuration/validation/defects - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidName(_)
            | Error::InvalidProperty { .. }
            | Error::InvalidAddress(_)
            | Error::LayerStack(_)
            | Error::AccessDenied { .. }
            | Error::ImplementationError(_)
            | Error::DatabaseLoad { .. } => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::SatelliteNotConnected { .. }
                | Error::SatelliteTimeout { .. }
        )
    }

    /// Errors that must never surface while a satellite processes resources.
    /// The device manager runs with full privileges and does not touch the
    /// database, so seeing one of these there means a bug.
    pub fn is_implementation_error(&self) -> bool {
        matches!(
            self,
            Error::AccessDenied { .. }
                | Error::Database(_)
                | Error::DatabaseLoad { .. }
                | Error::ImplementationError(_)
        )
    }

    /// The layer failure carried by device layer errors
    pub fn layer_failure(&self) -> Option<&LayerFailure> {
        match self {
            Error::Storage(f) | Error::ResourceLayer(f) | Error::VolumeLayer(f) => Some(f),
            _ => None,
        }
    }

    /// Structured result entry reporting this error
    pub fn to_rc_entry(&self) -> RcEntry {
        fn layer_entry(code: u64, failure: &LayerFailure) -> RcEntry {
            RcEntry::new(code, failure.message.clone())
                .with_cause(failure.cause.clone())
                .with_correction(failure.correction.clone())
                .with_details(failure.details.clone())
        }

        match self {
            Error::ApiRc(entry) => (**entry).clone(),
            Error::Storage(f) => layer_entry(codes::FAIL_STOR_LAYER, f),
            Error::ResourceLayer(f) => layer_entry(codes::FAIL_RSC_LAYER, f),
            Error::VolumeLayer(f) => layer_entry(codes::FAIL_VLM_LAYER, f),
            Error::LayerStack(_) => RcEntry::new(codes::FAIL_INVLD_LAYER_STACK, self.to_string()),
            Error::AccessDenied { code, .. } => RcEntry::new(*code, self.to_string()),
            Error::Database(_) | Error::DatabaseLoad { .. } => {
                RcEntry::new(codes::FAIL_SQL, self.to_string())
            }
            Error::NodeNotFound { .. } => RcEntry::new(codes::FAIL_NOT_FOUND_NODE, self.to_string()),
            Error::ResourceDefinitionNotFound { .. } => {
                RcEntry::new(codes::FAIL_NOT_FOUND_RSC_DFN, self.to_string())
            }
            Error::ResourceNotFound { .. } => {
                RcEntry::new(codes::FAIL_NOT_FOUND_RSC, self.to_string())
            }
            Error::StorPoolNotFound { .. } => {
                RcEntry::new(codes::FAIL_NOT_FOUND_STOR_POOL, self.to_string())
            }
            Error::SatelliteNotConnected { .. } | Error::SatelliteTimeout { .. } => {
                RcEntry::new(codes::FAIL_NOT_CONNECTED, self.to_string())
            }
            _ => RcEntry::new(codes::FAIL_UNKNOWN_ERROR, self.to_string()),
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::api_rc(RcEntry::new(codes::FAIL_EXISTS_RSC, "exists"));
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(10))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Storage(LayerFailure::new("lvcreate failed"));
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::SatelliteNotConnected {
            node: "alpha".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let denied = Error::access_denied("accessing flags of rsc", codes::FAIL_ACC_DENIED_RSC_DFN);
        assert!(!denied.is_retryable());
        assert!(!denied.is_transient());
    }

    #[test]
    fn test_implementation_error_classification() {
        assert!(Error::Database("constraint violated".into()).is_implementation_error());
        assert!(Error::access_denied("x", 0).is_implementation_error());
        assert!(!Error::Storage(LayerFailure::new("x")).is_implementation_error());
        assert!(!Error::VolumeLayer(LayerFailure::new("x")).is_implementation_error());
    }

    #[test]
    fn test_layer_failure_builder() {
        let failure = LayerFailure::new("Failed to create volume")
            .with_cause("volume group full")
            .with_correction("extend the volume group")
            .with_details("vg0: 0 free extents");

        let err = Error::Storage(failure.clone());
        assert_eq!(err.layer_failure(), Some(&failure));
        assert_eq!(err.to_string(), "Storage error: Failed to create volume");

        let entry = err.to_rc_entry();
        assert_eq!(entry.return_code, codes::FAIL_STOR_LAYER);
        assert_eq!(entry.cause.as_deref(), Some("volume group full"));
        assert_eq!(entry.correction.as_deref(), Some("extend the volume group"));
        assert_eq!(entry.details.as_deref(), Some("vg0: 0 free extents"));
    }

    #[test]
    fn test_rc_entry_codes() {
        let denied = Error::access_denied("x", codes::FAIL_ACC_DENIED_RSC);
        assert_eq!(denied.to_rc_entry().return_code, codes::FAIL_ACC_DENIED_RSC);

        let timeout = Error::SatelliteTimeout {
            node: "alpha".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.to_rc_entry().return_code, codes::FAIL_NOT_CONNECTED);
        assert!(Error::Internal("x".into()).to_rc_entry().is_error());
    }
}
