//! Harvester error types
//!
//! Two layers of failure reporting: classified connection errors, which are
//! returned as data from [`crate::ConnectionManager::open`] rather than
//! raised, and query-level errors with transient/fatal classification for
//! retry logic.

use serde::Serialize;
use thiserror::Error;

/// Classified connection-establishment failures.
///
/// Returned as the keys of the error map from `ConnectionManager::open`.
/// These are never raised as control flow; the caller inspects the map and
/// decides how to surface them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ConnectionErrorKind {
    /// Connect attempt exceeded the configured timeout.
    Timeout,
    /// Hostname did not resolve.
    UnknownHost,
    /// Other communication failure while establishing the session.
    CommunicationOther,
    /// The server rejected the requested authentication mechanism.
    AuthenticationUnsupported,
    /// Invalid credentials.
    AuthenticationFailed,
    /// LDAP protocol violation during connect, bind, or paging setup.
    ProtocolError,
    /// I/O failure while arming the paging control.
    IoError,
}

impl ConnectionErrorKind {
    /// Stable code for classification in logs and UI.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            ConnectionErrorKind::Timeout => "CONNECTION_TIMEOUT",
            ConnectionErrorKind::UnknownHost => "UNKNOWN_HOST",
            ConnectionErrorKind::CommunicationOther => "COMMUNICATION_OTHER",
            ConnectionErrorKind::AuthenticationUnsupported => "AUTHENTICATION_UNSUPPORTED",
            ConnectionErrorKind::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ConnectionErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ConnectionErrorKind::IoError => "IO_ERROR",
        }
    }
}

impl std::fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.error_code())
    }
}

/// Error that can occur while running a directory query.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Communication dropped mid-query; the whole query may be retried.
    #[error("directory temporarily unavailable: {message}")]
    TransientUnavailable {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Protocol violation fatal for this call (bad filter, unsupported
    /// scope, entry-resolution failure).
    #[error("protocol failure: {message}")]
    ProtocolFailure {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Programmer error: an operation was invoked out of sequence.
    #[error("invalid state: {message}")]
    InvalidState { message: String },
}

impl HarvestError {
    /// Check if this error is transient and the query should be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, HarvestError::TransientUnavailable { .. })
    }

    /// Create a transient-unavailability error.
    pub fn transient(message: impl Into<String>) -> Self {
        HarvestError::TransientUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transient-unavailability error with source.
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        HarvestError::TransientUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a protocol-failure error.
    pub fn protocol(message: impl Into<String>) -> Self {
        HarvestError::ProtocolFailure {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol-failure error with source.
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        HarvestError::ProtocolFailure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        HarvestError::InvalidState {
            message: message.into(),
        }
    }
}

/// Result type for harvester operations.
pub type HarvestResult<T> = Result<T, HarvestError>;
