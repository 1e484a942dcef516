//! Error types for hierarchy mutations and the notification pipeline.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy for the hierarchy engine.
///
/// Only failures that abort the surrounding mutation live here. Degraded
/// secondary work (a failed designation renumbering, a lost push delivery)
/// is logged at the call site and deliberately has no variant: the primary
/// write must never fail because of it.
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════
    // Rejected before any write
    // ═══════════════════════════════════════════════════════════
    /// A required field is missing or malformed.
    #[error("Invalid {field}: {reason}")]
    Validation {
        /// Field that failed validation
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The actor lacks permission on the project or node.
    #[error("Access denied")]
    AccessDenied,

    /// A referenced entity does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind (e.g. "project", "ouvrage")
        kind: &'static str,
        /// Identifier that was looked up
        id: i64,
    },

    // ═══════════════════════════════════════════════════════════
    // Aborted mid-transaction
    // ═══════════════════════════════════════════════════════════
    /// An identifier collision could not be resolved within the
    /// transaction, or a node is still referenced elsewhere.
    #[error("Conflict: {0}")]
    Conflict(String),

    // ═══════════════════════════════════════════════════════════
    // System errors
    // ═══════════════════════════════════════════════════════════
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),
}

impl EngineError {
    /// Shorthand for a [`EngineError::Validation`] error.
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`EngineError::NotFound`] error.
    #[must_use]
    pub const fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    /// Returns `true` if this error is due to invalid caller input rather
    /// than an internal failure.
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::AccessDenied | Self::NotFound { .. }
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::Database("row not found".to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}
