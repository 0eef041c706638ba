//! Error types for lamad-store

use thiserror::Error;

use crate::db::models::PermissionLevel;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: user {user_id} lacks {required} on {node_id}")]
    Forbidden {
        user_id: String,
        node_id: String,
        required: PermissionLevel,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn forbidden(user_id: &str, node_id: &str, required: PermissionLevel) -> Self {
        Self::Forbidden {
            user_id: user_id.to_string(),
            node_id: node_id.to_string(),
            required,
        }
    }

    /// Stable machine-readable code for callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden { .. } => "forbidden",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may safely retry the operation
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

/// Classify a rusqlite error. Busy and locked databases are transient,
/// everything else is reported as internal.
pub(crate) fn sql_error(context: &str, e: rusqlite::Error) -> StorageError {
    match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            StorageError::StorageUnavailable(format!("{}: {}", context, e))
        }
        _ => StorageError::Internal(format!("{}: {}", context, e)),
    }
}

/// True when the error is a uniqueness or check constraint violation
pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
