//! SQLSTATE to domain error mapping.

use domains::DomainError;
use tracing::warn;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const LOCK_NOT_AVAILABLE: &str = "55P03";

fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|c| c.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    sqlstate(error).as_deref() == Some(UNIQUE_VIOLATION)
}

pub(crate) fn is_foreign_key_violation(error: &sqlx::Error) -> bool {
    sqlstate(error).as_deref() == Some(FOREIGN_KEY_VIOLATION)
}

pub(crate) fn is_check_violation(error: &sqlx::Error) -> bool {
    sqlstate(error).as_deref() == Some(CHECK_VIOLATION)
}

/// Fallback mapping once call-site specific codes have been handled.
pub(crate) fn db_err(error: sqlx::Error) -> DomainError {
    match sqlstate(&error).as_deref() {
        Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE) => {
            warn!(%error, "transaction aborted by concurrency control");
            return DomainError::Transient(error.to_string());
        }
        _ => {}
    }
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DomainError::Transient(error.to_string())
        }
        other => DomainError::Internal(other.to_string()),
    }
}
