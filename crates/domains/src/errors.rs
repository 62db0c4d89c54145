//! # DomainError
//!
//! Centralized error handling for the hyperlocal engine.
//! Every failure an engine operation can surface maps to exactly one
//! [`ErrorKind`], which is what callers branch on.

use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Auth,
    Forbidden,
    Transient,
    InvariantViolation,
    Internal,
}

/// Why an access token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    /// Not a well-formed token, or a required claim is missing/mismatched.
    Invalid,
    /// The `exp` claim is in the past.
    Expired,
    /// The header names an algorithm other than the one we sign with.
    WrongAlgorithm,
    /// The signature does not verify against our secret.
    SignatureInvalid,
}

impl std::fmt::Display for TokenRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            TokenRejection::Invalid => "malformed or invalid claims",
            TokenRejection::Expired => "expired",
            TokenRejection::WrongAlgorithm => "unexpected signing algorithm",
            TokenRejection::SignatureInvalid => "signature does not verify",
        };
        f.write_str(reason)
    }
}

/// The primary error type for all engine operations.
#[derive(Error, Debug)]
pub enum DomainError {
    /// Malformed input (e.g. content too long, latitude out of range)
    #[error("validation error: {0}")]
    Validation(String),

    /// The (user, post) pair already holds a vote of the requested kind
    #[error("user has already voted on this post")]
    AlreadyVoted,

    /// Another account already owns this username
    #[error("username already taken")]
    UsernameTaken,

    /// Resource not found (e.g. Post, User)
    #[error("{entity} not found with ID {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is banned")]
    AccountBanned,

    /// Refresh token unknown, already consumed, or past its expiry
    #[error("invalid or expired refresh token")]
    InvalidOrExpiredToken,

    #[error("access token rejected: {0}")]
    AccessToken(TokenRejection),

    /// Authenticated, but lacking the role the operation needs
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Lock contention, serialization failure, connection loss. Safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Vote counters no longer match the ledger. Writes to the post are refused.
    #[error("invariant violation on post {post_id}: {detail}")]
    InvariantViolation { post_id: Uuid, detail: String },

    /// Infrastructure or programming failure (e.g. signing key rejected)
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DomainError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::AlreadyVoted | DomainError::UsernameTaken => ErrorKind::Conflict,
            DomainError::NotFound { .. } => ErrorKind::NotFound,
            DomainError::InvalidCredentials
            | DomainError::AccountBanned
            | DomainError::InvalidOrExpiredToken
            | DomainError::AccessToken(_) => ErrorKind::Auth,
            DomainError::Forbidden(_) => ErrorKind::Forbidden,
            DomainError::Transient(_) => ErrorKind::Transient,
            DomainError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            DomainError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only transient store failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// A specialized Result type for engine logic.
pub type DomainResult<T> = std::result::Result<T, DomainError>;
