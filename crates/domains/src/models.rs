//! # Domain Models
//!
//! These structs represent the core entities of the hyperlocal engine.
//! We use UUID v7 for time-ordered, globally unique identification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

/// Authorization role carried in access tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Unique when present
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

/// The public face of a user, attached to posts and comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: Uuid,
    pub username: Option<String>,
}

impl From<&User> for Author {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
        }
    }
}

/// A short message anchored to a coordinate.
///
/// `upvotes` and `downvotes` are derived state: they always equal the number
/// of ledger votes of that kind for this post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub location: GeoPoint,
    pub upvotes: i64,
    pub downvotes: i64,
    pub is_flagged: bool,
    /// Set once the counters were caught disagreeing with the ledger.
    /// Votes are refused until a recount clears it.
    #[serde(default)]
    pub counters_quarantined: bool,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn new(user_id: Uuid, content: String, location: GeoPoint, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            content,
            location,
            upvotes: 0,
            downvotes: 0,
            is_flagged: false,
            counters_quarantined: false,
            created_at: now,
        }
    }
}

/// A post joined with its owning user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostView {
    #[serde(flatten)]
    pub post: Post,
    pub author: Author,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentView {
    #[serde(flatten)]
    pub comment: Comment,
    pub author: Author,
}

/// A complaint against a post. Repeat reports by the same user are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub post_id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Result of filing a report, as observed inside the filing transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub report: Report,
    pub report_count: i64,
    pub flagged: bool,
    /// True only for the report that moved the post from unflagged to flagged
    pub newly_flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    #[serde(rename = "upvote")]
    Up,
    #[serde(rename = "downvote")]
    Down,
}

impl VoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteKind::Up => "upvote",
            VoteKind::Down => "downvote",
        }
    }

    pub fn opposite(&self) -> VoteKind {
        match self {
            VoteKind::Up => VoteKind::Down,
            VoteKind::Down => VoteKind::Up,
        }
    }
}

impl std::str::FromStr for VoteKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upvote" => Ok(VoteKind::Up),
            "downvote" => Ok(VoteKind::Down),
            other => Err(format!("unknown vote kind {other:?}")),
        }
    }
}

/// One ledger row. Unique per (user_id, post_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: Uuid,
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub kind: VoteKind,
    pub created_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(user_id: Uuid, post_id: Uuid, kind: VoteKind, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            post_id,
            kind,
            created_at: now,
        }
    }
}

/// What a successful vote did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChange {
    /// First vote by this user on this post
    Cast(VoteKind),
    /// Existing vote flipped to the other kind
    Switched { from: VoteKind, to: VoteKind },
}

/// A successful vote plus the post counters as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub change: VoteChange,
    pub upvotes: i64,
    pub downvotes: i64,
}

/// Counters for a post, either as stored or as counted from the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub upvotes: i64,
    pub downvotes: i64,
}

/// Stored counters next to what the ledger says they should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterAudit {
    pub stored: VoteTally,
    pub ledger: VoteTally,
}

impl CounterAudit {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.ledger
    }
}

/// A persisted single-use refresh credential.
#[derive(Clone)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshToken")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl RefreshToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// What the store found when a refresh token was consumed.
///
/// The row is deleted in every case where it existed.
#[derive(Debug, Clone)]
pub enum TokenConsumption {
    Consumed(RefreshToken),
    Expired(RefreshToken),
    Missing,
}

/// Claims proven by a valid access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Returned by register, login and refresh.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// The authenticated caller of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<&Claims> for Principal {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.user_id,
            role: claims.role,
        }
    }
}
