//! # Core Traits (Ports)
//!
//! Any adapter must implement these traits to be wired into the engine.
//!
//! Storage ports expose each multi-step mutation as ONE method so the adapter
//! can run it as a single transaction. Services never read-branch-write across
//! two port calls when an invariant depends on the read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::DomainResult;
use crate::geo::GeoPoint;
use crate::models::{
    Claims, Comment, CounterAudit, Post, RefreshToken, Report, ReportOutcome, Role,
    TokenConsumption, User, Vote, VoteOutcome, VoteTally,
};

/// Identity store.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Fails with `UsernameTaken` when the unique username index rejects the row.
    async fn insert_user(&self, user: User) -> DomainResult<User>;
    async fn find_user(&self, id: Uuid) -> DomainResult<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> DomainResult<Option<User>>;
    /// Batch lookup; unknown ids are skipped.
    async fn find_users(&self, ids: &[Uuid]) -> DomainResult<Vec<User>>;
    /// Returns false when no such user exists.
    async fn set_banned(&self, id: Uuid, banned: bool) -> DomainResult<bool>;
}

/// Post aggregate storage.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert_post(&self, post: Post) -> DomainResult<Post>;
    async fn find_post(&self, id: Uuid) -> DomainResult<Option<Post>>;
    /// Removes the post with its votes, reports and comments.
    async fn delete_post(&self, id: Uuid) -> DomainResult<bool>;
    /// Explicit moderator override of the flag.
    async fn set_flagged(&self, id: Uuid, flagged: bool) -> DomainResult<bool>;
    /// Newest first.
    async fn list_flagged(&self) -> DomainResult<Vec<Post>>;
    /// Posts whose geodesic distance from `center` is at most `radius_meters`,
    /// newest first, ties broken by descending id.
    async fn find_within_radius(
        &self,
        center: GeoPoint,
        radius_meters: f64,
    ) -> DomainResult<Vec<Post>>;
}

/// The vote ledger and the counters derived from it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait VoteRepository: Send + Sync {
    /// Atomically records `vote` for its (user, post) pair and moves the post
    /// counters to match.
    ///
    /// - no vote yet: insert, increment the matching counter
    /// - same kind: `AlreadyVoted`, nothing changes
    /// - other kind: flip in place, decrement old counter, increment new one
    ///
    /// Concurrent calls on the same pair are serialized by the store.
    ///
    /// Fails with `InvariantViolation` while the post's counters are
    /// quarantined. A counter move that would go negative quarantines the
    /// post before failing the same way. Fails with `NotFound` for an unknown
    /// post or voter.
    async fn cast_vote(&self, vote: Vote) -> DomainResult<VoteOutcome>;
    /// Stored counters and ledger counts read from one consistent snapshot.
    /// When they disagree the post is quarantined in the same transaction.
    /// `None` when the post does not exist.
    async fn audit_counters(&self, post_id: Uuid) -> DomainResult<Option<CounterAudit>>;
    /// Rewrites the post counters from the ledger and clears the quarantine,
    /// in one transaction.
    async fn recount(&self, post_id: Uuid) -> DomainResult<VoteTally>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ReportRepository: Send + Sync {
    /// Inserts `report`, counts the post's reports and sets `is_flagged` once
    /// the count reaches `flag_threshold`, all in one transaction.
    /// Fails with `NotFound` for an unknown post or reporter.
    async fn file_report(&self, report: Report, flag_threshold: i64)
        -> DomainResult<ReportOutcome>;
    async fn count_reports(&self, post_id: Uuid) -> DomainResult<i64>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CommentRepository: Send + Sync {
    /// Fails with `NotFound` when the post does not exist.
    async fn insert_comment(&self, comment: Comment) -> DomainResult<Comment>;
    /// Newest first.
    async fn list_comments(&self, post_id: Uuid) -> DomainResult<Vec<Comment>>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn store_refresh_token(&self, token: RefreshToken) -> DomainResult<()>;
    /// Deletes the row matching `token` and reports what it was.
    /// Exactly one of any number of concurrent callers sees the row.
    async fn consume_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<TokenConsumption>;
    /// Deletes rows with `expires_at <= now`; returns how many went.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64>;
}

/// One-way salted password hashing.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PasswordHasher: Send + Sync {
    async fn hash_password(&self, password: &str) -> DomainResult<String>;
    async fn verify_password(&self, password: &str, hash: &str) -> DomainResult<bool>;
}

/// Signs and verifies access tokens with a shared secret.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait AccessTokenCodec: Send + Sync {
    fn sign(
        &self,
        user_id: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<String>;
    /// Checks algorithm, signature and claims, then expiry against `now`.
    fn verify(&self, token: &str, now: DateTime<Utc>) -> DomainResult<Claims>;
}

/// Source of unguessable opaque token values.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
