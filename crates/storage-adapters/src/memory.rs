//! # In-memory Store
//!
//! Implements every repository port over plain maps. Each mutation holds the
//! single write lock for its whole duration, so operations are serializable
//! exactly like the Postgres transactions they stand in for.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    geodesic_distance, Comment, CommentRepository, CounterAudit, DomainError, DomainResult,
    GeoPoint, Post, PostRepository, RefreshToken, RefreshTokenRepository, Report, ReportOutcome,
    ReportRepository, TokenConsumption, User, UserRepository, Vote, VoteChange, VoteKind,
    VoteOutcome, VoteRepository, VoteTally,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    usernames: HashMap<String, Uuid>,
    posts: HashMap<Uuid, Post>,
    votes: HashMap<(Uuid, Uuid), Vote>,
    comments: HashMap<Uuid, Comment>,
    reports: HashMap<Uuid, Report>,
    refresh_tokens: HashMap<String, RefreshToken>,
}

impl Tables {
    fn post_mut(&mut self, id: Uuid) -> DomainResult<&mut Post> {
        self.posts
            .get_mut(&id)
            .ok_or_else(|| DomainError::not_found("post", id))
    }

    fn require_user(&self, id: Uuid) -> DomainResult<()> {
        if self.users.contains_key(&id) {
            Ok(())
        } else {
            Err(DomainError::not_found("user", id))
        }
    }

    fn ledger_tally(&self, post_id: Uuid) -> VoteTally {
        self.votes
            .values()
            .filter(|v| v.post_id == post_id)
            .fold(VoteTally::default(), |mut tally, v| {
                match v.kind {
                    VoteKind::Up => tally.upvotes += 1,
                    VoteKind::Down => tally.downvotes += 1,
                }
                tally
            })
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the stored counters without touching the ledger.
    ///
    /// Lets operators and tests reproduce a drifted cache.
    pub async fn overwrite_counters(&self, post_id: Uuid, tally: VoteTally) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        let post = tables.post_mut(post_id)?;
        post.upvotes = tally.upvotes;
        post.downvotes = tally.downvotes;
        Ok(())
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, Uuid)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

// Mirrors the CHECK (upvotes >= 0 AND downvotes >= 0) constraint.
fn adjust(counter: &mut i64, delta: i64, post_id: Uuid, name: &str) -> DomainResult<()> {
    let next = *counter + delta;
    if next < 0 {
        return Err(DomainError::InvariantViolation {
            post_id,
            detail: format!("{name} would become {next}"),
        });
    }
    *counter = next;
    Ok(())
}

fn quarantined(post_id: Uuid) -> DomainError {
    DomainError::InvariantViolation {
        post_id,
        detail: "counters are quarantined until recounted".into(),
    }
}

fn counter_for(post: &mut Post, kind: VoteKind) -> (&mut i64, &'static str) {
    match kind {
        VoteKind::Up => (&mut post.upvotes, "upvotes"),
        VoteKind::Down => (&mut post.downvotes, "downvotes"),
    }
}

#[async_trait]
impl UserRepository for InMemoryStore {
    async fn insert_user(&self, user: User) -> DomainResult<User> {
        let mut tables = self.tables.write().await;
        if let Some(name) = &user.username {
            if tables.usernames.contains_key(name) {
                return Err(DomainError::UsernameTaken);
            }
            tables.usernames.insert(name.clone(), user.id);
        }
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> DomainResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_username(&self, username: &str) -> DomainResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .usernames
            .get(username)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn find_users(&self, ids: &[Uuid]) -> DomainResult<Vec<User>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.users.get(id))
            .cloned()
            .collect())
    }

    async fn set_banned(&self, id: Uuid, banned: bool) -> DomainResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.users.get_mut(&id) {
            Some(user) => {
                user.is_banned = banned;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PostRepository for InMemoryStore {
    async fn insert_post(&self, post: Post) -> DomainResult<Post> {
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&post.user_id) {
            return Err(DomainError::not_found("user", post.user_id));
        }
        tables.posts.insert(post.id, post.clone());
        Ok(post)
    }

    async fn find_post(&self, id: Uuid) -> DomainResult<Option<Post>> {
        Ok(self.tables.read().await.posts.get(&id).cloned())
    }

    async fn delete_post(&self, id: Uuid) -> DomainResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.posts.remove(&id).is_none() {
            return Ok(false);
        }
        tables.votes.retain(|_, v| v.post_id != id);
        tables.reports.retain(|_, r| r.post_id != id);
        tables.comments.retain(|_, c| c.post_id != id);
        Ok(true)
    }

    async fn set_flagged(&self, id: Uuid, flagged: bool) -> DomainResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.posts.get_mut(&id) {
            Some(post) => {
                post.is_flagged = flagged;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_flagged(&self) -> DomainResult<Vec<Post>> {
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| p.is_flagged)
            .cloned()
            .collect();
        newest_first(&mut posts, |p| (p.created_at, p.id));
        Ok(posts)
    }

    async fn find_within_radius(
        &self,
        center: GeoPoint,
        radius_meters: f64,
    ) -> DomainResult<Vec<Post>> {
        let tables = self.tables.read().await;
        let mut posts: Vec<Post> = tables
            .posts
            .values()
            .filter(|p| geodesic_distance(&center, &p.location) <= radius_meters)
            .cloned()
            .collect();
        newest_first(&mut posts, |p| (p.created_at, p.id));
        debug!(scanned = tables.posts.len(), matched = posts.len(), "radius scan");
        Ok(posts)
    }
}

#[async_trait]
impl VoteRepository for InMemoryStore {
    async fn cast_vote(&self, vote: Vote) -> DomainResult<VoteOutcome> {
        let mut tables = self.tables.write().await;
        let post_id = vote.post_id;
        let key = (vote.user_id, post_id);

        // Work on a copy so a failed check leaves the counters untouched.
        let mut post = tables.post_mut(post_id)?.clone();
        if post.counters_quarantined {
            return Err(quarantined(post_id));
        }
        tables.require_user(vote.user_id)?;

        let previous = tables.votes.get(&key).map(|v| v.kind);
        let change = match previous {
            None => {
                let (counter, name) = counter_for(&mut post, vote.kind);
                adjust(counter, 1, post_id, name).map(|()| VoteChange::Cast(vote.kind))
            }
            Some(kind) if kind == vote.kind => return Err(DomainError::AlreadyVoted),
            Some(from) => {
                let (old, old_name) = counter_for(&mut post, from);
                let moved = adjust(old, -1, post_id, old_name).and_then(|()| {
                    let (new, new_name) = counter_for(&mut post, vote.kind);
                    adjust(new, 1, post_id, new_name)
                });
                moved.map(|()| VoteChange::Switched {
                    from,
                    to: vote.kind,
                })
            }
        };
        let change = match change {
            Ok(change) => change,
            Err(err) => {
                tables.post_mut(post_id)?.counters_quarantined = true;
                return Err(err);
            }
        };

        let outcome = VoteOutcome {
            change,
            upvotes: post.upvotes,
            downvotes: post.downvotes,
        };
        tables.posts.insert(post_id, post);
        let kind = vote.kind;
        tables
            .votes
            .entry(key)
            .and_modify(|existing| existing.kind = kind)
            .or_insert(vote);
        Ok(outcome)
    }

    async fn audit_counters(&self, post_id: Uuid) -> DomainResult<Option<CounterAudit>> {
        let mut tables = self.tables.write().await;
        let ledger = tables.ledger_tally(post_id);
        let Some(post) = tables.posts.get_mut(&post_id) else {
            return Ok(None);
        };
        let audit = CounterAudit {
            stored: VoteTally {
                upvotes: post.upvotes,
                downvotes: post.downvotes,
            },
            ledger,
        };
        if !audit.is_consistent() {
            post.counters_quarantined = true;
        }
        Ok(Some(audit))
    }

    async fn recount(&self, post_id: Uuid) -> DomainResult<VoteTally> {
        let mut tables = self.tables.write().await;
        let tally = tables.ledger_tally(post_id);
        let post = tables.post_mut(post_id)?;
        post.upvotes = tally.upvotes;
        post.downvotes = tally.downvotes;
        post.counters_quarantined = false;
        Ok(tally)
    }
}

#[async_trait]
impl ReportRepository for InMemoryStore {
    async fn file_report(
        &self,
        report: Report,
        flag_threshold: i64,
    ) -> DomainResult<ReportOutcome> {
        let mut tables = self.tables.write().await;
        let post_id = report.post_id;
        if !tables.posts.contains_key(&post_id) {
            return Err(DomainError::not_found("post", post_id));
        }
        tables.require_user(report.user_id)?;

        tables.reports.insert(report.id, report.clone());
        let report_count = tables
            .reports
            .values()
            .filter(|r| r.post_id == post_id)
            .count() as i64;

        let post = tables.post_mut(post_id)?;
        let was_flagged = post.is_flagged;
        if report_count >= flag_threshold {
            post.is_flagged = true;
        }
        let flagged = post.is_flagged;

        Ok(ReportOutcome {
            report,
            report_count,
            flagged,
            newly_flagged: flagged && !was_flagged,
        })
    }

    async fn count_reports(&self, post_id: Uuid) -> DomainResult<i64> {
        let tables = self.tables.read().await;
        Ok(tables
            .reports
            .values()
            .filter(|r| r.post_id == post_id)
            .count() as i64)
    }
}

#[async_trait]
impl CommentRepository for InMemoryStore {
    async fn insert_comment(&self, comment: Comment) -> DomainResult<Comment> {
        let mut tables = self.tables.write().await;
        if !tables.posts.contains_key(&comment.post_id) {
            return Err(DomainError::not_found("post", comment.post_id));
        }
        tables.comments.insert(comment.id, comment.clone());
        Ok(comment)
    }

    async fn list_comments(&self, post_id: Uuid) -> DomainResult<Vec<Comment>> {
        let tables = self.tables.read().await;
        let mut comments: Vec<Comment> = tables
            .comments
            .values()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect();
        newest_first(&mut comments, |c| (c.created_at, c.id));
        Ok(comments)
    }
}

#[async_trait]
impl RefreshTokenRepository for InMemoryStore {
    async fn store_refresh_token(&self, token: RefreshToken) -> DomainResult<()> {
        let mut tables = self.tables.write().await;
        if tables.refresh_tokens.contains_key(&token.token) {
            return Err(DomainError::Internal("refresh token collision".into()));
        }
        tables.refresh_tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn consume_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<TokenConsumption> {
        let mut tables = self.tables.write().await;
        Ok(match tables.refresh_tokens.remove(token) {
            Some(row) if row.is_expired_at(now) => TokenConsumption::Expired(row),
            Some(row) => TokenConsumption::Consumed(row),
            None => TokenConsumption::Missing,
        })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.refresh_tokens.len();
        tables.refresh_tokens.retain(|_, t| !t.is_expired_at(now));
        Ok((before - tables.refresh_tokens.len()) as u64)
    }
}
