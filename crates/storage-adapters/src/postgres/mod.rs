//! # PostgreSQL / PostGIS Store
//!
//! Every multi-step port method runs inside one transaction. Per-post work
//! (votes, reports, audits, recounts) starts with `SELECT ... FOR UPDATE` on
//! the post row, which serializes writers on that post without table locks.

mod errors;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domains::{
    Comment, CommentRepository, CounterAudit, DomainError, DomainResult, GeoPoint, Post,
    PostRepository, RefreshToken, RefreshTokenRepository, Report, ReportOutcome,
    ReportRepository, TokenConsumption, User, UserRepository, Vote, VoteChange, VoteKind,
    VoteOutcome, VoteRepository, VoteTally,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use errors::{db_err, is_check_violation, is_foreign_key_violation, is_unique_violation};

const POST_COLUMNS: &str = "id, user_id, content, latitude, longitude, upvotes, downvotes, \
                            is_flagged, counters_quarantined, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> DomainResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(db_err)?;
        info!(max_connections, "postgres pool ready");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> DomainResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DomainError::Internal(format!("migration failed: {e}")))?;
        Ok(())
    }
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        password_hash: row.try_get("password_hash")?,
        is_banned: row.try_get("is_banned")?,
        created_at: row.try_get("created_at")?,
    })
}

fn post_from_row(row: &PgRow) -> DomainResult<Post> {
    let latitude: f64 = row.try_get("latitude").map_err(db_err)?;
    let longitude: f64 = row.try_get("longitude").map_err(db_err)?;
    Ok(Post {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        location: GeoPoint::new(latitude, longitude)?,
        upvotes: row.try_get("upvotes").map_err(db_err)?,
        downvotes: row.try_get("downvotes").map_err(db_err)?,
        is_flagged: row.try_get("is_flagged").map_err(db_err)?,
        counters_quarantined: row.try_get("counters_quarantined").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn comment_from_row(row: &PgRow) -> Result<Comment, sqlx::Error> {
    Ok(Comment {
        id: row.try_get("id")?,
        post_id: row.try_get("post_id")?,
        user_id: row.try_get("user_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn refresh_token_from_row(row: &PgRow) -> Result<RefreshToken, sqlx::Error> {
    Ok(RefreshToken {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token: row.try_get("token")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn vote_kind(raw: &str) -> DomainResult<VoteKind> {
    raw.parse().map_err(DomainError::Internal)
}

fn quarantined(post_id: Uuid) -> DomainError {
    DomainError::InvariantViolation {
        post_id,
        detail: "counters are quarantined until recounted".into(),
    }
}

fn tally_from_row(row: &PgRow, up: &str, down: &str) -> Result<VoteTally, sqlx::Error> {
    Ok(VoteTally {
        upvotes: row.try_get(up)?,
        downvotes: row.try_get(down)?,
    })
}

#[async_trait]
impl UserRepository for PgStore {
    async fn insert_user(&self, user: User) -> DomainResult<User> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, is_banned, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.is_banned)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DomainError::UsernameTaken
            } else {
                db_err(e)
            }
        })?;
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> DomainResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, is_banned, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose().map_err(db_err)
    }

    async fn find_user_by_username(&self, username: &str) -> DomainResult<Option<User>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, is_banned, created_at
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(user_from_row).transpose().map_err(db_err)
    }

    async fn find_users(&self, ids: &[Uuid]) -> DomainResult<Vec<User>> {
        let rows = sqlx::query(
            "SELECT id, username, password_hash, is_banned, created_at
             FROM users WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(user_from_row)
            .collect::<Result<_, _>>()
            .map_err(db_err)
    }

    async fn set_banned(&self, id: Uuid, banned: bool) -> DomainResult<bool> {
        let result = sqlx::query("UPDATE users SET is_banned = $2 WHERE id = $1")
            .bind(id)
            .bind(banned)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PostRepository for PgStore {
    async fn insert_post(&self, post: Post) -> DomainResult<Post> {
        sqlx::query(
            "INSERT INTO posts (id, user_id, content, latitude, longitude,
                                upvotes, downvotes, is_flagged, counters_quarantined, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(post.id)
        .bind(post.user_id)
        .bind(&post.content)
        .bind(post.location.latitude)
        .bind(post.location.longitude)
        .bind(post.upvotes)
        .bind(post.downvotes)
        .bind(post.is_flagged)
        .bind(post.counters_quarantined)
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DomainError::not_found("user", post.user_id)
            } else {
                db_err(e)
            }
        })?;
        Ok(post)
    }

    async fn find_post(&self, id: Uuid) -> DomainResult<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(post_from_row).transpose()
    }

    async fn delete_post(&self, id: Uuid) -> DomainResult<bool> {
        // votes, reports and comments go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_flagged(&self, id: Uuid, flagged: bool) -> DomainResult<bool> {
        let result = sqlx::query("UPDATE posts SET is_flagged = $2 WHERE id = $1")
            .bind(id)
            .bind(flagged)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_flagged(&self) -> DomainResult<Vec<Post>> {
        let rows = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE is_flagged ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(post_from_row).collect()
    }

    async fn find_within_radius(
        &self,
        center: GeoPoint,
        radius_meters: f64,
    ) -> DomainResult<Vec<Post>> {
        // geography + ST_DWithin measures on the WGS84 spheroid; the bound is inclusive.
        let rows = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM posts
             WHERE ST_DWithin(
                 geog,
                 ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography,
                 $3
             )
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(center.longitude)
        .bind(center.latitude)
        .bind(radius_meters)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        debug!(matched = rows.len(), "radius query");
        rows.iter().map(post_from_row).collect()
    }
}

#[async_trait]
impl VoteRepository for PgStore {
    async fn cast_vote(&self, vote: Vote) -> DomainResult<VoteOutcome> {
        let post_id = vote.post_id;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // 1. Lock the post; every vote on it queues here.
        let locked = sqlx::query(
            "SELECT upvotes, downvotes, counters_quarantined FROM posts WHERE id = $1 FOR UPDATE",
        )
        .bind(post_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| DomainError::not_found("post", post_id))?;
        let fenced: bool = locked.try_get("counters_quarantined").map_err(db_err)?;
        if fenced {
            return Err(quarantined(post_id));
        }
        let stored = tally_from_row(&locked, "upvotes", "downvotes").map_err(db_err)?;

        // 2. Read the pair's current vote under the lock.
        let previous = sqlx::query("SELECT kind FROM votes WHERE user_id = $1 AND post_id = $2")
            .bind(vote.user_id)
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .map(|row| row.try_get::<String, _>("kind"))
            .transpose()
            .map_err(db_err)?
            .map(|raw| vote_kind(&raw))
            .transpose()?;

        let (change, up_delta, down_delta): (VoteChange, i64, i64) = match previous {
            None => match vote.kind {
                VoteKind::Up => (VoteChange::Cast(vote.kind), 1, 0),
                VoteKind::Down => (VoteChange::Cast(vote.kind), 0, 1),
            },
            Some(kind) if kind == vote.kind => return Err(DomainError::AlreadyVoted),
            Some(from) => {
                let to = vote.kind;
                match to {
                    VoteKind::Up => (VoteChange::Switched { from, to }, 1, -1),
                    VoteKind::Down => (VoteChange::Switched { from, to }, -1, 1),
                }
            }
        };

        // 3. A counter that would go negative has drifted: fence the post.
        if stored.upvotes + up_delta < 0 || stored.downvotes + down_delta < 0 {
            sqlx::query("UPDATE posts SET counters_quarantined = TRUE WHERE id = $1")
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            return Err(DomainError::InvariantViolation {
                post_id,
                detail: format!(
                    "counter update ({up_delta:+}/{down_delta:+}) on {}/{} would go negative",
                    stored.upvotes, stored.downvotes
                ),
            });
        }

        // 4. Write the ledger.
        if previous.is_none() {
            sqlx::query(
                "INSERT INTO votes (id, user_id, post_id, kind, created_at)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(vote.id)
            .bind(vote.user_id)
            .bind(post_id)
            .bind(vote.kind.as_str())
            .bind(vote.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    DomainError::AlreadyVoted
                } else if is_foreign_key_violation(&e) {
                    DomainError::not_found("user", vote.user_id)
                } else {
                    db_err(e)
                }
            })?;
        } else {
            sqlx::query("UPDATE votes SET kind = $3 WHERE user_id = $1 AND post_id = $2")
                .bind(vote.user_id)
                .bind(post_id)
                .bind(vote.kind.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        // 5. Move the counters. The CHECK constraint stays as a backstop.
        let row = sqlx::query(
            "UPDATE posts SET upvotes = upvotes + $2, downvotes = downvotes + $3
             WHERE id = $1 RETURNING upvotes, downvotes",
        )
        .bind(post_id)
        .bind(up_delta)
        .bind(down_delta)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_check_violation(&e) {
                DomainError::InvariantViolation {
                    post_id,
                    detail: format!(
                        "counter update ({up_delta:+}/{down_delta:+}) would go negative"
                    ),
                }
            } else {
                db_err(e)
            }
        })?;
        let tally = tally_from_row(&row, "upvotes", "downvotes").map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(VoteOutcome {
            change,
            upvotes: tally.upvotes,
            downvotes: tally.downvotes,
        })
    }

    async fn audit_counters(&self, post_id: Uuid) -> DomainResult<Option<CounterAudit>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Locking the post keeps votes out while the ledger is counted.
        let Some(locked) =
            sqlx::query("SELECT upvotes, downvotes FROM posts WHERE id = $1 FOR UPDATE")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
        else {
            return Ok(None);
        };
        let stored = tally_from_row(&locked, "upvotes", "downvotes").map_err(db_err)?;

        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE kind = 'upvote')   AS ledger_up,
                    COUNT(*) FILTER (WHERE kind = 'downvote') AS ledger_down
             FROM votes WHERE post_id = $1",
        )
        .bind(post_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let audit = CounterAudit {
            stored,
            ledger: tally_from_row(&row, "ledger_up", "ledger_down").map_err(db_err)?,
        };

        if !audit.is_consistent() {
            sqlx::query("UPDATE posts SET counters_quarantined = TRUE WHERE id = $1")
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(Some(audit))
    }

    async fn recount(&self, post_id: Uuid) -> DomainResult<VoteTally> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let locked = sqlx::query("SELECT id FROM posts WHERE id = $1 FOR UPDATE")
            .bind(post_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if locked.is_none() {
            return Err(DomainError::not_found("post", post_id));
        }

        let row = sqlx::query(
            "UPDATE posts SET
                 upvotes   = (SELECT COUNT(*) FROM votes WHERE post_id = $1 AND kind = 'upvote'),
                 downvotes = (SELECT COUNT(*) FROM votes WHERE post_id = $1 AND kind = 'downvote'),
                 counters_quarantined = FALSE
             WHERE id = $1
             RETURNING upvotes, downvotes",
        )
        .bind(post_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let tally = tally_from_row(&row, "upvotes", "downvotes").map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(tally)
    }
}

#[async_trait]
impl ReportRepository for PgStore {
    async fn file_report(
        &self,
        report: Report,
        flag_threshold: i64,
    ) -> DomainResult<ReportOutcome> {
        let post_id = report.post_id;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let was_flagged: bool =
            match sqlx::query("SELECT is_flagged FROM posts WHERE id = $1 FOR UPDATE")
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
            {
                Some(row) => row.try_get("is_flagged").map_err(db_err)?,
                None => return Err(DomainError::not_found("post", post_id)),
            };

        sqlx::query(
            "INSERT INTO reports (id, post_id, user_id, reason, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(report.id)
        .bind(post_id)
        .bind(report.user_id)
        .bind(&report.reason)
        .bind(report.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DomainError::not_found("user", report.user_id)
            } else {
                db_err(e)
            }
        })?;

        let report_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM reports WHERE post_id = $1")
            .bind(post_id)
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("n"))
            .map_err(db_err)?;

        let flagged = was_flagged || report_count >= flag_threshold;
        if flagged && !was_flagged {
            sqlx::query("UPDATE posts SET is_flagged = TRUE WHERE id = $1")
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(ReportOutcome {
            report,
            report_count,
            flagged,
            newly_flagged: flagged && !was_flagged,
        })
    }

    async fn count_reports(&self, post_id: Uuid) -> DomainResult<i64> {
        sqlx::query("SELECT COUNT(*) AS n FROM reports WHERE post_id = $1")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("n"))
            .map_err(db_err)
    }
}

#[async_trait]
impl CommentRepository for PgStore {
    async fn insert_comment(&self, comment: Comment) -> DomainResult<Comment> {
        sqlx::query(
            "INSERT INTO comments (id, post_id, user_id, content, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(comment.id)
        .bind(comment.post_id)
        .bind(comment.user_id)
        .bind(&comment.content)
        .bind(comment.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DomainError::not_found("post", comment.post_id)
            } else {
                db_err(e)
            }
        })?;
        Ok(comment)
    }

    async fn list_comments(&self, post_id: Uuid) -> DomainResult<Vec<Comment>> {
        let rows = sqlx::query(
            "SELECT id, post_id, user_id, content, created_at FROM comments
             WHERE post_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(comment_from_row)
            .collect::<Result<_, _>>()
            .map_err(db_err)
    }
}

#[async_trait]
impl RefreshTokenRepository for PgStore {
    async fn store_refresh_token(&self, token: RefreshToken) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token, expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(token.id)
        .bind(token.user_id)
        .bind(&token.token)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn consume_refresh_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<TokenConsumption> {
        // DELETE ... RETURNING: of concurrent callers only one gets the row back.
        let row = sqlx::query(
            "DELETE FROM refresh_tokens WHERE token = $1
             RETURNING id, user_id, token, expires_at, created_at",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row.as_ref().map(refresh_token_from_row).transpose().map_err(db_err)? {
            Some(row) if row.is_expired_at(now) => TokenConsumption::Expired(row),
            Some(row) => TokenConsumption::Consumed(row),
            None => TokenConsumption::Missing,
        })
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
