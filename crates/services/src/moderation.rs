//! # Moderation Facade
//!
//! The operations the HTTP layer calls. Callers hand in an already
//! authenticated [`Principal`] (see [`ModerationFacade::authenticate`]) and a
//! decoded payload; everything else happens here.

use std::sync::Arc;

use domains::{
    AccessTokenCodec, Author, Clock, Comment, CommentRepository, CommentView, DomainError,
    DomainResult, GeoPoint, PasswordHasher, Post, PostRepository, PostView, Principal,
    RefreshTokenRepository, ReportOutcome, ReportRepository, TokenGenerator, TokenPair,
    UserRepository, VoteKind, VoteOutcome, VoteRepository, VoteTally,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::credentials::{CredentialManager, TokenPolicy};
use crate::proximity::{ProximityEngine, DEFAULT_RADIUS_METERS};
use crate::reports::ReportPolicy;
use crate::votes::VoteLedger;
use crate::{validation, views};

/// Every adapter the engine talks to.
pub struct EnginePorts {
    pub users: Arc<dyn UserRepository>,
    pub posts: Arc<dyn PostRepository>,
    pub votes: Arc<dyn VoteRepository>,
    pub reports: Arc<dyn ReportRepository>,
    pub comments: Arc<dyn CommentRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub hasher: Arc<dyn PasswordHasher>,
    pub codec: Arc<dyn AccessTokenCodec>,
    pub generator: Arc<dyn TokenGenerator>,
    pub clock: Arc<dyn Clock>,
}

/// Caller-side policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct EnginePolicy {
    pub tokens: TokenPolicy,
    /// Radius applied by [`ModerationFacade::nearby_posts`]
    pub nearby_radius_meters: f64,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            tokens: TokenPolicy::default(),
            nearby_radius_meters: DEFAULT_RADIUS_METERS,
        }
    }
}

pub struct ModerationFacade {
    users: Arc<dyn UserRepository>,
    posts: Arc<dyn PostRepository>,
    comments: Arc<dyn CommentRepository>,
    clock: Arc<dyn Clock>,
    votes: VoteLedger,
    reports: ReportPolicy,
    proximity: ProximityEngine,
    credentials: CredentialManager,
    nearby_radius_meters: f64,
}

impl ModerationFacade {
    pub fn new(ports: EnginePorts, policy: EnginePolicy) -> Self {
        let EnginePorts {
            users,
            posts,
            votes,
            reports,
            comments,
            refresh_tokens,
            hasher,
            codec,
            generator,
            clock,
        } = ports;

        Self {
            votes: VoteLedger::new(votes, clock.clone()),
            reports: ReportPolicy::new(reports, clock.clone()),
            proximity: ProximityEngine::new(posts.clone(), users.clone()),
            credentials: CredentialManager::new(
                users.clone(),
                refresh_tokens,
                hasher,
                codec,
                generator,
                clock.clone(),
                policy.tokens,
            ),
            users,
            posts,
            comments,
            clock,
            nearby_radius_meters: policy.nearby_radius_meters,
        }
    }

    // ── Credentials ─────────────────────────────────────────────────────────

    pub async fn register(&self, username: &str, password: &str) -> DomainResult<TokenPair> {
        self.credentials.register(username, password).await
    }

    pub async fn login(&self, username: &str, password: &str) -> DomainResult<TokenPair> {
        self.credentials.login(username, password).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> DomainResult<TokenPair> {
        self.credentials.refresh(refresh_token).await
    }

    /// Turns a bearer access token into the principal for later calls.
    pub fn authenticate(&self, access_token: &str) -> DomainResult<Principal> {
        let claims = self.credentials.validate_access_token(access_token)?;
        Ok(Principal::from(&claims))
    }

    // ── Posts ───────────────────────────────────────────────────────────────

    #[instrument(skip(self, content), fields(user_id = %principal.user_id))]
    pub async fn create_post(
        &self,
        principal: &Principal,
        content: &str,
        latitude: f64,
        longitude: f64,
    ) -> DomainResult<PostView> {
        validation::content(content)?;
        let location = GeoPoint::new(latitude, longitude)?;

        let author = self
            .users
            .find_user(principal.user_id)
            .await?
            .ok_or_else(|| DomainError::not_found("user", principal.user_id))?;

        let post = Post::new(
            principal.user_id,
            content.to_string(),
            location,
            self.clock.now(),
        );
        let post = self.posts.insert_post(post).await?;
        info!(post_id = %post.id, "post created");

        Ok(PostView {
            post,
            author: Author::from(&author),
        })
    }

    pub async fn get_post(&self, post_id: Uuid) -> DomainResult<PostView> {
        let post = self
            .posts
            .find_post(post_id)
            .await?
            .ok_or_else(|| DomainError::not_found("post", post_id))?;
        let mut views = views::post_views(self.users.as_ref(), vec![post]).await?;
        views
            .pop()
            .ok_or_else(|| DomainError::Internal("post view lost during author join".into()))
    }

    /// Posts around a point using the configured default radius.
    pub async fn nearby_posts(&self, latitude: f64, longitude: f64) -> DomainResult<Vec<PostView>> {
        self.nearby_posts_within(latitude, longitude, self.nearby_radius_meters)
            .await
    }

    pub async fn nearby_posts_within(
        &self,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
    ) -> DomainResult<Vec<PostView>> {
        let center = GeoPoint::new(latitude, longitude)?;
        self.proximity.nearby(center, radius_meters).await
    }

    // ── Votes & reports ─────────────────────────────────────────────────────

    pub async fn cast_vote(
        &self,
        principal: &Principal,
        post_id: Uuid,
        kind: VoteKind,
    ) -> DomainResult<VoteOutcome> {
        self.votes.cast_vote(principal.user_id, post_id, kind).await
    }

    pub async fn file_report(
        &self,
        principal: &Principal,
        post_id: Uuid,
        reason: &str,
    ) -> DomainResult<ReportOutcome> {
        self.reports
            .file_report(post_id, principal.user_id, reason)
            .await
    }

    // ── Comments ────────────────────────────────────────────────────────────

    #[instrument(skip(self, content), fields(user_id = %principal.user_id))]
    pub async fn create_comment(
        &self,
        principal: &Principal,
        post_id: Uuid,
        content: &str,
    ) -> DomainResult<CommentView> {
        validation::content(content)?;

        let author = self
            .users
            .find_user(principal.user_id)
            .await?
            .ok_or_else(|| DomainError::not_found("user", principal.user_id))?;

        let comment = Comment {
            id: Uuid::now_v7(),
            post_id,
            user_id: principal.user_id,
            content: content.to_string(),
            created_at: self.clock.now(),
        };
        let comment = self.comments.insert_comment(comment).await?;

        Ok(CommentView {
            comment,
            author: Author::from(&author),
        })
    }

    /// Newest first.
    pub async fn list_comments(&self, post_id: Uuid) -> DomainResult<Vec<CommentView>> {
        let comments = self.comments.list_comments(post_id).await?;
        views::comment_views(self.users.as_ref(), comments).await
    }

    // ── Admin ───────────────────────────────────────────────────────────────

    pub async fn list_flagged(&self, principal: &Principal) -> DomainResult<Vec<PostView>> {
        require_admin(principal, "list flagged posts")?;
        let posts = self.posts.list_flagged().await?;
        views::post_views(self.users.as_ref(), posts).await
    }

    #[instrument(skip(self), fields(admin = %principal.user_id))]
    pub async fn delete_post(&self, principal: &Principal, post_id: Uuid) -> DomainResult<()> {
        require_admin(principal, "delete posts")?;
        if !self.posts.delete_post(post_id).await? {
            return Err(DomainError::not_found("post", post_id));
        }
        info!("post deleted");
        Ok(())
    }

    /// Clears the flag. The only way a post goes from flagged back to visible.
    #[instrument(skip(self), fields(admin = %principal.user_id))]
    pub async fn unflag_post(&self, principal: &Principal, post_id: Uuid) -> DomainResult<()> {
        require_admin(principal, "unflag posts")?;
        if !self.posts.set_flagged(post_id, false).await? {
            return Err(DomainError::not_found("post", post_id));
        }
        info!("post unflagged");
        Ok(())
    }

    #[instrument(skip(self), fields(admin = %principal.user_id))]
    pub async fn ban_user(&self, principal: &Principal, user_id: Uuid) -> DomainResult<()> {
        self.set_banned(principal, user_id, true).await
    }

    #[instrument(skip(self), fields(admin = %principal.user_id))]
    pub async fn unban_user(&self, principal: &Principal, user_id: Uuid) -> DomainResult<()> {
        self.set_banned(principal, user_id, false).await
    }

    async fn set_banned(
        &self,
        principal: &Principal,
        user_id: Uuid,
        banned: bool,
    ) -> DomainResult<()> {
        require_admin(principal, "change ban state")?;
        if !self.users.set_banned(user_id, banned).await? {
            return Err(DomainError::not_found("user", user_id));
        }
        info!(banned, "ban state changed");
        Ok(())
    }

    /// Reports filed against a post so far, repeats included.
    pub async fn report_count(&self, principal: &Principal, post_id: Uuid) -> DomainResult<i64> {
        require_admin(principal, "read report counts")?;
        self.reports.report_count(post_id).await
    }

    /// Checks counters against the ledger; quarantines the post on divergence.
    pub async fn audit_counters(
        &self,
        principal: &Principal,
        post_id: Uuid,
    ) -> DomainResult<VoteTally> {
        require_admin(principal, "audit vote counters")?;
        self.votes.audit(post_id).await
    }

    /// Rewrites counters from the ledger and lifts any quarantine.
    pub async fn reconcile_counters(
        &self,
        principal: &Principal,
        post_id: Uuid,
    ) -> DomainResult<VoteTally> {
        require_admin(principal, "reconcile vote counters")?;
        self.votes.reconcile(post_id).await
    }

    // ── Maintenance ─────────────────────────────────────────────────────────

    pub async fn sweep_expired_tokens(&self) -> DomainResult<u64> {
        self.credentials.sweep_expired_tokens().await
    }
}

fn require_admin(principal: &Principal, action: &str) -> DomainResult<()> {
    if principal.is_admin() {
        return Ok(());
    }
    warn!(user_id = %principal.user_id, action, "admin operation refused");
    Err(DomainError::Forbidden(format!("admin role required to {action}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domains::{
        MockAccessTokenCodec, MockClock, MockCommentRepository, MockPasswordHasher,
        MockPostRepository, MockRefreshTokenRepository, MockReportRepository,
        MockTokenGenerator, MockUserRepository, MockVoteRepository, Role,
    };

    fn facade(users: MockUserRepository, posts: MockPostRepository) -> ModerationFacade {
        let mut clock = MockClock::new();
        clock.expect_now().returning(chrono::Utc::now);
        ModerationFacade::new(
            EnginePorts {
                users: Arc::new(users),
                posts: Arc::new(posts),
                votes: Arc::new(MockVoteRepository::new()),
                reports: Arc::new(MockReportRepository::new()),
                comments: Arc::new(MockCommentRepository::new()),
                refresh_tokens: Arc::new(MockRefreshTokenRepository::new()),
                hasher: Arc::new(MockPasswordHasher::new()),
                codec: Arc::new(MockAccessTokenCodec::new()),
                generator: Arc::new(MockTokenGenerator::new()),
                clock: Arc::new(clock),
            },
            EnginePolicy::default(),
        )
    }

    fn principal(role: Role) -> Principal {
        Principal {
            user_id: Uuid::now_v7(),
            role,
        }
    }

    #[tokio::test]
    async fn admin_operations_refuse_plain_users() {
        let mut posts = MockPostRepository::new();
        posts.expect_delete_post().never();
        posts.expect_list_flagged().never();
        let mut users = MockUserRepository::new();
        users.expect_set_banned().never();

        let engine = facade(users, posts);
        let user = principal(Role::User);

        let deleted = engine.delete_post(&user, Uuid::now_v7()).await;
        assert!(matches!(deleted, Err(DomainError::Forbidden(_))));
        let flagged = engine.list_flagged(&user).await;
        assert!(matches!(flagged, Err(DomainError::Forbidden(_))));
        let banned = engine.ban_user(&user, Uuid::now_v7()).await;
        assert!(matches!(banned, Err(DomainError::Forbidden(_))));
    }

    #[tokio::test]
    async fn deleting_a_missing_post_is_not_found() {
        let mut posts = MockPostRepository::new();
        posts.expect_delete_post().times(1).returning(|_| Ok(false));

        let engine = facade(MockUserRepository::new(), posts);
        let err = engine
            .delete_post(&principal(Role::Admin), Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound { entity: "post", .. }));
    }

    #[tokio::test]
    async fn invalid_coordinates_never_reach_the_store() {
        let mut posts = MockPostRepository::new();
        posts.expect_insert_post().never();
        posts.expect_find_within_radius().never();

        let engine = facade(MockUserRepository::new(), posts);
        let created = engine
            .create_post(&principal(Role::User), "hello", 91.0, 0.0)
            .await;
        assert!(matches!(created, Err(DomainError::Validation(_))));
        let nearby = engine.nearby_posts(0.0, 181.0).await;
        assert!(matches!(nearby, Err(DomainError::Validation(_))));
    }
}
