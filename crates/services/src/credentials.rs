//! # Credential Lifecycle Manager
//!
//! Short-lived signed access tokens plus long-lived, single-use refresh
//! tokens persisted server-side.
//!
//! Refresh token states: `issued -> consumed` on a successful refresh,
//! `issued -> expired` with time. Both are terminal. Consumption deletes the
//! row before anything else happens, so a token can never be replayed even if
//! issuing the replacement fails.

use std::sync::Arc;

use chrono::Duration;
use domains::{
    AccessTokenCodec, Claims, Clock, DomainError, DomainResult, PasswordHasher, RefreshToken,
    RefreshTokenRepository, Role, TokenConsumption, TokenGenerator, TokenPair, User,
    UserRepository,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::validation;

/// Token lifetimes.
#[derive(Debug, Clone, Copy)]
pub struct TokenPolicy {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(30),
        }
    }
}

pub struct CredentialManager {
    users: Arc<dyn UserRepository>,
    tokens: Arc<dyn RefreshTokenRepository>,
    hasher: Arc<dyn PasswordHasher>,
    codec: Arc<dyn AccessTokenCodec>,
    generator: Arc<dyn TokenGenerator>,
    clock: Arc<dyn Clock>,
    policy: TokenPolicy,
}

impl CredentialManager {
    pub fn new(
        users: Arc<dyn UserRepository>,
        tokens: Arc<dyn RefreshTokenRepository>,
        hasher: Arc<dyn PasswordHasher>,
        codec: Arc<dyn AccessTokenCodec>,
        generator: Arc<dyn TokenGenerator>,
        clock: Arc<dyn Clock>,
        policy: TokenPolicy,
    ) -> Self {
        Self {
            users,
            tokens,
            hasher,
            codec,
            generator,
            clock,
            policy,
        }
    }

    /// Creates an account and signs it in.
    ///
    /// The pre-check gives a fast answer; the store's unique index is what
    /// settles two concurrent registrations of one name.
    #[instrument(skip(self, password))]
    pub async fn register(&self, username: &str, password: &str) -> DomainResult<TokenPair> {
        validation::username(username)?;
        validation::password(password)?;

        if self.users.find_user_by_username(username).await?.is_some() {
            debug!("username already registered");
            return Err(DomainError::UsernameTaken);
        }

        let user = User {
            id: Uuid::now_v7(),
            username: Some(username.to_string()),
            password_hash: self.hasher.hash_password(password).await?,
            is_banned: false,
            created_at: self.clock.now(),
        };
        let user = self.users.insert_user(user).await?;
        info!(user_id = %user.id, "user registered");

        self.issue_token_pair(user.id).await
    }

    /// Password is checked before the ban flag so the ban state is only
    /// revealed to someone holding the password.
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> DomainResult<TokenPair> {
        let user = self
            .users
            .find_user_by_username(username)
            .await?
            .ok_or(DomainError::InvalidCredentials)?;

        if !self
            .hasher
            .verify_password(password, &user.password_hash)
            .await?
        {
            debug!(user_id = %user.id, "password mismatch");
            return Err(DomainError::InvalidCredentials);
        }
        if user.is_banned {
            info!(user_id = %user.id, "login refused for banned account");
            return Err(DomainError::AccountBanned);
        }

        self.issue_token_pair(user.id).await
    }

    /// Rotates a refresh token: the presented one is deleted, a new pair issued.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> DomainResult<TokenPair> {
        let now = self.clock.now();
        let consumed = match self.tokens.consume_refresh_token(refresh_token, now).await? {
            TokenConsumption::Consumed(token) => token,
            TokenConsumption::Expired(token) => {
                debug!(user_id = %token.user_id, "expired refresh token presented");
                return Err(DomainError::InvalidOrExpiredToken);
            }
            TokenConsumption::Missing => {
                debug!("unknown or already consumed refresh token presented");
                return Err(DomainError::InvalidOrExpiredToken);
            }
        };

        let user = self
            .users
            .find_user(consumed.user_id)
            .await?
            .ok_or(DomainError::InvalidOrExpiredToken)?;
        if user.is_banned {
            info!(user_id = %user.id, "refresh refused for banned account");
            return Err(DomainError::AccountBanned);
        }

        self.issue_token_pair(user.id).await
    }

    /// Signs an access token and persists a fresh refresh token for `user_id`.
    ///
    /// Every account is issued the `user` role.
    pub async fn issue_token_pair(&self, user_id: Uuid) -> DomainResult<TokenPair> {
        let now = self.clock.now();
        let access_token = self
            .codec
            .sign(user_id, Role::User, now, now + self.policy.access_ttl)?;

        let refresh = RefreshToken {
            id: Uuid::now_v7(),
            user_id,
            token: self.generator.generate(),
            expires_at: now + self.policy.refresh_ttl,
            created_at: now,
        };
        let refresh_value = refresh.token.clone();
        self.tokens.store_refresh_token(refresh).await?;

        Ok(TokenPair {
            access_token,
            refresh_token: refresh_value,
            expires_in: self.policy.access_ttl.num_seconds(),
        })
    }

    pub fn validate_access_token(&self, token: &str) -> DomainResult<Claims> {
        self.codec.verify(token, self.clock.now()).map_err(|err| {
            debug!(error = %err, "access token rejected");
            err
        })
    }

    /// Deletes expired refresh tokens. Safe to run alongside live refreshes:
    /// both sides delete, and only the one that removes the row acts on it.
    #[instrument(skip(self))]
    pub async fn sweep_expired_tokens(&self) -> DomainResult<u64> {
        let removed = self.tokens.sweep_expired(self.clock.now()).await?;
        if removed > 0 {
            info!(removed, "expired refresh tokens swept");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use domains::{
        MockAccessTokenCodec, MockClock, MockPasswordHasher, MockRefreshTokenRepository,
        MockTokenGenerator, MockUserRepository,
    };

    struct Mocks {
        users: MockUserRepository,
        tokens: MockRefreshTokenRepository,
        hasher: MockPasswordHasher,
        codec: MockAccessTokenCodec,
        generator: MockTokenGenerator,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                users: MockUserRepository::new(),
                tokens: MockRefreshTokenRepository::new(),
                hasher: MockPasswordHasher::new(),
                codec: MockAccessTokenCodec::new(),
                generator: MockTokenGenerator::new(),
            }
        }

        fn expect_issue(&mut self) {
            self.codec
                .expect_sign()
                .returning(|_, _, _, _| Ok("signed".into()));
            self.generator.expect_generate().returning(|| "next-refresh".into());
            self.tokens.expect_store_refresh_token().returning(|_| Ok(()));
        }

        fn build(self, now: DateTime<Utc>) -> CredentialManager {
            let mut clock = MockClock::new();
            clock.expect_now().return_const(now);
            CredentialManager::new(
                Arc::new(self.users),
                Arc::new(self.tokens),
                Arc::new(self.hasher),
                Arc::new(self.codec),
                Arc::new(self.generator),
                Arc::new(clock),
                TokenPolicy::default(),
            )
        }
    }

    fn account(banned: bool) -> User {
        User {
            id: Uuid::now_v7(),
            username: Some("carol".into()),
            password_hash: "hash".into(),
            is_banned: banned,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn issued_pair_carries_access_ttl_and_thirty_day_refresh() {
        let now = Utc::now();
        let mut mocks = Mocks::new();
        mocks
            .codec
            .expect_sign()
            .withf(move |_, role, issued, expires| {
                *role == Role::User && *expires - *issued == Duration::minutes(15)
            })
            .returning(|_, _, _, _| Ok("signed".into()));
        mocks.generator.expect_generate().returning(|| "opaque".into());
        mocks
            .tokens
            .expect_store_refresh_token()
            .withf(move |t| t.token == "opaque" && t.expires_at == now + Duration::days(30))
            .times(1)
            .returning(|_| Ok(()));

        let pair = mocks.build(now).issue_token_pair(Uuid::now_v7()).await.unwrap();
        assert_eq!(pair.expires_in, 900);
        assert_eq!(pair.refresh_token, "opaque");
    }

    #[tokio::test]
    async fn register_short_circuits_on_known_username() {
        let mut mocks = Mocks::new();
        mocks
            .users
            .expect_find_user_by_username()
            .returning(|_| Ok(Some(account(false))));
        mocks.hasher.expect_hash_password().never();
        mocks.users.expect_insert_user().never();

        let err = mocks
            .build(Utc::now())
            .register("carol", "secret-pw")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::UsernameTaken));
    }

    #[tokio::test]
    async fn banned_account_with_right_password_cannot_log_in() {
        let mut mocks = Mocks::new();
        mocks
            .users
            .expect_find_user_by_username()
            .returning(|_| Ok(Some(account(true))));
        mocks.hasher.expect_verify_password().returning(|_, _| Ok(true));
        mocks.codec.expect_sign().never();

        let err = mocks
            .build(Utc::now())
            .login("carol", "secret-pw")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::AccountBanned));
    }

    #[tokio::test]
    async fn wrong_password_does_not_reveal_ban() {
        let mut mocks = Mocks::new();
        mocks
            .users
            .expect_find_user_by_username()
            .returning(|_| Ok(Some(account(true))));
        mocks.hasher.expect_verify_password().returning(|_, _| Ok(false));

        let err = mocks
            .build(Utc::now())
            .login("carol", "guess")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidCredentials));
    }

    #[tokio::test]
    async fn expired_refresh_token_is_rejected() {
        let now = Utc::now();
        let mut mocks = Mocks::new();
        mocks
            .tokens
            .expect_consume_refresh_token()
            .times(1)
            .returning(move |value, _| {
                Ok(TokenConsumption::Expired(RefreshToken {
                    id: Uuid::now_v7(),
                    user_id: Uuid::now_v7(),
                    token: value.to_string(),
                    expires_at: now - Duration::seconds(1),
                    created_at: now - Duration::days(30),
                }))
            });
        mocks.users.expect_find_user().never();

        let err = mocks.build(now).refresh("stale").await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidOrExpiredToken));
    }

    #[tokio::test]
    async fn refresh_issues_a_new_pair_for_the_token_owner() {
        let now = Utc::now();
        let owner = account(false);
        let owner_id = owner.id;
        let mut mocks = Mocks::new();
        mocks
            .tokens
            .expect_consume_refresh_token()
            .withf(|value, _| value == "current")
            .returning(move |value, _| {
                Ok(TokenConsumption::Consumed(RefreshToken {
                    id: Uuid::now_v7(),
                    user_id: owner_id,
                    token: value.to_string(),
                    expires_at: now + Duration::days(1),
                    created_at: now - Duration::days(29),
                }))
            });
        mocks
            .users
            .expect_find_user()
            .returning(move |_| Ok(Some(owner.clone())));
        mocks.expect_issue();

        let pair = mocks.build(now).refresh("current").await.unwrap();
        assert_eq!(pair.refresh_token, "next-refresh");
    }

    #[tokio::test]
    async fn banned_owner_cannot_refresh() {
        let now = Utc::now();
        let owner = account(true);
        let owner_id = owner.id;
        let mut mocks = Mocks::new();
        mocks.tokens.expect_consume_refresh_token().returning(move |v, _| {
            Ok(TokenConsumption::Consumed(RefreshToken {
                id: Uuid::now_v7(),
                user_id: owner_id,
                token: v.to_string(),
                expires_at: now + Duration::days(1),
                created_at: now,
            }))
        });
        mocks
            .users
            .expect_find_user()
            .returning(move |_| Ok(Some(owner.clone())));
        mocks.tokens.expect_store_refresh_token().never();

        let err = mocks.build(now).refresh("current").await.unwrap_err();
        assert!(matches!(err, DomainError::AccountBanned));
    }
}
