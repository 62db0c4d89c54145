//! Engine behavior against scripted ports: failure paths a real adapter
//! rarely produces on demand.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use domains::{
    DomainError, MockAccessTokenCodec, MockClock, MockPasswordHasher, MockRefreshTokenRepository,
    MockTokenGenerator, MockUserRepository, RefreshToken, TokenConsumption, User,
};
use services::{CredentialManager, TokenPolicy};
use uuid::Uuid;

struct Ports {
    users: MockUserRepository,
    tokens: MockRefreshTokenRepository,
    hasher: MockPasswordHasher,
    codec: MockAccessTokenCodec,
    generator: MockTokenGenerator,
}

impl Ports {
    fn new() -> Self {
        Self {
            users: MockUserRepository::new(),
            tokens: MockRefreshTokenRepository::new(),
            hasher: MockPasswordHasher::new(),
            codec: MockAccessTokenCodec::new(),
            generator: MockTokenGenerator::new(),
        }
    }

    fn manager(self) -> CredentialManager {
        let mut clock = MockClock::new();
        clock
            .expect_now()
            .return_const(Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap());
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

fn user(id: Uuid) -> User {
    User {
        id,
        username: Some("someone".into()),
        password_hash: "$argon2id$stub".into(),
        is_banned: false,
        created_at: Utc::now(),
    }
}

fn stored_token(user_id: Uuid) -> RefreshToken {
    let now = Utc::now();
    RefreshToken {
        id: Uuid::now_v7(),
        user_id,
        token: "presented".into(),
        expires_at: now + Duration::days(1),
        created_at: now,
    }
}

#[tokio::test]
async fn test_refresh_burns_token_even_when_issuance_fails() {
    let user_id = Uuid::now_v7();
    let mut ports = Ports::new();
    ports
        .tokens
        .expect_consume_refresh_token()
        .times(1)
        .returning(move |_, _| Ok(TokenConsumption::Consumed(stored_token(user_id))));
    ports
        .users
        .expect_find_user()
        .returning(move |id| Ok(Some(user(id))));
    ports
        .codec
        .expect_sign()
        .returning(|_, _, _, _| Err(DomainError::Internal("signer offline".into())));
    ports.tokens.expect_store_refresh_token().never();

    let err = ports.manager().refresh("presented").await.unwrap_err();
    assert!(matches!(err, DomainError::Internal(_)));
}

#[tokio::test]
async fn test_transient_store_error_surfaces_as_retryable() {
    let mut ports = Ports::new();
    ports
        .tokens
        .expect_consume_refresh_token()
        .returning(|_, _| Err(DomainError::Transient("could not obtain lock".into())));
    ports.users.expect_find_user().never();

    let err = ports.manager().refresh("presented").await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_refresh_for_deleted_account_is_rejected() {
    let user_id = Uuid::now_v7();
    let mut ports = Ports::new();
    ports
        .tokens
        .expect_consume_refresh_token()
        .returning(move |_, _| Ok(TokenConsumption::Consumed(stored_token(user_id))));
    ports.users.expect_find_user().returning(|_| Ok(None));
    ports.codec.expect_sign().never();

    let err = ports.manager().refresh("presented").await.unwrap_err();
    assert!(matches!(err, DomainError::InvalidOrExpiredToken));
}

#[tokio::test]
async fn test_lost_registration_race_reports_username_taken() {
    let mut ports = Ports::new();
    ports
        .users
        .expect_find_user_by_username()
        .returning(|_| Ok(None));
    ports
        .hasher
        .expect_hash_password()
        .returning(|_| Ok("$argon2id$stub".into()));
    // The pre-check passed but the unique index caught the duplicate.
    ports
        .users
        .expect_insert_user()
        .returning(|_| Err(DomainError::UsernameTaken));
    ports.codec.expect_sign().never();

    let err = ports
        .manager()
        .register("racer", "long-enough")
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::UsernameTaken));
}
