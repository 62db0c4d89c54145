//! Shared wiring: the real engine over a real store, with a clock the test
//! moves by hand.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use auth_adapters::{Argon2Hasher, JwtCodec, OsRngTokenGenerator};
use chrono::{DateTime, Duration, TimeZone, Utc};
use domains::{
    Clock, CommentRepository, PostRepository, Principal, RefreshTokenRepository,
    ReportRepository, Role, TokenPair, UserRepository, VoteRepository,
};
use services::{EnginePolicy, EnginePorts, ModerationFacade};
use storage_adapters::InMemoryStore;
use uuid::Uuid;

pub const JWT_SECRET: &[u8] = b"integration-secret-integration-secret";
pub const PASSWORD: &str = "correct-horse";

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Builds a facade over `store`, which backs every repository port.
pub fn engine_over<S>(store: Arc<S>, clock: Arc<ManualClock>) -> ModerationFacade
where
    S: UserRepository
        + PostRepository
        + VoteRepository
        + ReportRepository
        + CommentRepository
        + RefreshTokenRepository
        + 'static,
{
    let ports = EnginePorts {
        users: store.clone(),
        posts: store.clone(),
        votes: store.clone(),
        reports: store.clone(),
        comments: store.clone(),
        refresh_tokens: store,
        // Minimum cost keeps registration fast in tests.
        hasher: Arc::new(Argon2Hasher::with_cost(8, 1).unwrap()),
        codec: Arc::new(JwtCodec::new(JWT_SECRET, "hyperlocal").unwrap()),
        generator: Arc::new(OsRngTokenGenerator),
        clock,
    };
    ModerationFacade::new(ports, EnginePolicy::default())
}

pub fn fixed_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    ))
}

pub struct Harness {
    pub engine: Arc<ModerationFacade>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = fixed_clock();
        Self {
            engine: Arc::new(engine_over(store.clone(), clock.clone())),
            store,
            clock,
        }
    }

    /// A second engine instance sharing this harness's store, as another
    /// replica of the service would.
    pub fn replica(&self) -> Arc<ModerationFacade> {
        Arc::new(engine_over(self.store.clone(), self.clock.clone()))
    }

    /// Registers `username` and resolves its principal from the access token.
    pub async fn sign_up(&self, username: &str) -> (Principal, TokenPair) {
        let pair = self.engine.register(username, PASSWORD).await.unwrap();
        let principal = self.engine.authenticate(&pair.access_token).unwrap();
        (principal, pair)
    }

    pub async fn user(&self, username: &str) -> Principal {
        self.sign_up(username).await.0
    }
}

/// No registration path grants the admin role; operators get it out of band.
pub fn admin() -> Principal {
    Principal {
        user_id: Uuid::now_v7(),
        role: Role::Admin,
    }
}
