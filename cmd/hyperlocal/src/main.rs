//! # Hyperlocal Engine Binary
//!
//! Assembles the engine from configuration, applies migrations and runs the
//! refresh-token sweep until interrupted. The HTTP surface mounts the facade
//! built here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use auth_adapters::{Argon2Hasher, JwtCodec, OsRngTokenGenerator};
use configs::{LogFormat, LogSettings, Settings};
use domains::SystemClock;
use secrecy::ExposeSecret;
use services::{EnginePolicy, EnginePorts, ModerationFacade, TokenPolicy};
use storage_adapters::PgStore;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading configuration")?;
    init_tracing(&settings.log);

    // 1. Database
    let store = Arc::new(
        PgStore::connect(
            settings.database.url.expose_secret(),
            settings.database.max_connections,
            Duration::from_secs(settings.database.acquire_timeout_secs),
        )
        .await
        .context("connecting to postgres")?,
    );
    store.migrate().await.context("running migrations")?;

    // 2. Auth
    let codec = JwtCodec::new(
        settings.auth.jwt_secret.expose_secret().as_bytes(),
        settings.auth.issuer.clone(),
    )
    .context("building jwt codec")?;

    // 3. Engine
    let policy = EnginePolicy {
        tokens: TokenPolicy {
            access_ttl: chrono::Duration::seconds(settings.auth.access_token_ttl_secs),
            refresh_ttl: chrono::Duration::days(settings.auth.refresh_token_ttl_days),
        },
        nearby_radius_meters: settings.moderation.nearby_radius_meters,
    };
    let engine = Arc::new(ModerationFacade::new(
        EnginePorts {
            users: store.clone(),
            posts: store.clone(),
            votes: store.clone(),
            reports: store.clone(),
            comments: store.clone(),
            refresh_tokens: store.clone(),
            hasher: Arc::new(Argon2Hasher::new()),
            codec: Arc::new(codec),
            generator: Arc::new(OsRngTokenGenerator),
            clock: Arc::new(SystemClock),
        },
        policy,
    ));

    info!(
        radius_m = policy.nearby_radius_meters,
        access_ttl_s = policy.tokens.access_ttl.num_seconds(),
        "hyperlocal engine ready"
    );

    // 4. Maintenance loop
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "cannot listen for ctrl-c");
        }
    };
    let period = Duration::from_secs(settings.maintenance.token_sweep_interval_secs);
    run_maintenance(period, shutdown, || {
        let engine = engine.clone();
        async move {
            if let Err(err) = engine.sweep_expired_tokens().await {
                error!(error = %err, retryable = err.is_retryable(), "token sweep failed");
            }
        }
    })
    .await;

    store.pool().close().await;
    Ok(())
}

/// Runs `sweep` every `period` until `shutdown` resolves; returns the number
/// of sweeps. The shutdown future lives across iterations, so a signal that
/// lands mid-sweep ends the loop once that sweep finishes.
async fn run_maintenance<S, F>(
    period: Duration,
    shutdown: impl Future<Output = ()>,
    mut sweep: S,
) -> u64
where
    S: FnMut() -> F,
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    tokio::pin!(shutdown);
    let mut sweeps = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                sweep().await;
                sweeps += 1;
            }
            () = &mut shutdown => {
                info!(sweeps, "shutdown requested");
                return sweeps;
            }
        }
    }
}
