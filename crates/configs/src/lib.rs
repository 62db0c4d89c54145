//! # Runtime Configuration
//!
//! Layered settings: built-in defaults, then `config/default.toml`, then
//! `config/{HYPERLOCAL_ENV}.toml`, then `HYPERLOCAL__SECTION__KEY` environment
//! variables. A `.env` file, when present, is loaded into the environment first.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

pub const ENV_PREFIX: &str = "HYPERLOCAL";
pub const MIN_JWT_SECRET_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Loaded fine but fails a sanity rule.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub auth: AuthSettings,
    pub moderation: ModerationSettings,
    pub maintenance: MaintenanceSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: SecretString,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    pub jwt_secret: SecretString,
    pub issuer: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModerationSettings {
    pub nearby_radius_meters: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSettings {
    pub token_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Settings {
    /// Loads from `.env`, the `config/` directory and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let profile = std::env::var("HYPERLOCAL_ENV").unwrap_or_else(|_| "development".into());

        let builder = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{profile}")).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        Self::finish(builder)
    }

    /// Defaults overlaid with a TOML document.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::finish(Self::defaults()?.add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("database.max_connections", 10)?
            .set_default("database.acquire_timeout_secs", 5)?
            .set_default("auth.issuer", "hyperlocal")?
            .set_default("auth.access_token_ttl_secs", 900)?
            .set_default("auth.refresh_token_ttl_days", 30)?
            .set_default("moderation.nearby_radius_meters", 5000.0)?
            .set_default("maintenance.token_sweep_interval_secs", 3600)?
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.expose_secret().len() < MIN_JWT_SECRET_BYTES {
            return Err(ConfigError::Invalid(format!(
                "auth.jwt_secret must be at least {MIN_JWT_SECRET_BYTES} bytes"
            )));
        }
        if self.auth.access_token_ttl_secs <= 0 || self.auth.refresh_token_ttl_days <= 0 {
            return Err(ConfigError::Invalid("token TTLs must be positive".into()));
        }
        let radius = self.moderation.nearby_radius_meters;
        if !radius.is_finite() || radius <= 0.0 {
            return Err(ConfigError::Invalid(
                "moderation.nearby_radius_meters must be a positive number".into(),
            ));
        }
        if self.maintenance.token_sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "maintenance.token_sweep_interval_secs must be positive".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be positive".into(),
            ));
        }
        Ok(())
    }
}
