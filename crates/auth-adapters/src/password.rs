//! Argon2id password hashing. Hashing is CPU-bound, so it runs on the
//! blocking pool rather than a runtime worker.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use domains::{DomainError, DomainResult, PasswordHasher};
use tracing::warn;

#[derive(Clone)]
pub struct Argon2Hasher {
    argon2: Argon2<'static>,
}

impl Default for Argon2Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Argon2Hasher {
    /// Argon2id with the crate's recommended parameters.
    pub fn new() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }

    /// Argon2id with an explicit memory (KiB) and iteration cost.
    pub fn with_cost(m_cost_kib: u32, t_cost: u32) -> DomainResult<Self> {
        let params = Params::new(m_cost_kib, t_cost, Params::DEFAULT_P_COST, None)
            .map_err(|e| DomainError::Validation(format!("argon2 parameters: {e}")))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }
}

#[async_trait]
impl PasswordHasher for Argon2Hasher {
    async fn hash_password(&self, password: &str) -> DomainResult<String> {
        let (argon2, password) = (self.argon2.clone(), password.to_owned());
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| DomainError::Internal(format!("password hashing failed: {e}")))
        })
        .await
        .map_err(|e| DomainError::Internal(format!("hashing task failed: {e}")))?
    }

    /// A malformed stored hash verifies as false rather than erroring.
    async fn verify_password(&self, password: &str, hash: &str) -> DomainResult<bool> {
        let argon2 = self.argon2.clone();
        let (password, hash) = (password.to_owned(), hash.to_owned());
        tokio::task::spawn_blocking(move || {
            let parsed = match PasswordHash::new(&hash) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "stored password hash is malformed");
                    return false;
                }
            };
            argon2
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .await
        .map_err(|e| DomainError::Internal(format!("verification task failed: {e}")))
    }
}
