//! # HS256 Access Tokens
//!
//! Only HS256 is accepted. Tokens declaring any other algorithm are refused
//! before signature checks run. Expiry and not-before are judged against the
//! caller's clock, not the library's.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use domains::{AccessTokenCodec, Claims, DomainError, DomainResult, Role, TokenRejection};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub const MIN_SECRET_BYTES: usize = 32;

/// Just the `alg` of a header, read as free text so that names the library
/// does not know (`none`) still come back as a wrong algorithm.
#[derive(Deserialize)]
struct DeclaredAlgorithm {
    alg: String,
}

fn declared_algorithm(token: &str) -> Option<String> {
    let segment = token.split('.').next()?;
    let raw = URL_SAFE_NO_PAD.decode(segment).ok()?;
    serde_json::from_slice::<DeclaredAlgorithm>(&raw)
        .ok()
        .map(|header| header.alg)
}

#[derive(Debug, Serialize, Deserialize)]
struct WireClaims {
    sub: String,
    user_id: Uuid,
    role: Role,
    iss: String,
    iat: i64,
    nbf: i64,
    exp: i64,
}

pub struct JwtCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl JwtCodec {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> DomainResult<Self> {
        if secret.len() < MIN_SECRET_BYTES {
            return Err(DomainError::Internal(format!(
                "jwt secret must be at least {MIN_SECRET_BYTES} bytes"
            )));
        }
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["sub", "iss", "iat", "nbf", "exp"]);

        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer,
        })
    }
}

fn rejection(err: &jsonwebtoken::errors::Error) -> TokenRejection {
    match err.kind() {
        JwtErrorKind::ExpiredSignature => TokenRejection::Expired,
        JwtErrorKind::InvalidSignature => TokenRejection::SignatureInvalid,
        JwtErrorKind::InvalidAlgorithm | JwtErrorKind::InvalidAlgorithmName => {
            TokenRejection::WrongAlgorithm
        }
        _ => TokenRejection::Invalid,
    }
}

fn timestamp(secs: i64) -> DomainResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(DomainError::AccessToken(TokenRejection::Invalid))
}

impl AccessTokenCodec for JwtCodec {
    fn sign(
        &self,
        user_id: Uuid,
        role: Role,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<String> {
        let claims = WireClaims {
            sub: user_id.to_string(),
            user_id,
            role,
            iss: self.issuer.clone(),
            iat: issued_at.timestamp(),
            nbf: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| DomainError::Internal(format!("jwt signing failed: {e}")))
    }

    fn verify(&self, token: &str, now: DateTime<Utc>) -> DomainResult<Claims> {
        if let Some(alg) = declared_algorithm(token).filter(|alg| alg != "HS256") {
            debug!(%alg, "token algorithm refused");
            return Err(DomainError::AccessToken(TokenRejection::WrongAlgorithm));
        }
        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "unreadable token header");
            DomainError::AccessToken(rejection(&e))
        })?;
        if header.alg != Algorithm::HS256 {
            debug!(alg = ?header.alg, "token algorithm refused");
            return Err(DomainError::AccessToken(TokenRejection::WrongAlgorithm));
        }

        let data = decode::<WireClaims>(token, &self.decoding, &self.validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            DomainError::AccessToken(rejection(&e))
        })?;
        let wire = data.claims;

        if wire.sub != wire.user_id.to_string() {
            return Err(DomainError::AccessToken(TokenRejection::Invalid));
        }
        let now = now.timestamp();
        if now >= wire.exp {
            return Err(DomainError::AccessToken(TokenRejection::Expired));
        }
        if now < wire.nbf {
            return Err(DomainError::AccessToken(TokenRejection::Invalid));
        }

        Ok(Claims {
            user_id: wire.user_id,
            role: wire.role,
            issued_at: timestamp(wire.iat)?,
            expires_at: timestamp(wire.exp)?,
        })
    }
}
