//! # Auth Adapters
//!
//! Password hashing, refresh token generation and (behind `auth-jwt`) the
//! access token codec.

#[cfg(feature = "auth-jwt")]
pub mod jwt;
pub mod password;
pub mod token;

#[cfg(feature = "auth-jwt")]
pub use jwt::JwtCodec;
pub use password::Argon2Hasher;
pub use token::OsRngTokenGenerator;
