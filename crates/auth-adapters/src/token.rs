//! Opaque refresh token values: 32 bytes from the OS RNG, base64url encoded.

use argon2::password_hash::rand_core::{OsRng, RngCore};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use domains::TokenGenerator;

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct OsRngTokenGenerator;

impl TokenGenerator for OsRngTokenGenerator {
    fn generate(&self) -> String {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}
