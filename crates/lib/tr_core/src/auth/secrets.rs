//! Random identifiers and API-key hashing.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use super::AuthError;

/// Fixed prefix of every API-key plaintext.
pub const API_KEY_PREFIX: &str = "tr_";

/// Length of the non-secret lookup identifier following [`API_KEY_PREFIX`].
pub const KEY_ID_LEN: usize = 8;

/// bcrypt cost factor.
const BCRYPT_COST: u32 = 10;

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Opaque session identifier: 256 bits of CSPRNG output, base64url.
pub fn generate_session_id() -> String {
    random_token(32)
}

/// OAuth2 `state` parameter (CSRF token).
pub fn generate_state() -> String {
    random_token(24)
}

/// New API-key plaintext: `tr_` followed by 256 bits of base64url entropy.
pub fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", random_token(32))
}

/// Lookup identifier of a presented key, or `None` if it cannot be one of ours.
pub fn api_key_lookup_id(plaintext: &str) -> Option<&str> {
    plaintext.strip_prefix(API_KEY_PREFIX)?.get(..KEY_ID_LEN)
}

/// Hash an API key with bcrypt (per-key salt embedded in the hash).
pub fn hash_api_key(plaintext: &str) -> Result<String, AuthError> {
    bcrypt::hash(plaintext, BCRYPT_COST)
        .map_err(|e| AuthError::Internal(format!("bcrypt hash: {e}")))
}

/// Verify a presented key against a stored bcrypt hash.
pub fn verify_api_key(plaintext: &str, hash: &str) -> Result<bool, AuthError> {
    bcrypt::verify(plaintext, hash).map_err(|e| AuthError::Internal(format!("bcrypt verify: {e}")))
}
