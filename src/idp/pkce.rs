//! PKCE (RFC 7636) verification and pair generation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::models::CodeChallengeMethod;

/// Unreserved characters allowed in a code verifier (RFC 7636 §4.1).
const VERIFIER_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Length of generated verifiers.
pub const VERIFIER_LEN: usize = 64;

/// A verifier together with its S256 challenge.
#[derive(Debug, Clone, Serialize)]
pub struct PkcePair {
    /// Secret kept by the client until the token request
    pub code_verifier: String,
    /// `base64url(SHA256(code_verifier))`
    pub code_challenge: String,
    /// Always `S256`
    pub code_challenge_method: &'static str,
}

/// Constant-time string comparison.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// `base64url(SHA256(verifier))` without padding.
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Check `verifier` against a recorded challenge.
///
/// An empty verifier never matches.
#[must_use]
pub fn verify_pkce(verifier: &str, challenge: &str, method: CodeChallengeMethod) -> bool {
    if verifier.is_empty() {
        return false;
    }
    match method {
        CodeChallengeMethod::S256 => constant_time_eq(&s256_challenge(verifier), challenge),
        CodeChallengeMethod::Plain => constant_time_eq(verifier, challenge),
    }
}

/// Generate a fresh 64-character verifier and its S256 challenge.
#[must_use]
pub fn generate_pkce() -> PkcePair {
    let mut rng = rand::rng();
    let code_verifier: String = (0..VERIFIER_LEN)
        .map(|_| VERIFIER_CHARSET[rng.random_range(0..VERIFIER_CHARSET.len())] as char)
        .collect();
    let code_challenge = s256_challenge(&code_verifier);
    PkcePair {
        code_verifier,
        code_challenge,
        code_challenge_method: "S256",
    }
}
