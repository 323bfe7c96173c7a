//! Signing service: produces and verifies signed JWTs.
//!
//! The rest of the engine only sees the [`TokenSigner`] contract:
//! `sign(claims, algorithm, key_id)`, `verify(token)`, and the public
//! key set. [`JwtSigner`] is the in-process implementation backed by
//! `jsonwebtoken`, holding one or more keys indexed by `kid`.
//!
//! # Key material
//!
//! - Configured PEM files: PKCS#8 private key + SPKI public key, either
//!   ES256 (P-256) or RS256.
//! - No configured files: an ephemeral P-256 key pair is generated with
//!   `rcgen` at startup. Tokens do not survive a restart.
//!
//! Verification requires the header `alg` to equal the algorithm the
//! `kid` was registered with, so a token cannot downgrade its own key.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::config::SigningConfig;

/// Claim set carried by every signed token.
pub type Claims = serde_json::Map<String, Value>;

/// Supported signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// ECDSA P-256 with SHA-256
    ES256,
}

impl SigningAlgorithm {
    fn jwt(self) -> Algorithm {
        match self {
            Self::RS256 => Algorithm::RS256,
            Self::ES256 => Algorithm::ES256,
        }
    }

    /// Name as it appears in a JOSE header.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::ES256 => "ES256",
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RS256" => Ok(Self::RS256),
            "ES256" => Ok(Self::ES256),
            other => Err(SigningError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Signing and verification failures.
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// No key registered under this `kid`.
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// The key exists but was registered for a different algorithm.
    #[error("Algorithm mismatch for key {key_id}: key is {expected}, requested {actual}")]
    AlgorithmMismatch {
        /// Key identifier
        key_id: String,
        /// Algorithm the key was registered with
        expected: String,
        /// Algorithm requested or found in the token header
        actual: String,
    },

    /// Algorithm outside the supported set.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Key files missing, unreadable or malformed.
    #[error("Invalid key material: {0}")]
    KeyMaterial(String),

    /// JWT encode/decode failure, including signature and expiry checks.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl SigningError {
    /// Whether verification failed only because the token expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Jwt(e) if matches!(e.kind(), ErrorKind::ExpiredSignature))
    }
}

/// Contract of the signing service.
pub trait TokenSigner: Send + Sync {
    /// Sign `claims` with the key registered as `key_id`.
    fn sign(
        &self,
        claims: &Claims,
        algorithm: SigningAlgorithm,
        key_id: &str,
    ) -> Result<String, SigningError>;

    /// Verify signature and expiry, returning the claim set.
    fn verify(&self, token: &str) -> Result<Claims, SigningError>;

    /// Public keys as a JWK Set document.
    fn jwks(&self) -> Value;

    /// Key used when a caller does not pick one.
    fn default_key_id(&self) -> &str;

    /// Algorithm of the default key.
    fn default_algorithm(&self) -> SigningAlgorithm;

    /// Sign with the default key.
    fn sign_default(&self, claims: &Claims) -> Result<String, SigningError> {
        self.sign(claims, self.default_algorithm(), self.default_key_id())
    }
}

struct SigningKey {
    algorithm: SigningAlgorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Value,
}

/// `jsonwebtoken`-backed signer holding keys indexed by `kid`.
pub struct JwtSigner {
    keys: HashMap<String, SigningKey>,
    default_kid: String,
}

impl JwtSigner {
    /// Generate a throwaway ES256 key pair.
    pub fn generate_ephemeral(key_id: &str) -> Result<Self, SigningError> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| SigningError::KeyMaterial(format!("Failed to generate key: {e}")))?;
        let private_pem = key_pair.serialize_pem();
        let public_pem = key_pair.public_key_pem();

        info!(kid = %key_id, alg = "ES256", "Generated ephemeral signing key");
        Self::from_pem(key_id, SigningAlgorithm::ES256, &private_pem, &public_pem)
    }

    /// Build a signer from PEM-encoded key material.
    pub fn from_pem(
        key_id: &str,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<Self, SigningError> {
        let mut signer = Self {
            keys: HashMap::new(),
            default_kid: key_id.to_string(),
        };
        signer.add_key(key_id, algorithm, private_pem, public_pem)?;
        Ok(signer)
    }

    /// Build the signer described by the `signing` config section.
    pub fn from_config(config: &SigningConfig) -> Result<Self, SigningError> {
        match (&config.private_key_path, &config.public_key_path) {
            (Some(private), Some(public)) => {
                let private_pem = read_pem(private)?;
                let public_pem = read_pem(public)?;
                info!(
                    kid = %config.key_id,
                    alg = %config.algorithm,
                    "Loaded signing key from {}",
                    private.display()
                );
                Self::from_pem(&config.key_id, config.algorithm, &private_pem, &public_pem)
            }
            (None, None) if config.algorithm == SigningAlgorithm::ES256 => {
                Self::generate_ephemeral(&config.key_id)
            }
            (None, None) => Err(SigningError::KeyMaterial(format!(
                "{} requires private_key_path and public_key_path",
                config.algorithm
            ))),
            _ => Err(SigningError::KeyMaterial(
                "private_key_path and public_key_path must be set together".to_string(),
            )),
        }
    }

    /// Register an additional key. Existing keys under the same `kid` are replaced.
    pub fn add_key(
        &mut self,
        key_id: &str,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<(), SigningError> {
        let (encoding, decoding) = match algorithm {
            SigningAlgorithm::ES256 => (
                EncodingKey::from_ec_pem(private_pem.as_bytes())?,
                DecodingKey::from_ec_pem(public_pem.as_bytes())?,
            ),
            SigningAlgorithm::RS256 => (
                EncodingKey::from_rsa_pem(private_pem.as_bytes())?,
                DecodingKey::from_rsa_pem(public_pem.as_bytes())?,
            ),
        };
        let jwk = public_jwk(key_id, algorithm, public_pem)?;

        self.keys.insert(
            key_id.to_string(),
            SigningKey {
                algorithm,
                encoding,
                decoding,
                jwk,
            },
        );
        Ok(())
    }

    fn key(&self, key_id: &str) -> Result<&SigningKey, SigningError> {
        self.keys
            .get(key_id)
            .ok_or_else(|| SigningError::UnknownKey(key_id.to_string()))
    }
}

impl TokenSigner for JwtSigner {
    fn sign(
        &self,
        claims: &Claims,
        algorithm: SigningAlgorithm,
        key_id: &str,
    ) -> Result<String, SigningError> {
        let key = self.key(key_id)?;
        if key.algorithm != algorithm {
            return Err(SigningError::AlgorithmMismatch {
                key_id: key_id.to_string(),
                expected: key.algorithm.to_string(),
                actual: algorithm.to_string(),
            });
        }

        let mut header = Header::new(algorithm.jwt());
        header.kid = Some(key_id.to_string());
        Ok(jsonwebtoken::encode(&header, claims, &key.encoding)?)
    }

    fn verify(&self, token: &str) -> Result<Claims, SigningError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.unwrap_or_else(|| self.default_kid.clone());
        let key = self.key(&kid)?;

        if header.alg != key.algorithm.jwt() {
            debug!(kid = %kid, "Token header algorithm does not match key");
            return Err(SigningError::AlgorithmMismatch {
                key_id: kid,
                expected: key.algorithm.to_string(),
                actual: format!("{:?}", header.alg),
            });
        }

        // Audience is checked by callers against the client they serve.
        let mut validation = Validation::new(key.algorithm.jwt());
        validation.validate_aud = false;
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<Claims>(token, &key.decoding, &validation)?;
        Ok(data.claims)
    }

    fn jwks(&self) -> Value {
        let mut kids: Vec<&String> = self.keys.keys().collect();
        kids.sort();
        let keys: Vec<Value> = kids
            .into_iter()
            .filter_map(|kid| self.keys.get(kid).map(|k| k.jwk.clone()))
            .collect();
        json!({ "keys": keys })
    }

    fn default_key_id(&self) -> &str {
        &self.default_kid
    }

    fn default_algorithm(&self) -> SigningAlgorithm {
        self.keys
            .get(&self.default_kid)
            .map_or(SigningAlgorithm::ES256, |k| k.algorithm)
    }
}

fn read_pem(path: &Path) -> Result<String, SigningError> {
    std::fs::read_to_string(path)
        .map_err(|e| SigningError::KeyMaterial(format!("{}: {e}", path.display())))
}

/// Derive the public JWK for an SPKI PEM.
fn public_jwk(
    key_id: &str,
    algorithm: SigningAlgorithm,
    public_pem: &str,
) -> Result<Value, SigningError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(public_pem.as_bytes())
        .map_err(|e| SigningError::KeyMaterial(format!("Invalid public key PEM: {e}")))?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(&pem.contents)
        .map_err(|e| SigningError::KeyMaterial(format!("Invalid SPKI: {e}")))?;
    let parsed = spki
        .parsed()
        .map_err(|e| SigningError::KeyMaterial(format!("Unsupported public key: {e}")))?;

    match (algorithm, parsed) {
        (SigningAlgorithm::ES256, PublicKey::EC(point)) => {
            let data = point.data();
            // Uncompressed SEC1 point: 0x04 || X || Y
            if data.len() != 65 || data[0] != 0x04 {
                return Err(SigningError::KeyMaterial(
                    "Expected an uncompressed P-256 point".to_string(),
                ));
            }
            Ok(json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode(&data[1..33]),
                "y": URL_SAFE_NO_PAD.encode(&data[33..65]),
                "use": "sig",
                "alg": algorithm.as_str(),
                "kid": key_id,
            }))
        }
        (SigningAlgorithm::RS256, PublicKey::RSA(rsa)) => Ok(json!({
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.modulus)),
            "e": URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.exponent)),
            "use": "sig",
            "alg": algorithm.as_str(),
            "kid": key_id,
        })),
        (alg, _) => Err(SigningError::KeyMaterial(format!(
            "Public key type does not match {alg}"
        ))),
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    &bytes[start..]
}
