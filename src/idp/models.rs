//! Identity store records: clients, users, codes, refresh tokens.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signing::Claims;

/// How a client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Browser or native app; cannot keep a secret, relies on PKCE.
    Public,
    /// Server-side app holding a secret.
    Confidential,
    /// Service account using the client-credentials grant.
    Machine,
}

impl ClientType {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Confidential => "confidential",
            Self::Machine => "machine",
        }
    }
}

/// OAuth 2.0 grant types the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `authorization_code`
    AuthorizationCode,
    /// `refresh_token`
    RefreshToken,
    /// `client_credentials`
    ClientCredentials,
}

impl GrantType {
    /// Wire name used in `grant_type`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for a `grant_type` outside [`GrantType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported grant type: {0}")]
pub struct UnsupportedGrantType(pub String);

impl FromStr for GrantType {
    type Err = UnsupportedGrantType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(Self::AuthorizationCode),
            "refresh_token" => Ok(Self::RefreshToken),
            "client_credentials" => Ok(Self::ClientCredentials),
            other => Err(UnsupportedGrantType(other.to_string())),
        }
    }
}

/// A registered relying party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Client identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Authentication style
    #[serde(rename = "type")]
    pub client_type: ClientType,
    /// Shared secret; absent for public clients
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    /// Exact-match redirect URIs
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Grants this client may use
    #[serde(default)]
    pub grant_types: Vec<GrantType>,
    /// Scopes this client may request
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Client {
    /// Whether the token endpoint must check a secret for this client.
    #[must_use]
    pub fn requires_secret(&self) -> bool {
        self.client_type != ClientType::Public
    }

    /// Whether the client is registered for `grant`.
    #[must_use]
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Whether every scope in `requested` is in the client's allowed set.
    #[must_use]
    pub fn allows_scopes(&self, requested: &[&str]) -> bool {
        requested
            .iter()
            .all(|s| self.scopes.iter().any(|allowed| allowed == s))
    }
}

/// A demo principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Stable subject identifier
    pub id: String,
    /// Login name
    pub email: String,
    /// Compared on login, never serialized
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Display name
    pub name: String,
    /// Role list exposed under the `roles` scope
    #[serde(default)]
    pub roles: Vec<String>,
    /// Extra claims merged over the standard ones
    #[serde(default)]
    pub claims: Claims,
    /// Creation time; drives `updated_at`
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// PKCE transformation recorded with a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    /// `S256`
    S256,
    /// `plain`
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    /// Parse the request parameter. Anything other than `plain` is S256.
    #[must_use]
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("plain") => Self::Plain,
            _ => Self::S256,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

/// Arguments to [`super::MockIdp::create_authorization_code`].
#[derive(Debug, Clone, Default)]
pub struct CodeRequest {
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub correlation_id: Option<String>,
}

/// A single-use proof of authenticated consent.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub user_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: CodeChallengeMethod,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    /// Flow the code was issued in
    pub correlation_id: Option<String>,
}

impl AuthorizationCode {
    /// Whether the code is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A stored refresh token, bound to the client that obtained it.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub user_id: String,
    pub scope: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub correlation_id: Option<String>,
}

impl RefreshToken {
    /// Whether the token is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Split a space-delimited scope string.
pub fn scope_list(scope: &str) -> Vec<&str> {
    scope.split_whitespace().collect()
}

/// Whether a space-delimited scope string contains `wanted`.
pub fn has_scope(scope: &str, wanted: &str) -> bool {
    scope.split_whitespace().any(|s| s == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> Client {
        Client {
            id: "svc".into(),
            name: "Service".into(),
            client_type: ClientType::Machine,
            secret: Some("s".into()),
            redirect_uris: vec![],
            grant_types: vec![GrantType::ClientCredentials],
            scopes: vec!["api:read".into(), "api:write".into()],
        }
    }

    #[test]
    fn grant_type_parses_wire_names() {
        assert_eq!(
            "authorization_code".parse::<GrantType>().unwrap(),
            GrantType::AuthorizationCode
        );
        assert_eq!(
            "client_credentials".parse::<GrantType>().unwrap(),
            GrantType::ClientCredentials
        );
        assert_eq!(
            "password".parse::<GrantType>().unwrap_err(),
            UnsupportedGrantType("password".into())
        );
    }

    #[test]
    fn challenge_method_defaults_to_s256() {
        assert_eq!(CodeChallengeMethod::from_param(None), CodeChallengeMethod::S256);
        assert_eq!(
            CodeChallengeMethod::from_param(Some("S256")),
            CodeChallengeMethod::S256
        );
        assert_eq!(
            CodeChallengeMethod::from_param(Some("bogus")),
            CodeChallengeMethod::S256
        );
        assert_eq!(
            CodeChallengeMethod::from_param(Some("plain")),
            CodeChallengeMethod::Plain
        );
    }

    #[test]
    fn client_scope_and_grant_checks() {
        let client = machine();
        assert!(client.requires_secret());
        assert!(client.allows_grant(GrantType::ClientCredentials));
        assert!(!client.allows_grant(GrantType::AuthorizationCode));
        assert!(client.allows_scopes(&["api:read"]));
        assert!(!client.allows_scopes(&["api:read", "admin"]));
    }

    #[test]
    fn client_secret_is_not_serialized() {
        let json = serde_json::to_value(machine()).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["type"], "machine");
    }

    #[test]
    fn user_deserializes_from_yaml() {
        let yaml = r"
id: carol
email: carol@example.com
password: hunter2
name: Carol
roles: [auditor]
claims:
  department: finance
";
        let user: User = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(user.password, "hunter2");
        assert_eq!(user.claims["department"], "finance");
        let out = serde_json::to_value(&user).unwrap();
        assert!(out.get("password").is_none());
    }

    #[test]
    fn scope_helpers() {
        assert_eq!(scope_list(" openid  profile "), vec!["openid", "profile"]);
        assert!(has_scope("openid profile", "openid"));
        assert!(!has_scope("openidx", "openid"));
    }
}
