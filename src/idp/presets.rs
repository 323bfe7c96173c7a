//! Demo seed data and the read-only presets offered to UIs.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::models::{Client, ClientType, GrantType, User};
use crate::signing::Claims;

/// Redirect URI registered for the confidential demo client.
pub const DEMO_APP_REDIRECT: &str = "http://localhost:3000/callback";
/// Redirect URI registered for the public demo client.
pub const PUBLIC_APP_REDIRECT: &str = "http://localhost:3000/callback/spa";

/// Login credentials shown next to a demo user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoCredentials {
    pub email: String,
    pub password: String,
}

/// A selectable demo user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoUserPreset {
    pub id: String,
    pub name: String,
    pub description: String,
    pub credentials: DemoCredentials,
    pub suggested_scopes: Vec<String>,
}

/// A selectable demo client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoClientPreset {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub client_type: ClientType,
    pub grant_types: Vec<GrantType>,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub redirect_uris: Vec<String>,
}

/// Both preset lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoPresets {
    pub users: Vec<DemoUserPreset>,
    pub clients: Vec<DemoClientPreset>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

fn user(id: &str, email: &str, password: &str, name: &str, roles: &[&str]) -> User {
    User {
        id: id.to_string(),
        email: email.to_string(),
        password: password.to_string(),
        name: name.to_string(),
        roles: strings(roles),
        claims: Claims::new(),
        created_at: Utc::now(),
    }
}

/// Users seeded at startup.
pub fn demo_users() -> Vec<User> {
    vec![
        user("alice", "alice@example.com", "password123", "Alice Smith", &["user"]),
        user("bob", "bob@example.com", "password123", "Bob Jones", &["user"]),
        user(
            "admin",
            "admin@example.com",
            "admin123",
            "Admin User",
            &["admin", "user"],
        ),
    ]
}

/// Clients seeded at startup.
pub fn demo_clients() -> Vec<Client> {
    vec![
        Client {
            id: "demo-app".into(),
            name: "Demo Application (Confidential)".into(),
            client_type: ClientType::Confidential,
            secret: Some("demo-secret".into()),
            redirect_uris: strings(&[DEMO_APP_REDIRECT]),
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            scopes: strings(&["openid", "profile", "email"]),
        },
        Client {
            id: "public-app".into(),
            name: "Public Application (SPA)".into(),
            client_type: ClientType::Public,
            secret: None,
            redirect_uris: strings(&[PUBLIC_APP_REDIRECT]),
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            scopes: strings(&["openid", "profile", "email"]),
        },
        Client {
            id: "machine-client".into(),
            name: "Machine-to-Machine Client".into(),
            client_type: ClientType::Machine,
            secret: Some("machine-secret".into()),
            redirect_uris: Vec::new(),
            grant_types: vec![GrantType::ClientCredentials],
            scopes: strings(&["api:read", "api:write"]),
        },
    ]
}

/// Demo users with credentials and suggested scopes.
pub fn user_presets() -> Vec<DemoUserPreset> {
    let preset = |id: &str, name: &str, description: &str, email: &str, password: &str, scopes: &[&str]| {
        DemoUserPreset {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            credentials: DemoCredentials {
                email: email.to_string(),
                password: password.to_string(),
            },
            suggested_scopes: strings(scopes),
        }
    };

    vec![
        preset(
            "alice",
            "Alice (Standard User)",
            "A standard user with basic permissions",
            "alice@example.com",
            "password123",
            &["openid", "profile", "email"],
        ),
        preset(
            "bob",
            "Bob (Standard User)",
            "Another standard user for testing multi-user scenarios",
            "bob@example.com",
            "password123",
            &["openid", "profile", "email"],
        ),
        preset(
            "admin",
            "Admin (Elevated Permissions)",
            "An administrator with elevated permissions and roles",
            "admin@example.com",
            "admin123",
            &["openid", "profile", "email", "roles"],
        ),
    ]
}

/// Demo clients with type, grants and scopes.
pub fn client_presets() -> Vec<DemoClientPreset> {
    let descriptions = [
        ("demo-app", "A server-side application with a client secret"),
        (
            "public-app",
            "A single-page application without a client secret (uses PKCE)",
        ),
        (
            "machine-client",
            "A service account for API access without user context",
        ),
    ];

    demo_clients()
        .into_iter()
        .map(|client| {
            let description = descriptions
                .iter()
                .find(|(id, _)| *id == client.id)
                .map(|(_, d)| (*d).to_string())
                .unwrap_or_default();
            DemoClientPreset {
                description,
                id: client.id,
                name: client.name,
                client_type: client.client_type,
                grant_types: client.grant_types,
                scopes: client.scopes,
                secret: client.secret,
                redirect_uris: client.redirect_uris,
            }
        })
        .collect()
}

/// Both preset lists.
pub fn presets() -> DemoPresets {
    DemoPresets {
        users: user_presets(),
        clients: client_presets(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_match_seed() {
        let presets = presets();
        let users = demo_users();
        for preset in &presets.users {
            let seeded = users.iter().find(|u| u.id == preset.id).unwrap();
            assert_eq!(seeded.email, preset.credentials.email);
            assert_eq!(seeded.password, preset.credentials.password);
        }
        assert_eq!(presets.clients.len(), demo_clients().len());
    }

    #[test]
    fn public_preset_has_no_secret() {
        let clients = client_presets();
        let public = clients.iter().find(|c| c.id == "public-app").unwrap();
        assert!(public.secret.is_none());
        let json = serde_json::to_value(public).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["type"], "public");
        assert!(public.description.contains("PKCE"));
    }

    #[test]
    fn admin_has_roles() {
        let admin = demo_users().into_iter().find(|u| u.id == "admin").unwrap();
        assert_eq!(admin.roles, vec!["admin", "user"]);
    }
}
