//! Scope-driven user claims.

use serde_json::{Value, json};

use super::models::User;
use crate::signing::Claims;

/// Assemble the claims a user discloses for `scopes`.
///
/// `sub` is always present. `profile` adds `name`, `preferred_username`
/// and `updated_at`; `email` adds `email` and `email_verified`; `roles`
/// adds the role list. Per-user custom claims are merged last and win.
pub fn user_claims(user: &User, scopes: &[&str]) -> Claims {
    let mut claims = Claims::new();
    claims.insert("sub".into(), json!(user.id));

    for scope in scopes {
        match *scope {
            "profile" => {
                claims.insert("name".into(), json!(user.name));
                claims.insert("preferred_username".into(), json!(user.id));
                claims.insert("updated_at".into(), json!(user.created_at.timestamp()));
            }
            "email" => {
                claims.insert("email".into(), json!(user.email));
                claims.insert("email_verified".into(), Value::Bool(true));
            }
            "roles" => {
                claims.insert("roles".into(), json!(user.roles));
            }
            _ => {}
        }
    }

    for (key, value) in &user.claims {
        claims.insert(key.clone(), value.clone());
    }

    claims
}
