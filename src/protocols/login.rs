//! HTML login form shared by the browser-facing flows.

use std::fmt::Write as _;

use axum::response::{Html, IntoResponse, Response};

use crate::idp::presets::user_presets;
use crate::idp::scope_list;

/// A login page posting back to `action`.
pub(crate) struct LoginPage<'a> {
    pub title: &'a str,
    pub badge: &'a str,
    pub action: &'a str,
    pub button: &'a str,
    pub client_name: &'a str,
    /// Hidden form fields carried through the submit
    pub hidden: Vec<(&'a str, &'a str)>,
    pub scope: &'a str,
    pub error: Option<&'a str>,
}

impl LoginPage<'_> {
    pub fn render(&self) -> String {
        let mut hidden = String::new();
        for (name, value) in &self.hidden {
            let _ = writeln!(
                hidden,
                r#"      <input type="hidden" name="{}" value="{}">"#,
                escape(name),
                escape(value)
            );
        }

        let error = self
            .error
            .map(|e| format!(r#"<div class="error">{}</div>"#, escape(e)))
            .unwrap_or_default();

        let mut demo_users = String::new();
        for preset in user_presets() {
            let _ = writeln!(
                demo_users,
                r#"      <div class="demo-user" onclick="fill('{email}', '{password}')"><div class="name">{name}</div><div class="email">{email}</div></div>"#,
                email = escape(&preset.credentials.email),
                password = escape(&preset.credentials.password),
                name = escape(&preset.name),
            );
        }

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <title>Login - {title}</title>
  <style>
    body {{ font-family: system-ui, sans-serif; background: #1a1a2e; color: #e4e4e7; display: flex; justify-content: center; padding-top: 8vh; }}
    .container {{ background: rgba(255,255,255,0.05); border: 1px solid rgba(255,255,255,0.1); border-radius: 16px; padding: 40px; width: 420px; }}
    .badge {{ color: #a5b4fc; font-size: 14px; }}
    .error {{ background: rgba(239,68,68,0.1); color: #fca5a5; padding: 12px; border-radius: 8px; margin-bottom: 16px; }}
    input[type=email], input[type=password] {{ width: 100%; padding: 10px; margin-bottom: 16px; }}
    button {{ width: 100%; padding: 12px; background: #6366f1; color: #fff; border: none; border-radius: 8px; }}
    .demo-user {{ cursor: pointer; padding: 8px; margin-top: 8px; background: rgba(0,0,0,0.2); border-radius: 8px; }}
    .demo-user .email, .scopes {{ font-size: 12px; color: #71717a; }}
    .scopes span {{ display: inline-block; background: rgba(99,102,241,0.1); padding: 2px 6px; margin: 2px; border-radius: 4px; }}
  </style>
</head>
<body>
  <div class="container">
    <h1>Protocol Showcase</h1>
    <div class="badge">{badge}</div>
    <p>Signing in to <strong>{client}</strong></p>
    {error}
    <form method="POST" action="{action}">
{hidden}      <label for="email">Email</label>
      <input type="email" id="email" name="email" placeholder="alice@example.com" required>
      <label for="password">Password</label>
      <input type="password" id="password" name="password" required>
      <button type="submit">{button}</button>
    </form>
    <div class="demo-users">
      <h3>Demo users (click to autofill)</h3>
{demo_users}    </div>
    <div class="scopes">Requested scopes: {scopes}</div>
  </div>
  <script>
    function fill(email, password) {{
      document.getElementById('email').value = email;
      document.getElementById('password').value = password;
    }}
  </script>
</body>
</html>"#,
            title = escape(self.title),
            badge = escape(self.badge),
            client = escape(self.client_name),
            action = escape(self.action),
            button = escape(self.button),
            scopes = format_scopes(self.scope),
        )
    }
}

impl IntoResponse for LoginPage<'_> {
    fn into_response(self) -> Response {
        Html(self.render()).into_response()
    }
}

fn format_scopes(scope: &str) -> String {
    let scopes = scope_list(scope);
    if scopes.is_empty() {
        return "<span>none</span>".to_string();
    }
    scopes
        .into_iter()
        .map(|s| format!("<span>{}</span>", escape(s)))
        .collect()
}

/// Escape text for HTML element and attribute context.
pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
