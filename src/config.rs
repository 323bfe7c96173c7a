//! Configuration management

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::idp::{Client, User};
use crate::signing::SigningAlgorithm;
use crate::{Error, Result};

/// Environment variable prefix for overrides (`SHOWCASE_SERVER__PORT=9000`).
pub const ENV_PREFIX: &str = "SHOWCASE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// HTTP listener
    pub server: ServerConfig,
    /// Mock identity provider
    pub idp: IdpConfig,
    /// Token signing keys
    pub signing: SigningConfig,
    /// Live event stream
    pub looking_glass: LookingGlassConfig,
    /// Plugin lifecycle deadlines
    pub lifecycle: LifecycleConfig,
    /// Per-plugin switches and settings, keyed by plugin id
    pub plugins: HashMap<String, PluginConfig>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is missing or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files first so their variables are visible to expansion
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Settings for a plugin id; plugins absent from the map are enabled with no settings.
    #[must_use]
    pub fn plugin(&self, id: &str) -> PluginConfig {
        self.plugins.get(id).cloned().unwrap_or_default()
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(format!("env pattern: {e}")))?;

        self.idp.issuer = Self::expand_string(&re, &self.idp.issuer);

        for path in [
            &mut self.signing.private_key_path,
            &mut self.signing.public_key_path,
        ]
        .into_iter()
        .flatten()
        {
            *path = PathBuf::from(Self::expand_string(&re, &path.to_string_lossy()));
        }

        for plugin in self.plugins.values_mut() {
            for value in plugin.settings.values_mut() {
                if let Value::String(s) = value {
                    *s = Self::expand_string(&re, s);
                }
            }
        }

        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Allow any origin (the dashboard usually runs on another port)
    pub cors_allow_any_origin: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(10),
            cors_allow_any_origin: true,
        }
    }
}

/// Mock identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// `iss` claim and base of discovery URLs
    pub issuer: String,
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token_ttl: Duration,
    /// ID token lifetime
    #[serde(with = "humantime_serde")]
    pub id_token_ttl: Duration,
    /// Seed demo users and clients
    pub seed_demo_data: bool,
    /// How often expired codes and tokens are purged
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    /// Additional users; replace seeded users with the same id
    #[serde(skip_serializing)]
    pub users: Vec<User>,
    /// Additional clients; replace seeded clients with the same id
    #[serde(skip_serializing)]
    pub clients: Vec<Client>,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            code_ttl: Duration::from_secs(10 * 60),
            access_token_ttl: Duration::from_secs(60 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            id_token_ttl: Duration::from_secs(60 * 60),
            seed_demo_data: true,
            reaper_interval: Duration::from_secs(60),
            users: Vec::new(),
            clients: Vec::new(),
        }
    }
}

/// Signing key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// `ES256` or `RS256`
    pub algorithm: SigningAlgorithm,
    /// `kid` header value
    pub key_id: String,
    /// PKCS#8 private key PEM
    pub private_key_path: Option<PathBuf>,
    /// SPKI public key PEM
    pub public_key_path: Option<PathBuf>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: SigningAlgorithm::ES256,
            key_id: "showcase-key-1".to_string(),
            private_key_path: None,
            public_key_path: None,
        }
    }
}

/// Looking-glass event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookingGlassConfig {
    /// Events retained for replay and history
    pub retention: usize,
    /// Per-subscriber broadcast buffer
    pub channel_capacity: usize,
    /// SSE keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Upper bound on `replay=N`
    pub max_replay: usize,
}

impl Default for LookingGlassConfig {
    fn default() -> Self {
        Self {
            retention: 1000,
            channel_capacity: 256,
            keep_alive_interval: Duration::from_secs(15),
            max_replay: 200,
        }
    }
}

/// Plugin lifecycle deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Deadline for one plugin's initialization, hooks included
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Deadline for one plugin's shutdown, hooks included
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// One plugin's configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Register and initialize this plugin
    pub enabled: bool,
    /// Plugin-specific settings
    pub settings: serde_json::Map<String, Value>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: serde_json::Map::new(),
        }
    }
}

impl PluginConfig {
    /// String setting, if present.
    #[must_use]
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// Duration setting given as a human string (`"5m"`) or seconds.
    pub fn setting_duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.settings.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|secs| Some(Duration::from_secs(secs)))
                .ok_or_else(|| Error::Config(format!("{key}: expected a positive number"))),
            Some(Value::String(s)) => humantime_serde::parse(s)
                .map(Some)
                .map_err(|e| Error::Config(format!("{key}: {e}"))),
            Some(other) => Err(Error::Config(format!(
                "{key}: expected a duration, got {other}"
            ))),
        }
    }
}

/// Human-readable duration serialization (`"30s"`, `"10m"`, `"7d"`, `"250ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"7d"` or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
