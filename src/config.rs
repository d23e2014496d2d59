use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{RateLimitError, Result},
    policy::Role,
    redis::RedisConfig,
};

/// Environment prefix for overrides, e.g. `NEWSGATE__REDIS__URL`
pub const ENV_PREFIX: &str = "NEWSGATE";

/// Top-level settings for the rate limiting service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub redis: RedisSettings,
    pub local: LocalStoreSettings,
    pub cache: CacheSettings,
    pub policies: PolicySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
    /// Reverse proxies in front of the service; `X-Forwarded-For` is read
    /// this many hops from the right. Zero trusts only the socket address.
    pub trusted_proxies: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            trusted_proxies: 0,
        }
    }
}

/// Distributed backend settings. No URL means local-only mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
            key_prefix: "rl:".to_string(),
        }
    }
}

impl RedisSettings {
    /// Client configuration, if a backend is configured
    pub fn client_config(&self) -> Option<RedisConfig> {
        self.url
            .as_ref()
            .filter(|url| !url.trim().is_empty())
            .map(|url| RedisConfig {
                url: url.clone(),
                connection_timeout: Duration::from_millis(self.connect_timeout_ms),
                command_timeout: Duration::from_millis(self.command_timeout_ms),
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreSettings {
    /// Upper bound on live windows kept by each in-process store
    pub max_keys: u64,
}

impl Default for LocalStoreSettings {
    fn default() -> Self {
        Self { max_keys: 100_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub key_prefix: String,
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: "cache:".to_string(),
            default_ttl_secs: 300,
        }
    }
}

/// Window, quota and message of one named policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    pub window_ms: u64,
    pub max: u32,
    pub message: String,
    /// Requests whose path starts with one of these bypass the limiter
    #[serde(default)]
    pub skip_paths: Vec<String>,
}

impl LimitSettings {
    fn new(window: Duration, max: u32, message: &str) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max,
            message: message.to_string(),
            skip_paths: Vec::new(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

const MINUTE: Duration = Duration::from_secs(60);

/// Settings for every policy in the catalog
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub general: LimitSettings,
    pub auth: LimitSettings,
    pub fetch: LimitSettings,
    pub search: LimitSettings,
    pub user_action: LimitSettings,
    /// Quota multiplier applied to the general policy for elevated roles
    pub elevated_multiplier: u32,
    pub elevated_roles: Vec<Role>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            general: LimitSettings::new(
                15 * MINUTE,
                100,
                "Too many requests from this client, please try again later.",
            ),
            auth: LimitSettings::new(
                15 * MINUTE,
                5,
                "Too many authentication attempts, please try again later.",
            ),
            fetch: LimitSettings::new(
                60 * MINUTE,
                10,
                "News fetch limit reached, please try again later.",
            ),
            search: LimitSettings::new(MINUTE, 30, "Too many search requests, please slow down."),
            user_action: LimitSettings::new(
                MINUTE,
                100,
                "Too many actions, please slow down.",
            ),
            elevated_multiplier: 5,
            elevated_roles: vec![Role::Admin],
        }
    }
}

impl Settings {
    /// Load settings from an optional file, then `NEWSGATE__*` environment overrides.
    ///
    /// Both sources are layered over [`Settings::default`] key by key, so
    /// overriding one field of a policy keeps the rest of that policy's defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Settings::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }
}

/// Load settings from a YAML string, layered over the defaults like [`Settings::load`]
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    let overrides: serde_yaml::Value = serde_yaml::from_str(yaml)
        .map_err(|e| RateLimitError::Config(format!("Failed to parse YAML: {}", e)))?;

    let mut merged = serde_yaml::to_value(Settings::default())
        .map_err(|e| RateLimitError::Config(format!("Failed to encode defaults: {}", e)))?;
    if !overrides.is_null() {
        merge_yaml(&mut merged, overrides);
    }

    serde_yaml::from_value(merged)
        .map_err(|e| RateLimitError::Config(format!("Invalid settings: {}", e)))
}

/// Load settings from a YAML file
pub fn load_settings_from_file(path: &str) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}

fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
