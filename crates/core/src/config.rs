//! Configuration types and layered loading.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. `BAZEL_CACHE_<SECTION>__<KEY>` environment variables
//! 4. The conventional AWS / listener environment variables (`AWS_S3_BUCKET`, ...)
//!
//! Command-line flags are layered on top by the binary.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::value::{Dict, Map, Value};
use figment::{Figment, Metadata, Profile, Provider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the optional config file.
pub const DEFAULT_CONFIG_PATH: &str = "bazel-s3-cache.toml";

/// Prefix for nested environment overrides (`BAZEL_CACHE_STORAGE__BUCKET`).
pub const ENV_PREFIX: &str = "BAZEL_CACHE_";

/// Unprefixed environment variables and the config keys they populate.
pub const LEGACY_ENV_VARS: &[(&str, &str)] = &[
    ("LISTEN_ADDR", "server.listen"),
    ("AWS_S3_BUCKET", "storage.bucket"),
    ("AWS_DEFAULT_REGION", "storage.region"),
    ("AWS_ACCESS_KEY_ID", "storage.access_key_id"),
    ("AWS_SECRET_ACCESS_KEY", "storage.secret_access_key"),
    ("AWS_SESSION_TOKEN", "storage.session_token"),
    ("AWS_ENDPOINT_URL_S3", "storage.endpoint"),
];

/// HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address. `:PORT` binds every interface.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Upper bound on draining in-flight requests after a shutdown signal.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Serve Prometheus metrics on `/metrics` (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Address suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }

    /// Get the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// S3 storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket holding the `ac/` and `cas/` prefixes. Required.
    #[serde(default)]
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Static access key. Falls back to the default AWS credential chain when unset.
    pub access_key_id: Option<String>,
    /// Static secret key, required together with `access_key_id`.
    pub secret_access_key: Option<String>,
    /// Optional session token for temporary static credentials.
    pub session_token: Option<String>,
    /// Optional endpoint URL for S3-compatible services (MinIO, etc.).
    pub endpoint: Option<String>,
    /// Use path-style URLs (`endpoint/bucket/key`). Needed by MinIO.
    #[serde(default)]
    pub force_path_style: bool,
    /// Total attempts per S3 request, including the first (1 disables retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            endpoint: None,
            force_path_style: false,
            max_attempts: default_max_attempts(),
        }
    }
}

impl StorageConfig {
    /// Create a configuration for the given bucket with default settings.
    pub fn for_bucket(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Treat empty strings from the environment as unset.
    pub fn normalize(&mut self) {
        for value in [
            &mut self.access_key_id,
            &mut self.secret_access_key,
            &mut self.session_token,
            &mut self.endpoint,
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        self.bucket = self.bucket.trim().to_string();
    }

    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.is_empty() {
            return Err("s3 bucket for cache not set".to_string());
        }
        if self.region.trim().is_empty() {
            return Err("s3 region must not be empty".to_string());
        }
        if self.max_attempts == 0 {
            return Err("storage.max_attempts must be at least 1".to_string());
        }
        match (
            self.access_key_id.as_ref(),
            self.secret_access_key.as_ref(),
            self.session_token.as_ref(),
        ) {
            (Some(_), Some(_), _) | (None, None, None) => Ok(()),
            (None, None, Some(_)) => {
                Err("s3 session token requires access_key_id and secret_access_key".to_string())
            }
            _ => Err(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ),
        }
    }

    /// Whether static credentials were supplied.
    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Build the layered figment: defaults, file, prefixed env, legacy env.
    ///
    /// The file is skipped if it does not exist.
    pub fn figment(config_file: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file.as_ref()))
            .merge(StringEnv(Env::prefixed(ENV_PREFIX).split("__")))
            .merge(StringEnv(legacy_env()))
    }

    /// Extract, normalize and validate a configuration.
    ///
    /// Numeric and boolean settings accept their string forms (`"5"`, `"true"`,
    /// `"on"`) since environment layers only carry strings.
    pub fn from_figment(figment: &Figment) -> crate::Result<Self> {
        let mut config: AppConfig = figment
            .extract_lossy()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.storage.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.listen.trim().is_empty() {
            return Err(crate::Error::Config(
                "server.listen must not be empty".to_string(),
            ));
        }
        self.storage.validate().map_err(crate::Error::Config)
    }

    /// Create a test configuration pointing at a dummy bucket.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::for_bucket("bazel-cache-test"),
        }
    }
}

/// Environment provider for the unprefixed variables in [`LEGACY_ENV_VARS`].
fn legacy_env() -> Env {
    let names: Vec<&str> = LEGACY_ENV_VARS.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV_VARS
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| path.to_string())
            .unwrap_or_else(|| key.as_str().to_string())
            .into()
    })
}

/// Environment provider that keeps every value as a string.
///
/// `Env` parses values, so `AWS_S3_BUCKET=123456` would arrive as an integer
/// and `AWS_SECRET_ACCESS_KEY=true` as a bool. Key filtering and nesting are
/// still done by the wrapped `Env`.
struct StringEnv(Env);

impl Provider for StringEnv {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> figment::Result<Map<Profile, Dict>> {
        let mut dict = Dict::new();
        for (key, value) in self.0.iter() {
            insert_path(&mut dict, key.as_str(), value);
        }
        Ok(self.0.profile.collect(dict))
    }
}

/// Insert `value` at a dotted `path`, creating intermediate dictionaries.
fn insert_path(dict: &mut Dict, path: &str, value: String) {
    match path.split_once('.') {
        Some((head, rest)) => {
            let entry = dict
                .entry(head.to_string())
                .or_insert_with(|| Value::from(Dict::new()));
            if let Value::Dict(_, inner) = entry {
                insert_path(inner, rest, value);
            }
        }
        None => {
            dict.insert(path.to_string(), Value::from(value));
        }
    }
}
