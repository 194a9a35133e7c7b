use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("finchat.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.pricing.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("FINCHAT_ENDPOINT_URL") {
            self.server.endpoint_url = url;
        }
        if let Ok(db_path) = env::var("FINCHAT_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
        if let Ok(data_path) = env::var("FINCHAT_DATA_PATH") {
            self.data.path = PathBuf::from(data_path);
        }
        if let Ok(key) = env::var("FINCHAT_SESSION_KEY") {
            self.storage.session_key = key;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Namespace inside the store; one per logical user session.
    #[serde(default = "default_session_key")]
    pub session_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            session_key: default_session_key(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_path")]
    pub path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: default_data_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: u64,
    #[serde(default = "default_recent_queries")]
    pub recent_queries: usize,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            recent_queries: default_recent_queries(),
            log_path: default_log_path(),
        }
    }
}

/// Unit costs per 1M prompt tokens, split by whether the provider served them from cache.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_cache_miss_rate", alias = "prompt_per_1m")]
    pub cache_miss_per_1m: f64,
    #[serde(default = "default_cache_hit_rate", alias = "cached_prompt_per_1m")]
    pub cache_hit_per_1m: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            cache_miss_per_1m: default_cache_miss_rate(),
            cache_hit_per_1m: default_cache_hit_rate(),
        }
    }
}

impl PricingConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.cache_hit_per_1m.is_finite() || !self.cache_miss_per_1m.is_finite() {
            bail!("pricing rates must be finite numbers");
        }
        if self.cache_hit_per_1m < 0.0 {
            bail!("pricing.cache_hit_per_1m must not be negative");
        }
        if self.cache_hit_per_1m >= self.cache_miss_per_1m {
            bail!(
                "pricing.cache_hit_per_1m ({}) must be lower than pricing.cache_miss_per_1m ({})",
                self.cache_hit_per_1m,
                self.cache_miss_per_1m
            );
        }
        Ok(())
    }
}

fn default_endpoint_url() -> String {
    "https://dashboard-ai-production.up.railway.app/chat".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_database_path() -> PathBuf {
    PathBuf::from("finchat.db")
}

fn default_session_key() -> String {
    "default".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data.json")
}

fn default_refresh_hz() -> u64 {
    10
}

fn default_recent_queries() -> usize {
    8
}

fn default_log_path() -> PathBuf {
    PathBuf::from("finchat.log")
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_cache_miss_rate() -> f64 {
    0.27
}

fn default_cache_hit_rate() -> f64 {
    0.07
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env, fs,
        path::PathBuf,
        sync::{Mutex, OnceLock},
    };
    use tempfile::NamedTempFile;

    #[test]
    fn load_from_file_applies_sections() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _url_guard = EnvGuard::unset("FINCHAT_ENDPOINT_URL");
        let _db_guard = EnvGuard::unset("FINCHAT_DB_PATH");
        let _data_guard = EnvGuard::unset("FINCHAT_DATA_PATH");
        let _key_guard = EnvGuard::unset("FINCHAT_SESSION_KEY");

        let file = NamedTempFile::new().unwrap();
        let toml = r#"
            [server]
            endpoint_url = "http://localhost:8083/chat"
            request_timeout_secs = 30

            [storage]
            database_path = "custom.db"
            session_key = "alice"

            [display]
            recent_queries = 3

            [pricing]
            cache_miss_per_1m = 1.0
            cache_hit_per_1m = 0.25
        "#;
        fs::write(file.path(), toml).unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.endpoint_url, "http://localhost:8083/chat");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.storage.database_path, PathBuf::from("custom.db"));
        assert_eq!(config.storage.session_key, "alice");
        assert_eq!(config.display.recent_queries, 3);
        assert_eq!(config.data.path, PathBuf::from("data.json"));
        assert!((config.pricing.cache_miss_per_1m - 1.0).abs() < f64::EPSILON);
        assert!((config.pricing.cache_hit_per_1m - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _url_guard = EnvGuard::set("FINCHAT_ENDPOINT_URL", "http://127.0.0.1:9000/chat");
        let _db_guard = EnvGuard::set("FINCHAT_DB_PATH", "/tmp/finchat-test.db");
        let _data_guard = EnvGuard::set("FINCHAT_DATA_PATH", "/tmp/finchat-data.json");
        let _key_guard = EnvGuard::set("FINCHAT_SESSION_KEY", "bob");

        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
            [server]
            endpoint_url = "https://example.com/chat"

            [storage]
            session_key = "alice"
            "#,
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.server.endpoint_url, "http://127.0.0.1:9000/chat");
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/tmp/finchat-test.db")
        );
        assert_eq!(config.data.path, PathBuf::from("/tmp/finchat-data.json"));
        assert_eq!(config.storage.session_key, "bob");
    }

    #[test]
    fn defaults_match_published_rates() {
        let pricing = PricingConfig::default();
        assert!((pricing.cache_miss_per_1m - 0.27).abs() < f64::EPSILON);
        assert!((pricing.cache_hit_per_1m - 0.07).abs() < f64::EPSILON);
        assert!(pricing.validate().is_ok());
    }

    #[test]
    fn cached_rate_must_be_cheaper() {
        let _lock = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
            [pricing]
            cache_miss_per_1m = 0.10
            cache_hit_per_1m = 0.10
            "#,
        )
        .unwrap();

        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("cache_hit_per_1m"));
    }

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            if previous.is_some() {
                unsafe { env::remove_var(key) };
            }
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(ref value) = self.previous {
                unsafe { env::set_var(self.key, value) };
            } else {
                unsafe { env::remove_var(self.key) };
            }
        }
    }

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
}
