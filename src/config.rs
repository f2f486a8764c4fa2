use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mitm::ca::{CaConfig, KeyAlgorithm};
use crate::scope::ScopeRules;

/// Runtime-adjustable interception settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    pub custom_headers: BTreeMap<String, String>,
    pub ssl_interception_enabled: bool,
    pub save_only_in_scope: bool,
    pub scope_rules: ScopeRules,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            custom_headers: BTreeMap::new(),
            ssl_interception_enabled: true,
            save_only_in_scope: false,
            scope_rules: ScopeRules::default(),
        }
    }
}

impl ProxySettings {
    /// Whether exchanges with `host` should be captured
    pub fn should_capture(&self, host: &str) -> bool {
        !self.save_only_in_scope || crate::scope::is_in_scope(host, Some(&self.scope_rules))
    }
}

/// Partial settings update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsUpdate {
    pub custom_headers: Option<BTreeMap<String, String>>,
    pub ssl_interception_enabled: Option<bool>,
    pub save_only_in_scope: Option<bool>,
    pub scope_rules: Option<ScopeRules>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    // Listener
    pub host: String,
    pub port: u16,

    // Application data (certificates live under `<data_dir>/certificates`)
    pub data_dir: PathBuf,
    pub ca: CaConfig,

    // Initial interception settings
    pub settings: ProxySettings,

    // Capture bounds
    pub max_captured_requests: usize,
    pub max_capture_body_bytes: usize,

    // Connection handling
    pub shutdown_grace: Duration,
    pub connect_timeout: Duration,
    pub verify_upstream_tls: bool,

    pub event_capacity: usize,
    pub log_json: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl ProxyConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ca: CaConfig::in_dir(data_dir.join("certificates")),
            data_dir,
            settings: ProxySettings::default(),
            max_captured_requests: 1000,
            max_capture_body_bytes: 10 * 1024 * 1024,
            shutdown_grace: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(10),
            verify_upstream_tls: false,
            event_capacity: 1024,
            log_json: true,
        }
    }

    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if present

        let data_dir = env::var("KPROXY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let mut config = Self::with_data_dir(data_dir);

        if let Ok(host) = env::var("KPROXY_HOST") {
            config.host = host;
        }
        config.port = parse_var("KPROXY_PORT", config.port)?;

        config.settings.ssl_interception_enabled =
            parse_var("KPROXY_SSL_INTERCEPTION", config.settings.ssl_interception_enabled)?;
        config.settings.save_only_in_scope =
            parse_var("KPROXY_SAVE_ONLY_IN_SCOPE", config.settings.save_only_in_scope)?;
        config.settings.scope_rules = ScopeRules::new(
            list_var("KPROXY_SCOPE_IN"),
            list_var("KPROXY_SCOPE_OUT"),
        );

        if let Ok(raw) = env::var("KPROXY_CUSTOM_HEADERS") {
            let headers: BTreeMap<String, String> =
                serde_json::from_str(&raw).context("Invalid KPROXY_CUSTOM_HEADERS")?;
            crate::headers::parse_custom_headers(&headers)
                .map_err(anyhow::Error::msg)
                .context("Invalid KPROXY_CUSTOM_HEADERS")?;
            config.settings.custom_headers = headers;
        }

        config.max_captured_requests =
            parse_var("KPROXY_MAX_CAPTURED_REQUESTS", config.max_captured_requests)?;
        config.max_capture_body_bytes =
            parse_var("KPROXY_MAX_CAPTURE_BODY_BYTES", config.max_capture_body_bytes)?;
        config.shutdown_grace =
            Duration::from_millis(parse_var("KPROXY_SHUTDOWN_GRACE_MS", 3000u64)?);
        config.connect_timeout =
            Duration::from_secs(parse_var("KPROXY_CONNECT_TIMEOUT_SECS", 10u64)?);
        config.event_capacity = parse_var("KPROXY_EVENT_CAPACITY", config.event_capacity)?;
        config.verify_upstream_tls =
            parse_var("KPROXY_VERIFY_UPSTREAM_TLS", config.verify_upstream_tls)?;
        config.ca.key_algorithm =
            parse_var::<KeyAlgorithm>("KPROXY_KEY_ALGORITHM", config.ca.key_algorithm)?;
        config.log_json = parse_var("KPROXY_LOG_JSON", config.log_json)?;

        if config.max_captured_requests == 0 {
            anyhow::bail!("KPROXY_MAX_CAPTURED_REQUESTS must be at least 1");
        }
        if config.event_capacity == 0 {
            anyhow::bail!("KPROXY_EVENT_CAPACITY must be at least 1");
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}

fn list_var(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("kproxy");
        }
    }
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".local/share/kproxy");
        }
    }
    PathBuf::from(".kproxy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "KPROXY_HOST",
        "KPROXY_PORT",
        "KPROXY_DATA_DIR",
        "KPROXY_SSL_INTERCEPTION",
        "KPROXY_SAVE_ONLY_IN_SCOPE",
        "KPROXY_SCOPE_IN",
        "KPROXY_SCOPE_OUT",
        "KPROXY_CUSTOM_HEADERS",
        "KPROXY_MAX_CAPTURED_REQUESTS",
        "KPROXY_KEY_ALGORITHM",
    ];

    fn clear_test_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KPROXY_DATA_DIR", "/tmp/kproxy-test");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert!(config.settings.ssl_interception_enabled);
        assert!(!config.settings.save_only_in_scope);
        assert_eq!(config.max_captured_requests, 1000);
        assert_eq!(config.max_capture_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert_eq!(
            config.ca.cert_path,
            PathBuf::from("/tmp/kproxy-test/certificates/ca.crt")
        );
        assert_eq!(config.ca.key_algorithm, KeyAlgorithm::Rsa2048);

        clear_test_env();
    }

    #[test]
    fn test_overrides() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KPROXY_PORT", "9090");
        env::set_var("KPROXY_SSL_INTERCEPTION", "false");
        env::set_var("KPROXY_SCOPE_IN", "*.example.com, api.test.io,");
        env::set_var("KPROXY_SCOPE_OUT", "admin.example.com");
        env::set_var("KPROXY_CUSTOM_HEADERS", r#"{"X-Team":"red"}"#);
        env::set_var("KPROXY_KEY_ALGORITHM", "ecdsa-p256");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(config.port, 9090);
        assert!(!config.settings.ssl_interception_enabled);
        assert_eq!(
            config.settings.scope_rules.in_scope,
            vec!["*.example.com".to_string(), "api.test.io".to_string()]
        );
        assert_eq!(config.settings.scope_rules.out_of_scope.len(), 1);
        assert_eq!(
            config.settings.custom_headers.get("X-Team").map(String::as_str),
            Some("red")
        );
        assert_eq!(config.ca.key_algorithm, KeyAlgorithm::EcdsaP256);

        clear_test_env();
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_test_env();
        env::set_var("KPROXY_PORT", "not-a-port");

        let err = ProxyConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("Invalid KPROXY_PORT"), "{}", err);

        clear_test_env();
        env::set_var("KPROXY_CUSTOM_HEADERS", r#"{"bad name":"x"}"#);
        let err = ProxyConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("Invalid KPROXY_CUSTOM_HEADERS"), "{}", err);

        clear_test_env();
    }

    #[test]
    fn test_should_capture() {
        let mut settings = ProxySettings::default();
        settings.scope_rules = ScopeRules::new(vec!["*.example.com"], Vec::<&str>::new());
        assert!(settings.should_capture("other.org"));

        settings.save_only_in_scope = true;
        assert!(settings.should_capture("api.example.com"));
        assert!(!settings.should_capture("other.org"));
    }

    #[test]
    fn test_settings_update_deserializes_partially() {
        let update: SettingsUpdate =
            serde_json::from_str(r#"{"saveOnlyInScope":true}"#).unwrap();
        assert_eq!(update.save_only_in_scope, Some(true));
        assert!(update.custom_headers.is_none());
        assert!(update.ssl_interception_enabled.is_none());
    }
}
