//! Configuration management

use crate::agent::{platform_from_name, ServiceRef, TargetProvider};
use crate::server::{
    auth_manager_from_name, AuthManager, DEFAULT_MAX_CONNECTIONS, MAX_CONNECTIONS,
    MIN_CONNECTIONS,
};
use crate::session::SessionManagerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Overrides `messaging.max_connections`
pub const MAX_CONNECTIONS_ENV: &str = "FLIGHTDECK_MAX_WS_CONNECTIONS";

/// Overrides `auth.manager`
pub const AUTH_MANAGER_ENV: &str = "FLIGHTDECK_AUTH_MANAGER";

/// Overrides `platform.strategy`
pub const PLATFORM_ENV: &str = "FLIGHTDECK_PLATFORM";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub messaging: MessagingConfig,
    pub sessions: SessionsConfig,
    pub auth: AuthConfig,
    pub rules: RulesConfig,
    pub platform: PlatformConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Address the HTTP and WebSocket planes listen on
    pub listen: String,

    /// Archive of saved recordings
    pub recordings_dir: Option<PathBuf>,

    /// Uploaded custom templates
    pub templates_dir: Option<PathBuf>,

    /// Rendered reports of archived recordings
    pub reports_dir: Option<PathBuf>,

    /// Persisted automated rules
    pub rules_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8181".to_string(),
            recordings_dir: None,
            templates_dir: None,
            reports_dir: None,
            rules_dir: None,
        }
    }
}

/// WebSocket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Concurrently admitted clients, clamped to [1, 64]
    pub max_connections: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Target session reuse
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,

    /// Unset means a task may hold a target's session indefinitely
    pub lease_timeout_secs: Option<u64>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            reap_interval_secs: 30,
            lease_timeout_secs: None,
        }
    }
}

/// Authentication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Registered auth manager name, `noop` or `token`
    pub manager: String,

    /// Shared secret for the `token` manager
    pub token: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            manager: "noop".to_string(),
            token: None,
        }
    }
}

/// Automated rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// How often every rule is re-applied to discovered targets
    pub sweep_interval_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

/// Target discovery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Registered strategy name, `none` or `static`. Detected from
    /// `services` when unset.
    pub strategy: Option<String>,

    /// Services the `static` strategy reports
    pub services: Vec<ServiceRef>,
}

/// Resolve the admitted client count from its environment value: unset or
/// non-numeric input gives the default, numeric input is clamped to [1, 64]
pub fn resolve_max_connections(raw: Option<&str>) -> usize {
    let raw = match raw {
        Some(raw) => raw.trim(),
        None => return DEFAULT_MAX_CONNECTIONS,
    };
    let requested = match raw.parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            tracing::warn!(
                "{} \"{}\" is not a number, using default {}",
                MAX_CONNECTIONS_ENV,
                raw,
                DEFAULT_MAX_CONNECTIONS
            );
            return DEFAULT_MAX_CONNECTIONS;
        }
    };
    let clamped = requested.clamp(MIN_CONNECTIONS as i64, MAX_CONNECTIONS as i64) as usize;
    if clamped as i64 != requested {
        tracing::warn!(
            "{} {} out of range, clamped to {}",
            MAX_CONNECTIONS_ENV,
            requested,
            clamped
        );
    }
    clamped
}

impl Config {
    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, or return defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("flightdeck")
            .join("config.toml")
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        match lookup(MAX_CONNECTIONS_ENV) {
            Some(raw) => {
                self.messaging.max_connections = resolve_max_connections(Some(&raw));
            }
            None => {
                self.messaging.max_connections = self
                    .messaging
                    .max_connections
                    .clamp(MIN_CONNECTIONS, MAX_CONNECTIONS);
            }
        }
        if let Some(manager) = lookup(AUTH_MANAGER_ENV).filter(|m| !m.trim().is_empty()) {
            self.auth.manager = manager.trim().to_string();
        }
        if let Some(strategy) = lookup(PLATFORM_ENV).filter(|s| !s.trim().is_empty()) {
            self.platform.strategy = Some(strategy.trim().to_string());
        }
        tracing::info!(
            "Max WebSocket connections: {}, auth manager: {}",
            self.messaging.max_connections,
            self.auth.manager
        );
    }

    fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("flightdeck")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.general
            .recordings_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("recordings"))
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.general
            .templates_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("templates"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.general
            .reports_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("reports"))
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.general
            .rules_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("rules"))
    }

    pub fn rules_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rules.sweep_interval_secs.max(1))
    }

    pub fn session_manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            idle_timeout: Duration::from_secs(self.sessions.idle_timeout_secs),
            lease_timeout: self.sessions.lease_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.reap_interval_secs.max(1))
    }

    /// Construct the configured auth manager
    pub fn auth_manager(&self) -> Result<Arc<dyn AuthManager>> {
        Ok(auth_manager_from_name(
            &self.auth.manager,
            self.auth.token.as_deref(),
        )?)
    }

    /// Construct the configured discovery strategy over the configured
    /// services plus `extra`
    pub fn target_provider(&self, extra: Vec<ServiceRef>) -> Result<Arc<dyn TargetProvider>> {
        let mut services = self.platform.services.clone();
        services.extend(extra);
        Ok(platform_from_name(
            self.platform.strategy.as_deref(),
            services,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_resolve_max_connections() {
        assert_eq!(resolve_max_connections(None), 2);
        assert_eq!(resolve_max_connections(Some("0")), 1);
        assert_eq!(resolve_max_connections(Some("-3")), 1);
        assert_eq!(resolve_max_connections(Some("1000")), 64);
        assert_eq!(resolve_max_connections(Some("abc")), 2);
        assert_eq!(resolve_max_connections(Some(" 8 ")), 8);
    }

    proptest! {
        #[test]
        fn test_resolved_count_always_in_bounds(n in any::<i64>()) {
            let resolved = resolve_max_connections(Some(&n.to_string()));
            prop_assert!((1..=64).contains(&resolved));
        }

        #[test]
        fn test_non_numeric_defaults(s in "[a-zA-Z]{1,12}") {
            prop_assert_eq!(resolve_max_connections(Some(&s)), 2);
        }
    }

    #[test]
    fn test_parse_config_file() {
        let config: Config = toml::from_str(
            r#"
[general]
listen = "0.0.0.0:9000"
recordings_dir = "/var/lib/flightdeck/recordings"

[messaging]
max_connections = 8

[sessions]
lease_timeout_secs = 30

[auth]
manager = "token"
token = "s3cret"

[rules]
sweep_interval_secs = 5

[platform]
strategy = "static"

[[platform.services]]
serviceUri = "agent://db-1:9091"
alias = "db"
"#,
        )
        .unwrap();

        assert_eq!(config.general.listen, "0.0.0.0:9000");
        assert_eq!(
            config.recordings_dir(),
            PathBuf::from("/var/lib/flightdeck/recordings")
        );
        assert_eq!(config.messaging.max_connections, 8);
        assert_eq!(config.sessions.idle_timeout_secs, 90);
        assert_eq!(
            config.session_manager_config().lease_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.auth_manager().unwrap().name(), "token");
        assert_eq!(config.rules_sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.platform.strategy.as_deref(), Some("static"));
        assert_eq!(config.platform.services[0].alias.as_deref(), Some("db"));
    }

    #[tokio::test]
    async fn test_target_provider_merges_services() {
        let mut config = Config::default();
        config.platform.services = vec![ServiceRef {
            service_uri: "agent://db-1:9091".to_string(),
            alias: Some("db".to_string()),
        }];
        let extra = ServiceRef {
            service_uri: "agent://localhost:9091".to_string(),
            alias: None,
        };

        let provider = config.target_provider(vec![extra.clone()]).unwrap();
        let services = provider.list_discoverable_services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1], extra);

        config.platform.strategy = Some("none".to_string());
        let provider = config.target_provider(vec![extra]).unwrap();
        assert!(provider.list_discoverable_services().await.unwrap().is_empty());
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let env: HashMap<&str, &str> = [(PLATFORM_ENV, "kubernetes")].into_iter().collect();
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.platform.strategy.as_deref(), Some("kubernetes"));
        assert!(config.target_provider(Vec::new()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (MAX_CONNECTIONS_ENV, "1000"),
            (AUTH_MANAGER_ENV, "token"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.messaging.max_connections, 64);
        assert_eq!(config.auth.manager, "token");
        assert!(config.auth_manager().is_err());
    }

    #[test]
    fn test_file_value_clamped_without_env() {
        let mut config = Config::default();
        config.messaging.max_connections = 0;
        config.apply_overrides(|_| None);
        assert_eq!(config.messaging.max_connections, 1);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.messaging.max_connections, 2);
        assert_eq!(config.auth.manager, "noop");
    }
}
