//! brokerd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ClusterConfig;

/// Default capacity of each work-engine topic queue.
pub const DEFAULT_BUFFER_SIZE: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerdConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub engine: EngineConfig,
    pub cluster: ClusterConfig,
    pub runner: RunnerConfig,
    #[serde(rename = "registry")]
    pub registries: Vec<RegistryConfig>,
}

/// Behaviour switches for the broker itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Enables the add/remove spec operations.
    pub dev_broker: bool,
    /// Run an automation action on bind and unbind.
    pub launch_on_bind: bool,
    pub bootstrap_on_startup: bool,
    /// Reconcile in-progress jobs at startup.
    pub recovery: bool,
    /// How often the catalog is reloaded from the registries.
    pub refresh_interval: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dev_broker: false,
            launch_on_bind: false,
            bootstrap_on_startup: true,
            recovery: true,
            refresh_interval: "600s".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Parsed refresh interval; `None` disables the refresh loop.
    pub fn refresh_interval(&self) -> Option<Duration> {
        parse_duration(&self.refresh_interval).filter(|d| !d.is_zero())
    }

    /// False when `refresh_interval` is not a duration at all, as opposed
    /// to a zero duration that disables the loop on purpose.
    pub fn refresh_interval_is_valid(&self) -> bool {
        parse_duration(&self.refresh_interval).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/brokerd/broker.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Executable invoked as `{program} {action}` for every automation run.
    pub program: PathBuf,
    /// Root under which per-run sandbox directories are created.
    pub work_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("bundle-runner"),
            work_dir: PathBuf::from("/var/lib/brokerd/sandboxes"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub name: String,
    pub path: PathBuf,
    /// Abort bootstrap when this registry cannot be loaded.
    #[serde(default)]
    pub fail_on_error: bool,
}

impl BrokerdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BrokerdConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "10m", "1h".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: BrokerdConfig = toml::from_str("").unwrap();
        assert!(config.broker.recovery);
        assert!(!config.broker.launch_on_bind);
        assert_eq!(config.engine.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.registries.is_empty());
        assert_eq!(config.broker.refresh_interval(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[broker]
dev_broker = true
launch_on_bind = true
refresh_interval = "0"

[store]
path = "/tmp/b.redb"

[cluster]
host = "https://cluster:6443"
namespace = "brokers"

[[registry]]
name = "local"
path = "/etc/brokerd/specs"
fail_on_error = true

[[registry]]
name = "extra"
path = "/srv/specs"
"#;
        let config: BrokerdConfig = toml::from_str(toml_str).unwrap();
        assert!(config.broker.dev_broker);
        assert_eq!(config.broker.refresh_interval(), None);
        assert_eq!(config.cluster.namespace, "brokers");
        assert_eq!(config.registries.len(), 2);
        assert!(config.registries[0].fail_on_error);
        assert!(!config.registries[1].fail_on_error);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = BrokerdConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("refresh_interval"));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        let max = u64::MAX.to_string();
        assert_eq!(parse_duration(&format!("{max}m")), None);
        assert_eq!(parse_duration(&format!("{max}h")), None);
        assert_eq!(parse_duration(&format!("{max}s")), Some(Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn unparseable_refresh_interval_is_flagged() {
        let config = BrokerConfig {
            refresh_interval: "every now and then".into(),
            ..Default::default()
        };
        assert_eq!(config.refresh_interval(), None);
        assert!(!config.refresh_interval_is_valid());
        assert!(BrokerConfig::default().refresh_interval_is_valid());
    }
}
