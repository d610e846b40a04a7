use crate::LoadBalanceMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse traffic config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid traffic config: {0}")]
    Invalid(String),
}

/// Top-level traffic configuration document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Registry and coordination store settings
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,

    /// Global default load balance mode
    #[serde(default)]
    pub load_balance: LoadBalanceMode,

    /// Per-service overrides
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Endpoints this process publishes, in wire form
    #[serde(default)]
    pub providers: Vec<String>,
}

impl TrafficConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(source: &str) -> Result<Self, ConfigError> {
        let config: TrafficConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.root.is_empty() || !self.registry.root.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "registry root must be an absolute path, got {:?}",
                self.registry.root
            )));
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.interface.trim().is_empty() {
                return Err(ConfigError::Invalid("service interface must not be empty".to_string()));
            }
            if !seen.insert(service.interface.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "service {} configured more than once",
                    service.interface
                )));
            }
            let mut methods = HashSet::new();
            for method in &service.methods {
                if method.name.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "service {} has a method entry without a name",
                        service.interface
                    )));
                }
                if !methods.insert(method.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "method {}.{} configured more than once",
                        service.interface, method.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Get the configuration for one interface
    pub fn service(&self, interface: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.interface == interface)
    }
}

/// Registry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySettings {
    /// Root path in the coordination store
    #[serde(default = "default_root")]
    pub root: String,

    /// Upper bound for a lookup waiting on its first notification (milliseconds)
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Period of the failback retry task (milliseconds)
    #[serde(default = "default_retry_period_ms")]
    pub retry_period_ms: u64,
}

impl RegistrySettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            retry_period_ms: default_retry_period_ms(),
        }
    }
}

/// Connection pool settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    /// How long a returned connection stays idle before it is shut down (milliseconds)
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Traffic settings for one service interface
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Fully qualified interface name
    pub interface: String,

    /// Interface-level load balance mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalance: Option<LoadBalanceMode>,

    /// Consumer-side request rate limit per 1s window; <= 0 disables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tps: Option<i64>,

    /// Provider-side concurrent request limit; 0 means unlimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actives: Option<u32>,

    /// Weight published with this process's providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,

    /// Method-level overrides
    #[serde(default)]
    pub methods: Vec<MethodConfig>,

    /// Condition router rules, applied in order
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Method-level overrides
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MethodConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalance: Option<LoadBalanceMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actives: Option<u32>,
}

fn default_root() -> String {
    "/rpc".to_string()
}

fn default_lookup_timeout_ms() -> u64 {
    5_000
}

fn default_retry_period_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}
