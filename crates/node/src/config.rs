//! Daemon configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the steering namespace.
///
/// When set, it takes precedence over the config file's `namespace` field.
/// This enables container deployments where the namespace is injected at
/// runtime (e.g. from the downward API).
///
/// # Example
///
/// ```bash
/// RATEWATCH_NAMESPACE=shoot--my-shoot ratewatchd start
/// ```
pub const RATEWATCH_NAMESPACE_ENV: &str = "RATEWATCH_NAMESPACE";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// How often the same target is scraped, in seconds.
    pub scrape_period_secs: u64,
    /// How often the level of scraping parallelism is adjusted, in
    /// milliseconds.
    pub flow_control_period_ms: u64,
    /// Two samples closer together than this do not provide sufficient
    /// rate-calculation accuracy and the newer one is rejected. Seconds.
    pub min_sample_gap_secs: u64,
    /// Samples older than this are not served, in seconds.
    pub max_sample_age_secs: u64,
    /// Sample pairs further apart than this are not served, in seconds.
    pub max_sample_gap_secs: u64,

    /// Namespace holding the steering endpoint record.
    pub namespace: String,
    /// Address advertised to metric consumers via endpoint steering.
    pub serving_ip: String,
    pub serving_port: u16,

    /// Listen address of the rate query endpoint.
    pub serving_listen: SocketAddr,
    /// Listen address of the Prometheus /metrics endpoint.
    pub metrics_listen: SocketAddr,

    /// Base URL of the cluster API holding the endpoint record. Endpoint
    /// steering is disabled when unset.
    #[serde(default)]
    pub cluster_api_url: Option<String>,
    /// Bearer token presented to the cluster API.
    #[serde(default)]
    pub cluster_api_token: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            scrape_period_secs: 60,
            flow_control_period_ms: 200,
            min_sample_gap_secs: 10,
            max_sample_age_secs: 90,
            max_sample_gap_secs: 600,
            namespace: "default".to_owned(),
            serving_ip: "127.0.0.1".to_owned(),
            serving_port: 9399,
            serving_listen: "0.0.0.0:9399".parse().expect("valid default address"),
            metrics_listen: "0.0.0.0:9100".parse().expect("valid default address"),
            cluster_api_url: None,
            cluster_api_token: None,
        }
    }
}

impl NodeConfig {
    pub fn scrape_period(&self) -> Duration {
        Duration::from_secs(self.scrape_period_secs)
    }

    pub fn flow_control_period(&self) -> Duration {
        Duration::from_millis(self.flow_control_period_ms)
    }

    pub fn min_sample_gap(&self) -> Duration {
        Duration::from_secs(self.min_sample_gap_secs)
    }

    pub fn max_sample_age(&self) -> Duration {
        Duration::from_secs(self.max_sample_age_secs)
    }

    pub fn max_sample_gap(&self) -> Duration {
        Duration::from_secs(self.max_sample_gap_secs)
    }

    /// Resolve the effective steering namespace.
    ///
    /// Resolution order (highest priority first):
    /// 1. `RATEWATCH_NAMESPACE` environment variable
    /// 2. `namespace` field, as loaded from the config file or replaced by
    ///    the `--namespace` flag (see [`ConfigOverrides`])
    pub fn effective_namespace(&self) -> String {
        if let Ok(from_env) = std::env::var(RATEWATCH_NAMESPACE_ENV) {
            if !from_env.is_empty() {
                return from_env;
            }
        }
        self.namespace.clone()
    }

    /// Save config to file.
    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from file.
    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Command-line overrides applied on top of a loaded [`NodeConfig`].
///
/// Every field mirrors one `start` flag; only set values replace the
/// corresponding config field. For the namespace, the
/// `RATEWATCH_NAMESPACE` environment variable still wins over the applied
/// value (see [`NodeConfig::effective_namespace`]).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub scrape_period_secs: Option<u64>,
    pub flow_control_period_ms: Option<u64>,
    pub min_sample_gap_secs: Option<u64>,
    pub max_sample_age_secs: Option<u64>,
    pub max_sample_gap_secs: Option<u64>,
    pub namespace: Option<String>,
    pub serving_ip: Option<String>,
    pub serving_port: Option<u16>,
    pub serving_listen: Option<SocketAddr>,
    pub metrics_listen: Option<SocketAddr>,
}

impl ConfigOverrides {
    /// Applies every set override to `config`.
    pub fn apply(&self, config: &mut NodeConfig) {
        if let Some(value) = self.scrape_period_secs {
            config.scrape_period_secs = value;
        }
        if let Some(value) = self.flow_control_period_ms {
            config.flow_control_period_ms = value;
        }
        if let Some(value) = self.min_sample_gap_secs {
            config.min_sample_gap_secs = value;
        }
        if let Some(value) = self.max_sample_age_secs {
            config.max_sample_age_secs = value;
        }
        if let Some(value) = self.max_sample_gap_secs {
            config.max_sample_gap_secs = value;
        }
        if let Some(value) = &self.namespace {
            config.namespace = value.clone();
        }
        if let Some(value) = &self.serving_ip {
            config.serving_ip = value.clone();
        }
        if let Some(value) = self.serving_port {
            config.serving_port = value;
        }
        if let Some(value) = self.serving_listen {
            config.serving_listen = value;
        }
        if let Some(value) = self.metrics_listen {
            config.metrics_listen = value;
        }
    }
}
