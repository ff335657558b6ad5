//! Process settings and loading logic.

use std::collections::BTreeMap;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use lb_tracing::TracingConfig;
use serde::Deserialize;

/// Top-level process settings: listener, logging, and the raw load-balancer input.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    /// `[tracing]`: `service_name`, `otlp_endpoint`, `protocol`, `log_level`
    /// and `json_logs` (one JSON object per log line when true).
    #[serde(default)]
    pub tracing: TracingConfig,

    /// Raw load-balancer keys (`ORIGINS`, `RETRIES`, ...) as strings.
    /// Process environment variables of the same name take precedence,
    /// see [`crate::config::RawEnv::capture`].
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Upper bound on a buffered inbound request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Settings {
    /// Load settings from a TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (EDGE_LB_ prefix, __ for nesting)
    /// 2. TOML config file (missing file is not an error)
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("EDGE_LB_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let settings: Settings = figment.extract()?;
        Ok(settings)
    }
}
