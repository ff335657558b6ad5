//! Diagnostics endpoint: service identity plus a sanitized configuration view.
//!
//! Origin URLs and CORS allow-origin entries never appear in the body; only
//! counts, flags, and non-sensitive lists are reported.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::clock::iso_timestamp;
use crate::config::LbConfig;

pub const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Serialize)]
pub struct Diagnostics {
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub config: ConfigSnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub origin_count: usize,
    pub origin_timeout_ms: u64,
    pub retries: u32,
    pub fail_statuses: Vec<u16>,
    pub diag_path: String,
    pub cors_enabled: bool,
    pub cors_allow_methods: Vec<String>,
    pub cors_allow_headers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cors_expose_headers: Option<Vec<String>>,
    pub cors_allow_credentials: bool,
    pub cors_max_age_sec: u64,
}

impl From<&LbConfig> for ConfigSnapshot {
    fn from(config: &LbConfig) -> Self {
        Self {
            origin_count: config.origins.len(),
            origin_timeout_ms: config.origin_timeout_ms,
            retries: config.retries,
            fail_statuses: config.fail_statuses.iter().copied().collect(),
            diag_path: config.diag_path.clone(),
            cors_enabled: config.cors.enabled,
            cors_allow_methods: config.cors.allow_methods.clone(),
            cors_allow_headers: config.cors.allow_headers.clone(),
            cors_expose_headers: config.cors.expose_headers.clone(),
            cors_allow_credentials: config.cors.allow_credentials,
            cors_max_age_sec: config.cors.max_age_sec,
        }
    }
}

impl Diagnostics {
    pub fn snapshot(config: &LbConfig) -> Self {
        Self {
            service: SERVICE_NAME,
            version: VERSION,
            timestamp: iso_timestamp(),
            config: ConfigSnapshot::from(config),
        }
    }
}

/// 200 JSON diagnostics response.
pub fn diagnostics_response(config: &LbConfig) -> Response {
    (StatusCode::OK, axum::Json(Diagnostics::snapshot(config))).into_response()
}
