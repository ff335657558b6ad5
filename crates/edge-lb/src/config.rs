//! Load-balancer configuration: raw string input resolved into typed, clamped settings.
//!
//! Resolution runs once per inbound request against an immutable [`RawEnv`]
//! snapshot. Only an empty origin pool is fatal; every other field falls back
//! to its default and numeric fields are clamped into range.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::ConfigError;

pub const ORIGINS: &str = "ORIGINS";
pub const ORIGIN_TIMEOUT_MS: &str = "ORIGIN_TIMEOUT_MS";
pub const RETRIES: &str = "RETRIES";
pub const FAIL_STATUSES: &str = "FAIL_STATUSES";
pub const LB_DIAG_PATH: &str = "LB_DIAG_PATH";
pub const CORS_ENABLED: &str = "CORS_ENABLED";
pub const CORS_ALLOW_ORIGINS: &str = "CORS_ALLOW_ORIGINS";
pub const CORS_ALLOW_METHODS: &str = "CORS_ALLOW_METHODS";
pub const CORS_ALLOW_HEADERS: &str = "CORS_ALLOW_HEADERS";
pub const CORS_EXPOSE_HEADERS: &str = "CORS_EXPOSE_HEADERS";
pub const CORS_ALLOW_CREDENTIALS: &str = "CORS_ALLOW_CREDENTIALS";
pub const CORS_MAX_AGE_SEC: &str = "CORS_MAX_AGE_SEC";

/// Every key the resolver reads.
pub const KEYS: &[&str] = &[
    ORIGINS,
    ORIGIN_TIMEOUT_MS,
    RETRIES,
    FAIL_STATUSES,
    LB_DIAG_PATH,
    CORS_ENABLED,
    CORS_ALLOW_ORIGINS,
    CORS_ALLOW_METHODS,
    CORS_ALLOW_HEADERS,
    CORS_EXPOSE_HEADERS,
    CORS_ALLOW_CREDENTIALS,
    CORS_MAX_AGE_SEC,
];

const DEFAULT_ORIGIN_TIMEOUT_MS: i64 = 8000;
const MIN_ORIGIN_TIMEOUT_MS: i64 = 1000;
const MAX_ORIGIN_TIMEOUT_MS: i64 = 90_000;
const DEFAULT_RETRIES: i64 = 1;
const MAX_RETRIES: i64 = 5;
const DEFAULT_FAIL_STATUSES: [u16; 5] = [500, 504, 521, 522, 523];
const DEFAULT_DIAG_PATH: &str = "/__lb/health";
const DEFAULT_ALLOW_METHODS: &str = "GET,POST,PUT,PATCH,DELETE,OPTIONS";
const DEFAULT_ALLOW_HEADERS: &str = "Content-Type,Authorization";
const DEFAULT_MAX_AGE_SEC: i64 = 600;

/// Immutable snapshot of raw string-keyed input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEnv {
    values: BTreeMap<String, String>,
}

impl RawEnv {
    /// Build the snapshot from a settings table, letting process environment
    /// variables with the same names override it.
    pub fn capture(table: BTreeMap<String, String>) -> Self {
        let mut values = table;
        for key in KEYS {
            if let Ok(value) = std::env::var(key) {
                values.insert((*key).to_string(), value);
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Resolved load-balancer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LbConfig {
    /// Origin base URLs in configured order. Never empty.
    pub origins: Vec<String>,
    pub origin_timeout_ms: u64,
    pub retries: u32,
    /// Statuses treated as origin failures. Never empty.
    pub fail_statuses: BTreeSet<u16>,
    pub diag_path: String,
    pub cors: CorsConfig,
}

/// Which request origins the CORS policy admits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowOrigins {
    /// `CORS_ALLOW_ORIGINS=*`
    Any,
    /// Exact, case-sensitive matches.
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origins: AllowOrigins,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub expose_headers: Option<Vec<String>>,
    pub allow_credentials: bool,
    pub max_age_sec: u64,
}

impl LbConfig {
    /// Resolve the raw snapshot into a validated configuration.
    pub fn resolve(raw: &RawEnv) -> Result<Self, ConfigError> {
        let origins = match raw.get(ORIGINS) {
            None => return Err(ConfigError::Missing { field: ORIGINS }),
            Some(value) => split_list(value),
        };
        if origins.is_empty() {
            return Err(ConfigError::Empty { field: ORIGINS });
        }

        let origin_timeout_ms = parse_int(raw.get(ORIGIN_TIMEOUT_MS), DEFAULT_ORIGIN_TIMEOUT_MS)
            .clamp(MIN_ORIGIN_TIMEOUT_MS, MAX_ORIGIN_TIMEOUT_MS) as u64;
        let retries = parse_int(raw.get(RETRIES), DEFAULT_RETRIES).clamp(0, MAX_RETRIES) as u32;

        let mut fail_statuses: BTreeSet<u16> = raw
            .get(FAIL_STATUSES)
            .map(split_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| s.parse::<u16>().ok())
            .collect();
        if fail_statuses.is_empty() {
            fail_statuses = DEFAULT_FAIL_STATUSES.into_iter().collect();
        }

        let diag_path = raw
            .get(LB_DIAG_PATH)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_DIAG_PATH)
            .to_string();

        Ok(Self {
            origins,
            origin_timeout_ms,
            retries,
            fail_statuses,
            diag_path,
            cors: CorsConfig::resolve(raw),
        })
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms)
    }

    /// Attempts per request: one plus retries, capped to the pool size.
    pub fn max_attempts(&self) -> usize {
        (self.retries as usize + 1).min(self.origins.len())
    }

    pub fn is_fail_status(&self, status: u16) -> bool {
        self.fail_statuses.contains(&status)
    }
}

impl CorsConfig {
    fn resolve(raw: &RawEnv) -> Self {
        let allow_origins = match raw.get(CORS_ALLOW_ORIGINS) {
            Some(value) if value.trim() == "*" => AllowOrigins::Any,
            Some(value) => AllowOrigins::List(split_list(value)),
            None => AllowOrigins::List(Vec::new()),
        };

        let expose_headers = raw
            .get(CORS_EXPOSE_HEADERS)
            .map(split_list)
            .filter(|list| !list.is_empty());

        Self {
            enabled: parse_bool(raw.get(CORS_ENABLED)),
            allow_origins,
            allow_methods: list_or_default(raw.get(CORS_ALLOW_METHODS), DEFAULT_ALLOW_METHODS),
            allow_headers: list_or_default(raw.get(CORS_ALLOW_HEADERS), DEFAULT_ALLOW_HEADERS),
            expose_headers,
            allow_credentials: parse_bool(raw.get(CORS_ALLOW_CREDENTIALS)),
            max_age_sec: parse_int(raw.get(CORS_MAX_AGE_SEC), DEFAULT_MAX_AGE_SEC).max(0) as u64,
        }
    }
}

/// Comma-split, trim, drop empty tokens.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn list_or_default(value: Option<&str>, default: &str) -> Vec<String> {
    let list = value.map(split_list).unwrap_or_default();
    if list.is_empty() {
        split_list(default)
    } else {
        list
    }
}

/// Base-10 integer, or `default` when absent or non-numeric.
fn parse_int(value: Option<&str>, default: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
