//! Server configuration from environment variables.

use std::time::Duration;

use axum::http::HeaderValue;
use tracing::warn;

use ledger_db::{PoolConfig, DEFAULT_MAX_UPLOAD_BYTES};

use crate::auth::TokenTable;

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/ledger";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_FILE_STORAGE_PATH: &str = "/var/lib/ledger/files";
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Everything the binary needs to start serving.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub file_storage_path: String,
    pub max_upload_bytes: u64,
    pub tokens: TokenTable,
    pub allowed_origins: Vec<HeaderValue>,
    pub db_max_connections: u32,
}

impl ApiConfig {
    /// Read configuration from the process environment.
    ///
    /// Environment variables:
    ///   DATABASE_URL       - PostgreSQL connection string
    ///   HOST / PORT        - listen address (default: 0.0.0.0:3000)
    ///   FILE_STORAGE_PATH  - attachment store root
    ///   MAX_UPLOAD_BYTES   - per-file upload limit (default: 10 MiB)
    ///   LEDGER_API_TOKENS  - `token=id:Display Name;...`
    ///   ALLOWED_ORIGINS    - comma-separated CORS origins
    ///   DB_MAX_CONNECTIONS - pool size (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable numbers fall back to
    /// their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let tokens = lookup("LEDGER_API_TOKENS")
            .map(|raw| TokenTable::parse(&raw))
            .unwrap_or_default();
        if tokens.is_empty() {
            warn!("LEDGER_API_TOKENS is empty; every API request will be rejected");
        }

        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            host: lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or(&lookup, "PORT", DEFAULT_PORT),
            file_storage_path: lookup("FILE_STORAGE_PATH")
                .unwrap_or_else(|| DEFAULT_FILE_STORAGE_PATH.to_string()),
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            tokens,
            allowed_origins: parse_allowed_origins(
                lookup("ALLOWED_ORIGINS").as_deref().unwrap_or(DEFAULT_ALLOWED_ORIGINS),
            ),
            db_max_connections: parse_or(
                &lookup,
                "DB_MAX_CONNECTIONS",
                DEFAULT_DB_MAX_CONNECTIONS,
            ),
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_connections(self.db_max_connections)
            .acquire_timeout(Duration::from_secs(30))
    }

    /// Whole-request body limit: one full-size upload plus form overhead.
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_upload_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(1024 * 1024)
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid number in environment, using default");
            default
        }),
        None => default,
    }
}

/// Parse a comma-separated origin list, skipping invalid entries.
pub fn parse_allowed_origins(raw: &str) -> Vec<HeaderValue> {
    raw.split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}
