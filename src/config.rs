//! Configuration management

use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::defaults;

/// Which storage backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Which bus backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    Nats,
    Memory,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials
    pub nats_credentials: Option<(String, String)>,

    pub bus_backend: BusBackend,

    pub store_backend: StoreBackend,

    /// PostgreSQL connection string (required for the postgres backend)
    pub database_url: Option<String>,

    /// Origin name stamped on every published envelope
    pub service_name: String,

    /// Consumer group shared by all query responders
    pub consumer_group: String,

    /// How long a requester waits for one attempt
    pub query_timeout: Duration,

    /// Requester attempts before giving up
    pub query_max_attempts: u32,

    /// Files above this size must go through the asynchronous import
    pub sync_import_max_bytes: usize,

    /// Candidate search limit when the request has none
    pub candidate_default_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nats_url = get("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let nats_credentials = match (get("NATS_USER"), get("NATS_PASSWORD")) {
            (Some(user), Some(password)) if !user.is_empty() => Some((user, password)),
            _ => None,
        };

        let bus_backend = match get("BUS_BACKEND").as_deref().unwrap_or("nats") {
            "nats" => BusBackend::Nats,
            "memory" => BusBackend::Memory,
            other => anyhow::bail!("BUS_BACKEND must be 'nats' or 'memory', got '{}'", other),
        };

        let store_backend = match get("STORE_BACKEND").as_deref().unwrap_or("postgres") {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => anyhow::bail!("STORE_BACKEND must be 'postgres' or 'memory', got '{}'", other),
        };

        let database_url = get("DATABASE_URL");
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }

        let service_name = get("SERVICE_NAME").unwrap_or_else(|| defaults::SERVICE_NAME.to_string());
        let consumer_group = get("QUERY_CONSUMER_GROUP").unwrap_or_else(|| service_name.clone());

        let query_timeout_ms: u64 = parse_or(&get, "QUERY_TIMEOUT_MS", defaults::QUERY_TIMEOUT_MS)?;
        let query_max_attempts: u32 =
            parse_or(&get, "QUERY_MAX_ATTEMPTS", defaults::QUERY_MAX_ATTEMPTS)?;
        if query_max_attempts == 0 {
            anyhow::bail!("QUERY_MAX_ATTEMPTS must be at least 1");
        }

        let sync_import_max_bytes =
            parse_or(&get, "SYNC_IMPORT_MAX_BYTES", defaults::SYNC_IMPORT_MAX_BYTES)?;
        let candidate_default_limit =
            parse_or(&get, "CANDIDATE_DEFAULT_LIMIT", defaults::CANDIDATE_DEFAULT_LIMIT)?;

        Ok(Self {
            nats_url,
            nats_credentials,
            bus_backend,
            store_backend,
            database_url,
            service_name,
            consumer_group,
            query_timeout: Duration::from_millis(query_timeout_ms),
            query_max_attempts,
            sync_import_max_bytes,
            candidate_default_limit,
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        None => Ok(default),
    }
}
