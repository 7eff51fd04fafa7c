use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineSettings;

/// Server configuration, read once at startup from `SLOTLEASE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Hold lease length.
    pub lease: Duration,
    /// Expiry sweep period, never more than half the lease.
    pub sweep_interval: Duration,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub storage_retries: u32,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let lease_secs = parse_or::<u64>(&parse, "SLOTLEASE_LEASE_SECS", 30).max(1);
        let lease = Duration::from_secs(lease_secs);
        let sweep_ms = parse_or::<u64>(&parse, "SLOTLEASE_SWEEP_MS", 1_000).max(10);
        let sweep_interval = Duration::from_millis(sweep_ms).min(lease / 2);

        Self {
            port: parse_or(&parse, "SLOTLEASE_PORT", 5433),
            bind: parse("SLOTLEASE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: parse("SLOTLEASE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: parse("SLOTLEASE_PASSWORD").unwrap_or_else(|| "slotlease".into()),
            max_connections: parse_or::<usize>(&parse, "SLOTLEASE_MAX_CONNECTIONS", 256).max(1),
            lease,
            sweep_interval,
            compact_threshold: parse_or(&parse, "SLOTLEASE_COMPACT_THRESHOLD", 1000),
            compact_interval: Duration::from_secs(
                parse_or::<u64>(&parse, "SLOTLEASE_COMPACT_INTERVAL_SECS", 60).max(1),
            ),
            storage_retries: parse_or(&parse, "SLOTLEASE_STORAGE_RETRIES", 3),
            metrics_port: parse("SLOTLEASE_METRICS_PORT").and_then(|v| v.parse().ok()),
            tls_cert: parse("SLOTLEASE_TLS_CERT"),
            tls_key: parse("SLOTLEASE_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotlease.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            lease_ms: self.lease.as_millis() as i64,
            storage_retries: self.storage_retries,
        }
    }
}

fn parse_or<T: FromStr>(parse: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    parse(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
