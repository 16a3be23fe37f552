// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Configuration: a TOML file with optional `${VAR}` / `${VAR:-default}`
//! expansion, overlaid on defaults that make `--target all` run out of the
//! box.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use spanvault_model::overrides::Overrides;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub distributor: DistributorSection,
    pub ingester: IngesterSection,
    pub storage: StorageSection,
    pub compactor: CompactorSection,
    pub ring: RingSection,
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port of the role's primary HTTP surface.
    pub http_listen_port: u16,
    /// Port of the status surface (`/ready`, `/metrics`).
    pub status_listen_port: u16,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            http_listen_port: 3200,
            status_listen_port: 3220,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributorSection {
    pub log_received_traces: bool,
    pub extend_writes: bool,
    #[serde(with = "humantime_serde")]
    pub remote_timeout: Duration,
}

impl Default for DistributorSection {
    fn default() -> Self {
        DistributorSection {
            log_received_traces: false,
            extend_writes: true,
            remote_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngesterSection {
    pub listen_port: u16,
    pub max_block_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub max_block_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub trace_idle_period: Duration,
    #[serde(with = "humantime_serde")]
    pub max_trace_idle: Duration,
    #[serde(with = "humantime_serde")]
    pub flush_check_period: Duration,
    #[serde(with = "humantime_serde")]
    pub complete_block_timeout: Duration,
    pub concurrent_flushes: usize,
    pub flush_queue_depth: usize,
    pub num_tokens: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_period: Duration,
}

impl Default for IngesterSection {
    fn default() -> Self {
        IngesterSection {
            listen_port: 3201,
            max_block_bytes: 1024 * 1024 * 1024,
            max_block_duration: Duration::from_secs(3600),
            trace_idle_period: Duration::from_secs(10),
            max_trace_idle: Duration::from_secs(1800),
            flush_check_period: Duration::from_secs(10),
            complete_block_timeout: Duration::from_secs(15 * 60),
            concurrent_flushes: 4,
            flush_queue_depth: 100,
            num_tokens: 128,
            heartbeat_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Memory,
    S3,
    Gcs,
    Azure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Memcached,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: BackendKind,
    pub local_path: PathBuf,
    pub wal_path: PathBuf,
    pub blocks_path: PathBuf,
    pub cache: Option<CacheKind>,
    pub cache_max_items: usize,
    #[serde(with = "humantime_serde")]
    pub hedge_requests_at: Duration,
    #[serde(with = "humantime_serde")]
    pub blocklist_poll: Duration,
    pub block_target_page_size: usize,
    pub block_bloom_shard_count: usize,
    pub block_bloom_false_positive: f64,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            backend: BackendKind::Local,
            local_path: PathBuf::from("/var/spanvault/store"),
            wal_path: PathBuf::from("/var/spanvault/wal"),
            blocks_path: PathBuf::from("/var/spanvault/blocks"),
            cache: None,
            cache_max_items: 10_000,
            hedge_requests_at: Duration::ZERO,
            blocklist_poll: Duration::from_secs(300),
            block_target_page_size: 1024 * 1024,
            block_bloom_shard_count: 10,
            block_bloom_false_positive: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactorSection {
    pub max_compaction_input_bytes: u64,
    pub max_inputs_per_job: usize,
    pub max_compaction_objects: u64,
    #[serde(with = "humantime_serde")]
    pub compaction_window: Duration,
    #[serde(with = "humantime_serde")]
    pub deletion_grace: Duration,
}

impl Default for CompactorSection {
    fn default() -> Self {
        CompactorSection {
            max_compaction_input_bytes: 100 * 1024 * 1024,
            max_inputs_per_job: 4,
            max_compaction_objects: 1_000_000,
            compaction_window: Duration::from_secs(4 * 3600),
            deletion_grace: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingSection {
    pub replication_factor: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
}

impl Default for RingSection {
    fn default() -> Self {
        RingSection {
            replication_factor: 3,
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>, expand_env: bool) -> anyhow::Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };

        let mut raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        if expand_env {
            raw = expand_env_vars(&raw)?;
        }
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

/// Replaces `${VAR}` and `${VAR:-default}`. Unset variables without a
/// default are an error rather than silently becoming empty strings.
fn expand_env_vars(raw: &str) -> anyhow::Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("static regex must parse");

    let mut missing: Vec<String> = Vec::new();
    let expanded = re
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => {
                        missing.push(name.to_string());
                        String::new()
                    }
                },
            }
        })
        .into_owned();

    if missing.is_empty() {
        Ok(expanded)
    } else {
        anyhow::bail!("unset environment variables in config: {}", missing.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::load(None, false).unwrap();
        assert_eq!(config.server.http_listen_port, 3200);
        assert_eq!(config.ring.replication_factor, 3);
        assert_eq!(config.storage.backend, BackendKind::Local);
    }

    #[test]
    fn test_load_toml_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
http_listen_port = 9999

[ingester]
trace_idle_period = "30s"

[storage]
backend = "memory"

[overrides.defaults]
max_bytes_per_trace = 123
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path), false).unwrap();
        assert_eq!(config.server.http_listen_port, 9999);
        assert_eq!(config.ingester.trace_idle_period, Duration::from_secs(30));
        assert_eq!(config.storage.backend, BackendKind::Memory);
        assert_eq!(config.overrides.limits("any").max_bytes_per_trace, 123);
        // untouched sections keep defaults
        assert_eq!(config.server.status_listen_port, 3220);
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SPANVAULT_TEST_PORT", "4242");
        let expanded = expand_env_vars(
            "port = ${SPANVAULT_TEST_PORT}\npath = \"${SPANVAULT_TEST_UNSET:-/tmp/x}\"",
        )
        .unwrap();
        assert!(expanded.contains("port = 4242"));
        assert!(expanded.contains("path = \"/tmp/x\""));
        std::env::remove_var("SPANVAULT_TEST_PORT");

        assert!(expand_env_vars("x = ${SPANVAULT_DEFINITELY_UNSET}").is_err());
    }
}
