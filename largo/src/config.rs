//! The YAML configuration schema.
//!
//! Durations are expressed in seconds; sizes in bytes. Flags and
//! environment variables override file values where the CLI exposes them.

use data_types::{DedicatedColumnSpec, TenantId};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};

fn default_replication_factor() -> usize {
    3
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LargoConfig {
    /// Ingester replicas per trace.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Object store root directory. In-memory storage when unset.
    #[serde(default)]
    pub object_store_dir: Option<PathBuf>,

    /// HTTP bind address for the query (and ingest) surface.
    #[serde(default = "HttpConfig::default_bind")]
    pub http_bind: String,

    #[serde(default)]
    pub ingester: IngesterSection,
    #[serde(default)]
    pub block: BlockSection,
    #[serde(default)]
    pub compactor: CompactorSection,
    #[serde(default)]
    pub frontend: FrontendSection,
    #[serde(default)]
    pub querier: QuerierSection,

    /// Retention per tenant, seconds. Tenants not listed keep data forever
    /// unless `default_retention` is set.
    #[serde(default)]
    pub retention_per_tenant: HashMap<String, u64>,
    /// Default retention, seconds.
    #[serde(default)]
    pub default_retention: Option<u64>,
}

impl Default for LargoConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }
}

/// Marker type carrying the default bind address.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig;

impl HttpConfig {
    fn default_bind() -> String {
        "127.0.0.1:3200".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngesterSection {
    pub wal_dir: PathBuf,
    pub max_trace_bytes: usize,
    /// Seconds without new spans before a trace is cut.
    pub max_trace_idle: u64,
    /// Seconds after first span before a trace is cut regardless.
    pub max_trace_age: u64,
    pub wal: WalSection,
    /// Seconds a flushed block stays readable locally.
    pub linger_period: u64,
}

impl Default for IngesterSection {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./largo-data/wal"),
            max_trace_bytes: 10 * 1024 * 1024,
            max_trace_idle: 10,
            max_trace_age: 30,
            wal: WalSection::default(),
            linger_period: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WalSection {
    pub segment_size: usize,
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            segment_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BlockSection {
    pub row_group_target_bytes: usize,
    pub dedicated_columns: Vec<DedicatedColumnEntry>,
}

impl Default for BlockSection {
    fn default() -> Self {
        Self {
            row_group_target_bytes: 100 * 1024 * 1024,
            dedicated_columns: vec![],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DedicatedColumnEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: DedicatedColumnType,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedicatedColumnType {
    String,
    Int,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompactorSection {
    pub input_blocks_per_job: usize,
    /// Seconds between tombstone and physical delete.
    pub grace_period: u64,
    /// Seconds before unpublished uploads are swept.
    pub orphan_age: u64,
}

impl Default for CompactorSection {
    fn default() -> Self {
        Self {
            input_blocks_per_job: 4,
            grace_period: 3600,
            orphan_age: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FrontendSection {
    pub search_shards: u32,
    pub trace_shards: u32,
    pub max_retries: usize,
    /// Seconds.
    pub query_timeout: u64,
    /// Pulling worker tasks per process.
    pub workers: usize,
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            search_shards: 4,
            trace_shards: 4,
            max_retries: 2,
            query_timeout: 30,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuerierSection {
    pub concurrent_block_reads: usize,
}

impl Default for QuerierSection {
    fn default() -> Self {
        Self {
            concurrent_block_reads: 8,
        }
    }
}

impl LargoConfig {
    /// Load from a YAML file, or the defaults when no path is given.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    /// The dedicated column specs for block building.
    pub fn dedicated_columns(&self) -> Vec<DedicatedColumnSpec> {
        self.block
            .dedicated_columns
            .iter()
            .map(|entry| match entry.kind {
                DedicatedColumnType::String => DedicatedColumnSpec::str(entry.key.clone()),
                DedicatedColumnType::Int => DedicatedColumnSpec::int(entry.key.clone()),
            })
            .collect()
    }

    /// Per-tenant retention as durations; tenants with invalid names are
    /// skipped.
    pub fn retention(&self) -> HashMap<TenantId, Duration> {
        self.retention_per_tenant
            .iter()
            .filter_map(|(name, seconds)| {
                TenantId::new(name.clone())
                    .ok()
                    .map(|tenant| (tenant, Duration::from_secs(*seconds)))
            })
            .collect()
    }
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}
