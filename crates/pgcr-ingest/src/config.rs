//! Configuration management
//!
//! Sources, lowest precedence first:
//!
//! 1. built-in defaults
//! 2. the YAML file (`config.yml` unless told otherwise)
//! 3. `PGCR_*` environment variables, nested keys separated by `__`
//!    (`PGCR_DATASOURCE__HOST`, `PGCR_BATCH_SIZE`)
//! 4. command line overrides

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineSettings;
use crate::reader::{InputCompression, DEFAULT_MAX_LINE_BYTES};
use crate::worker::DecodePolicy;

// ============================================================================
// Defaults
// ============================================================================

/// Default configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "config.yml";

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "PGCR_";

/// Default input file extension.
pub const DEFAULT_EXTENSION: &str = ".zst";

/// Default number of record workers.
pub const DEFAULT_WORKERS: i64 = 100;

/// Default number of records per committed transaction.
pub const DEFAULT_BATCH_SIZE: i64 = 10_000;

/// Default capacity of the work queue between ingestion and workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Default PostgreSQL port.
pub const DEFAULT_DATASOURCE_PORT: u16 = 5432;

/// Default maximum database connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestConfig {
    /// Root of the input tree
    pub directory: PathBuf,
    pub extension: String,
    pub workers: i64,
    pub batch_size: i64,
    pub queue_capacity: usize,
    pub max_line_bytes: usize,
    pub compression: InputCompression,
    pub decode_policy: DecodePolicy,
    /// Per-file line estimate for progress bars
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_lines_per_file: Option<u64>,
    pub datasource: DatasourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DatasourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            extension: DEFAULT_EXTENSION.to_string(),
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            compression: InputCompression::default(),
            decode_policy: DecodePolicy::default(),
            expected_lines_per_file: None,
            datasource: DatasourceConfig::default(),
        }
    }
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_DATASOURCE_PORT,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Values given on the command line. Unset fields leave the file/env value alone.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_policy: Option<DecodePolicy>,
}

/// Map `BATCH_SIZE` to `batchSize` and `DATASOURCE__MAX_CONNECTIONS` to
/// `datasource.maxConnections`.
fn env_key(raw: &str) -> String {
    raw.split("__")
        .map(|segment| {
            let mut key = String::with_capacity(segment.len());
            let mut upper = false;
            for c in segment.chars() {
                if c == '_' {
                    upper = !key.is_empty();
                } else if upper {
                    key.push(c.to_ascii_uppercase());
                    upper = false;
                } else {
                    key.push(c.to_ascii_lowercase());
                }
            }
            key
        })
        .collect::<Vec<_>>()
        .join(".")
}

impl IngestConfig {
    /// Layered configuration sources, without command line overrides.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(IngestConfig::default()))
            .merge(Yaml::file(path))
            .merge(
                Env::prefixed(ENV_PREFIX)
                    .lowercase(false)
                    .map(|key| env_key(key.as_str()).into()),
            )
    }

    /// Load the configuration. Callers validate what their mode needs.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let config: IngestConfig = Self::figment(path)
            .merge(Serialized::globals(overrides))
            .extract()?;
        Ok(config)
    }

    /// Check the settings the pipeline itself needs.
    pub fn validate_pipeline(&self) -> anyhow::Result<()> {
        if self.batch_size <= 0 {
            anyhow::bail!("Batch size cannot be zero or negative");
        }

        if self.directory.as_os_str().is_empty() {
            anyhow::bail!("Root directory cannot be empty");
        }

        if self.workers <= 0 {
            anyhow::bail!("Number of workers cannot be zero or negative");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("Queue capacity must be greater than 0");
        }

        if self.max_line_bytes == 0 {
            anyhow::bail!("Maximum line length must be greater than 0");
        }

        if self.extension.trim_start_matches('.').is_empty() {
            anyhow::bail!("File extension cannot be empty");
        }

        Ok(())
    }

    /// Check everything, including the datasource.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_pipeline()?;

        if self.datasource.host.is_empty() {
            anyhow::bail!("Datasource host cannot be empty");
        }

        if self.datasource.port == 0 {
            anyhow::bail!("Datasource port cannot be empty");
        }

        if self.datasource.max_connections == 0 {
            anyhow::bail!("Datasource maxConnections must be greater than 0");
        }

        Ok(())
    }

    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        self.validate_pipeline()?;

        Ok(PipelineSettings {
            workers: usize::try_from(self.workers)?,
            batch_size: u64::try_from(self.batch_size)?,
            queue_capacity: self.queue_capacity,
            max_line_bytes: self.max_line_bytes,
            compression: self.compression,
            decode_policy: self.decode_policy,
        })
    }
}
