//! Gateway configuration.
//!
//! Loaded from a YAML or JSON file. Every field has a default, so a config
//! file only needs the secrets. String values of the form `${VAR}` are
//! expanded from the environment.
//!
//! ```yaml
//! ws_addr: "0.0.0.0:8040"
//! http_addr: "0.0.0.0:8041"
//! worker_secret: "${WORKER_SECRET}"
//! token_secret: "${JWT_SECRET}"
//! files_dir: "/var/lib/zapdos/files"
//! workers:
//!   max_batch_size: 32
//!   max_latency_ms: 30000
//! write_queue:
//!   flush_count: 1000
//!   flush_latency_ms: 3000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchPolicy;
use crate::error::{Error, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket listen address for tenants and workers.
    pub ws_addr: String,
    /// REST listen address.
    pub http_addr: String,
    /// Shared secret workers present in `i_am_worker`.
    pub worker_secret: String,
    /// HMAC key for tenant tokens.
    pub token_secret: String,
    /// Directory for uploaded frames.
    pub files_dir: PathBuf,
    pub workers: WorkerDefaults,
    pub write_queue: WriteQueueConfig,
    pub jobs: JobConfig,
    pub search: SearchConfig,
    pub categories: Categories,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_addr: "0.0.0.0:8040".to_string(),
            http_addr: "0.0.0.0:8041".to_string(),
            worker_secret: String::new(),
            token_secret: String::new(),
            files_dir: PathBuf::from("zapdos_data/files"),
            workers: WorkerDefaults::default(),
            write_queue: WriteQueueConfig::default(),
            jobs: JobConfig::default(),
            search: SearchConfig::default(),
            categories: Categories::default(),
        }
    }
}

/// Batching defaults applied when a worker omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerDefaults {
    pub max_batch_size: usize,
    pub max_latency_ms: u64,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_latency_ms: 30_000,
        }
    }
}

/// Persistence batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteQueueConfig {
    /// The queue flushes once it holds more than this many entries.
    pub flush_count: usize,
    pub flush_latency_ms: u64,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            flush_count: 1000,
            flush_latency_ms: 3000,
        }
    }
}

impl WriteQueueConfig {
    pub fn policy(&self) -> BatchPolicy {
        BatchPolicy::new(
            self.flush_count.saturating_add(1),
            Duration::from_millis(self.flush_latency_ms),
        )
    }
}

/// Pending job lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Unanswered jobs are dropped after this long.
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl JobConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Search endpoint tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Maximum rows fetched from the store per query.
    pub limit: usize,
    pub island_gap_secs: u64,
    /// Frames attached to the summary prompt.
    pub summary_images: usize,
    /// Include `_distance` in island members.
    pub expose_distance: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            island_gap_secs: 300,
            summary_images: 5,
            expose_distance: false,
        }
    }
}

impl SearchConfig {
    pub fn island_gap(&self) -> Duration {
        Duration::from_secs(self.island_gap_secs)
    }
}

/// Job categories the gateway produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Categories {
    /// One job per category is dispatched for every indexed frame.
    pub index: Vec<String>,
    pub query_embedding: String,
    pub search_summary: String,
    pub autocomplete: String,
    pub summary: String,
    pub summarize: String,
}

impl Default for Categories {
    fn default() -> Self {
        Self {
            index: vec!["embedding".to_string(), "image_description".to_string()],
            query_embedding: "fast_embedding".to_string(),
            search_summary: "qa_vlm".to_string(),
            autocomplete: "text_generation".to_string(),
            summary: "summary".to_string(),
            summarize: "summarize".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a `.yaml`, `.yml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let mut cfg: GatewayConfig = match ext {
            "json" => serde_json::from_slice(&data)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            "yaml" | "yml" => serde_yaml::from_slice(&data)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "unsupported config format: {}",
                    path.display()
                )));
            }
        };
        cfg.expand_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Expand `${VAR}` references in addresses, secrets and paths.
    pub fn expand_env(&mut self) {
        self.ws_addr = expand_env(&self.ws_addr);
        self.http_addr = expand_env(&self.http_addr);
        self.worker_secret = expand_env(&self.worker_secret);
        self.token_secret = expand_env(&self.token_secret);
        if let Some(dir) = self.files_dir.to_str() {
            self.files_dir = PathBuf::from(expand_env(dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_secret.is_empty() {
            return Err(Error::InvalidConfig("worker_secret is empty".into()));
        }
        if self.token_secret.is_empty() {
            return Err(Error::InvalidConfig("token_secret is empty".into()));
        }
        if self.workers.max_batch_size == 0 || self.workers.max_latency_ms == 0 {
            return Err(Error::InvalidConfig(
                "workers.max_batch_size and workers.max_latency_ms must be positive".into(),
            ));
        }
        if self.write_queue.flush_count == 0 || self.write_queue.flush_latency_ms == 0 {
            return Err(Error::InvalidConfig(
                "write_queue.flush_count and write_queue.flush_latency_ms must be positive".into(),
            ));
        }
        if self.jobs.timeout_ms == 0 {
            return Err(Error::InvalidConfig("jobs.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Replace every `${NAME}` with the value of the environment variable
/// `NAME`. Unset variables expand to the empty string.
pub fn expand_env(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
