use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tiered_archive_common::{ArchiveStore, Clock, HotStore};
use tiered_archive_migrator::MigratorConfig;
use tiered_archive_policy::{RetryPolicy, TierPolicy, DAY};
use tiered_archive_proxy::ProxyConfig;
use tiered_archive_stores::{FsArchiveStore, FsHotStore, MemoryArchiveStore, MemoryHotStore};

/// Top-level TOML configuration. Every field has a default, so an empty
/// file (or no file) is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "StoreConfig::default_hot")]
    pub hot_store: StoreConfig,
    #[serde(default = "StoreConfig::default_archive")]
    pub archive_store: StoreConfig,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub migration: MigrationSection,
    #[serde(default)]
    pub proxy: ProxySection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hot_store: StoreConfig::default_hot(),
            archive_store: StoreConfig::default_archive(),
            policy: PolicySection::default(),
            retry: RetrySection::default(),
            migration: MigrationSection::default(),
            proxy: ProxySection::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Fs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Directory for `fs` stores. Ignored for `memory`.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    fn default_hot() -> Self {
        Self {
            kind: StoreKind::Fs,
            path: Some(PathBuf::from("data/hot")),
        }
    }

    fn default_archive() -> Self {
        Self {
            kind: StoreKind::Fs,
            path: Some(PathBuf::from("data/archive")),
        }
    }

    fn fs_path(&self, section: &str) -> anyhow::Result<&Path> {
        self.path
            .as_deref()
            .with_context(|| format!("[{section}] kind = \"fs\" needs a path"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub cutoff_days: u64,
    pub rehydration_ttl_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            cutoff_days: 90,
            rehydration_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 50,
            max_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MigrationSection {
    pub batch_size: usize,
    pub verify_writes: bool,
    pub max_consecutive_failures: u32,
    pub cursor_path: Option<PathBuf>,
    /// Pause between runs for `serve`.
    pub interval_secs: u64,
}

impl Default for MigrationSection {
    fn default() -> Self {
        Self {
            batch_size: 100,
            verify_writes: true,
            max_consecutive_failures: 5,
            cursor_path: None,
            interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    pub write_back: bool,
    /// 0 disables the default deadline.
    pub request_timeout_ms: u64,
    pub write_back_timeout_ms: u64,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            write_back: true,
            request_timeout_ms: 2000,
            write_back_timeout_ms: 250,
        }
    }
}

impl Config {
    /// Load from `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.policy.cutoff_days > 0, "[policy] cutoff_days must be positive");
        anyhow::ensure!(self.migration.batch_size > 0, "[migration] batch_size must be positive");
        anyhow::ensure!(self.retry.max_attempts > 0, "[retry] max_attempts must be at least 1");
        Ok(())
    }

    pub fn tier_policy(&self) -> TierPolicy {
        let cutoff = DAY * u32::try_from(self.policy.cutoff_days).unwrap_or(u32::MAX);
        TierPolicy::new(cutoff, Duration::from_secs(self.policy.rehydration_ttl_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn migrator_config(&self) -> MigratorConfig {
        MigratorConfig {
            batch_size: self.migration.batch_size,
            verify_writes: self.migration.verify_writes,
            max_consecutive_failures: self.migration.max_consecutive_failures,
            cursor_path: self.migration.cursor_path.clone(),
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            write_back: self.proxy.write_back,
            request_timeout: match self.proxy.request_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            write_back_timeout: Duration::from_millis(self.proxy.write_back_timeout_ms),
        }
    }

    pub fn migration_interval(&self) -> Duration {
        Duration::from_secs(self.migration.interval_secs.max(1))
    }

    pub fn open_hot_store(&self, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<dyn HotStore>> {
        Ok(match self.hot_store.kind {
            StoreKind::Memory => Arc::new(MemoryHotStore::new(clock)),
            StoreKind::Fs => {
                let dir = self.hot_store.fs_path("hot_store")?;
                Arc::new(FsHotStore::open(dir, clock).with_context(|| format!("opening hot store {}", dir.display()))?)
            }
        })
    }

    pub fn open_archive_store(&self) -> anyhow::Result<Arc<dyn ArchiveStore>> {
        Ok(match self.archive_store.kind {
            StoreKind::Memory => Arc::new(MemoryArchiveStore::new()),
            StoreKind::Fs => {
                let dir = self.archive_store.fs_path("archive_store")?;
                Arc::new(
                    FsArchiveStore::open(dir).with_context(|| format!("opening archive store {}", dir.display()))?,
                )
            }
        })
    }
}
