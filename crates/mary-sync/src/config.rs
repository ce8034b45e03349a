use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use mary_core::EntityKind;
use mary_storage::{BackoffPolicy, ClickHouseConfig, HttpClientConfig, MarilynCredentials, DEFAULT_PER_PAGE};
use serde::Deserialize;

use crate::extract::DEFAULT_MAX_PAGES;

/// Operational knobs, optionally read from a YAML file. Every field has a
/// default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub per_page: u32,
    pub max_pages: u32,
    pub http_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub max_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub api_concurrency: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            per_page: DEFAULT_PER_PAGE,
            max_pages: DEFAULT_MAX_PAGES,
            http_timeout_secs: 60,
            store_timeout_secs: 120,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
            api_concurrency: 4,
        }
    }
}

impl Tuning {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let tuning: Self = serde_yaml::from_str(text).context("parsing tuning yaml")?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading tuning file {}", path.display()))
    }

    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        path.map(Self::load).unwrap_or_else(|| Ok(Self::default()))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.per_page > 0, "per_page must be positive");
        anyhow::ensure!(self.max_pages > 0, "max_pages must be positive");
        anyhow::ensure!(self.api_concurrency > 0, "api_concurrency must be positive");
        anyhow::ensure!(
            self.retry_base_delay_ms <= self.retry_max_delay_ms,
            "retry_base_delay_ms must not exceed retry_max_delay_ms"
        );
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            concurrency: self.api_concurrency,
            backoff: self.backoff(),
            ..Default::default()
        }
    }
}

/// Everything one sync needs: where to read, where to write, what to move.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_root: String,
    pub credentials: MarilynCredentials,
    pub project_id: u64,
    pub clickhouse: ClickHouseConfig,
    pub database: String,
    pub entities: Vec<EntityKind>,
    pub concurrent: bool,
    pub tuning: Tuning,
}

impl SyncConfig {
    /// Entity kinds in dependency order (placements, stats, ad stats), once each.
    pub fn selected_entities(&self) -> Vec<EntityKind> {
        let mut entities = if self.entities.is_empty() {
            EntityKind::ALL.to_vec()
        } else {
            self.entities.clone()
        };
        entities.sort();
        entities.dedup();
        entities
    }

    pub fn clickhouse_with_tuning(&self) -> ClickHouseConfig {
        ClickHouseConfig {
            timeout: Duration::from_secs(self.tuning.store_timeout_secs),
            backoff: self.tuning.backoff(),
            ..self.clickhouse.clone()
        }
    }
}
