//! Sync orchestration: extract pages from Marilyn, clean them and reload the
//! ClickHouse tables for a date range.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use mary_adapters::{TransformContext, AD_STATS, PLACEMENTS, STATS};
use mary_core::{DateRange, EntityKind, IdentifierError, RangeError};
use mary_storage::{
    ClickHouseStore, ColumnStore, FetchError, HttpFetcher, MarilynClient, ReportingApi, StoreError,
};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub mod config;
pub mod extract;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod provision;
pub mod reload;
pub mod schedule;

#[cfg(test)]
mod testing;

pub use config::{SyncConfig, Tuning};
pub use extract::{Extractor, Page, DEFAULT_MAX_PAGES};
pub use self::metrics::{register_metrics, EntityRunSummary, SyncMetrics};
pub use pipeline::{insert_token, EntityPipeline, PipelineSettings};
pub use process::{BatchProcessor, ProcessedPage};
pub use provision::{provision_all, Provisioner};
pub use reload::PartitionReloader;
pub use schedule::{build_scheduler, trailing_window};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("{entity}: fetching page {page} failed: {source}")]
    Fetch {
        entity: EntityKind,
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("{entity}: source still had pages after {max_pages}")]
    PageLimit { entity: EntityKind, max_pages: u32 },
    #[error("{stage} on {target} failed: {source}")]
    Store {
        stage: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug)]
pub struct EntityOutcome {
    pub entity: EntityKind,
    pub result: Result<EntityRunSummary, SyncError>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub range: DateRange,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntityOutcome>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.entities.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn failed_entities(&self) -> Vec<EntityKind> {
        self.entities
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.entity)
            .collect()
    }
}

/// Runs the selected entity pipelines for one date range.
pub struct SyncRunner<A, S> {
    api: A,
    store: S,
    database: String,
    project_id: u64,
    entities: Vec<EntityKind>,
    concurrent: bool,
    per_page: u32,
    max_pages: u32,
}

impl SyncRunner<MarilynClient, ClickHouseStore> {
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.tuning.http_client()).context("building API client")?;
        let api = MarilynClient::new(http, config.api_root.clone(), config.credentials.clone());
        let store = ClickHouseStore::new(&config.clickhouse_with_tuning());
        Ok(Self::new(api, store, config))
    }

    pub fn store(&self) -> &ClickHouseStore {
        &self.store
    }
}

impl<A, S> SyncRunner<A, S>
where
    A: ReportingApi,
    S: ColumnStore,
{
    pub fn new(api: A, store: S, config: &SyncConfig) -> Self {
        Self {
            api,
            store,
            database: config.database.clone(),
            project_id: config.project_id,
            entities: config.selected_entities(),
            concurrent: config.concurrent,
            per_page: config.tuning.per_page,
            max_pages: config.tuning.max_pages,
        }
    }

    /// Validates `start..=end` before touching the network or the store.
    pub async fn run_dates(&self, start: NaiveDate, end: NaiveDate) -> Result<RunOutcome, SyncError> {
        let range = DateRange::new(start, end)?;
        self.run(range).await
    }

    /// Creates the database, then runs every selected entity. An entity that
    /// fails does not stop the others; the outcome lists each result.
    pub async fn run(&self, range: DateRange) -> Result<RunOutcome, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %range);
        self.run_inner(run_id, range).instrument(span).await
    }

    /// Only creates the database and the selected tables.
    pub async fn provision(&self) -> Result<Vec<mary_core::TableRef>, SyncError> {
        provision_all(&self.store, &self.database, &self.entities).await
    }

    async fn run_inner(&self, run_id: Uuid, range: DateRange) -> Result<RunOutcome, SyncError> {
        let started_at = Utc::now();
        info!(
            entities = ?self.entities,
            concurrent = self.concurrent,
            "sync started"
        );

        Provisioner::new(&self.store, &self.database)
            .ensure_database()
            .await?;

        let settings = PipelineSettings {
            run_id,
            database: self.database.clone(),
            project_id: self.project_id,
            per_page: self.per_page,
            max_pages: self.max_pages,
            ctx: TransformContext {
                synced_at: started_at,
            },
        };
        register_metrics();
        let metrics = SyncMetrics::default();
        let pipeline = EntityPipeline::new(&self.api, &self.store, &settings, &metrics);

        let entities = if self.concurrent {
            join_all(self.entities.iter().map(|entity| run_entity(&pipeline, *entity, range))).await
        } else {
            let mut outcomes = Vec::with_capacity(self.entities.len());
            for entity in &self.entities {
                outcomes.push(run_entity(&pipeline, *entity, range).await);
            }
            outcomes
        };

        let outcome = RunOutcome {
            run_id,
            range,
            started_at,
            finished_at: Utc::now(),
            entities,
        };
        if outcome.is_success() {
            info!("success");
        } else {
            error!(failed = ?outcome.failed_entities(), "sync finished with failures");
        }
        Ok(outcome)
    }
}

async fn run_entity<A, S>(
    pipeline: &EntityPipeline<'_, A, S>,
    entity: EntityKind,
    range: DateRange,
) -> EntityOutcome
where
    A: ReportingApi + ?Sized,
    S: ColumnStore + ?Sized,
{
    let result = match entity {
        EntityKind::Placements => pipeline.run(&PLACEMENTS, range).await,
        EntityKind::Stats => pipeline.run(&STATS, range).await,
        EntityKind::AdStats => pipeline.run(&AD_STATS, range).await,
    };
    if let Err(err) = &result {
        error!(%entity, error = %err, "entity sync failed");
    }
    EntityOutcome { entity, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{records, stat_record, FakeApi, FakeStore, StoreEvent};
    use mary_storage::{ApiPage, ClickHouseConfig, MarilynCredentials};
    use serde_json::json;

    fn config(entities: Vec<EntityKind>, concurrent: bool) -> SyncConfig {
        SyncConfig {
            api_root: "http://fake".into(),
            credentials: MarilynCredentials {
                account_id: "1".into(),
                token: "t".into(),
            },
            project_id: 7,
            clickhouse: ClickHouseConfig::new("localhost", 8123, "default", None),
            database: "analytics".into(),
            entities,
            concurrent,
            tuning: Tuning::default(),
        }
    }

    fn d(s: &str) -> NaiveDate {
        mary_core::parse_cli_date(s).unwrap()
    }

    fn api() -> FakeApi {
        FakeApi::default()
            .with_pages(
                EntityKind::Placements,
                vec![ApiPage::new(records(3, |i| json!({"id": i + 1, "channel_id": 1})))],
            )
            .with_pages(
                EntityKind::Stats,
                vec![ApiPage::new(records(2, |i| stat_record("2024-01-01", i + 1)))],
            )
    }

    #[tokio::test]
    async fn end_before_start_fails_before_any_io() {
        let store = FakeStore::default();
        let api = api();
        let runner = SyncRunner::new(&api, &store, &config(Vec::new(), false));

        let err = runner.run_dates(d("2024-01-03"), d("2024-01-01")).await.unwrap_err();
        assert!(matches!(err, SyncError::Range(RangeError::EndBeforeStart { .. })));
        assert!(store.events().is_empty());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn entities_run_in_order_and_failures_are_isolated() {
        let api = api().failing_from_page(EntityKind::Stats, 1);
        let store = FakeStore::default();
        let runner = SyncRunner::new(&api, &store, &config(Vec::new(), false));

        let outcome = runner.run_dates(d("2024-01-01"), d("2024-01-01")).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.failed_entities(), vec![EntityKind::Stats]);
        assert_eq!(
            outcome.entities.iter().map(|o| o.entity).collect::<Vec<_>>(),
            EntityKind::ALL.to_vec()
        );
        let placements = outcome.entities[0].result.as_ref().unwrap();
        assert_eq!(placements.inserted, 3);
        assert!(outcome.entities[2].result.is_ok());

        let entity_order: Vec<EntityKind> = api.calls().into_iter().map(|(e, _)| e).collect();
        assert_eq!(
            entity_order,
            vec![EntityKind::Placements, EntityKind::Stats, EntityKind::AdStats]
        );
        assert_eq!(
            store.events()[0],
            StoreEvent::Execute("CREATE DATABASE IF NOT EXISTS analytics ENGINE = Atomic".into())
        );
    }

    #[tokio::test]
    async fn concurrent_mode_runs_every_selected_entity() {
        let api = api();
        let store = FakeStore::default();
        let runner = SyncRunner::new(
            &api,
            &store,
            &config(vec![EntityKind::Stats, EntityKind::Placements], true),
        );

        let outcome = runner.run_dates(d("2024-01-01"), d("2024-01-02")).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(store.rows("analytics.mary_placements").len(), 3);
        assert_eq!(store.rows("analytics.mary_stats").len(), 2);
        assert!(store.rows("analytics.mary_ad_stats").is_empty());
        let drops = store
            .events()
            .into_iter()
            .filter(|e| matches!(e, StoreEvent::DropPartition(..)))
            .count();
        assert_eq!(drops, 2);
    }

    #[tokio::test]
    async fn provision_only_creates_objects() {
        let api = api();
        let store = FakeStore::default();
        SyncRunner::new(&api, &store, &config(Vec::new(), false))
            .provision()
            .await
            .unwrap();
        assert_eq!(store.events().len(), 4);
        assert!(api.calls().is_empty());
    }
}
