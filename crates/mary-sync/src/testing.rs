//! In-memory stand-ins for the reporting API and the column store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use mary_adapters::TransformContext;
use mary_core::{EntityKind, RawRecord, TableRef};
use mary_storage::{ApiPage, ApiQuery, ColumnStore, EntityRow, FetchError, Grouping, ReportingApi, StoreError};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::pipeline::PipelineSettings;

pub(crate) fn records(n: u64, make: impl Fn(u64) -> Value) -> Vec<RawRecord> {
    (0..n)
        .map(|i| match make(i) {
            Value::Object(map) => map,
            other => panic!("record must be an object, got {other}"),
        })
        .collect()
}

pub(crate) fn stat_record(date: &str, placement_id: u64) -> Value {
    json!({
        "date": date,
        "channel_id": 1,
        "campaign_xid": "cmp-1",
        "placement_id": placement_id,
        "placement_name": format!("placement {placement_id}"),
        "impressions": 1000,
        "clicks": 10,
        "cost_fact": "12.345",
        "revenue": null,
    })
}

pub(crate) fn ctx() -> TransformContext {
    TransformContext {
        synced_at: DateTime::from_timestamp(1_704_067_200, 0).unwrap(),
    }
}

pub(crate) fn settings(per_page: u32) -> PipelineSettings {
    PipelineSettings {
        run_id: Uuid::new_v4(),
        database: "analytics".into(),
        project_id: 7,
        per_page,
        max_pages: 100,
        ctx: ctx(),
    }
}

fn entity_of(query: &ApiQuery) -> EntityKind {
    match query {
        ApiQuery::ProjectPlacements { .. } => EntityKind::Placements,
        ApiQuery::DetailedStatistics(body) => match body.grouping {
            Grouping::Placement => EntityKind::Stats,
            Grouping::Ad => EntityKind::AdStats,
        },
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pages: HashMap<EntityKind, Vec<ApiPage>>,
    repeating: HashMap<EntityKind, ApiPage>,
    fail_from: HashMap<EntityKind, u32>,
    calls: Mutex<Vec<(EntityKind, u32)>>,
}

impl FakeApi {
    pub(crate) fn with_pages(mut self, entity: EntityKind, pages: Vec<ApiPage>) -> Self {
        self.pages.insert(entity, pages);
        self
    }

    pub(crate) fn with_repeating_page(mut self, entity: EntityKind, page: ApiPage) -> Self {
        self.repeating.insert(entity, page);
        self
    }

    pub(crate) fn failing_from_page(mut self, entity: EntityKind, page: u32) -> Self {
        self.fail_from.insert(entity, page);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(EntityKind, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportingApi for FakeApi {
    async fn fetch_page(&self, query: &ApiQuery, page: u32) -> Result<ApiPage, FetchError> {
        let entity = entity_of(query);
        self.calls.lock().unwrap().push((entity, page));

        if self.fail_from.get(&entity).is_some_and(|from| page >= *from) {
            return Err(FetchError::HttpStatus {
                status: 500,
                url: format!("fake://{entity}"),
                body: "upstream exploded".into(),
            });
        }
        if let Some(page) = self.repeating.get(&entity) {
            return Ok(page.clone());
        }
        Ok(self
            .pages
            .get(&entity)
            .and_then(|pages| pages.get(page as usize - 1))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StoreEvent {
    Execute(String),
    DropPartition(String, NaiveDate),
    Insert(String, usize),
}

/// Emulates partition drops: rows remember the partition they were written to.
#[derive(Default)]
pub(crate) struct FakeStore {
    events: Mutex<Vec<StoreEvent>>,
    tables: Mutex<BTreeMap<String, Vec<(Option<NaiveDate>, Value)>>>,
    tokens: Mutex<Vec<String>>,
    fail_drops: bool,
    fail_insert_after: Option<usize>,
}

fn unavailable(operation: &'static str, target: String) -> StoreError {
    StoreError::Timeout {
        operation,
        target,
        timeout: Duration::from_secs(1),
    }
}

impl FakeStore {
    pub(crate) fn failing_drops(mut self) -> Self {
        self.fail_drops = true;
        self
    }

    pub(crate) fn failing_insert_after(mut self, successful: usize) -> Self {
        self.fail_insert_after = Some(successful);
        self
    }

    pub(crate) fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.iter().map(|(_, row)| row.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn insert_tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    fn inserts_so_far(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StoreEvent::Insert(..)))
            .count()
    }
}

#[async_trait]
impl ColumnStore for FakeStore {
    async fn execute(&self, sql: &str) -> Result<(), StoreError> {
        self.events.lock().unwrap().push(StoreEvent::Execute(sql.to_string()));
        Ok(())
    }

    async fn insert<R: EntityRow>(&self, table: &TableRef, rows: &[R], token: &str) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if self.fail_insert_after.is_some_and(|n| self.inserts_so_far() >= n) {
            return Err(unavailable("insert", table.to_string()));
        }
        let encoded: Vec<_> = rows
            .iter()
            .map(|row| (row.partition_date(), serde_json::to_value(row).unwrap()))
            .collect();
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .extend(encoded);
        self.tokens.lock().unwrap().push(token.to_string());
        self.events
            .lock()
            .unwrap()
            .push(StoreEvent::Insert(table.to_string(), rows.len()));
        Ok(rows.len() as u64)
    }

    async fn drop_partition(&self, table: &TableRef, date: NaiveDate) -> Result<(), StoreError> {
        if self.fail_drops {
            return Err(unavailable("drop partition", table.to_string()));
        }
        if let Some(rows) = self.tables.lock().unwrap().get_mut(&table.to_string()) {
            rows.retain(|(partition, _)| *partition != Some(date));
        }
        self.events
            .lock()
            .unwrap()
            .push(StoreEvent::DropPartition(table.to_string(), date));
        Ok(())
    }
}
