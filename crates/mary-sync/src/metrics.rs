use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use ::metrics::{counter, describe_counter, Unit};
use mary_core::EntityKind;
use serde::Serialize;

static REGISTER_METRICS: Once = Once::new();

/// Pages read from the API.
pub const MARY_SYNC_PAGES_TOTAL: &str = "mary_sync_pages_total";
/// Records received from the API.
pub const MARY_SYNC_RECORDS_FETCHED_TOTAL: &str = "mary_sync_records_fetched_total";
/// Rows written to ClickHouse.
pub const MARY_SYNC_ROWS_INSERTED_TOTAL: &str = "mary_sync_rows_inserted_total";
/// Records dropped because they failed to coerce.
pub const MARY_SYNC_RECORDS_DISCARDED_TOTAL: &str = "mary_sync_records_discarded_total";
/// Partitions dropped before reloading.
pub const MARY_SYNC_PARTITIONS_DROPPED_TOTAL: &str = "mary_sync_partitions_dropped_total";

const ENTITY_LABEL: &str = "entity";

/// Registers metric descriptions with the installed recorder. Safe to call
/// more than once.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(MARY_SYNC_PAGES_TOTAL, Unit::Count, "API pages read per entity");
        describe_counter!(
            MARY_SYNC_RECORDS_FETCHED_TOTAL,
            Unit::Count,
            "Records received from the API per entity"
        );
        describe_counter!(
            MARY_SYNC_ROWS_INSERTED_TOTAL,
            Unit::Count,
            "Rows inserted into ClickHouse per entity"
        );
        describe_counter!(
            MARY_SYNC_RECORDS_DISCARDED_TOTAL,
            Unit::Count,
            "Records skipped after a coercion failure per entity"
        );
        describe_counter!(
            MARY_SYNC_PARTITIONS_DROPPED_TOTAL,
            Unit::Count,
            "Date partitions dropped before reload per entity"
        );
    });
}

#[derive(Debug, Default)]
struct EntityCounters {
    pages: AtomicU64,
    fetched: AtomicU64,
    inserted: AtomicU64,
    discarded: AtomicU64,
    partitions_dropped: AtomicU64,
    inserts: AtomicU64,
}

/// Run-wide counters, one set per entity kind. Shared by reference between
/// concurrently running pipelines. Every update is also emitted through the
/// `metrics` facade, labelled by entity.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    entities: [EntityCounters; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntityRunSummary {
    pub entity: EntityKind,
    pub pages: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub discarded: u64,
    pub partitions_dropped: u64,
    pub inserts: u64,
}

impl SyncMetrics {
    fn counters(&self, entity: EntityKind) -> &EntityCounters {
        let index = match entity {
            EntityKind::Placements => 0,
            EntityKind::Stats => 1,
            EntityKind::AdStats => 2,
        };
        &self.entities[index]
    }

    pub fn record_page(&self, entity: EntityKind, fetched: usize) {
        let counters = self.counters(entity);
        counters.pages.fetch_add(1, Ordering::Relaxed);
        counters.fetched.fetch_add(fetched as u64, Ordering::Relaxed);
        counter!(MARY_SYNC_PAGES_TOTAL, ENTITY_LABEL => entity.as_str()).increment(1);
        counter!(MARY_SYNC_RECORDS_FETCHED_TOTAL, ENTITY_LABEL => entity.as_str()).increment(fetched as u64);
    }

    pub fn record_discarded(&self, entity: EntityKind, discarded: usize) {
        self.counters(entity)
            .discarded
            .fetch_add(discarded as u64, Ordering::Relaxed);
        counter!(MARY_SYNC_RECORDS_DISCARDED_TOTAL, ENTITY_LABEL => entity.as_str()).increment(discarded as u64);
    }

    pub fn record_insert(&self, entity: EntityKind, rows: u64) {
        let counters = self.counters(entity);
        counters.inserts.fetch_add(1, Ordering::Relaxed);
        counters.inserted.fetch_add(rows, Ordering::Relaxed);
        counter!(MARY_SYNC_ROWS_INSERTED_TOTAL, ENTITY_LABEL => entity.as_str()).increment(rows);
    }

    pub fn record_partitions_dropped(&self, entity: EntityKind, count: usize) {
        self.counters(entity)
            .partitions_dropped
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(MARY_SYNC_PARTITIONS_DROPPED_TOTAL, ENTITY_LABEL => entity.as_str()).increment(count as u64);
    }

    pub fn summary(&self, entity: EntityKind) -> EntityRunSummary {
        let counters = self.counters(entity);
        EntityRunSummary {
            entity,
            pages: counters.pages.load(Ordering::Relaxed),
            fetched: counters.fetched.load(Ordering::Relaxed),
            inserted: counters.inserted.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            partitions_dropped: counters.partitions_dropped.load(Ordering::Relaxed),
            inserts: counters.inserts.load(Ordering::Relaxed),
        }
    }
}
