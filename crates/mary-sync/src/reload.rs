use mary_core::{DateRange, TableRef, DATE_FORMAT};
use mary_storage::{ColumnStore, StoreError};
use tracing::info;

/// Clears the daily partitions of a fact table ahead of a reload, so that
/// inserting the fresh pages leaves exactly one copy of each day.
pub struct PartitionReloader<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ColumnStore + ?Sized> PartitionReloader<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Drops one partition per calendar day of `range`, oldest first, and
    /// returns how many statements were issued.
    pub async fn clear(&self, table: &TableRef, range: DateRange) -> Result<usize, StoreError> {
        info!(
            table = %table,
            from = %range.start().format(DATE_FORMAT),
            to = %range.end().format(DATE_FORMAT),
            days = range.len_days(),
            "dropping partitions"
        );
        let mut dropped = 0usize;
        for day in range.days() {
            self.store.drop_partition(table, day).await?;
            dropped += 1;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStore, StoreEvent};
    use chrono::NaiveDate;

    #[tokio::test]
    async fn drops_every_day_in_order() {
        let store = FakeStore::default();
        let table = TableRef::new("db", "mary_stats").unwrap();
        let range = DateRange::parse("2024-01-30", "2024-02-01").unwrap();

        let dropped = PartitionReloader::new(&store).clear(&table, range).await.unwrap();
        assert_eq!(dropped, 3);
        let day = |s: &str| NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap();
        assert_eq!(
            store.events(),
            vec![
                StoreEvent::DropPartition("db.mary_stats".into(), day("2024-01-30")),
                StoreEvent::DropPartition("db.mary_stats".into(), day("2024-01-31")),
                StoreEvent::DropPartition("db.mary_stats".into(), day("2024-02-01")),
            ]
        );
    }

    #[tokio::test]
    async fn first_failure_stops_the_reload() {
        let store = FakeStore::default().failing_drops();
        let table = TableRef::new("db", "mary_stats").unwrap();
        let range = DateRange::parse("2024-01-01", "2024-01-03").unwrap();

        assert!(PartitionReloader::new(&store).clear(&table, range).await.is_err());
        assert!(store.events().is_empty());
    }
}
