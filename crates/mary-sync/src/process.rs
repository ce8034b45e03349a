//! Per-record transformation with fault isolation.

use mary_adapters::{EntitySchema, TransformContext};
use mary_storage::EntityRow;
use tracing::{debug, warn};

use crate::extract::Page;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedPage<R> {
    pub rows: Vec<R>,
    pub discarded: usize,
}

/// Turns raw pages into typed rows. A record that fails to coerce is logged and
/// left out; it never fails the page.
pub struct BatchProcessor<'a, R> {
    schema: &'a EntitySchema<R>,
    ctx: TransformContext,
}

impl<'a, R: EntityRow> BatchProcessor<'a, R> {
    pub fn new(schema: &'a EntitySchema<R>, ctx: TransformContext) -> Self {
        Self { schema, ctx }
    }

    pub fn process(&self, page: &Page) -> ProcessedPage<R> {
        let mut rows = Vec::with_capacity(page.records.len());
        let mut discarded = 0usize;

        for (index, record) in page.records.iter().enumerate() {
            match self.schema.transform(record, &self.ctx) {
                Ok(row) => rows.push(row),
                Err(err) => {
                    discarded += 1;
                    let raw = serde_json::to_string(record).unwrap_or_default();
                    warn!(
                        entity = %self.schema.kind,
                        page = page.number,
                        index,
                        field = err.field,
                        error = %err,
                        record = %raw,
                        "record skipped due to transform error"
                    );
                }
            }
        }

        if discarded > 0 {
            warn!(
                entity = %self.schema.kind,
                page = page.number,
                discarded,
                "number of not inserted rows"
            );
        } else {
            debug!(entity = %self.schema.kind, page = page.number, rows = rows.len(), "page transformed");
        }

        ProcessedPage { rows, discarded }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, records, stat_record};
    use mary_adapters::{PLACEMENTS, STATS};
    use serde_json::json;
    use tracing_test::traced_test;

    fn page(records: Vec<mary_core::RawRecord>) -> Page {
        Page {
            number: 1,
            records,
            has_more: false,
        }
    }

    #[test]
    fn bad_date_drops_only_that_record() {
        let mut input = records(3, |i| stat_record("2024-01-01", 10 + i));
        input[1].insert("date".into(), json!("not-a-date"));

        let out = BatchProcessor::new(&STATS, ctx()).process(&page(input));
        assert_eq!(out.discarded, 1);
        assert_eq!(
            out.rows.iter().map(|r| r.placement_id).collect::<Vec<_>>(),
            vec![10, 12]
        );
    }

    #[test]
    fn date_before_epoch_is_discarded_not_left_for_the_encoder() {
        let mut input = records(3, |i| stat_record("2024-01-01", 10 + i));
        input[1].insert("date".into(), json!("1969-12-31"));

        let out = BatchProcessor::new(&STATS, ctx()).process(&page(input));
        assert_eq!(out.discarded, 1);
        assert_eq!(out.rows.len(), 2);
        for row in &out.rows {
            serde_json::to_value(row).unwrap();
        }
    }

    #[test]
    fn order_of_surviving_rows_is_preserved() {
        let input = records(4, |i| {
            if i % 2 == 0 {
                json!({"id": i + 1, "channel_id": 1, "name": format!("p{i}")})
            } else {
                json!({"name": "no id", "channel_id": 1})
            }
        });
        let out = BatchProcessor::new(&PLACEMENTS, ctx()).process(&page(input));
        assert_eq!(out.discarded, 2);
        assert_eq!(
            out.rows.iter().map(|r| r.placement_name.as_str()).collect::<Vec<_>>(),
            vec!["p0", "p2"]
        );
    }

    #[test]
    #[traced_test]
    fn clean_page_does_not_warn() {
        let input = records(2, |i| stat_record("2024-01-01", 10 + i));
        let out = BatchProcessor::new(&STATS, ctx()).process(&page(input));
        assert_eq!(out.discarded, 0);
        assert!(logs_contain("page transformed"));
        assert!(!logs_contain("number of not inserted rows"));
    }

    #[test]
    #[traced_test]
    fn page_with_discards_warns_once_with_the_count() {
        let mut input = records(2, |i| stat_record("2024-01-01", 10 + i));
        input[0].insert("date".into(), json!("not-a-date"));
        BatchProcessor::new(&STATS, ctx()).process(&page(input));
        assert!(logs_contain("number of not inserted rows"));
        assert!(logs_contain("discarded=1"));
    }

    #[test]
    fn empty_page_is_fine() {
        let out = BatchProcessor::new(&STATS, ctx()).process(&page(Vec::new()));
        assert!(out.rows.is_empty());
        assert_eq!(out.discarded, 0);
    }
}
