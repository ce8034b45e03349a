//! Paginated extraction as a lazy stream of pages.

use futures::stream::{self, Stream};
use mary_core::{EntityKind, RawRecord};
use mary_storage::{ApiQuery, ReportingApi};
use tracing::debug;

use crate::SyncError;

/// One page of raw records, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// 1-based.
    pub number: u32,
    pub records: Vec<RawRecord>,
    pub has_more: bool,
}

pub const DEFAULT_MAX_PAGES: u32 = 100_000;

pub struct Extractor<'a, A: ?Sized> {
    api: &'a A,
    max_pages: u32,
}

struct Cursor {
    query: ApiQuery,
    next: Option<u32>,
}

impl<'a, A: ReportingApi + ?Sized> Extractor<'a, A> {
    pub fn new(api: &'a A, max_pages: u32) -> Self {
        Self {
            api,
            max_pages: max_pages.max(1),
        }
    }

    /// Pages of `query`, fetched one at a time as the stream is polled. A page
    /// is only requested after the previous one has been handed out, so the
    /// consumer's processing speed bounds the fetch rate.
    pub fn pages(
        &self,
        entity: EntityKind,
        query: ApiQuery,
    ) -> impl Stream<Item = Result<Page, SyncError>> + Send + 'a
    where
        A: Sync,
    {
        let api = self.api;
        let max_pages = self.max_pages;
        let cursor = Cursor {
            query,
            next: Some(1),
        };

        stream::try_unfold(cursor, move |cursor| async move {
            let Some(number) = cursor.next else {
                return Ok(None);
            };
            if number > max_pages {
                return Err(SyncError::PageLimit { entity, max_pages });
            }

            let fetched = api
                .fetch_page(&cursor.query, number)
                .await
                .map_err(|source| SyncError::Fetch {
                    entity,
                    page: number,
                    source,
                })?;
            let has_more = fetched.has_more(number, cursor.query.per_page());
            debug!(%entity, page = number, records = fetched.items.len(), has_more, "page fetched");

            let page = Page {
                number,
                records: fetched.items,
                has_more,
            };
            let next = Cursor {
                query: cursor.query,
                next: has_more.then_some(number + 1),
            };
            Ok(Some((page, next)))
        })
    }
}
