//! Marilyn reporting API: query bodies, page envelopes and the HTTP client.

use std::fmt;

use async_trait::async_trait;
use mary_core::{DateRange, RawRecord, DATE_FORMAT};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{FetchError, HttpFetcher, RequestSpec};

pub const DEFAULT_PER_PAGE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Grouping {
    Placement,
    Ad,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFilter {
    pub entity: &'static str,
    pub entities: Vec<u64>,
}

/// Body of `POST /api/statistics/detailed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsQuery {
    pub channel_id: Vec<u32>,
    pub start_date: String,
    pub end_date: String,
    pub date_grouping: &'static str,
    pub grouping: Grouping,
    pub filtering: Vec<EntityFilter>,
    pub custom_metrics: Vec<serde_json::Value>,
    pub profiles: Vec<serde_json::Value>,
    pub goals: Vec<serde_json::Value>,
    pub with_vat: bool,
    pub per_page: u32,
    pub sorting: &'static str,
    pub columns: Vec<&'static str>,
}

impl StatisticsQuery {
    pub fn daily(
        project_id: u64,
        range: DateRange,
        grouping: Grouping,
        columns: &[&'static str],
        per_page: u32,
    ) -> Self {
        Self {
            channel_id: Vec::new(),
            start_date: range.start().format(DATE_FORMAT).to_string(),
            end_date: range.end().format(DATE_FORMAT).to_string(),
            date_grouping: "day",
            grouping,
            filtering: vec![EntityFilter {
                entity: "project",
                entities: vec![project_id],
            }],
            custom_metrics: Vec::new(),
            profiles: Vec::new(),
            goals: Vec::new(),
            with_vat: false,
            per_page,
            sorting: "date",
            columns: columns.to_vec(),
        }
    }
}

/// What to page through. A query plus a page number fully determines a request,
/// so re-fetching a page is always safe.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiQuery {
    ProjectPlacements { project_id: u64, per_page: u32 },
    DetailedStatistics(StatisticsQuery),
}

impl ApiQuery {
    pub fn per_page(&self) -> u32 {
        match self {
            ApiQuery::ProjectPlacements { per_page, .. } => *per_page,
            ApiQuery::DetailedStatistics(query) => query.per_page,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct PageMeta {
    #[serde(default, alias = "current_page")]
    pub page: Option<u32>,
    #[serde(default, alias = "last_page", alias = "total_pages")]
    pub page_count: Option<u32>,
    #[serde(default, alias = "total_count")]
    pub total: Option<u64>,
}

/// One decoded page of the API's pagination envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiPage {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<RawRecord>,
    #[serde(default, alias = "pagination")]
    pub meta: Option<PageMeta>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RawRecord>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<RawRecord>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ApiPage {
    pub fn new(items: Vec<RawRecord>) -> Self {
        Self { items, meta: None }
    }

    /// Whether another page follows `requested_page`.
    ///
    /// An empty page always ends the sequence. Otherwise pagination metadata
    /// wins (page count, then total); without it a short page is the last one.
    pub fn has_more(&self, requested_page: u32, per_page: u32) -> bool {
        if self.items.is_empty() {
            return false;
        }
        if let Some(meta) = self.meta {
            let current = meta.page.unwrap_or(requested_page);
            if let Some(count) = meta.page_count {
                return current < count;
            }
            if let Some(total) = meta.total {
                return u64::from(current) * u64::from(per_page) < total;
            }
        }
        self.items.len() >= per_page as usize
    }
}

/// Paginated record source. Pages are numbered from 1.
#[async_trait]
pub trait ReportingApi: Send + Sync {
    async fn fetch_page(&self, query: &ApiQuery, page: u32) -> Result<ApiPage, FetchError>;
}

#[async_trait]
impl<T: ReportingApi + ?Sized> ReportingApi for &T {
    async fn fetch_page(&self, query: &ApiQuery, page: u32) -> Result<ApiPage, FetchError> {
        (**self).fetch_page(query, page).await
    }
}

#[derive(Clone)]
pub struct MarilynCredentials {
    pub account_id: String,
    pub token: String,
}

impl fmt::Debug for MarilynCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarilynCredentials")
            .field("account_id", &self.account_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct MarilynClient {
    http: HttpFetcher,
    api_root: String,
    credentials: MarilynCredentials,
}

impl MarilynClient {
    pub fn new(http: HttpFetcher, api_root: impl Into<String>, credentials: MarilynCredentials) -> Self {
        let api_root = api_root.into().trim_end_matches('/').to_string();
        Self {
            http,
            api_root,
            credentials,
        }
    }

    pub fn request_for(&self, query: &ApiQuery, page: u32) -> Result<RequestSpec, FetchError> {
        let request = match query {
            ApiQuery::ProjectPlacements {
                project_id,
                per_page,
            } => RequestSpec::get(format!(
                "{}/api/projects/{project_id}/placements",
                self.api_root
            ))
            .query("page", page)
            .query("per_page", per_page),
            ApiQuery::DetailedStatistics(body) => {
                let body = serde_json::to_value(body).map_err(|source| FetchError::Decode {
                    url: format!("{}/api/statistics/detailed", self.api_root),
                    source,
                })?;
                RequestSpec::post_json(format!("{}/api/statistics/detailed", self.api_root), body)
                    .query("page", page)
            }
        };
        Ok(request
            .header("X-API-Account", self.credentials.account_id.clone())
            .header("X-API-Token", self.credentials.token.clone())
            .header("Accept", "application/json"))
    }
}

#[async_trait]
impl ReportingApi for MarilynClient {
    async fn fetch_page(&self, query: &ApiQuery, page: u32) -> Result<ApiPage, FetchError> {
        let request = self.request_for(query, page)?;
        self.http.send_json(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, HttpClientConfig};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn range() -> DateRange {
        DateRange::parse("2024-01-01", "2024-01-03").unwrap()
    }

    fn client(root: &str, retries: usize) -> MarilynClient {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap();
        MarilynClient::new(
            http,
            format!("{root}/"),
            MarilynCredentials {
                account_id: "42".into(),
                token: "secret".into(),
            },
        )
    }

    #[test]
    fn statistics_body_matches_api_contract() {
        let query = StatisticsQuery::daily(7, range(), Grouping::Ad, &["date", "ad_id"], 200);
        let value = serde_json::to_value(&query).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "channel_id": [],
                "start_date": "2024-01-01",
                "end_date": "2024-01-03",
                "date_grouping": "day",
                "grouping": "ad",
                "filtering": [{"entity": "project", "entities": [7]}],
                "custom_metrics": [],
                "profiles": [],
                "goals": [],
                "with_vat": false,
                "per_page": 200,
                "sorting": "date",
                "columns": ["date", "ad_id"],
            })
        );
    }

    #[test]
    fn has_more_prefers_page_count_then_total_then_page_size() {
        let items = |n: usize| (0..n).map(|_| RawRecord::new()).collect::<Vec<_>>();

        let mut page = ApiPage::new(items(2));
        page.meta = Some(PageMeta {
            page: Some(1),
            page_count: Some(3),
            total: None,
        });
        assert!(page.has_more(1, 2));
        page.meta = Some(PageMeta {
            page: Some(3),
            page_count: Some(3),
            total: None,
        });
        assert!(!page.has_more(3, 2));

        page.meta = Some(PageMeta {
            page: None,
            page_count: None,
            total: Some(4),
        });
        assert!(page.has_more(1, 2));
        assert!(!page.has_more(2, 2));

        assert!(ApiPage::new(items(2)).has_more(1, 2));
        assert!(!ApiPage::new(items(1)).has_more(1, 2));
        assert!(!ApiPage::new(Vec::new()).has_more(1, 2));
    }

    #[test]
    fn envelope_accepts_pagination_aliases_and_null_items() {
        let page: ApiPage = serde_json::from_str(
            r#"{"items": [{"id": 1}], "pagination": {"current_page": 1, "last_page": 2}}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.meta.unwrap().page_count, Some(2));

        let empty: ApiPage = serde_json::from_str(r#"{"items": null}"#).unwrap();
        assert!(empty.items.is_empty());
    }

    #[test]
    fn credentials_debug_hides_token() {
        let creds = MarilynCredentials {
            account_id: "1".into(),
            token: "top-secret".into(),
        };
        assert!(!format!("{creds:?}").contains("top-secret"));
    }

    #[tokio::test]
    async fn placements_page_is_fetched_with_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/projects/9/placements"))
            .and(query_param("page", "2"))
            .and(query_param("per_page", "200"))
            .and(header("X-API-Account", "42"))
            .and(header("X-API-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"id": 5, "name": "banner"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let page = client(&server.uri(), 0)
            .fetch_page(
                &ApiQuery::ProjectPlacements {
                    project_id: 9,
                    per_page: 200,
                },
                2,
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["name"], "banner");
    }

    #[tokio::test]
    async fn statistics_fetch_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/statistics/detailed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/statistics/detailed"))
            .and(query_param("page", "1"))
            .and(body_partial_json(serde_json::json!({"grouping": "placement"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"date": "2024-01-01"}],
            })))
            .mount(&server)
            .await;

        let query = ApiQuery::DetailedStatistics(StatisticsQuery::daily(
            9,
            range(),
            Grouping::Placement,
            &["date"],
            200,
        ));
        let page = client(&server.uri(), 2).fetch_page(&query, 1).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server.uri(), 3)
            .fetch_page(
                &ApiQuery::ProjectPlacements {
                    project_id: 1,
                    per_page: 10,
                },
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 401, .. }));
    }
}
