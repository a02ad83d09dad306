//! Paginated queries against the reporting API

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use super::resolve::ReportRow;
use super::window::Window;
use crate::config::ReportingConfig;

/// One page request as the reporting API expects it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub ids: String,
    pub filters: String,
    pub dimensions: String,
    pub metrics: String,
    pub sort: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// 1-based
    pub start_index: u32,
    pub max_results: u32,
}

impl ReportRequest {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ids", self.ids.clone()),
            ("filters", self.filters.clone()),
            ("dimensions", self.dimensions.clone()),
            ("metrics", self.metrics.clone()),
            ("sort", self.sort.clone()),
            ("start-date", self.start_date.format("%Y-%m-%d").to_string()),
            ("end-date", self.end_date.format("%Y-%m-%d").to_string()),
            ("start-index", self.start_index.to_string()),
            ("max-results", self.max_results.to_string()),
        ]
    }
}

/// One page of results. A missing `rows` key means no rows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportPage {
    #[serde(default)]
    pub rows: Vec<ReportRow>,
    #[serde(default, rename = "totalResults")]
    pub total_results: Option<u64>,
}

/// Authenticated access to the reporting API
#[async_trait]
pub trait ReportingApi: Send + Sync {
    async fn fetch(&self, request: &ReportRequest) -> Result<ReportPage>;
}

/// Reporting API over HTTPS with a pre-provisioned bearer token
pub struct HttpReportingApi {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl HttpReportingApi {
    pub fn new(config: &ReportingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            access_token: config.access_token.clone(),
        })
    }
}

#[async_trait]
impl ReportingApi for HttpReportingApi {
    async fn fetch(&self, request: &ReportRequest) -> Result<ReportPage> {
        let page = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.access_token)
            .query(&request.query_pairs())
            .send()
            .await
            .context("reporting API request failed")?
            .error_for_status()?
            .json::<ReportPage>()
            .await
            .context("reporting API returned an unreadable body")?;
        Ok(page)
    }
}

/// Static part of a report query
#[derive(Debug, Clone, Copy)]
pub struct QueryShape<'a> {
    pub filters: &'a str,
    pub dimensions: &'a str,
    pub metrics: &'a str,
    pub sort: &'a str,
}

/// 1-based index of the page after the one starting at `start_index`
fn next_start_index(start_index: u32, page_size: u32) -> Option<u32> {
    start_index.checked_add(page_size)
}

/// Run one report over one window, following pages until the result is
/// exhausted or a page comes back empty. A full page is logged since it
/// means the window alone holds more rows than one request returns.
pub async fn query_window(
    api: &dyn ReportingApi,
    profile_id: &str,
    shape: QueryShape<'_>,
    window: Window,
    page_size: u32,
) -> Result<Vec<ReportRow>> {
    let mut request = ReportRequest {
        ids: format!("ga:{}", profile_id),
        filters: shape.filters.to_string(),
        dimensions: shape.dimensions.to_string(),
        metrics: shape.metrics.to_string(),
        sort: shape.sort.to_string(),
        start_date: window.start,
        end_date: window.end,
        start_index: 1,
        max_results: page_size,
    };

    let mut rows = Vec::new();
    loop {
        debug!("{} -> {} (from row {})", request.start_date, request.end_date, request.start_index);
        let page = api.fetch(&request).await?;
        let received = page.rows.len();
        rows.extend(page.rows);

        if received == 0 || received < page_size as usize {
            break;
        }
        if let Some(total) = page.total_results {
            if rows.len() as u64 >= total {
                break;
            }
        }

        let Some(next) = next_start_index(request.start_index, page_size) else {
            warn!(
                "Row index limit reached for {} -> {}; keeping {} rows",
                request.start_date,
                request.end_date,
                rows.len()
            );
            break;
        };
        warn!(
            "Full page of {} rows for {} -> {}; fetching the next page",
            received, request.start_date, request.end_date
        );
        request.start_index = next;
    }

    Ok(rows)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeApi;
    use super::*;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn shape() -> QueryShape<'static> {
        QueryShape {
            filters: "ga:pagePath=~/dataset/",
            dimensions: "ga:pagePath,ga:date",
            metrics: "ga:uniquePageviews",
            sort: "-ga:uniquePageviews",
        }
    }

    fn window() -> Window {
        Window {
            start: day("2024-03-01"),
            end: day("2024-03-31"),
        }
    }

    fn numbered_rows(from: u32, count: u32) -> Vec<ReportRow> {
        (from..from + count)
            .map(|i| vec![format!("/dataset/d{}", i), "20240301".to_string(), "1".to_string()])
            .collect()
    }

    #[tokio::test]
    async fn test_single_short_page() {
        let api = FakeApi::new(|_| {
            Ok(ReportPage {
                rows: numbered_rows(1, 3),
                total_results: Some(3),
            })
        });

        let rows = query_window(&api, "42", shape(), window(), 10).await.unwrap();
        assert_eq!(rows.len(), 3);

        let requests = api.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].ids, "ga:42");
        assert_eq!(requests[0].start_index, 1);
        assert_eq!(requests[0].max_results, 10);
        assert_eq!(requests[0].start_date, day("2024-03-01"));
        assert_eq!(requests[0].end_date, day("2024-03-31"));
    }

    #[tokio::test]
    async fn test_full_pages_are_followed() {
        let api = FakeApi::new(|req| {
            let remaining = 25u32.saturating_sub(req.start_index - 1);
            Ok(ReportPage {
                rows: numbered_rows(req.start_index, remaining.min(req.max_results)),
                total_results: Some(25),
            })
        });

        let rows = query_window(&api, "42", shape(), window(), 10).await.unwrap();
        assert_eq!(rows.len(), 25);

        let starts: Vec<u32> = api.requests().iter().map(|r| r.start_index).collect();
        assert_eq!(starts, vec![1, 11, 21]);
    }

    #[tokio::test]
    async fn test_exact_multiple_stops_on_total() {
        let api = FakeApi::new(|req| {
            Ok(ReportPage {
                rows: numbered_rows(req.start_index, 10),
                total_results: Some(10),
            })
        });

        let rows = query_window(&api, "42", shape(), window(), 10).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(api.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_page_ends_pagination_without_total() {
        let api = FakeApi::new(|req| {
            let rows = if req.start_index <= 20 {
                numbered_rows(req.start_index, req.max_results)
            } else {
                Vec::new()
            };
            Ok(ReportPage {
                rows,
                total_results: None,
            })
        });

        let rows = query_window(&api, "42", shape(), window(), 10).await.unwrap();
        assert_eq!(rows.len(), 20);

        let starts: Vec<u32> = api.requests().iter().map(|r| r.start_index).collect();
        assert_eq!(starts, vec![1, 11, 21]);
    }

    #[test]
    fn test_next_start_index_stops_at_overflow() {
        assert_eq!(next_start_index(1, 10_000), Some(10_001));
        assert_eq!(next_start_index(u32::MAX - 5, 10), None);
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let api = FakeApi::new(|_| Err(anyhow::anyhow!("401 unauthorized")));
        let err = query_window(&api, "42", shape(), window(), 10).await.unwrap_err();
        assert!(err.to_string().contains("401"));
    }

    #[test]
    fn test_missing_rows_key_means_empty() {
        let page: ReportPage = serde_json::from_str(r#"{"totalResults": 0}"#).unwrap();
        assert!(page.rows.is_empty());

        let page: ReportPage =
            serde_json::from_str(r#"{"rows": [["/dataset/a", "20240301", "4"]], "totalResults": 1}"#).unwrap();
        assert_eq!(page.rows[0][2], "4");
    }
}
