use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::{DataSource, FetchedSeries};
use crate::config::DEFAULT_WORLDBANK_BASE_URL;
use crate::core::rate_limiter::RateLimiter;
use crate::error::FetchError;
use crate::models::{DataSourceKind, DateRange, SeriesPoint, SeriesRequest};

/// Upper bound on pages followed for one series, whatever the API reports.
const MAX_PAGES: u32 = 1_000;

pub struct WorldBankFetcher {
    client: Client,
    base_url: String,
    page_size: u32,
}

/// One parsed page of a World Bank response.
#[derive(Debug)]
struct WorldBankPage {
    pages: u32,
    returned: usize,
    series_name: Option<String>,
    points: Vec<SeriesPoint>,
}

impl WorldBankFetcher {
    pub fn new(base_url: impl Into<String>, page_size: u32) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("EconConvergence/1.0"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_WORLDBANK_BASE_URL, 1000)
    }

    fn page_url(&self, request: &SeriesRequest, range: &DateRange, page: u32) -> String {
        format!(
            "{}/country/{}/indicator/{}?format=json&per_page={}&page={}&date={}:{}",
            self.base_url, request.entity, request.metric, self.page_size, page, range.start_year, range.end_year
        )
    }

    fn parse_page(json: &Value) -> Result<WorldBankPage, FetchError> {
        // World Bank API returns an array: [Metadata, [Data...]]
        let arr = json
            .as_array()
            .ok_or_else(|| FetchError::Format("World Bank response is not an array".to_string()))?;

        let meta = arr
            .first()
            .ok_or_else(|| FetchError::Format("World Bank response is empty".to_string()))?;

        // Errors come back as [{"message": [{"id": .., "key": .., "value": ..}]}]
        if let Some(messages) = meta["message"].as_array() {
            let text = messages
                .iter()
                .filter_map(|m| m["value"].as_str().or_else(|| m["key"].as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(FetchError::Format(format!("World Bank API error: {}", text)));
        }

        let pages = match &meta["pages"] {
            Value::Number(n) => n.as_u64().map_or(1, |p| u32::try_from(p).unwrap_or(u32::MAX)),
            Value::String(s) => s.trim().parse::<u64>().map_or(1, |p| u32::try_from(p).unwrap_or(u32::MAX)),
            _ => 1,
        }
        .min(MAX_PAGES);

        let data: &[Value] = match arr.get(1) {
            Some(Value::Array(items)) => items.as_slice(),
            // No data for the requested range
            Some(Value::Null) => &[],
            _ => return Err(FetchError::Format("Invalid World Bank API response format".to_string())),
        };

        let mut series_name = None;
        let mut points = Vec::new();

        for obs in data {
            if series_name.is_none() {
                series_name = obs["indicator"]["value"].as_str().map(str::to_string);
            }

            let Some(date) = obs["date"].as_str() else { continue };

            // Numeric, numeric string, or null
            let value = match &obs["value"] {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };

            if let Some(value) = value.filter(|v| v.is_finite()) {
                points.push(SeriesPoint::new(date, value));
            }
        }

        Ok(WorldBankPage { pages, returned: data.len(), series_name, points })
    }
}

#[async_trait]
impl DataSource for WorldBankFetcher {
    fn name(&self) -> &str {
        "worldbank"
    }

    fn kind(&self) -> DataSourceKind {
        DataSourceKind::WorldBank
    }

    async fn fetch_series(
        &self,
        request: &SeriesRequest,
        range: &DateRange,
        limiter: &RateLimiter,
    ) -> Result<FetchedSeries, FetchError> {
        let mut page = 1;
        let mut total_pages = 1;
        let mut series_name = None;
        let mut points = Vec::new();

        while page <= total_pages {
            let url = self.page_url(request, range, page);
            limiter.wait().await;
            debug!(url = %url, "Fetching World Bank page");

            let resp = self.client.get(&url).send().await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::Status { status, body });
            }

            let json: Value = resp.json().await?;
            let parsed = Self::parse_page(&json)?;

            total_pages = parsed.pages.max(1);
            if series_name.is_none() {
                series_name = parsed.series_name;
            }
            let empty = parsed.returned == 0;
            points.extend(parsed.points);
            // An empty page means the API has nothing further, whatever `pages` says
            if empty {
                break;
            }
            page += 1;
        }

        // API returns newest first
        points.sort_by(|a, b| a.date.cmp(&b.date));

        Ok(FetchedSeries {
            series_name: series_name.unwrap_or_else(|| request.metric.clone()),
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::test_server::serve;
    use serde_json::json;
    use std::time::{Duration, Instant};

    /// Two-page GDP series, newest first as the API returns it.
    fn gdp_page(target: &str) -> (u16, String) {
        let data = if target.contains("&page=1&") {
            json!([
                { "page": 1, "pages": 2, "per_page": 2, "total": 4 },
                [
                    { "indicator": { "value": "GDP (current US$)" }, "date": "2003", "value": 4.0 },
                    { "indicator": { "value": "GDP (current US$)" }, "date": "2002", "value": null }
                ]
            ])
        } else {
            json!([
                { "page": 2, "pages": 2, "per_page": 2, "total": 4 },
                [
                    { "indicator": { "value": "GDP (current US$)" }, "date": "2001", "value": "2.0" },
                    { "indicator": { "value": "GDP (current US$)" }, "date": "2000", "value": 1.0 }
                ]
            ])
        };
        (200, data.to_string())
    }

    #[test]
    fn test_parse_wb_response() {
        let json_data = json!([
            { "page": 1, "pages": 1, "per_page": 50, "total": 2 },
            [
                { "indicator": { "id": "GDP", "value": "GDP (current US$)" }, "country": { "id": "US", "value": "United States" }, "countryiso3code": "USA", "date": "2023", "value": 3.0, "unit": "", "obs_status": "", "decimal": 1 },
                { "indicator": { "id": "GDP", "value": "GDP (current US$)" }, "country": { "id": "US", "value": "United States" }, "countryiso3code": "USA", "date": "2022", "value": 2.5, "unit": "", "obs_status": "", "decimal": 1 }
            ]
        ]);

        let page = WorldBankFetcher::parse_page(&json_data).unwrap();
        assert_eq!(page.pages, 1);
        assert_eq!(page.series_name.as_deref(), Some("GDP (current US$)"));
        assert_eq!(page.points.len(), 2);
        assert_eq!(page.points[0], SeriesPoint::new("2023", 3.0));
    }

    #[test]
    fn test_parse_drops_nulls_and_garbage() {
        let json_data = json!([
            { "page": 1, "pages": "3", "per_page": 50, "total": 5 },
            [
                { "date": "2023", "value": null },
                { "date": "2022", "value": "4.5" },
                { "date": "2021", "value": "n/a" },
                { "date": "2020", "value": 1.25 },
                { "value": 9.0 }
            ]
        ]);

        let page = WorldBankFetcher::parse_page(&json_data).unwrap();
        assert_eq!(page.pages, 3);
        assert_eq!(page.points, vec![SeriesPoint::new("2022", 4.5), SeriesPoint::new("2020", 1.25)]);
        assert!(page.series_name.is_none());
    }

    #[test]
    fn test_parse_null_data_is_empty() {
        let json_data = json!([{ "page": 0, "pages": 0, "per_page": 50, "total": 0 }, null]);
        let page = WorldBankFetcher::parse_page(&json_data).unwrap();
        assert!(page.points.is_empty());
    }

    #[test]
    fn test_parse_error_payload() {
        let json_data = json!([
            { "message": [{ "id": "120", "key": "Invalid value", "value": "The provided parameter value is not valid" }] }
        ]);
        let err = WorldBankFetcher::parse_page(&json_data).unwrap_err();
        assert!(err.to_string().contains("not valid"));
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(WorldBankFetcher::parse_page(&json!({ "error": "bad request" })).is_err());
        assert!(WorldBankFetcher::parse_page(&json!([{ "page": 1 }])).is_err());
    }

    #[test]
    fn test_page_url_carries_range_and_page_size() {
        let fetcher = WorldBankFetcher::new("http://localhost:9000/v2/", 500);
        let url = fetcher.page_url(&SeriesRequest::new("USA", "NY.GDP.MKTP.CD"), &DateRange::new(2000, 2010), 2);
        assert_eq!(
            url,
            "http://localhost:9000/v2/country/USA/indicator/NY.GDP.MKTP.CD?format=json&per_page=500&page=2&date=2000:2010"
        );
    }

    #[test]
    fn test_parse_huge_page_count_is_capped() {
        let json_data = json!([{ "page": 1, "pages": 99_999_999_999u64 }, []]);
        assert_eq!(WorldBankFetcher::parse_page(&json_data).unwrap().pages, MAX_PAGES);

        let json_data = json!([{ "page": 1, "pages": "4294967296" }, []]);
        assert_eq!(WorldBankFetcher::parse_page(&json_data).unwrap().pages, MAX_PAGES);
    }

    #[tokio::test]
    async fn test_fetch_follows_all_pages_and_sorts_ascending() {
        let server = serve(gdp_page).await;
        let fetcher = WorldBankFetcher::new(format!("{}/v2", server.base_url), 2);

        let series = fetcher
            .fetch_series(&SeriesRequest::new("USA", "NY.GDP.MKTP.CD"), &DateRange::new(2000, 2003), &RateLimiter::unlimited())
            .await
            .unwrap();

        assert_eq!(series.series_name, "GDP (current US$)");
        assert_eq!(
            series.points,
            vec![SeriesPoint::new("2000", 1.0), SeriesPoint::new("2001", 2.0), SeriesPoint::new("2003", 4.0)]
        );

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("/v2/country/USA/indicator/NY.GDP.MKTP.CD?"));
        assert!(requests[1].contains("&page=2&"));
    }

    #[tokio::test]
    async fn test_fetch_waits_on_limiter_for_every_page() {
        let server = serve(gdp_page).await;
        let fetcher = WorldBankFetcher::new(server.base_url.clone(), 2);
        let limiter = RateLimiter::new(Duration::from_millis(150), 1, 0);

        let started = Instant::now();
        for _ in 0..2 {
            fetcher
                .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2000, 2003), &limiter)
                .await
                .unwrap();
        }

        // four pages, the first token is free
        assert_eq!(server.requests().len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_fetch_stops_on_empty_page() {
        let server = serve(|_: &str| (200, json!([{ "page": 1, "pages": 50 }, []]).to_string())).await;
        let fetcher = WorldBankFetcher::new(server.base_url.clone(), 100);

        let series = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2000, 2003), &RateLimiter::unlimited())
            .await
            .unwrap();

        assert!(series.points.is_empty());
        assert_eq!(series.series_name, "GDP");
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_maps_error_status() {
        let server = serve(|_: &str| (503, "maintenance".to_string())).await;
        let fetcher = WorldBankFetcher::new(server.base_url.clone(), 100);

        let err = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2000, 2003), &RateLimiter::unlimited())
            .await
            .unwrap_err();

        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
