use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{DataSource, FetchedSeries};
use crate::config::DEFAULT_FRED_BASE_URL;
use crate::core::rate_limiter::RateLimiter;
use crate::error::{AuthError, FetchError};
use crate::models::{DataSourceKind, DateRange, SeriesPoint, SeriesRequest};

/// FRED marks missing observations with a literal "."
const MISSING_SENTINEL: &str = ".";

/// Largest `limit` the observations endpoint accepts.
const MAX_PAGE_SIZE: u32 = 100_000;

pub struct FredFetcher {
    api_key: Option<String>,
    client: Client,
    base_url: String,
    page_size: u32,
}

#[derive(Debug)]
struct FredPage {
    title: Option<String>,
    count: Option<u64>,
    returned: usize,
    points: Vec<SeriesPoint>,
}

impl FredFetcher {
    pub fn new(api_key: Option<String>, base_url: impl Into<String>, page_size: u32) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("EconConvergence/1.0"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .unwrap_or_else(|_| Client::new());

        let api_key = api_key
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty());

        Self {
            api_key,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn with_key(api_key: Option<String>) -> Self {
        Self::new(api_key, DEFAULT_FRED_BASE_URL, MAX_PAGE_SIZE)
    }

    fn observations_url(&self) -> String {
        format!("{}/series/observations", self.base_url)
    }

    /// Query for one page, without the key. The key is attached separately
    /// so it never appears in anything we format or log.
    fn page_params(&self, series_id: &str, range: &DateRange, offset: u64) -> Vec<(&'static str, String)> {
        vec![
            ("series_id", series_id.to_string()),
            ("file_type", "json".to_string()),
            ("observation_start", range.start_date()),
            ("observation_end", range.end_date()),
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ]
    }

    fn parse_observations(json: &Value) -> Result<FredPage, FetchError> {
        let observations = json["observations"]
            .as_array()
            .ok_or_else(|| FetchError::Format("No observations found in FRED response".to_string()))?;

        let mut points = Vec::new();

        for obs in observations {
            // "date": "2023-01-01", "value": "123.45"
            if let (Some(date_str), Some(value_str)) = (obs["date"].as_str(), obs["value"].as_str()) {
                if value_str == MISSING_SENTINEL {
                    continue;
                }

                if let Ok(value) = value_str.trim().parse::<f64>() {
                    if value.is_finite() {
                        points.push(SeriesPoint::new(date_str, value));
                    }
                }
            }
        }

        Ok(FredPage {
            title: json["title"].as_str().map(str::to_string),
            count: json["count"].as_u64(),
            returned: observations.len(),
            points,
        })
    }
}

#[async_trait]
impl DataSource for FredFetcher {
    fn name(&self) -> &str {
        "fred"
    }

    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Fred
    }

    fn check_credentials(&self) -> Result<(), AuthError> {
        match &self.api_key {
            Some(key) => {
                if key.len() != 32 {
                    warn!(key_length = key.len(), "FRED API key is not 32 characters, requests will likely fail");
                }
                Ok(())
            }
            None => Err(AuthError {
                provider: "fred".to_string(),
                reason: "FRED_API_KEY is not set".to_string(),
            }),
        }
    }

    async fn fetch_series(
        &self,
        request: &SeriesRequest,
        range: &DateRange,
        limiter: &RateLimiter,
    ) -> Result<FetchedSeries, FetchError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::Format("FRED API key missing".to_string()))?;

        let series_id = request.metric.as_str();
        let mut offset: u64 = 0;
        let mut title = None;
        let mut points = Vec::new();

        loop {
            limiter.wait().await;
            debug!(series_id, offset, "Fetching FRED observations");

            let resp = self
                .client
                .get(self.observations_url())
                .query(&self.page_params(series_id, range, offset))
                .query(&[("api_key", api_key)])
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::Status { status, body });
            }

            let json: Value = resp.json().await?;
            let page = Self::parse_observations(&json)?;

            if title.is_none() {
                title = page.title;
            }
            points.extend(page.points);

            offset += page.returned as u64;
            let exhausted = match page.count {
                Some(count) => offset >= count,
                None => true,
            };
            // A short page means we are at the end even if count disagrees
            if exhausted || page.returned < self.page_size as usize {
                break;
            }
        }

        Ok(FetchedSeries {
            series_name: title.unwrap_or_else(|| series_id.to_string()),
            points,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::test_server::serve;
    use serde_json::json;

    const KEY: &str = "deadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn test_parse_valid_response() {
        let json_data = json!({
            "count": 2,
            "title": "Unemployment Rate",
            "observations": [
                { "date": "2023-01-01", "value": "123.45" },
                { "date": "2023-01-02", "value": "124.56" }
            ]
        });

        let page = FredFetcher::parse_observations(&json_data).unwrap();
        assert_eq!(page.points.len(), 2);
        assert_eq!(page.points[0].value, 123.45);
        assert_eq!(page.points[1].value, 124.56);
        assert_eq!(page.title.as_deref(), Some("Unemployment Rate"));
        assert_eq!(page.count, Some(2));
    }

    #[test]
    fn test_parse_missing_value() {
        let json_data = json!({
            "observations": [
                { "date": "2023-01-01", "value": "." },
                { "date": "2023-01-02", "value": "100.0" },
                { "date": "2023-01-03", "value": "NaN" },
                { "date": "2023-01-04", "value": null }
            ]
        });

        let page = FredFetcher::parse_observations(&json_data).unwrap();
        assert_eq!(page.points, vec![SeriesPoint::new("2023-01-02", 100.0)]);
        assert_eq!(page.returned, 4);
    }

    #[test]
    fn test_parse_invalid_format() {
        let json_data = json!({ "error": "bad request" });
        assert!(FredFetcher::parse_observations(&json_data).is_err());
    }

    #[test]
    fn test_missing_key_is_stage_level_auth_error() {
        let fetcher = FredFetcher::with_key(None);
        let err = fetcher.check_credentials().unwrap_err();
        assert_eq!(err.provider, "fred");

        let blank = FredFetcher::with_key(Some("   ".to_string()));
        assert!(blank.check_credentials().is_err());

        let ok = FredFetcher::with_key(Some(" ABCDEF0123456789abcdef0123456789 ".to_string()));
        assert!(ok.check_credentials().is_ok());
    }

    #[test]
    fn test_page_params_exclude_key() {
        let fetcher = FredFetcher::new(Some("k".to_string()), "http://localhost/fred/", 500);
        assert_eq!(fetcher.observations_url(), "http://localhost/fred/series/observations");

        let params = fetcher.page_params("GDP", &DateRange::new(2000, 2001), 500);
        assert!(params.iter().all(|(name, _)| *name != "api_key"));
        assert!(params.contains(&("observation_start", "2000-01-01".to_string())));
        assert!(params.contains(&("observation_end", "2001-12-31".to_string())));
        assert!(params.contains(&("limit", "500".to_string())));
        assert!(params.contains(&("offset", "500".to_string())));
    }

    fn observations(count: Option<u64>, values: &[&str]) -> String {
        let obs: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, v)| json!({ "date": format!("2020-0{}-01", i + 1), "value": v }))
            .collect();
        let mut body = json!({ "title": "Gross Domestic Product", "observations": obs });
        if let Some(count) = count {
            body["count"] = json!(count);
        }
        body.to_string()
    }

    fn offset_of(target: &str) -> u64 {
        target
            .split(['?', '&'])
            .find_map(|kv| kv.strip_prefix("offset="))
            .and_then(|v| v.parse().ok())
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_advances_offset_until_short_page() {
        let server = serve(|target: &str| {
            let body = match offset_of(target) {
                0 => observations(Some(5), &["1.0", "2.0"]),
                2 => observations(Some(5), &["3.0", "."]),
                _ => observations(Some(5), &["5.0"]),
            };
            (200, body)
        })
        .await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), format!("{}/fred", server.base_url), 2);

        let series = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap();

        assert_eq!(series.series_name, "Gross Domestic Product");
        let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 5.0]);

        let offsets: Vec<u64> = server.requests().iter().map(|t| offset_of(t)).collect();
        assert_eq!(offsets, vec![0, 2, 4]);
        assert!(server.requests()[0].starts_with("/fred/series/observations?"));
        assert!(server.requests()[0].contains(&format!("api_key={}", KEY)));
    }

    #[tokio::test]
    async fn test_fetch_stops_when_count_reached() {
        let server = serve(|_: &str| (200, observations(Some(2), &["1.0", "2.0"]))).await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), server.base_url.clone(), 2);

        let series = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap();

        assert_eq!(series.points.len(), 2);
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_stops_without_count_or_on_empty_page() {
        let server = serve(|_: &str| (200, observations(None, &["1.0", "2.0"]))).await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), server.base_url.clone(), 2);
        fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap();
        assert_eq!(server.requests().len(), 1);

        // count claims more, but an empty page ends the loop
        let server = serve(|_: &str| (200, observations(Some(1_000), &[]))).await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), server.base_url.clone(), 2);
        let series = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap();
        assert!(series.points.is_empty());
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_maps_error_status() {
        let server = serve(|_: &str| (400, r#"{"error_message":"Bad Request"}"#.to_string())).await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), server.base_url.clone(), 100);

        let err = fetcher
            .fetch_series(&SeriesRequest::new("USA", "NOPE"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status { status: 400, .. }));
        assert!(!err.to_string().contains(KEY));
    }

    #[tokio::test]
    async fn test_transport_error_does_not_leak_key() {
        // nothing listens on port 1
        let fetcher = FredFetcher::new(Some(KEY.to_string()), "http://127.0.0.1:1/fred", 100);

        let err = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Http(_)));
        assert!(!err.to_string().contains(KEY));
        assert!(!format!("{:?}", err).contains(KEY));
    }

    #[tokio::test]
    async fn test_decode_error_does_not_leak_key() {
        let server = serve(|_: &str| (200, "<html>not json</html>".to_string())).await;
        let fetcher = FredFetcher::new(Some(KEY.to_string()), server.base_url.clone(), 100);

        let err = fetcher
            .fetch_series(&SeriesRequest::new("USA", "GDP"), &DateRange::new(2020, 2020), &RateLimiter::unlimited())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Http(_)));
        assert!(!err.to_string().contains(KEY));
    }
}
