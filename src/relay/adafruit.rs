//! Adafruit IO v2 REST client.
//!
//! Series map to feeds, grouped under one feed group. Feed keys are assigned
//! by the service and returned when a feed is created.

use super::{ApiError, ApiFuture, Series, TelemetryApi};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::info;

pub const API_BASE: &str = "https://io.adafruit.com/api/v2";

/// Upper bound on any single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEY_HEADER: &str = "x-aio-key";

#[derive(Debug, Deserialize)]
struct Feed {
    name: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct Group {
    #[serde(default)]
    feeds: Vec<Feed>,
}

impl From<Feed> for Series {
    fn from(feed: Feed) -> Self {
        Series {
            name: feed.name,
            key: feed.key,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if let Some(status) = err.status() {
            classify(status).unwrap_or_else(|| ApiError::Request(err.to_string()))
        } else if err.is_decode() || err.is_builder() {
            ApiError::Request(err.to_string())
        } else {
            ApiError::Connection(err.to_string())
        }
    }
}

/// Map a response status to an error, `None` for success.
fn classify(status: StatusCode) -> Option<ApiError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(ApiError::RateLimited)
    } else if status.is_success() {
        None
    } else {
        Some(ApiError::Request(status.to_string()))
    }
}

fn check(response: Response) -> Result<Response, ApiError> {
    match classify(response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

pub struct AdafruitIo {
    client: Client,
    base: String,
    user: String,
}

impl AdafruitIo {
    pub fn new(user: &str, key: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let mut value =
            HeaderValue::from_str(key).map_err(|e| ApiError::Request(format!("bad key: {e}")))?;
        value.set_sensitive(true);
        headers.insert(KEY_HEADER, value);

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base: API_BASE.to_string(),
            user: user.to_string(),
        })
    }

    /// Point the client at another server.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base.trim_end_matches('/'), self.user, path)
    }

    async fn group_feeds(&self, group: &str) -> Result<Vec<Series>, ApiError> {
        let response = self.client.get(self.url(&format!("groups/{group}"))).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!("Creating AIO group: {group}");
            let response = self
                .client
                .post(self.url("groups"))
                .json(&json!({ "name": group }))
                .send()
                .await?;
            check(response)?;
            return Ok(Vec::new());
        }
        let group: Group = check(response)?.json().await?;
        Ok(group.feeds.into_iter().map(Series::from).collect())
    }

    async fn create_feed(&self, name: &str, group: &str) -> Result<Series, ApiError> {
        let response = self
            .client
            .post(self.url("feeds"))
            .query(&[("group_key", group)])
            .json(&json!({ "feed": { "name": name } }))
            .send()
            .await?;
        let feed: Feed = check(response)?.json().await?;
        Ok(feed.into())
    }

    async fn send_data(&self, series: &Series, value: f64) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(&format!("feeds/{}/data", series.key)))
            .json(&json!({ "value": value }))
            .send()
            .await?;
        check(response)?;
        Ok(())
    }
}

impl TelemetryApi for AdafruitIo {
    fn list_series<'a>(&'a self, group: &'a str) -> ApiFuture<'a, Vec<Series>> {
        Box::pin(self.group_feeds(group))
    }

    fn create_series<'a>(&'a self, name: &'a str, group: &'a str) -> ApiFuture<'a, Series> {
        Box::pin(self.create_feed(name, group))
    }

    fn upload<'a>(&'a self, series: &'a Series, value: f64) -> ApiFuture<'a, ()> {
        Box::pin(self.send_data(series, value))
    }
}
