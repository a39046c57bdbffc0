//! Image search providers
//!
//! The pool only needs an ordered list of image locators for a query. The
//! default provider scrapes the image-search results page and pulls the
//! full-size image URLs out of the data embedded in it.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::harvest::config_loader::Search;

/// Error types for search operations
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Result type for search operations
pub type SearchResultOf<T> = Result<T, SearchError>;

/// One hit returned by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl SearchResult {
    #[cfg(test)]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
        }
    }
}

/// A provider that turns a query into image locators
#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search(&self, query: &str, safe: bool) -> SearchResultOf<Vec<SearchResult>>;
}

/// Scrapes an image-search results page
pub struct GoogleImageSearch {
    client: Client,
    endpoint: String,
    image_pattern: Regex,
}

impl GoogleImageSearch {
    pub fn new(config: &Search) -> SearchResultOf<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            image_pattern: Regex::new(IMAGE_PATTERN)?,
        })
    }

    /// Pulls `["<url>",<height>,<width>]` triples out of the page body.
    pub fn extract_results(&self, body: &str) -> Vec<SearchResult> {
        extract_results(&self.image_pattern, body)
    }
}

#[async_trait]
impl ImageSearch for GoogleImageSearch {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn search(&self, query: &str, safe: bool) -> SearchResultOf<Vec<SearchResult>> {
        let safe_param = if safe { "active" } else { "off" };
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("tbm", "isch"), ("safe", safe_param)])
            .send()
            .await?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("Search provider is rate limiting requests");
                return Err(SearchError::RateLimitExceeded);
            }
            status if !status.is_success() => {
                return Err(SearchError::Provider(format!("HTTP error: {}", status)));
            }
            _ => {}
        }

        let body = response.text().await?;
        if body.is_empty() {
            return Err(SearchError::InvalidResponse("empty response body".to_string()));
        }

        let results = self.extract_results(&body);
        debug!("Extracted {} image results", results.len());
        Ok(results)
    }
}

/// Matches `["<url>",<height>,<width>]` as embedded in the results page
const IMAGE_PATTERN: &str = r#"\["(https?://[^"]+?)",(\d+),(\d+)\]"#;

/// Hosts serving the provider's own thumbnails rather than the source image
const PROVIDER_HOSTS: [&str; 2] = ["gstatic.com", "google.com"];

fn extract_results(pattern: &Regex, body: &str) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let mut results = Vec::new();

    for caps in pattern.captures_iter(body) {
        let url = unescape_url(&caps[1]);
        if is_provider_hosted(&url) {
            continue;
        }
        if !seen.insert(url.clone()) {
            continue;
        }
        results.push(SearchResult {
            url,
            height: caps[2].parse().ok(),
            width: caps[3].parse().ok(),
        });
    }

    results
}

/// True for URLs on a provider host, and for anything that is not a URL.
fn is_provider_hosted(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return true;
    };
    let Some(host) = parsed.host_str() else {
        return true;
    };
    PROVIDER_HOSTS
        .iter()
        .any(|provider| host == *provider || host.ends_with(&format!(".{}", provider)))
}

/// Undoes the JSON string escapes the page applies to embedded URLs.
fn unescape_url(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}
