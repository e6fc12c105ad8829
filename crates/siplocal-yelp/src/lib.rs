//! Yelp Fusion API client and the directory trait the pipelines consume.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "siplocal-yelp";

pub const YELP_API_BASE: &str = "https://api.yelp.com/v3";
/// Yelp caps search pages at 50 results per request.
pub const SEARCH_PAGE_SIZE: usize = 50;
pub const DEFAULT_CATEGORIES: &str = "coffee,cafes";
/// Pause between paginated search requests to stay under the provider's
/// rate limit. Not a concurrency control.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum YelpError {
    /// Non-success response from the upstream API, with status and body text.
    /// The caller decides whether this is fatal or skippable.
    #[error("Yelp API error: {status} - {body}")]
    Api { status: u16, body: String },
    #[error("Yelp request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YelpCategory {
    pub alias: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct YelpCoordinates {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct YelpLocation {
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub address3: Option<String>,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip_code: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub display_address: Vec<String>,
}

/// A business as returned by the search endpoint. The details endpoint
/// returns the same shape plus a populated `photos` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YelpBusiness {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub url: Option<String>,
    pub price: Option<String>,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub review_count: i64,
    #[serde(default)]
    pub categories: Vec<YelpCategory>,
    #[serde(default)]
    pub coordinates: YelpCoordinates,
    #[serde(default)]
    pub location: YelpLocation,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub display_phone: String,
    /// Permanently-closed flag.
    #[serde(default)]
    pub is_closed: bool,
    /// Only populated by the business details endpoint.
    pub photos: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YelpSearchResponse {
    pub businesses: Vec<YelpBusiness>,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YelpReviewUser {
    pub name: String,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YelpReview {
    pub id: String,
    pub rating: i16,
    pub text: String,
    pub url: Option<String>,
    pub user: YelpReviewUser,
    pub time_created: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YelpReviewsResponse {
    pub reviews: Vec<YelpReview>,
    #[serde(default)]
    pub total: i64,
}

/// Dependency-injection seam over the external directory provider. The
/// ingestion orchestrator and review sync policy only see this trait, so
/// tests substitute fakes.
#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    /// Search a locality, paginating internally up to `max_results`.
    /// Permanently-closed businesses are dropped when `exclude_closed`.
    async fn search(
        &self,
        locality: &str,
        categories: &str,
        max_results: usize,
        exclude_closed: bool,
    ) -> Result<Vec<YelpBusiness>, YelpError>;

    /// Fetch one business with its extended photo list.
    async fn business_details(&self, business_id: &str) -> Result<YelpBusiness, YelpError>;

    /// Fetch the provider's current review set for a business.
    async fn business_reviews(&self, business_id: &str) -> Result<Vec<YelpReview>, YelpError>;
}

#[derive(Debug, Clone)]
pub struct YelpClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    page_delay: Duration,
}

impl YelpClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, YelpError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: YELP_API_BASE.to_string(),
            page_delay: DEFAULT_PAGE_DELAY,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, YelpError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "yelp_fetch");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(YelpError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    /// One page of search results, at most [`SEARCH_PAGE_SIZE`] entries.
    pub async fn search_page(
        &self,
        locality: &str,
        categories: &str,
        limit: usize,
        offset: usize,
    ) -> Result<YelpSearchResponse, YelpError> {
        self.get_json(
            "/businesses/search",
            &[
                ("location", locality.to_string()),
                ("categories", categories.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ],
        )
        .await
    }
}

pub(crate) fn drop_closed(businesses: Vec<YelpBusiness>) -> Vec<YelpBusiness> {
    businesses.into_iter().filter(|b| !b.is_closed).collect()
}

#[async_trait]
impl BusinessDirectory for YelpClient {
    async fn search(
        &self,
        locality: &str,
        categories: &str,
        max_results: usize,
        exclude_closed: bool,
    ) -> Result<Vec<YelpBusiness>, YelpError> {
        let mut collected: Vec<YelpBusiness> = Vec::new();
        let mut offset = 0usize;

        while collected.len() < max_results {
            let page = self
                .search_page(locality, categories, SEARCH_PAGE_SIZE, offset)
                .await?;
            if page.businesses.is_empty() {
                break;
            }

            let page_len = page.businesses.len();
            let businesses = if exclude_closed {
                drop_closed(page.businesses)
            } else {
                page.businesses
            };
            collected.extend(businesses);

            // A short page means the provider has no further results.
            if page_len < SEARCH_PAGE_SIZE || collected.len() >= max_results {
                break;
            }
            offset += SEARCH_PAGE_SIZE;
            tokio::time::sleep(self.page_delay).await;
        }

        collected.truncate(max_results);
        Ok(collected)
    }

    async fn business_details(&self, business_id: &str) -> Result<YelpBusiness, YelpError> {
        self.get_json(&format!("/businesses/{business_id}"), &[])
            .await
    }

    async fn business_reviews(&self, business_id: &str) -> Result<Vec<YelpReview>, YelpError> {
        let response: YelpReviewsResponse = self
            .get_json(&format!("/businesses/{business_id}/reviews"), &[])
            .await?;
        Ok(response.reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn business(id: &str, closed: bool) -> YelpBusiness {
        YelpBusiness {
            id: id.to_string(),
            name: id.to_string(),
            image_url: None,
            url: None,
            price: None,
            rating: 4.0,
            review_count: 1,
            categories: vec![],
            coordinates: YelpCoordinates::default(),
            location: YelpLocation::default(),
            phone: String::new(),
            display_phone: String::new(),
            is_closed: closed,
            photos: None,
        }
    }

    #[test]
    fn drop_closed_keeps_open_businesses_only() {
        let out = drop_closed(vec![
            business("a", false),
            business("b", true),
            business("c", false),
        ]);
        assert_eq!(
            out.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "c"]
        );
    }

    #[test]
    fn search_response_parses_with_missing_optionals() {
        let json = r#"{
            "businesses": [{
                "id": "abc123",
                "name": "Frida's Cafe",
                "image_url": "https://img.example/1.jpg",
                "url": "https://yelp.example/fridas",
                "price": "$$",
                "rating": 4.5,
                "review_count": 87,
                "categories": [{"alias": "coffee", "title": "Coffee & Tea"}],
                "coordinates": {"latitude": 25.9, "longitude": -97.5},
                "location": {
                    "address1": "123 Elizabeth St",
                    "city": "Brownsville",
                    "state": "TX",
                    "zip_code": "78520",
                    "country": "US",
                    "display_address": ["123 Elizabeth St", "Brownsville, TX 78520"]
                },
                "phone": "+19565550100",
                "display_phone": "(956) 555-0100"
            }],
            "total": 1
        }"#;
        let parsed: YelpSearchResponse = serde_json::from_str(json).unwrap();
        let b = &parsed.businesses[0];
        assert_eq!(b.id, "abc123");
        assert_eq!(b.price.as_deref(), Some("$$"));
        assert!(!b.is_closed);
        assert!(b.photos.is_none());
        assert_eq!(b.location.display_address.len(), 2);
    }

    #[test]
    fn reviews_response_parses() {
        let json = r#"{
            "reviews": [{
                "id": "rev-1",
                "rating": 5,
                "text": "Great pour-over.",
                "url": "https://yelp.example/rev-1",
                "user": {"name": "Ana R.", "image_url": null},
                "time_created": "2026-08-01 10:00:00"
            }],
            "total": 1
        }"#;
        let parsed: YelpReviewsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.reviews[0].rating, 5);
        assert_eq!(parsed.reviews[0].user.name, "Ana R.");
    }
}
