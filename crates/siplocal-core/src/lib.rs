//! Core domain model and validation for SipLocal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "siplocal-core";

/// Maximum number of photo URLs stored per business.
pub const MAX_PHOTOS: usize = 10;

pub const MIN_REVIEW_RATING: i16 = 1;
pub const MAX_REVIEW_RATING: i16 = 5;
pub const MIN_REVIEW_BODY_CHARS: usize = 10;
pub const MAX_REVIEW_BODY_CHARS: usize = 5000;
pub const MAX_REVIEW_TITLE_CHARS: usize = 100;

/// Symbolic price tier, mirroring the directory provider's `$`..`$$$$` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceTier {
    #[serde(rename = "$")]
    Budget,
    #[serde(rename = "$$")]
    Moderate,
    #[serde(rename = "$$$")]
    Pricey,
    #[serde(rename = "$$$$")]
    Splurge,
}

impl PriceTier {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "$" => Some(Self::Budget),
            "$$" => Some(Self::Moderate),
            "$$$" => Some(Self::Pricey),
            "$$$$" => Some(Self::Splurge),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Budget => "$",
            Self::Moderate => "$$",
            Self::Pricey => "$$$",
            Self::Splurge => "$$$$",
        }
    }
}

/// Category code + human label pair as provided by the directory API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub alias: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Structured postal address fields; `display_address` on the business record
/// carries the flattened form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PostalAddress {
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub address3: Option<String>,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub country: String,
}

/// Canonical persisted representation of a place of business.
///
/// The `id` is the directory provider's stable identifier and doubles as the
/// upsert conflict key: re-ingestion refreshes the row, it never duplicates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub directory_url: Option<String>,
    pub price: Option<PriceTier>,
    pub rating: f64,
    pub review_count: i64,
    pub categories: Vec<Category>,
    pub coordinates: Coordinates,
    pub address: PostalAddress,
    pub display_address: String,
    pub phone: String,
    pub display_phone: String,
    /// At most [`MAX_PHOTOS`] deduplicated URLs, primary image first.
    pub photos: Vec<String>,
    /// Populated out of band; never written by ingestion.
    pub ai_summary: Option<String>,
}

/// Discriminates user-authored reviews from externally sourced ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewSource {
    User,
    External,
}

impl ReviewSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::External => "external",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

/// Provenance attached to externally sourced reviews only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReviewDetails {
    pub external_id: String,
    pub author_name: String,
    pub author_avatar_url: Option<String>,
    pub url: Option<String>,
    /// When this copy was fetched from the provider; drives the 24h
    /// staleness window.
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: Uuid,
    pub business_id: String,
    /// Present only for user-authored reviews.
    pub user_id: Option<Uuid>,
    pub source: ReviewSource,
    pub rating: i16,
    pub title: Option<String>,
    pub body: String,
    pub photos: Option<Vec<String>>,
    pub helpful_count: i32,
    pub external: Option<ExternalReviewDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinStatus {
    Favorite,
    WantToTry,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Favorite => "favorite",
            Self::WantToTry => "want_to_try",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "favorite" => Some(Self::Favorite),
            "want_to_try" => Some(Self::WantToTry),
            _ => None,
        }
    }
}

/// A user's saved relationship to a business. At most one pin exists per
/// (user, business) pair; pinning again updates the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub business_id: String,
    pub status: PinStatus,
    pub note: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user display metadata keyed by the identity provider's user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: Uuid,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rating must be an integer between 1 and 5, got {0}")]
    RatingOutOfRange(i16),
    #[error("review content must be at least {MIN_REVIEW_BODY_CHARS} characters, got {0}")]
    BodyTooShort(usize),
    #[error("review content must be at most {MAX_REVIEW_BODY_CHARS} characters, got {0}")]
    BodyTooLong(usize),
    #[error("title must be at most {MAX_REVIEW_TITLE_CHARS} characters, got {0}")]
    TitleTooLong(usize),
}

pub fn validate_review_rating(rating: i16) -> Result<(), ValidationError> {
    if !(MIN_REVIEW_RATING..=MAX_REVIEW_RATING).contains(&rating) {
        return Err(ValidationError::RatingOutOfRange(rating));
    }
    Ok(())
}

pub fn validate_review_body(body: &str) -> Result<(), ValidationError> {
    let len = body.chars().count();
    if len < MIN_REVIEW_BODY_CHARS {
        return Err(ValidationError::BodyTooShort(len));
    }
    if len > MAX_REVIEW_BODY_CHARS {
        return Err(ValidationError::BodyTooLong(len));
    }
    Ok(())
}

pub fn validate_review_title(title: &str) -> Result<(), ValidationError> {
    let len = title.chars().count();
    if len > MAX_REVIEW_TITLE_CHARS {
        return Err(ValidationError::TitleTooLong(len));
    }
    Ok(())
}

/// Validate a full user-authored review submission. External reviews are not
/// validated here: their rating and body are copied verbatim from the
/// provider.
pub fn validate_user_review(
    rating: i16,
    title: Option<&str>,
    body: &str,
) -> Result<(), ValidationError> {
    validate_review_rating(rating)?;
    validate_review_body(body)?;
    if let Some(title) = title {
        validate_review_title(title)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_length_boundaries() {
        assert_eq!(
            validate_review_body(&"x".repeat(9)),
            Err(ValidationError::BodyTooShort(9))
        );
        assert_eq!(validate_review_body(&"x".repeat(10)), Ok(()));
        assert_eq!(validate_review_body(&"x".repeat(5000)), Ok(()));
        assert_eq!(
            validate_review_body(&"x".repeat(5001)),
            Err(ValidationError::BodyTooLong(5001))
        );
    }

    #[test]
    fn rating_boundaries() {
        assert_eq!(
            validate_review_rating(0),
            Err(ValidationError::RatingOutOfRange(0))
        );
        assert_eq!(validate_review_rating(1), Ok(()));
        assert_eq!(validate_review_rating(5), Ok(()));
        assert_eq!(
            validate_review_rating(6),
            Err(ValidationError::RatingOutOfRange(6))
        );
    }

    #[test]
    fn title_boundary() {
        assert_eq!(validate_review_title(&"t".repeat(100)), Ok(()));
        assert_eq!(
            validate_review_title(&"t".repeat(101)),
            Err(ValidationError::TitleTooLong(101))
        );
        assert_eq!(validate_user_review(4, None, &"b".repeat(20)), Ok(()));
    }

    #[test]
    fn price_tier_symbols_round_trip() {
        for symbol in ["$", "$$", "$$$", "$$$$"] {
            let tier = PriceTier::from_symbol(symbol).unwrap();
            assert_eq!(tier.symbol(), symbol);
        }
        assert_eq!(PriceTier::from_symbol("$$$$$"), None);
        assert_eq!(PriceTier::from_symbol(" $$ "), Some(PriceTier::Moderate));
    }
}
