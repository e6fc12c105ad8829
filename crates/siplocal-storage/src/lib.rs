//! Persistence traits + Postgres and in-memory stores for SipLocal.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use siplocal_core::{
    BusinessRecord, Category, Coordinates, ExternalReviewDetails, PinRecord, PinStatus,
    PostalAddress, PriceTier, ProfileRecord, ReviewRecord, ReviewSource,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "siplocal-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    /// A uniqueness rule was violated (duplicate user review or pin).
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Browse filters for the business list surface.
#[derive(Debug, Clone, Default)]
pub struct BusinessFilter {
    pub city: Option<String>,
    pub price: Option<PriceTier>,
    pub min_rating: Option<f64>,
    /// Matches a category label exactly.
    pub category: Option<String>,
    pub limit: Option<i64>,
}

pub const DEFAULT_BUSINESS_LIMIT: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewSourceFilter {
    #[default]
    All,
    User,
    External,
}

impl ReviewSourceFilter {
    pub fn matches(&self, source: ReviewSource) -> bool {
        match self {
            Self::All => true,
            Self::User => source == ReviewSource::User,
            Self::External => source == ReviewSource::External,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReviewSort {
    #[default]
    Newest,
    Oldest,
    Highest,
    Lowest,
    Helpful,
}

impl ReviewSort {
    pub fn from_str(value: &str) -> Self {
        match value {
            "oldest" => Self::Oldest,
            "highest" => Self::Highest,
            "lowest" => Self::Lowest,
            "helpful" => Self::Helpful,
            _ => Self::Newest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewQuery {
    pub business_id: String,
    pub source: ReviewSourceFilter,
    pub sort: ReviewSort,
    pub limit: i64,
    pub offset: i64,
}

impl ReviewQuery {
    pub fn for_business(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            source: ReviewSourceFilter::All,
            sort: ReviewSort::Newest,
            limit: 20,
            offset: 0,
        }
    }
}

/// Partial update for a user-authored review. `title` and `photos` use the
/// double-Option pattern so a caller can clear them explicitly.
#[derive(Debug, Clone, Default)]
pub struct ReviewPatch {
    pub rating: Option<i16>,
    pub title: Option<Option<String>>,
    pub body: Option<String>,
    pub photos: Option<Option<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct NewPin {
    pub user_id: Uuid,
    pub business_id: String,
    pub status: PinStatus,
    pub note: Option<String>,
    pub image_url: Option<String>,
}

#[async_trait]
pub trait BusinessStore: Send + Sync {
    /// Insert-or-update keyed by the business's stable external identifier.
    async fn upsert_business(&self, record: &BusinessRecord) -> StoreResult<()>;
    async fn get_business(&self, id: &str) -> StoreResult<Option<BusinessRecord>>;
    async fn list_businesses(&self, filter: &BusinessFilter) -> StoreResult<Vec<BusinessRecord>>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn insert_review(&self, record: &ReviewRecord) -> StoreResult<ReviewRecord>;
    async fn get_review(&self, id: Uuid) -> StoreResult<Option<ReviewRecord>>;
    async fn user_review_for_business(
        &self,
        user_id: Uuid,
        business_id: &str,
    ) -> StoreResult<Option<ReviewRecord>>;
    async fn list_reviews(&self, query: &ReviewQuery) -> StoreResult<Vec<ReviewRecord>>;
    async fn update_review(&self, id: Uuid, patch: &ReviewPatch) -> StoreResult<ReviewRecord>;
    async fn delete_review(&self, id: Uuid) -> StoreResult<()>;
    async fn external_reviews(&self, business_id: &str) -> StoreResult<Vec<ReviewRecord>>;
    /// Wholesale replacement of a business's externally sourced reviews,
    /// executed as a single transaction: delete-then-insert never leaves a
    /// window where a partial set is visible.
    async fn replace_external_reviews(
        &self,
        business_id: &str,
        rows: &[ReviewRecord],
    ) -> StoreResult<Vec<ReviewRecord>>;
    /// Maintenance deletion of external reviews fetched before `cutoff`.
    async fn expire_stale_external_reviews(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64>;
    async fn ratings_by_source(
        &self,
        business_id: &str,
        source: ReviewSource,
    ) -> StoreResult<Vec<i16>>;
}

#[async_trait]
pub trait PinStore: Send + Sync {
    /// Creates the pin, or updates the existing one for the same
    /// (user, business) pair.
    async fn upsert_pin(&self, pin: &NewPin) -> StoreResult<PinRecord>;
    async fn get_pin(&self, id: Uuid) -> StoreResult<Option<PinRecord>>;
    async fn pin_for(&self, user_id: Uuid, business_id: &str) -> StoreResult<Option<PinRecord>>;
    async fn list_pins(&self, user_id: Uuid) -> StoreResult<Vec<PinRecord>>;
    async fn delete_pin(&self, id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn upsert_profile(&self, profile: &ProfileRecord) -> StoreResult<ProfileRecord>;
    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<ProfileRecord>>;
    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<ProfileRecord>>;
}

/// The full persistence surface the web layer and pipelines depend on.
pub trait Store: BusinessStore + ReviewStore + PinStore + ProfileStore {}

impl<T: BusinessStore + ReviewStore + PinStore + ProfileStore> Store for T {}

// ---------------------------------------------------------------------------
// Postgres store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn business_from_row(row: &PgRow) -> StoreResult<BusinessRecord> {
    let categories_json: serde_json::Value = row.try_get("categories")?;
    let categories: Vec<Category> =
        serde_json::from_value(categories_json).map_err(|e| StoreError::Backend(e.to_string()))?;
    let photos_json: Option<serde_json::Value> = row.try_get("photos")?;
    let photos: Vec<String> = match photos_json {
        Some(value) => {
            serde_json::from_value(value).map_err(|e| StoreError::Backend(e.to_string()))?
        }
        None => Vec::new(),
    };
    let price: Option<String> = row.try_get("price")?;

    Ok(BusinessRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        image_url: row.try_get("image_url")?,
        directory_url: row.try_get("directory_url")?,
        price: price.as_deref().and_then(PriceTier::from_symbol),
        rating: row.try_get("rating")?,
        review_count: row.try_get("review_count")?,
        categories,
        coordinates: Coordinates {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
        },
        address: PostalAddress {
            address1: row.try_get("address1")?,
            address2: row.try_get("address2")?,
            address3: row.try_get("address3")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            zip_code: row.try_get("zip_code")?,
            country: row.try_get("country")?,
        },
        display_address: row.try_get("display_address")?,
        phone: row.try_get("phone")?,
        display_phone: row.try_get("display_phone")?,
        photos,
        ai_summary: row.try_get("ai_summary")?,
    })
}

fn review_from_row(row: &PgRow) -> StoreResult<ReviewRecord> {
    let source_text: String = row.try_get("source")?;
    let source = ReviewSource::from_str(&source_text)
        .ok_or_else(|| StoreError::Backend(format!("unknown review source {source_text}")))?;
    let photos_json: Option<serde_json::Value> = row.try_get("photos")?;
    let photos: Option<Vec<String>> = match photos_json {
        Some(value) => {
            Some(serde_json::from_value(value).map_err(|e| StoreError::Backend(e.to_string()))?)
        }
        None => None,
    };
    let external = match source {
        ReviewSource::External => Some(ExternalReviewDetails {
            external_id: row.try_get("external_id")?,
            author_name: row.try_get("external_author_name")?,
            author_avatar_url: row.try_get("external_author_avatar_url")?,
            url: row.try_get("external_url")?,
            fetched_at: row.try_get("external_fetched_at")?,
        }),
        ReviewSource::User => None,
    };

    Ok(ReviewRecord {
        id: row.try_get("id")?,
        business_id: row.try_get("business_id")?,
        user_id: row.try_get("user_id")?,
        source,
        rating: row.try_get("rating")?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        photos,
        helpful_count: row.try_get("helpful_count")?,
        external,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn pin_from_row(row: &PgRow) -> StoreResult<PinRecord> {
    let status_text: String = row.try_get("status")?;
    let status = PinStatus::from_str(&status_text)
        .ok_or_else(|| StoreError::Backend(format!("unknown pin status {status_text}")))?;
    Ok(PinRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        business_id: row.try_get("business_id")?,
        status,
        note: row.try_get("note")?,
        image_url: row.try_get("image_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const REVIEW_COLUMNS: &str = "id, business_id, user_id, source, rating, title, body, photos, \
     helpful_count, external_id, external_author_name, external_author_avatar_url, external_url, \
     external_fetched_at, created_at, updated_at";

#[async_trait]
impl BusinessStore for PgStore {
    async fn upsert_business(&self, record: &BusinessRecord) -> StoreResult<()> {
        let categories = serde_json::to_value(&record.categories)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let photos = if record.photos.is_empty() {
            None
        } else {
            Some(
                serde_json::to_value(&record.photos)
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
            )
        };

        sqlx::query(
            r#"
            INSERT INTO businesses (
                id, name, image_url, directory_url, price, rating, review_count,
                categories, latitude, longitude, address1, address2, address3,
                city, state, zip_code, country, display_address, phone,
                display_phone, photos, ai_summary, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, NOW()
            )
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                image_url = EXCLUDED.image_url,
                directory_url = EXCLUDED.directory_url,
                price = EXCLUDED.price,
                rating = EXCLUDED.rating,
                review_count = EXCLUDED.review_count,
                categories = EXCLUDED.categories,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                address1 = EXCLUDED.address1,
                address2 = EXCLUDED.address2,
                address3 = EXCLUDED.address3,
                city = EXCLUDED.city,
                state = EXCLUDED.state,
                zip_code = EXCLUDED.zip_code,
                country = EXCLUDED.country,
                display_address = EXCLUDED.display_address,
                phone = EXCLUDED.phone,
                display_phone = EXCLUDED.display_phone,
                photos = EXCLUDED.photos,
                updated_at = NOW()
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.image_url)
        .bind(&record.directory_url)
        .bind(record.price.as_ref().map(|p| p.symbol()))
        .bind(record.rating)
        .bind(record.review_count)
        .bind(categories)
        .bind(record.coordinates.latitude)
        .bind(record.coordinates.longitude)
        .bind(&record.address.address1)
        .bind(&record.address.address2)
        .bind(&record.address.address3)
        .bind(&record.address.city)
        .bind(&record.address.state)
        .bind(&record.address.zip_code)
        .bind(&record.address.country)
        .bind(&record.display_address)
        .bind(&record.phone)
        .bind(&record.display_phone)
        .bind(photos)
        .bind(&record.ai_summary)
        .execute(&self.pool)
        .await?;
        debug!(business_id = %record.id, "business_upserted");
        Ok(())
    }

    async fn get_business(&self, id: &str) -> StoreResult<Option<BusinessRecord>> {
        let row = sqlx::query("SELECT * FROM businesses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(business_from_row).transpose()
    }

    async fn list_businesses(&self, filter: &BusinessFilter) -> StoreResult<Vec<BusinessRecord>> {
        let mut builder = QueryBuilder::new("SELECT * FROM businesses WHERE TRUE");
        if let Some(city) = &filter.city {
            builder.push(" AND city = ").push_bind(city);
        }
        if let Some(price) = &filter.price {
            builder.push(" AND price = ").push_bind(price.symbol());
        }
        if let Some(min_rating) = filter.min_rating {
            builder.push(" AND rating >= ").push_bind(min_rating);
        }
        if let Some(category) = &filter.category {
            // categories is a JSONB array of {alias, title}; match by label.
            builder
                .push(" AND categories @> ")
                .push_bind(serde_json::json!([{ "title": category }]));
        }
        builder
            .push(" ORDER BY rating DESC, review_count DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(DEFAULT_BUSINESS_LIMIT));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(business_from_row).collect()
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn insert_review(&self, record: &ReviewRecord) -> StoreResult<ReviewRecord> {
        let photos = match &record.photos {
            Some(photos) => Some(
                serde_json::to_value(photos).map_err(|e| StoreError::Backend(e.to_string()))?,
            ),
            None => None,
        };
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reviews (
                id, business_id, user_id, source, rating, title, body, photos,
                helpful_count, external_id, external_author_name,
                external_author_avatar_url, external_url, external_fetched_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {REVIEW_COLUMNS}
            "#
        ))
        .bind(record.id)
        .bind(&record.business_id)
        .bind(record.user_id)
        .bind(record.source.as_str())
        .bind(record.rating)
        .bind(&record.title)
        .bind(&record.body)
        .bind(photos)
        .bind(record.helpful_count)
        .bind(record.external.as_ref().map(|e| e.external_id.clone()))
        .bind(record.external.as_ref().map(|e| e.author_name.clone()))
        .bind(
            record
                .external
                .as_ref()
                .and_then(|e| e.author_avatar_url.clone()),
        )
        .bind(record.external.as_ref().and_then(|e| e.url.clone()))
        .bind(record.external.as_ref().map(|e| e.fetched_at))
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_one(&self.pool)
        .await?;
        review_from_row(&row)
    }

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<ReviewRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn user_review_for_business(
        &self,
        user_id: Uuid,
        business_id: &str,
    ) -> StoreResult<Option<ReviewRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews \
             WHERE business_id = $1 AND user_id = $2 AND source = 'user'"
        ))
        .bind(business_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(review_from_row).transpose()
    }

    async fn list_reviews(&self, query: &ReviewQuery) -> StoreResult<Vec<ReviewRecord>> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE business_id = "
        ));
        builder.push_bind(&query.business_id);
        match query.source {
            ReviewSourceFilter::All => {}
            ReviewSourceFilter::User => {
                builder.push(" AND source = 'user'");
            }
            ReviewSourceFilter::External => {
                builder.push(" AND source = 'external'");
            }
        }
        builder.push(match query.sort {
            ReviewSort::Newest => " ORDER BY created_at DESC",
            ReviewSort::Oldest => " ORDER BY created_at ASC",
            ReviewSort::Highest => " ORDER BY rating DESC",
            ReviewSort::Lowest => " ORDER BY rating ASC",
            ReviewSort::Helpful => " ORDER BY helpful_count DESC",
        });
        builder.push(" LIMIT ").push_bind(query.limit);
        builder.push(" OFFSET ").push_bind(query.offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn update_review(&self, id: Uuid, patch: &ReviewPatch) -> StoreResult<ReviewRecord> {
        let mut builder = QueryBuilder::new("UPDATE reviews SET updated_at = NOW()");
        if let Some(rating) = patch.rating {
            builder.push(", rating = ").push_bind(rating);
        }
        if let Some(title) = &patch.title {
            builder.push(", title = ").push_bind(title.clone());
        }
        if let Some(body) = &patch.body {
            builder.push(", body = ").push_bind(body.clone());
        }
        if let Some(photos) = &patch.photos {
            let value = match photos {
                Some(photos) => Some(
                    serde_json::to_value(photos)
                        .map_err(|e| StoreError::Backend(e.to_string()))?,
                ),
                None => None,
            };
            builder.push(", photos = ").push_bind(value);
        }
        builder.push(" WHERE id = ").push_bind(id);
        builder.push(format!(" RETURNING {REVIEW_COLUMNS}"));

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => review_from_row(&row),
            None => Err(StoreError::NotFound),
        }
    }

    async fn delete_review(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM reviews WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn external_reviews(&self, business_id: &str) -> StoreResult<Vec<ReviewRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews \
             WHERE business_id = $1 AND source = 'external' \
             ORDER BY created_at DESC"
        ))
        .bind(business_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(review_from_row).collect()
    }

    async fn replace_external_reviews(
        &self,
        business_id: &str,
        rows: &[ReviewRecord],
    ) -> StoreResult<Vec<ReviewRecord>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM reviews WHERE business_id = $1 AND source = 'external'")
            .bind(business_id)
            .execute(&mut *tx)
            .await?;

        let mut inserted = Vec::with_capacity(rows.len());
        for record in rows {
            let row = sqlx::query(&format!(
                r#"
                INSERT INTO reviews (
                    id, business_id, user_id, source, rating, title, body,
                    photos, helpful_count, external_id, external_author_name,
                    external_author_avatar_url, external_url,
                    external_fetched_at, created_at, updated_at
                ) VALUES ($1, $2, NULL, 'external', $3, NULL, $4, NULL, 0,
                          $5, $6, $7, $8, $9, $10, $10)
                RETURNING {REVIEW_COLUMNS}
                "#
            ))
            .bind(record.id)
            .bind(business_id)
            .bind(record.rating)
            .bind(&record.body)
            .bind(record.external.as_ref().map(|e| e.external_id.clone()))
            .bind(record.external.as_ref().map(|e| e.author_name.clone()))
            .bind(
                record
                    .external
                    .as_ref()
                    .and_then(|e| e.author_avatar_url.clone()),
            )
            .bind(record.external.as_ref().and_then(|e| e.url.clone()))
            .bind(record.external.as_ref().map(|e| e.fetched_at))
            .bind(record.created_at)
            .fetch_one(&mut *tx)
            .await?;
            inserted.push(review_from_row(&row)?);
        }

        tx.commit().await?;
        debug!(business_id, count = inserted.len(), "external_reviews_replaced");
        Ok(inserted)
    }

    async fn expire_stale_external_reviews(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM reviews WHERE business_id = $1 AND source = 'external' \
             AND (external_fetched_at IS NULL OR external_fetched_at < $2)",
        )
        .bind(business_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn ratings_by_source(
        &self,
        business_id: &str,
        source: ReviewSource,
    ) -> StoreResult<Vec<i16>> {
        let rows = sqlx::query(
            "SELECT rating FROM reviews WHERE business_id = $1 AND source = $2",
        )
        .bind(business_id)
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<i16, _>("rating").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl PinStore for PgStore {
    async fn upsert_pin(&self, pin: &NewPin) -> StoreResult<PinRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_pins (id, user_id, business_id, status, note, image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, business_id) DO UPDATE SET
                status = EXCLUDED.status,
                note = EXCLUDED.note,
                image_url = EXCLUDED.image_url,
                updated_at = NOW()
            RETURNING id, user_id, business_id, status, note, image_url, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(pin.user_id)
        .bind(&pin.business_id)
        .bind(pin.status.as_str())
        .bind(&pin.note)
        .bind(&pin.image_url)
        .fetch_one(&self.pool)
        .await?;
        pin_from_row(&row)
    }

    async fn get_pin(&self, id: Uuid) -> StoreResult<Option<PinRecord>> {
        let row = sqlx::query("SELECT * FROM user_pins WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pin_from_row).transpose()
    }

    async fn pin_for(&self, user_id: Uuid, business_id: &str) -> StoreResult<Option<PinRecord>> {
        let row = sqlx::query("SELECT * FROM user_pins WHERE user_id = $1 AND business_id = $2")
            .bind(user_id)
            .bind(business_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pin_from_row).transpose()
    }

    async fn list_pins(&self, user_id: Uuid) -> StoreResult<Vec<PinRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM user_pins WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pin_from_row).collect()
    }

    async fn delete_pin(&self, id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM user_pins WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn upsert_profile(&self, profile: &ProfileRecord) -> StoreResult<ProfileRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO profiles (id, full_name, avatar_url, email)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                full_name = EXCLUDED.full_name,
                avatar_url = EXCLUDED.avatar_url,
                email = EXCLUDED.email
            RETURNING id, full_name, avatar_url, email
            "#,
        )
        .bind(profile.id)
        .bind(&profile.full_name)
        .bind(&profile.avatar_url)
        .bind(&profile.email)
        .fetch_one(&self.pool)
        .await?;
        Ok(ProfileRecord {
            id: row.try_get("id")?,
            full_name: row.try_get("full_name")?,
            avatar_url: row.try_get("avatar_url")?,
            email: row.try_get("email")?,
        })
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<ProfileRecord>> {
        let row = sqlx::query("SELECT id, full_name, avatar_url, email FROM profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(ProfileRecord {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                avatar_url: row.try_get("avatar_url")?,
                email: row.try_get("email")?,
            })
        })
        .transpose()
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<ProfileRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, full_name, avatar_url, email FROM profiles WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ProfileRecord {
                    id: row.try_get("id")?,
                    full_name: row.try_get("full_name")?,
                    avatar_url: row.try_get("avatar_url")?,
                    email: row.try_get("email")?,
                })
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Map-backed store used by tests and offline pipeline runs. Mirrors the
/// Postgres implementation's uniqueness rules.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    businesses: HashMap<String, BusinessRecord>,
    reviews: HashMap<Uuid, ReviewRecord>,
    pins: HashMap<Uuid, PinRecord>,
    profiles: HashMap<Uuid, ProfileRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn business_count(&self) -> usize {
        self.inner.lock().expect("memory store poisoned").businesses.len()
    }
}

fn sort_reviews(reviews: &mut [ReviewRecord], sort: ReviewSort) {
    match sort {
        ReviewSort::Newest => reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        ReviewSort::Oldest => reviews.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        ReviewSort::Highest => reviews.sort_by(|a, b| b.rating.cmp(&a.rating)),
        ReviewSort::Lowest => reviews.sort_by(|a, b| a.rating.cmp(&b.rating)),
        ReviewSort::Helpful => reviews.sort_by(|a, b| b.helpful_count.cmp(&a.helpful_count)),
    }
}

#[async_trait]
impl BusinessStore for MemoryStore {
    async fn upsert_business(&self, record: &BusinessRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.businesses.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_business(&self, id: &str) -> StoreResult<Option<BusinessRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.businesses.get(id).cloned())
    }

    async fn list_businesses(&self, filter: &BusinessFilter) -> StoreResult<Vec<BusinessRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut out: Vec<BusinessRecord> = inner
            .businesses
            .values()
            .filter(|b| {
                filter.city.as_deref().is_none_or(|c| b.address.city == c)
                    && filter.price.is_none_or(|p| b.price == Some(p))
                    && filter.min_rating.is_none_or(|r| b.rating >= r)
                    && filter
                        .category
                        .as_deref()
                        .is_none_or(|c| b.categories.iter().any(|cat| cat.title == c))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.rating
                .partial_cmp(&a.rating)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.review_count.cmp(&a.review_count))
        });
        out.truncate(filter.limit.unwrap_or(DEFAULT_BUSINESS_LIMIT) as usize);
        Ok(out)
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn insert_review(&self, record: &ReviewRecord) -> StoreResult<ReviewRecord> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if record.source == ReviewSource::User {
            let duplicate = inner.reviews.values().any(|r| {
                r.source == ReviewSource::User
                    && r.business_id == record.business_id
                    && r.user_id == record.user_id
            });
            if duplicate {
                return Err(StoreError::Conflict(
                    "user already reviewed this business".to_string(),
                ));
            }
        }
        inner.reviews.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<ReviewRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.reviews.get(&id).cloned())
    }

    async fn user_review_for_business(
        &self,
        user_id: Uuid,
        business_id: &str,
    ) -> StoreResult<Option<ReviewRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .reviews
            .values()
            .find(|r| {
                r.source == ReviewSource::User
                    && r.business_id == business_id
                    && r.user_id == Some(user_id)
            })
            .cloned())
    }

    async fn list_reviews(&self, query: &ReviewQuery) -> StoreResult<Vec<ReviewRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut reviews: Vec<ReviewRecord> = inner
            .reviews
            .values()
            .filter(|r| r.business_id == query.business_id && query.source.matches(r.source))
            .cloned()
            .collect();
        sort_reviews(&mut reviews, query.sort);
        Ok(reviews
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(0) as usize)
            .collect())
    }

    async fn update_review(&self, id: Uuid, patch: &ReviewPatch) -> StoreResult<ReviewRecord> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let review = inner.reviews.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(rating) = patch.rating {
            review.rating = rating;
        }
        if let Some(title) = &patch.title {
            review.title = title.clone();
        }
        if let Some(body) = &patch.body {
            review.body = body.clone();
        }
        if let Some(photos) = &patch.photos {
            review.photos = photos.clone();
        }
        review.updated_at = Utc::now();
        Ok(review.clone())
    }

    async fn delete_review(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.reviews.remove(&id).ok_or(StoreError::NotFound)?;
        Ok(())
    }

    async fn external_reviews(&self, business_id: &str) -> StoreResult<Vec<ReviewRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut out: Vec<ReviewRecord> = inner
            .reviews
            .values()
            .filter(|r| r.business_id == business_id && r.source == ReviewSource::External)
            .cloned()
            .collect();
        sort_reviews(&mut out, ReviewSort::Newest);
        Ok(out)
    }

    async fn replace_external_reviews(
        &self,
        business_id: &str,
        rows: &[ReviewRecord],
    ) -> StoreResult<Vec<ReviewRecord>> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.reviews.retain(|_, r| {
            !(r.business_id == business_id && r.source == ReviewSource::External)
        });
        for record in rows {
            inner.reviews.insert(record.id, record.clone());
        }
        Ok(rows.to_vec())
    }

    async fn expire_stale_external_reviews(
        &self,
        business_id: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let before = inner.reviews.len();
        inner.reviews.retain(|_, r| {
            !(r.business_id == business_id
                && r.source == ReviewSource::External
                && r.external
                    .as_ref()
                    .map(|e| e.fetched_at < cutoff)
                    .unwrap_or(true))
        });
        Ok((before - inner.reviews.len()) as u64)
    }

    async fn ratings_by_source(
        &self,
        business_id: &str,
        source: ReviewSource,
    ) -> StoreResult<Vec<i16>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .reviews
            .values()
            .filter(|r| r.business_id == business_id && r.source == source)
            .map(|r| r.rating)
            .collect())
    }
}

#[async_trait]
impl PinStore for MemoryStore {
    async fn upsert_pin(&self, pin: &NewPin) -> StoreResult<PinRecord> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let existing = inner
            .pins
            .values()
            .find(|p| p.user_id == pin.user_id && p.business_id == pin.business_id)
            .map(|p| p.id);
        let record = match existing {
            Some(id) => {
                let record = inner.pins.get_mut(&id).expect("pin id just looked up");
                record.status = pin.status;
                record.note = pin.note.clone();
                record.image_url = pin.image_url.clone();
                record.updated_at = now;
                record.clone()
            }
            None => {
                let record = PinRecord {
                    id: Uuid::new_v4(),
                    user_id: pin.user_id,
                    business_id: pin.business_id.clone(),
                    status: pin.status,
                    note: pin.note.clone(),
                    image_url: pin.image_url.clone(),
                    created_at: now,
                    updated_at: now,
                };
                inner.pins.insert(record.id, record.clone());
                record
            }
        };
        Ok(record)
    }

    async fn get_pin(&self, id: Uuid) -> StoreResult<Option<PinRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.pins.get(&id).cloned())
    }

    async fn pin_for(&self, user_id: Uuid, business_id: &str) -> StoreResult<Option<PinRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .pins
            .values()
            .find(|p| p.user_id == user_id && p.business_id == business_id)
            .cloned())
    }

    async fn list_pins(&self, user_id: Uuid) -> StoreResult<Vec<PinRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut out: Vec<PinRecord> = inner
            .pins
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn delete_pin(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.pins.remove(&id).ok_or(StoreError::NotFound)?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn upsert_profile(&self, profile: &ProfileRecord) -> StoreResult<ProfileRecord> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.profiles.insert(profile.id, profile.clone());
        Ok(profile.clone())
    }

    async fn get_profile(&self, id: Uuid) -> StoreResult<Option<ProfileRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.profiles.get(&id).cloned())
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<ProfileRecord>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(ids
            .iter()
            .filter_map(|id| inner.profiles.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn business(id: &str, name: &str, rating: f64) -> BusinessRecord {
        BusinessRecord {
            id: id.to_string(),
            name: name.to_string(),
            image_url: None,
            directory_url: None,
            price: Some(PriceTier::Moderate),
            rating,
            review_count: 10,
            categories: vec![Category {
                alias: "coffee".into(),
                title: "Coffee & Tea".into(),
            }],
            coordinates: Coordinates::default(),
            address: PostalAddress {
                city: "Harlingen".into(),
                state: "TX".into(),
                ..Default::default()
            },
            display_address: String::new(),
            phone: String::new(),
            display_phone: String::new(),
            photos: vec![],
            ai_summary: None,
        }
    }

    fn external_review(business_id: &str, external_id: &str, age_hours: i64) -> ReviewRecord {
        let now = Utc::now();
        ReviewRecord {
            id: Uuid::new_v4(),
            business_id: business_id.to_string(),
            user_id: None,
            source: ReviewSource::External,
            rating: 4,
            title: None,
            body: "Imported review body text.".to_string(),
            photos: None,
            helpful_count: 0,
            external: Some(ExternalReviewDetails {
                external_id: external_id.to_string(),
                author_name: "Remote Author".to_string(),
                author_avatar_url: None,
                url: None,
                fetched_at: now - Duration::hours(age_hours),
            }),
            created_at: now,
            updated_at: now,
        }
    }

    fn user_review(business_id: &str, user_id: Uuid) -> ReviewRecord {
        let now = Utc::now();
        ReviewRecord {
            id: Uuid::new_v4(),
            business_id: business_id.to_string(),
            user_id: Some(user_id),
            source: ReviewSource::User,
            rating: 5,
            title: Some("Lovely spot".to_string()),
            body: "Good espresso and quiet tables.".to_string(),
            photos: None,
            helpful_count: 0,
            external: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_business_is_idempotent_on_id() {
        let store = MemoryStore::new();
        store.upsert_business(&business("b1", "First Name", 4.0)).await.unwrap();
        store.upsert_business(&business("b1", "Renamed", 4.5)).await.unwrap();

        assert_eq!(store.business_count(), 1);
        let stored = store.get_business("b1").await.unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.rating, 4.5);
    }

    #[tokio::test]
    async fn second_user_review_for_same_business_conflicts() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        store.insert_review(&user_review("b1", user)).await.unwrap();
        let err = store.insert_review(&user_review("b1", user)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A different business is fine.
        store.insert_review(&user_review("b2", user)).await.unwrap();
    }

    #[tokio::test]
    async fn replace_external_reviews_is_wholesale() {
        let store = MemoryStore::new();
        store
            .replace_external_reviews("b1", &[external_review("b1", "old-1", 30)])
            .await
            .unwrap();

        let fresh = vec![
            external_review("b1", "new-1", 0),
            external_review("b1", "new-2", 0),
        ];
        let inserted = store.replace_external_reviews("b1", &fresh).await.unwrap();
        assert_eq!(inserted.len(), 2);

        let stored = store.external_reviews("b1").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored
            .iter()
            .all(|r| r.external.as_ref().unwrap().external_id.starts_with("new-")));
    }

    #[tokio::test]
    async fn expire_deletes_only_stale_rows() {
        let store = MemoryStore::new();
        store
            .replace_external_reviews(
                "b1",
                &[external_review("b1", "stale", 25), external_review("b1", "fresh", 1)],
            )
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::hours(24);
        let removed = store.expire_stale_external_reviews("b1", cutoff).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store.external_reviews("b1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].external.as_ref().unwrap().external_id, "fresh");
    }

    #[tokio::test]
    async fn pin_upsert_updates_rather_than_duplicates() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let first = store
            .upsert_pin(&NewPin {
                user_id: user,
                business_id: "b1".into(),
                status: PinStatus::WantToTry,
                note: None,
                image_url: None,
            })
            .await
            .unwrap();
        let second = store
            .upsert_pin(&NewPin {
                user_id: user,
                business_id: "b1".into(),
                status: PinStatus::Favorite,
                note: Some("great cortado".into()),
                image_url: None,
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, PinStatus::Favorite);
        assert_eq!(store.list_pins(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn business_filters_apply() {
        let store = MemoryStore::new();
        let mut other_city = business("b2", "Elsewhere", 4.8);
        other_city.address.city = "McAllen".into();
        store.upsert_business(&business("b1", "Local", 3.0)).await.unwrap();
        store.upsert_business(&other_city).await.unwrap();

        let filter = BusinessFilter {
            city: Some("Harlingen".into()),
            ..Default::default()
        };
        let rows = store.list_businesses(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b1");

        let filter = BusinessFilter {
            min_rating: Some(4.0),
            ..Default::default()
        };
        let rows = store.list_businesses(&filter).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "b2");
    }
}
