//! Axum JSON API for SipLocal: businesses, reviews, pins, profiles, and the
//! ingestion/sync trigger endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use siplocal_core::{
    validate_review_body, validate_review_rating, validate_review_title, validate_user_review,
    PinRecord, PinStatus, PriceTier, ProfileRecord, ReviewRecord, ReviewSource, ValidationError,
};
use siplocal_ingest::{IngestionPipeline, IngestionReport, IngestionRequest, ReviewSyncService, SyncError};
use siplocal_storage::{
    BusinessFilter, BusinessStore, NewPin, PinStore, ProfileStore, ReviewPatch, ReviewQuery,
    ReviewSort, ReviewSourceFilter, ReviewStore, Store, StoreError,
};
use siplocal_yelp::BusinessDirectory;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "siplocal-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub directory: Arc<dyn BusinessDirectory>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn BusinessDirectory>) -> Self {
        Self { store, directory }
    }
}

// ---------------------------------------------------------------------------
// Error surface
// ---------------------------------------------------------------------------

/// Every failure leaves the API as `{"success": false, "error": "..."}` with
/// the matching status code.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound(String),
    Conflict(String),
    Upstream(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("record not found".to_string()),
            StoreError::Conflict(message) => ApiError::Conflict(message),
            StoreError::Backend(message) => ApiError::Internal(message),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Upstream(inner) => ApiError::Upstream(inner.to_string()),
            SyncError::Storage(inner) => inner.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication required".into()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "not allowed".into()),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (
            status,
            Json(serde_json::json!({ "success": false, "error": error })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity comes from the `x-user-id` header, set by the auth proxy
/// in front of this service.
fn require_user(headers: &HeaderMap) -> ApiResult<Uuid> {
    let raw = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    Uuid::parse_str(raw).map_err(|_| ApiError::Unauthorized)
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/businesses", get(list_businesses_handler))
        .route("/api/businesses/{id}", get(get_business_handler))
        .route("/api/reviews", get(list_reviews_handler).post(create_review_handler))
        .route(
            "/api/reviews/{id}",
            axum::routing::patch(update_review_handler).delete(delete_review_handler),
        )
        .route("/api/reviews/stats", get(review_stats_handler))
        .route(
            "/api/reviews/sync",
            get(sync_status_handler)
                .post(sync_reviews_handler)
                .delete(expire_reviews_handler),
        )
        .route("/api/pins", get(list_pins_handler).post(upsert_pin_handler))
        .route("/api/pins/check", get(pin_check_handler))
        .route("/api/pins/{id}", delete(delete_pin_handler))
        .route("/api/profile", get(get_profile_handler).put(put_profile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "siplocal web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingestion + sync triggers
// ---------------------------------------------------------------------------

/// Overrides for the ingestion defaults; absent fields keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct IngestBody {
    localities: Option<Vec<String>>,
    max_per_locality: Option<usize>,
    min_rating: Option<f64>,
    fetch_photos: Option<bool>,
    exclude_chains: Option<bool>,
    require_photos: Option<bool>,
}

impl IngestBody {
    fn into_request(self) -> IngestionRequest {
        let mut request = IngestionRequest::default();
        if let Some(localities) = self.localities {
            request.localities = localities;
        }
        if let Some(max) = self.max_per_locality {
            request.max_per_locality = max;
        }
        if let Some(min_rating) = self.min_rating {
            request.min_rating = min_rating;
        }
        if let Some(fetch_photos) = self.fetch_photos {
            request.fetch_photos = fetch_photos;
        }
        if let Some(exclude_chains) = self.exclude_chains {
            request.exclude_chains = exclude_chains;
        }
        if let Some(require_photos) = self.require_photos {
            request.require_photos = require_photos;
        }
        request
    }
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<IngestBody>>,
) -> ApiResult<Json<IngestionReport>> {
    let request = body.map(|Json(b)| b).unwrap_or_default().into_request();
    if request.localities.is_empty() {
        return Err(ApiError::BadRequest("localities must not be empty".into()));
    }
    let pipeline = IngestionPipeline::new(state.directory.clone(), state.store.clone());
    let report = pipeline.run(&request).await;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct SyncQuery {
    business_id: String,
}

async fn sync_status_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_business(&state, &query.business_id).await?;
    let service = ReviewSyncService::new(state.directory.clone(), state.store.clone());
    let status = service.status(&query.business_id, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "business_id": query.business_id,
        "count": status.count,
        "expired": status.expired,
        "needs_sync": status.needs_sync,
    })))
}

#[derive(Debug, Deserialize)]
struct SyncBody {
    business_id: String,
}

async fn sync_reviews_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_business(&state, &body.business_id).await?;
    let service = ReviewSyncService::new(state.directory.clone(), state.store.clone());
    let reviews = service.sync(&body.business_id, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "synced": reviews.len(),
        "reviews": reviews,
    })))
}

/// Maintenance deletion of external reviews past the freshness window,
/// independent of the replace-on-sync path.
async fn expire_reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_business(&state, &query.business_id).await?;
    let service = ReviewSyncService::new(state.directory.clone(), state.store.clone());
    let expired = service.expire_stale(&query.business_id, Utc::now()).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "business_id": query.business_id,
        "expired": expired,
    })))
}

// ---------------------------------------------------------------------------
// Businesses
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct BusinessListQuery {
    city: Option<String>,
    price: Option<String>,
    min_rating: Option<f64>,
    category: Option<String>,
    limit: Option<i64>,
}

async fn list_businesses_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BusinessListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let price = match query.price.as_deref() {
        Some(symbol) => Some(
            PriceTier::from_symbol(symbol)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown price tier {symbol}")))?,
        ),
        None => None,
    };
    let filter = BusinessFilter {
        city: query.city,
        price,
        min_rating: query.min_rating,
        category: query.category,
        limit: query.limit,
    };
    let businesses = state.store.list_businesses(&filter).await?;
    Ok(Json(serde_json::json!({ "businesses": businesses })))
}

async fn get_business_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let business = require_business(&state, &id).await?;
    Ok(Json(serde_json::json!({ "business": business })))
}

async fn require_business(
    state: &AppState,
    id: &str,
) -> ApiResult<siplocal_core::BusinessRecord> {
    state
        .store
        .get_business(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("business {id} not found")))
}

// ---------------------------------------------------------------------------
// Reviews
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct ReviewAuthor {
    name: Option<String>,
    avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ReviewView {
    #[serde(flatten)]
    review: ReviewRecord,
    author: Option<ReviewAuthor>,
}

/// Attach display authorship: profile data for user reviews, provider
/// attribution for external ones.
async fn with_authors(state: &AppState, reviews: Vec<ReviewRecord>) -> ApiResult<Vec<ReviewView>> {
    let user_ids: Vec<Uuid> = reviews.iter().filter_map(|r| r.user_id).collect();
    let profiles = state.store.profiles_by_ids(&user_ids).await?;

    Ok(reviews
        .into_iter()
        .map(|review| {
            let author = match review.source {
                ReviewSource::User => review.user_id.and_then(|uid| {
                    profiles.iter().find(|p| p.id == uid).map(|p| ReviewAuthor {
                        name: p.full_name.clone(),
                        avatar_url: p.avatar_url.clone(),
                    })
                }),
                ReviewSource::External => review.external.as_ref().map(|e| ReviewAuthor {
                    name: Some(e.author_name.clone()),
                    avatar_url: e.author_avatar_url.clone(),
                }),
            };
            ReviewView { review, author }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct ReviewListQuery {
    business_id: String,
    source: Option<String>,
    sort: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = match query.source.as_deref() {
        None | Some("all") => ReviewSourceFilter::All,
        Some("user") => ReviewSourceFilter::User,
        Some("external") => ReviewSourceFilter::External,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("unknown source filter {other}")));
        }
    };
    let mut review_query = ReviewQuery::for_business(&query.business_id);
    review_query.source = source;
    if let Some(sort) = query.sort.as_deref() {
        review_query.sort = ReviewSort::from_str(sort);
    }
    if let Some(limit) = query.limit {
        review_query.limit = limit.clamp(1, 100);
    }
    if let Some(offset) = query.offset {
        review_query.offset = offset.max(0);
    }

    let reviews = state.store.list_reviews(&review_query).await?;
    let reviews = with_authors(&state, reviews).await?;
    Ok(Json(serde_json::json!({ "reviews": reviews })))
}

#[derive(Debug, Deserialize)]
struct CreateReviewBody {
    business_id: String,
    rating: i16,
    title: Option<String>,
    body: String,
    photos: Option<Vec<String>>,
}

async fn create_review_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateReviewBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let user_id = require_user(&headers)?;
    validate_user_review(body.rating, body.title.as_deref(), &body.body)?;
    require_business(&state, &body.business_id).await?;

    let now = Utc::now();
    let record = ReviewRecord {
        id: Uuid::new_v4(),
        business_id: body.business_id,
        user_id: Some(user_id),
        source: ReviewSource::User,
        rating: body.rating,
        title: body.title,
        body: body.body,
        photos: body.photos,
        helpful_count: 0,
        external: None,
        created_at: now,
        updated_at: now,
    };
    let inserted = state.store.insert_review(&record).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "review": inserted })),
    ))
}

fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// Absent fields are untouched; an explicit `null` clears the field.
#[derive(Debug, Default, Deserialize)]
struct UpdateReviewBody {
    rating: Option<i16>,
    #[serde(default, deserialize_with = "double_option")]
    title: Option<Option<String>>,
    body: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    photos: Option<Option<Vec<String>>>,
}

async fn owned_user_review(state: &AppState, id: Uuid, user_id: Uuid) -> ApiResult<ReviewRecord> {
    let review = state
        .store
        .get_review(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("review {id} not found")))?;
    if review.source != ReviewSource::User || review.user_id != Some(user_id) {
        return Err(ApiError::Forbidden);
    }
    Ok(review)
}

async fn update_review_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateReviewBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    owned_user_review(&state, id, user_id).await?;

    if let Some(rating) = body.rating {
        validate_review_rating(rating)?;
    }
    if let Some(review_body) = &body.body {
        validate_review_body(review_body)?;
    }
    if let Some(Some(title)) = &body.title {
        validate_review_title(title)?;
    }

    let patch = ReviewPatch {
        rating: body.rating,
        title: body.title,
        body: body.body,
        photos: body.photos,
    };
    let updated = state.store.update_review(id, &patch).await?;
    Ok(Json(serde_json::json!({ "success": true, "review": updated })))
}

async fn delete_review_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    owned_user_review(&state, id, user_id).await?;
    state.store.delete_review(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Serialize)]
struct SourceStats {
    count: usize,
    average: Option<f64>,
    /// How many ratings landed on each star, index 0 = one star.
    distribution: [usize; 5],
}

fn source_stats(ratings: &[i16]) -> SourceStats {
    let average = if ratings.is_empty() {
        None
    } else {
        Some(ratings.iter().map(|r| f64::from(*r)).sum::<f64>() / ratings.len() as f64)
    };
    let mut distribution = [0usize; 5];
    for rating in ratings {
        if (1..=5).contains(rating) {
            distribution[(*rating - 1) as usize] += 1;
        }
    }
    SourceStats {
        count: ratings.len(),
        average,
        distribution,
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    business_id: String,
}

async fn review_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_ratings = state
        .store
        .ratings_by_source(&query.business_id, ReviewSource::User)
        .await?;
    let external_ratings = state
        .store
        .ratings_by_source(&query.business_id, ReviewSource::External)
        .await?;
    let combined: Vec<i16> = user_ratings
        .iter()
        .chain(external_ratings.iter())
        .copied()
        .collect();
    Ok(Json(serde_json::json!({
        "business_id": query.business_id,
        "user": source_stats(&user_ratings),
        "external": source_stats(&external_ratings),
        "overall": source_stats(&combined),
    })))
}

// ---------------------------------------------------------------------------
// Pins
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PinBody {
    business_id: String,
    status: PinStatus,
    note: Option<String>,
    image_url: Option<String>,
}

async fn upsert_pin_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PinBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let user_id = require_user(&headers)?;
    require_business(&state, &body.business_id).await?;
    let pin = state
        .store
        .upsert_pin(&NewPin {
            user_id,
            business_id: body.business_id,
            status: body.status,
            note: body.note,
            image_url: body.image_url,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "pin": pin })),
    ))
}

async fn list_pins_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let pins = state.store.list_pins(user_id).await?;
    Ok(Json(serde_json::json!({ "pins": pins })))
}

#[derive(Debug, Deserialize)]
struct PinCheckQuery {
    business_id: String,
}

async fn pin_check_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<PinCheckQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let pin: Option<PinRecord> = state.store.pin_for(user_id, &query.business_id).await?;
    Ok(Json(serde_json::json!({
        "pinned": pin.is_some(),
        "pin": pin,
    })))
}

async fn delete_pin_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let pin = state
        .store
        .get_pin(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("pin {id} not found")))?;
    if pin.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    state.store.delete_pin(id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Profile
// ---------------------------------------------------------------------------

async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let profile = state
        .store
        .get_profile(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("profile not found".into()))?;
    Ok(Json(serde_json::json!({ "profile": profile })))
}

#[derive(Debug, Deserialize)]
struct ProfileBody {
    full_name: Option<String>,
    avatar_url: Option<String>,
    email: Option<String>,
}

async fn put_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProfileBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = require_user(&headers)?;
    let profile = state
        .store
        .upsert_profile(&ProfileRecord {
            id: user_id,
            full_name: body.full_name,
            avatar_url: body.avatar_url,
            email: body.email,
        })
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "profile": profile })))
}
