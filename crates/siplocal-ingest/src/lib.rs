//! Ingestion orchestration and review sync policy for SipLocal.
//!
//! Two sequential pipelines live here: pulling businesses out of the
//! directory provider into the canonical store, and keeping a business's
//! externally sourced reviews inside the 24-hour freshness window. Both run
//! single-threaded with sleep-based pacing; per-item failures are recorded
//! and skipped, never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use siplocal_core::{
    BusinessRecord, Category, Coordinates, ExternalReviewDetails, PostalAddress, PriceTier,
    ReviewRecord, ReviewSource, MAX_PHOTOS,
};
use siplocal_storage::{BusinessStore, ReviewStore, StoreError};
use siplocal_yelp::{BusinessDirectory, YelpBusiness, YelpError, YelpReview, DEFAULT_CATEGORIES};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "siplocal-ingest";

/// Default search scope: Rio Grande Valley cities.
pub const DEFAULT_LOCALITIES: &[&str] = &[
    "Brownsville, TX",
    "Harlingen, TX",
    "McAllen, TX",
    "Edinburg, TX",
    "Weslaco, TX",
    "Mission, TX",
    "San Benito, TX",
    "Pharr, TX",
];

/// Pause between localities to stay under the provider's rate limit.
pub const DEFAULT_LOCALITY_DELAY: Duration = Duration::from_millis(200);

/// Externally sourced reviews older than this are considered stale.
pub const REVIEW_FRESHNESS_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Chain/brand filter
// ---------------------------------------------------------------------------

/// Multi-location chain brands excluded from ingestion. Some entries are
/// convenience stores or fast food with in-house coffee counters.
const CHAIN_NAMES: &[&str] = &[
    "starbucks",
    "starbucks coffee",
    "7brew",
    "7-eleven",
    "dunkin",
    "dunkin donuts",
    "dunkin' donuts",
    "peets coffee",
    "peet's coffee",
    "caribou coffee",
    "tim hortons",
    "the coffee bean",
    "coffee bean & tea leaf",
    "tully's coffee",
    "tullys coffee",
    "biggby coffee",
    "panera bread",
    "mcdonalds",
    "wawa",
    "circle k",
    "speedway",
];

/// Whether a business name matches a known chain brand.
///
/// Lower-cases and trims, then tests substring containment in both
/// directions. Deliberately fuzzy: a short independent name contained in a
/// brand string, or a name containing a brand word, both match — even an
/// empty name matches, since every brand string contains it. Kept as-is
/// rather than tightened.
pub fn is_chain(business_name: &str) -> bool {
    let normalized = business_name.to_lowercase();
    let normalized = normalized.trim();
    CHAIN_NAMES
        .iter()
        .any(|chain| normalized.contains(chain) || chain.contains(normalized))
}

/// Drop chain businesses from a candidate list.
pub fn filter_chains(businesses: Vec<YelpBusiness>) -> Vec<YelpBusiness> {
    businesses.into_iter().filter(|b| !is_chain(&b.name)).collect()
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Merge the primary image and extended photo list into the canonical photo
/// set: primary first, duplicates dropped, at most [`MAX_PHOTOS`] entries.
pub fn merge_photos(image_url: Option<&str>, extra: &[String]) -> Vec<String> {
    let mut photos: Vec<String> = Vec::new();
    if let Some(primary) = image_url {
        if !primary.is_empty() {
            photos.push(primary.to_string());
        }
    }
    for photo in extra {
        if photos.len() >= MAX_PHOTOS {
            break;
        }
        if !photo.is_empty() && !photos.contains(photo) {
            photos.push(photo.clone());
        }
    }
    photos.truncate(MAX_PHOTOS);
    photos
}

/// Re-shape a raw directory business into the canonical record.
pub fn business_record_from_yelp(business: &YelpBusiness) -> BusinessRecord {
    let photos = merge_photos(
        business.image_url.as_deref(),
        business.photos.as_deref().unwrap_or_default(),
    );

    BusinessRecord {
        id: business.id.clone(),
        name: business.name.clone(),
        image_url: business.image_url.clone(),
        directory_url: business.url.clone(),
        price: business.price.as_deref().and_then(PriceTier::from_symbol),
        rating: business.rating,
        review_count: business.review_count,
        categories: business
            .categories
            .iter()
            .map(|c| Category {
                alias: c.alias.clone(),
                title: c.title.clone(),
            })
            .collect(),
        coordinates: Coordinates {
            latitude: business.coordinates.latitude,
            longitude: business.coordinates.longitude,
        },
        address: PostalAddress {
            address1: business.location.address1.clone(),
            address2: business.location.address2.clone(),
            address3: business.location.address3.clone(),
            city: business.location.city.clone(),
            state: business.location.state.clone(),
            zip_code: business.location.zip_code.clone(),
            country: business.location.country.clone(),
        },
        display_address: business.location.display_address.join(", "),
        phone: business.phone.clone(),
        display_phone: business.display_phone.clone(),
        photos,
        // Populated out of band, never during ingestion.
        ai_summary: None,
    }
}

/// Shape an upstream review into a stored external review row. Rating and
/// body are copied verbatim; title, author reference, and helpful votes are
/// forced to their external-review values.
pub fn review_record_from_yelp(
    business_id: &str,
    review: &YelpReview,
    fetched_at: DateTime<Utc>,
) -> ReviewRecord {
    ReviewRecord {
        id: Uuid::new_v4(),
        business_id: business_id.to_string(),
        user_id: None,
        source: ReviewSource::External,
        rating: review.rating,
        title: None,
        body: review.text.clone(),
        photos: None,
        helpful_count: 0,
        external: Some(ExternalReviewDetails {
            external_id: review.id.clone(),
            author_name: review.user.name.clone(),
            author_avatar_url: review.user.image_url.clone(),
            url: review.url.clone(),
            fetched_at,
        }),
        created_at: fetched_at,
        updated_at: fetched_at,
    }
}

// ---------------------------------------------------------------------------
// Ingestion orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionRequest {
    pub localities: Vec<String>,
    pub max_per_locality: usize,
    pub fetch_photos: bool,
    pub min_rating: f64,
    pub exclude_chains: bool,
    pub require_photos: bool,
}

impl Default for IngestionRequest {
    fn default() -> Self {
        Self {
            localities: DEFAULT_LOCALITIES.iter().map(ToString::to_string).collect(),
            max_per_locality: 50,
            fetch_photos: true,
            min_rating: 3.0,
            exclude_chains: true,
            require_photos: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalityReport {
    pub locality: String,
    /// Candidates remaining after exclusions and truncation.
    pub count: usize,
    pub processed: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionReport {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    /// Candidates dropped by the chain filter or trimmed past the
    /// per-locality target.
    pub filtered: usize,
    pub errors: Vec<String>,
    pub per_locality: Vec<LocalityReport>,
}

struct LocalityOutcome {
    count: usize,
    processed: usize,
    skipped: usize,
    filtered: usize,
    errors: Vec<String>,
}

/// Sequential ingestion over a configured set of localities. Counters are
/// kept globally and per locality so an operator can see where yield is
/// lost without re-running with verbose logging.
pub struct IngestionPipeline {
    directory: Arc<dyn BusinessDirectory>,
    store: Arc<dyn BusinessStore>,
    categories: String,
    locality_delay: Duration,
}

impl IngestionPipeline {
    pub fn new(directory: Arc<dyn BusinessDirectory>, store: Arc<dyn BusinessStore>) -> Self {
        Self {
            directory,
            store,
            categories: DEFAULT_CATEGORIES.to_string(),
            locality_delay: DEFAULT_LOCALITY_DELAY,
        }
    }

    pub fn with_categories(mut self, categories: impl Into<String>) -> Self {
        self.categories = categories.into();
        self
    }

    pub fn with_locality_delay(mut self, delay: Duration) -> Self {
        self.locality_delay = delay;
        self
    }

    pub async fn run(&self, request: &IngestionRequest) -> IngestionReport {
        let mut report = IngestionReport::default();

        for locality in &request.localities {
            info!(%locality, "ingesting locality");
            match self.ingest_locality(locality, request).await {
                Ok(outcome) => {
                    report.total += outcome.count;
                    report.processed += outcome.processed;
                    report.skipped += outcome.skipped;
                    report.filtered += outcome.filtered;
                    report.errors.extend(outcome.errors);
                    report.per_locality.push(LocalityReport {
                        locality: locality.clone(),
                        count: outcome.count,
                        processed: outcome.processed,
                        filtered: outcome.filtered,
                    });
                    // Pace the provider only after a locality that actually
                    // hit it end to end.
                    tokio::time::sleep(self.locality_delay).await;
                }
                Err(err) => {
                    // A failed candidate fetch aborts this locality only.
                    warn!(%locality, error = %err, "locality ingestion failed");
                    report.errors.push(format!("Error processing {locality}: {err}"));
                }
            }
        }

        info!(
            total = report.total,
            processed = report.processed,
            skipped = report.skipped,
            filtered = report.filtered,
            "ingestion run finished"
        );
        report
    }

    async fn ingest_locality(
        &self,
        locality: &str,
        request: &IngestionRequest,
    ) -> Result<LocalityOutcome, YelpError> {
        // Over-fetch so the chain filter has headroom before truncation.
        let fetch_target = request.max_per_locality.saturating_mul(2);
        let candidates = self
            .directory
            .search(locality, &self.categories, fetch_target, true)
            .await?;

        let mut candidates: Vec<YelpBusiness> = candidates
            .into_iter()
            .filter(|b| b.rating >= request.min_rating)
            .filter(|b| !request.require_photos || b.image_url.is_some())
            .collect();

        let mut filtered = 0usize;
        if request.exclude_chains {
            let before = candidates.len();
            candidates.retain(|b| !is_chain(&b.name));
            filtered += before - candidates.len();
        }
        if candidates.len() > request.max_per_locality {
            filtered += candidates.len() - request.max_per_locality;
            candidates.truncate(request.max_per_locality);
        }

        let count = candidates.len();
        let mut processed = 0usize;
        let mut skipped = 0usize;
        let mut errors = Vec::new();

        for candidate in candidates {
            let resolved = if request.fetch_photos {
                match self.directory.business_details(&candidate.id).await {
                    Ok(detail) => detail,
                    Err(err) => {
                        // Photos are mandatory, so a failed detail fetch
                        // disqualifies the candidate.
                        skipped += 1;
                        errors.push(format!(
                            "Error fetching details for {}: {err}",
                            candidate.name
                        ));
                        continue;
                    }
                }
            } else {
                candidate
            };

            let record = business_record_from_yelp(&resolved);
            if request.require_photos && record.photos.is_empty() {
                skipped += 1;
                errors.push(format!("Skipping {}: no photos available", record.name));
                continue;
            }

            match self.store.upsert_business(&record).await {
                Ok(()) => processed += 1,
                Err(err) => {
                    skipped += 1;
                    errors.push(format!("Error upserting {}: {err}", record.name));
                }
            }
        }

        Ok(LocalityOutcome {
            count,
            processed,
            skipped,
            filtered,
            errors,
        })
    }
}

// ---------------------------------------------------------------------------
// Review sync policy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] YelpError),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Freshness state of a business's externally sourced review set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewFreshness {
    /// At least one review fetched within the freshness window.
    Fresh,
    /// Reviews exist but every fetch timestamp is outside the window.
    Stale,
    /// No externally sourced reviews at all.
    Empty,
}

pub fn classify_external_reviews(
    reviews: &[ReviewRecord],
    now: DateTime<Utc>,
) -> ReviewFreshness {
    if reviews.is_empty() {
        return ReviewFreshness::Empty;
    }
    let freshest = reviews
        .iter()
        .filter_map(|r| r.external.as_ref().map(|e| e.fetched_at))
        .max();
    match freshest {
        Some(fetched_at)
            if now - fetched_at <= ChronoDuration::hours(REVIEW_FRESHNESS_HOURS) =>
        {
            ReviewFreshness::Fresh
        }
        _ => ReviewFreshness::Stale,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub count: usize,
    pub expired: usize,
    pub needs_sync: bool,
}

/// Replace-on-stale policy for externally sourced reviews.
pub struct ReviewSyncService {
    directory: Arc<dyn BusinessDirectory>,
    store: Arc<dyn ReviewStore>,
}

impl ReviewSyncService {
    pub fn new(directory: Arc<dyn BusinessDirectory>, store: Arc<dyn ReviewStore>) -> Self {
        Self { directory, store }
    }

    /// `needs_sync` is true when there are no external reviews or when the
    /// freshest fetch timestamp has aged out of the window.
    pub async fn status(
        &self,
        business_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncStatus, SyncError> {
        let reviews = self.store.external_reviews(business_id).await?;
        let window = ChronoDuration::hours(REVIEW_FRESHNESS_HOURS);
        let expired = reviews
            .iter()
            .filter(|r| {
                r.external
                    .as_ref()
                    .map(|e| now - e.fetched_at > window)
                    .unwrap_or(true)
            })
            .count();
        let needs_sync =
            classify_external_reviews(&reviews, now) != ReviewFreshness::Fresh;
        Ok(SyncStatus {
            count: reviews.len(),
            expired,
            needs_sync,
        })
    }

    /// Fetch the provider's current review set and replace the stored one
    /// wholesale. The fetch happens first: if it fails, nothing is mutated
    /// and the old rows stay visible.
    pub async fn sync(
        &self,
        business_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReviewRecord>, SyncError> {
        let fetched = self.directory.business_reviews(business_id).await?;
        let rows: Vec<ReviewRecord> = fetched
            .iter()
            .map(|review| review_record_from_yelp(business_id, review, now))
            .collect();
        let inserted = self.store.replace_external_reviews(business_id, &rows).await?;
        info!(business_id, synced = inserted.len(), "external reviews replaced");
        Ok(inserted)
    }

    /// Maintenance deletion of external reviews past the freshness window.
    /// Independent of [`Self::sync`]; the replace path no longer pre-deletes.
    pub async fn expire_stale(
        &self,
        business_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, SyncError> {
        let cutoff = now - ChronoDuration::hours(REVIEW_FRESHNESS_HOURS);
        Ok(self
            .store
            .expire_stale_external_reviews(business_id, cutoff)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use siplocal_storage::MemoryStore;
    use siplocal_yelp::{YelpCoordinates, YelpLocation, YelpReviewUser};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn candidate(id: &str, name: &str, rating: f64) -> YelpBusiness {
        YelpBusiness {
            id: id.to_string(),
            name: name.to_string(),
            image_url: Some(format!("https://img.example/{id}.jpg")),
            url: Some(format!("https://yelp.example/{id}")),
            price: Some("$$".to_string()),
            rating,
            review_count: 12,
            categories: vec![],
            coordinates: YelpCoordinates::default(),
            location: YelpLocation {
                address1: Some("1 Main St".into()),
                city: "Example City".into(),
                state: "TX".into(),
                zip_code: "78500".into(),
                country: "US".into(),
                display_address: vec!["1 Main St".into(), "Example City, TX 78500".into()],
                ..Default::default()
            },
            phone: "+19565550000".into(),
            display_phone: "(956) 555-0000".into(),
            is_closed: false,
            photos: None,
        }
    }

    /// Serves canned search/detail/review responses; failure modes toggled
    /// per business id.
    struct FakeDirectory {
        search_results: HashMap<String, Vec<YelpBusiness>>,
        detail_failures: Vec<String>,
        photoless: Vec<String>,
        reviews: Mutex<Result<Vec<YelpReview>, String>>,
    }

    impl Default for FakeDirectory {
        fn default() -> Self {
            Self {
                search_results: HashMap::new(),
                detail_failures: Vec::new(),
                photoless: Vec::new(),
                reviews: Mutex::new(Ok(Vec::new())),
            }
        }
    }

    impl FakeDirectory {
        fn with_search(locality: &str, results: Vec<YelpBusiness>) -> Self {
            let mut search_results = HashMap::new();
            search_results.insert(locality.to_string(), results);
            Self {
                search_results,
                ..Default::default()
            }
        }

        fn with_reviews(reviews: Vec<YelpReview>) -> Self {
            Self {
                reviews: Mutex::new(Ok(reviews)),
                ..Default::default()
            }
        }

        fn failing_reviews(message: &str) -> Self {
            Self {
                reviews: Mutex::new(Err(message.to_string())),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl BusinessDirectory for FakeDirectory {
        async fn search(
            &self,
            locality: &str,
            _categories: &str,
            max_results: usize,
            exclude_closed: bool,
        ) -> Result<Vec<YelpBusiness>, YelpError> {
            let mut results = self
                .search_results
                .get(locality)
                .cloned()
                .ok_or_else(|| YelpError::Api {
                    status: 400,
                    body: format!("unknown locality {locality}"),
                })?;
            if exclude_closed {
                results.retain(|b| !b.is_closed);
            }
            results.truncate(max_results);
            Ok(results)
        }

        async fn business_details(&self, business_id: &str) -> Result<YelpBusiness, YelpError> {
            if self.detail_failures.iter().any(|id| id == business_id) {
                return Err(YelpError::Api {
                    status: 500,
                    body: "detail fetch exploded".into(),
                });
            }
            let base = self
                .search_results
                .values()
                .flatten()
                .find(|b| b.id == business_id)
                .cloned()
                .ok_or(YelpError::Api {
                    status: 404,
                    body: "not found".into(),
                })?;
            let mut detail = base;
            detail.photos = if self.photoless.iter().any(|id| id == business_id) {
                detail.image_url = None;
                Some(vec![])
            } else {
                Some(vec![
                    format!("https://img.example/{business_id}-2.jpg"),
                    format!("https://img.example/{business_id}-3.jpg"),
                ])
            };
            Ok(detail)
        }

        async fn business_reviews(&self, _business_id: &str) -> Result<Vec<YelpReview>, YelpError> {
            match &*self.reviews.lock().unwrap() {
                Ok(reviews) => Ok(reviews.clone()),
                Err(message) => Err(YelpError::Api {
                    status: 500,
                    body: message.clone(),
                }),
            }
        }
    }

    fn yelp_review(id: &str, rating: i16) -> YelpReview {
        YelpReview {
            id: id.to_string(),
            rating,
            text: "External reviewer opinion text.".to_string(),
            url: Some(format!("https://yelp.example/review/{id}")),
            user: YelpReviewUser {
                name: "Reviewer".to_string(),
                image_url: None,
            },
            time_created: None,
        }
    }

    fn pipeline(directory: FakeDirectory, store: Arc<MemoryStore>) -> IngestionPipeline {
        IngestionPipeline::new(Arc::new(directory), store)
            .with_locality_delay(Duration::ZERO)
    }

    #[test]
    fn chain_filter_is_case_and_trim_insensitive() {
        for name in ["Starbucks Reserve", "dunkin donuts #41", "Local Roasters"] {
            let shouted = format!("  {}  ", name.to_uppercase());
            assert_eq!(is_chain(name), is_chain(&shouted), "name: {name}");
        }
        assert!(is_chain("Starbucks"));
        assert!(is_chain("Tim Hortons - Expressway"));
        assert!(!is_chain("Frida's Cafe"));
    }

    #[test]
    fn chain_filter_is_a_known_imprecise_heuristic() {
        // Bidirectional containment over-matches: an independent shop whose
        // name contains a denylisted brand word is dropped too.
        assert!(is_chain("Speedway Espresso Bar"));
        // Every brand string contains the empty name, so blank names match.
        assert!(is_chain(""));
        assert!(is_chain("   "));
        // And under-matches: the denylist is finite.
        assert!(!is_chain("Some Future Mega Chain"));
    }

    #[test]
    fn photo_merge_caps_dedupes_and_leads_with_primary() {
        let extra: Vec<String> = (0..15)
            .map(|i| format!("https://img.example/p{i}.jpg"))
            .collect();
        let photos = merge_photos(Some("https://img.example/p0.jpg"), &extra);
        assert_eq!(photos.len(), MAX_PHOTOS);
        assert_eq!(photos[0], "https://img.example/p0.jpg");
        let mut unique = photos.clone();
        unique.dedup();
        assert_eq!(unique.len(), photos.len());
    }

    #[test]
    fn normalization_flattens_address_and_parses_price() {
        let record = business_record_from_yelp(&candidate("b1", "Frida's Cafe", 4.5));
        assert_eq!(record.display_address, "1 Main St, Example City, TX 78500");
        assert_eq!(record.price, Some(PriceTier::Moderate));
        assert_eq!(record.photos, vec!["https://img.example/b1.jpg".to_string()]);
        assert!(record.ai_summary.is_none());
    }

    #[tokio::test]
    async fn ingestion_filters_chains_and_truncates_to_target() {
        let results = vec![
            candidate("c1", "Starbucks", 4.0),
            candidate("c2", "Dunkin Donuts", 4.0),
            candidate("c3", "Frida's Cafe", 4.5),
            candidate("c4", "Border Beans", 4.2),
            candidate("c5", "Paloma Coffee", 4.8),
        ];
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(FakeDirectory::with_search("Example City", results), store.clone());

        let report = pipeline
            .run(&IngestionRequest {
                localities: vec!["Example City".into()],
                max_per_locality: 2,
                ..Default::default()
            })
            .await;

        assert!(report.filtered >= 2, "chains counted as filtered");
        assert!(report.total <= 2, "count bounded by target after truncation");
        assert!(store.business_count() <= 2);
        assert_eq!(report.per_locality.len(), 1);
        let locality = &report.per_locality[0];
        assert_eq!(locality.locality, "Example City");
        assert!(locality.processed + report.skipped <= locality.count.max(report.total));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn detail_failure_skips_candidate_and_records_error() {
        let results = vec![
            candidate("ok", "Frida's Cafe", 4.5),
            candidate("boom", "Border Beans", 4.2),
        ];
        let directory = FakeDirectory {
            detail_failures: vec!["boom".into()],
            ..FakeDirectory::with_search("Example City", results)
        };
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(directory, store.clone())
            .run(&IngestionRequest {
                localities: vec!["Example City".into()],
                max_per_locality: 10,
                ..Default::default()
            })
            .await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Border Beans"));
        assert!(store.get_business("ok").await.unwrap().is_some());
        assert!(store.get_business("boom").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn photoless_candidate_is_rejected_after_detail_fetch() {
        let directory = FakeDirectory {
            photoless: vec!["bare".into()],
            ..FakeDirectory::with_search("Example City", vec![candidate("bare", "No Pics Cafe", 4.1)])
        };
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(directory, store.clone())
            .run(&IngestionRequest {
                localities: vec!["Example City".into()],
                max_per_locality: 10,
                ..Default::default()
            })
            .await;

        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.business_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn locality_delay_applies_only_after_successful_localities() {
        let directory = FakeDirectory::with_search(
            "Good City",
            vec![candidate("g1", "Frida's Cafe", 4.5)],
        );
        let store = Arc::new(MemoryStore::new());
        let pipeline = IngestionPipeline::new(Arc::new(directory), store)
            .with_locality_delay(Duration::from_millis(200));

        let started = tokio::time::Instant::now();
        pipeline
            .run(&IngestionRequest {
                localities: vec!["Bad City".into(), "Good City".into()],
                max_per_locality: 5,
                ..Default::default()
            })
            .await;

        // One pacing sleep for the successful locality, none for the failed one.
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn failed_locality_aborts_that_locality_only() {
        let directory = FakeDirectory::with_search(
            "Good City",
            vec![candidate("g1", "Frida's Cafe", 4.5)],
        );
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(directory, store.clone())
            .run(&IngestionRequest {
                localities: vec!["Bad City".into(), "Good City".into()],
                max_per_locality: 5,
                ..Default::default()
            })
            .await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.per_locality.len(), 1);
        assert!(report.errors.iter().any(|e| e.contains("Bad City")));
    }

    #[tokio::test]
    async fn below_minimum_rating_is_excluded_before_chain_filter() {
        let results = vec![
            candidate("low", "Low Rated Cafe", 2.5),
            candidate("hi", "Frida's Cafe", 4.5),
        ];
        let store = Arc::new(MemoryStore::new());
        let report = pipeline(FakeDirectory::with_search("Example City", results), store.clone())
            .run(&IngestionRequest {
                localities: vec!["Example City".into()],
                max_per_locality: 10,
                min_rating: 3.0,
                ..Default::default()
            })
            .await;

        assert_eq!(report.total, 1);
        assert_eq!(report.processed, 1);
        assert!(store.get_business("low").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn needs_sync_for_empty_and_stale_sets() {
        let store = Arc::new(MemoryStore::new());
        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::with_reviews(vec![])),
            store.clone(),
        );
        let now = Utc::now();

        let status = service.status("b1", now).await.unwrap();
        assert_eq!(status.count, 0);
        assert!(status.needs_sync);

        // One review fetched 25 hours ago: stale.
        let old = review_record_from_yelp("b1", &yelp_review("old", 4), now - ChronoDuration::hours(25));
        store.replace_external_reviews("b1", &[old]).await.unwrap();
        let status = service.status("b1", now).await.unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(status.expired, 1);
        assert!(status.needs_sync);
    }

    #[tokio::test]
    async fn fresh_set_does_not_need_sync() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let fresh = review_record_from_yelp("b1", &yelp_review("new", 5), now - ChronoDuration::hours(2));
        store.replace_external_reviews("b1", &[fresh]).await.unwrap();

        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::with_reviews(vec![])),
            store.clone(),
        );
        let status = service.status("b1", now).await.unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(status.expired, 0);
        assert!(!status.needs_sync);
    }

    #[tokio::test]
    async fn sync_replaces_stale_rows_with_fresh_timestamps() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old = review_record_from_yelp("b1", &yelp_review("old", 3), now - ChronoDuration::hours(25));
        store.replace_external_reviews("b1", &[old]).await.unwrap();

        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::with_reviews(vec![
                yelp_review("r1", 5),
                yelp_review("r2", 4),
            ])),
            store.clone(),
        );
        let synced = service.sync("b1", now).await.unwrap();
        assert_eq!(synced.len(), 2);

        let stored = store.external_reviews("b1").await.unwrap();
        assert_eq!(stored.len(), 2);
        for review in &stored {
            let external = review.external.as_ref().unwrap();
            assert_ne!(external.external_id, "old");
            assert_eq!(external.fetched_at, now);
            assert!(review.title.is_none());
            assert!(review.user_id.is_none());
            assert_eq!(review.helpful_count, 0);
        }
    }

    #[tokio::test]
    async fn sync_is_idempotent_in_count() {
        let store = Arc::new(MemoryStore::new());
        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::with_reviews(vec![
                yelp_review("r1", 5),
                yelp_review("r2", 4),
                yelp_review("r3", 3),
            ])),
            store.clone(),
        );

        let now = Utc::now();
        service.sync("b1", now).await.unwrap();
        service.sync("b1", now).await.unwrap();
        assert_eq!(store.external_reviews("b1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn expire_removes_only_rows_past_the_window() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let stale = review_record_from_yelp("b1", &yelp_review("stale", 3), now - ChronoDuration::hours(25));
        let fresh = review_record_from_yelp("b1", &yelp_review("fresh", 4), now - ChronoDuration::hours(1));
        store.replace_external_reviews("b1", &[stale, fresh]).await.unwrap();

        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::with_reviews(vec![])),
            store.clone(),
        );
        let removed = service.expire_stale("b1", now).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.external_reviews("b1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].external.as_ref().unwrap().external_id, "fresh");
    }

    #[tokio::test]
    async fn failed_fetch_aborts_sync_without_mutation() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old = review_record_from_yelp("b1", &yelp_review("old", 3), now - ChronoDuration::hours(25));
        store.replace_external_reviews("b1", &[old]).await.unwrap();

        let service = ReviewSyncService::new(
            Arc::new(FakeDirectory::failing_reviews("upstream down")),
            store.clone(),
        );
        let err = service.sync("b1", now).await.unwrap_err();
        assert!(matches!(err, SyncError::Upstream(_)));

        // Old data preserved on failure.
        let stored = store.external_reviews("b1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].external.as_ref().unwrap().external_id, "old");
    }
}
