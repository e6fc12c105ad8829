use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use siplocal_ingest::{IngestionPipeline, IngestionRequest, ReviewSyncService};
use siplocal_storage::PgStore;
use siplocal_yelp::YelpClient;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "siplocal")]
#[command(about = "SipLocal coffee directory: ingestion, review sync, and API server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API server.
    Serve,
    /// Pull businesses from the directory provider into the database.
    Ingest {
        /// Localities to search; defaults to the configured region.
        #[arg(long)]
        locality: Vec<String>,
        /// Per-locality target after filtering.
        #[arg(long, default_value_t = 50)]
        max_per_locality: usize,
        /// Minimum provider rating to keep a candidate.
        #[arg(long, default_value_t = 3.0)]
        min_rating: f64,
        /// Keep multi-location chain brands instead of dropping them.
        #[arg(long)]
        include_chains: bool,
        /// Keep businesses with no photos instead of skipping them.
        #[arg(long)]
        allow_photoless: bool,
    },
    /// Replace a business's externally sourced reviews with fresh ones.
    SyncReviews {
        business_id: String,
        /// Report freshness without mutating anything.
        #[arg(long)]
        status_only: bool,
    },
    /// Delete a business's externally sourced reviews older than the
    /// freshness window, without fetching replacements.
    ExpireReviews { business_id: String },
    /// Apply pending database migrations.
    Migrate,
}

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
    yelp_api_key: Option<String>,
    web_port: u16,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?,
            yelp_api_key: std::env::var("YELP_API_KEY").ok(),
            web_port: std::env::var("SIPLOCAL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        })
    }

    fn yelp_client(&self) -> Result<YelpClient> {
        let api_key = self
            .yelp_api_key
            .clone()
            .context("YELP_API_KEY is not set")?;
        Ok(YelpClient::new(api_key)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve => {
            let store = PgStore::connect(&config.database_url).await?;
            let directory = config.yelp_client()?;
            let state = siplocal_web::AppState::new(Arc::new(store), Arc::new(directory));
            siplocal_web::serve(state, config.web_port).await?;
        }
        Commands::Ingest {
            locality,
            max_per_locality,
            min_rating,
            include_chains,
            allow_photoless,
        } => {
            let store = PgStore::connect(&config.database_url).await?;
            let directory = config.yelp_client()?;
            let mut request = IngestionRequest {
                max_per_locality,
                min_rating,
                exclude_chains: !include_chains,
                require_photos: !allow_photoless,
                ..Default::default()
            };
            if !locality.is_empty() {
                request.localities = locality;
            }
            let pipeline = IngestionPipeline::new(Arc::new(directory), Arc::new(store));
            let report = pipeline.run(&request).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SyncReviews {
            business_id,
            status_only,
        } => {
            let store = PgStore::connect(&config.database_url).await?;
            let directory = config.yelp_client()?;
            let service = ReviewSyncService::new(Arc::new(directory), Arc::new(store));
            let now = Utc::now();
            if status_only {
                let status = service.status(&business_id, now).await?;
                println!(
                    "business={business_id} count={} expired={} needs_sync={}",
                    status.count, status.expired, status.needs_sync
                );
            } else {
                let reviews = service.sync(&business_id, now).await?;
                println!("business={business_id} synced={}", reviews.len());
            }
        }
        Commands::ExpireReviews { business_id } => {
            let store = PgStore::connect(&config.database_url).await?;
            let directory = config.yelp_client()?;
            let service = ReviewSyncService::new(Arc::new(directory), Arc::new(store));
            let removed = service.expire_stale(&business_id, Utc::now()).await?;
            println!("business={business_id} expired={removed}");
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
