//! Leadgrid worker - runs lead-generation jobs from the command line.
//!
//! The worker owns one browser, one geocoder rate gate and one quota
//! tracker for the whole process. Jobs interrupted by a crash or a
//! restart are picked up again with `resume`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leadgrid_browser::BrowserEngine;
use leadgrid_core::{AppConfig, BatchRequest, JobRequest, JobStatus, LocationType, Source};
use leadgrid_db::{batches, jobs, Database, DatabaseError};
use leadgrid_geo::{NominatimGeocoder, RateGate};
use leadgrid_scanner::{
    month_key, BatchRunner, DataSource, Deduplicator, EnrichmentCollector, Pipeline,
    PrimaryCollector, QuotaTracker, SupplementCollector, WebsiteEnricher,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "leadgrid-worker", version, about = "Run lead-generation jobs")]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "LEADGRID_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run or resume one job
    Run {
        /// Job identifier
        job_id: String,
    },
    /// Create a job and run it
    Scrape {
        /// Business keyword, e.g. "coffee shop"
        keyword: String,
        /// Location to search around
        location: String,
        /// address, coordinates, city, state, country or pincode
        #[arg(long, default_value = "city")]
        location_type: String,
        /// Search radius in kilometers
        #[arg(long, default_value_t = 5.0)]
        radius_km: f64,
        /// Latitude for coordinate searches
        #[arg(long, allow_hyphen_values = true)]
        latitude: Option<f64>,
        /// Longitude for coordinate searches
        #[arg(long, allow_hyphen_values = true)]
        longitude: Option<f64>,
    },
    /// Resume every job left unfinished by a previous worker
    Resume,
    /// Cancel a job
    Cancel {
        /// Job identifier
        job_id: String,
    },
    /// Submit a batch from a JSON file and run it
    Batch {
        /// File holding `{name?, notify_contact?, jobs: [...]}`
        file: PathBuf,
    },
    /// Run the unfinished jobs of an existing batch
    RunBatch {
        /// Batch identifier
        batch_id: String,
    },
    /// Cancel every unfinished job of a batch
    CancelBatch {
        /// Batch identifier
        batch_id: String,
    },
    /// Show this month's usage of the metered sources
    Quota,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,leadgrid=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(load_config(cli.config.as_ref())?);
    let db = open_database(&config).await?;

    match cli.command {
        Command::Run { job_id } => {
            let services = Services::start(Arc::clone(&config), db.clone()).await?;
            run_job_until_signal(&services.pipeline, &job_id).await?;
            print_job(&db, &job_id).await?;
            services.shutdown().await;
        }
        Command::Scrape {
            keyword,
            location,
            location_type,
            radius_km,
            latitude,
            longitude,
        } => {
            let Some(location_type) = LocationType::parse(&location_type) else {
                bail!("unknown location type '{location_type}'");
            };
            let request = JobRequest {
                keyword,
                location,
                location_type,
                radius_km,
                latitude,
                longitude,
                notify_contact: None,
            };
            let job = jobs::create_job(db.pool(), &request).await?;
            tracing::info!("Created job {}", job.id);

            let services = Services::start(Arc::clone(&config), db.clone()).await?;
            run_job_until_signal(&services.pipeline, &job.id).await?;
            print_job(&db, &job.id).await?;
            services.shutdown().await;
        }
        Command::Resume => {
            let services = Services::start(Arc::clone(&config), db.clone()).await?;
            for (job_id, status) in services.pipeline.resume_unfinished().await? {
                println!("{job_id}\t{status}");
            }
            services.shutdown().await;
        }
        Command::Cancel { job_id } => {
            // The running worker sees the persisted flag at its next checkpoint.
            let outcome = jobs::request_cancel(db.pool(), &job_id).await?;
            let job = jobs::get_job(db.pool(), &job_id).await?;
            if let Some(batch_id) = &job.batch_id {
                batches::refresh_batch_status(db.pool(), batch_id).await?;
            }
            println!("{job_id}\t{outcome:?}");
        }
        Command::Batch { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let request: BatchRequest = serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", file.display()))?;

            let services = Services::start(Arc::clone(&config), db.clone()).await?;
            let runner = BatchRunner::new(Arc::clone(&services.pipeline), config.batch.concurrency);
            let (batch, _) = runner.submit(&request).await?;
            let batch = runner.run_batch(&batch.id).await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            services.shutdown().await;
        }
        Command::RunBatch { batch_id } => {
            let services = Services::start(Arc::clone(&config), db.clone()).await?;
            let runner = BatchRunner::new(Arc::clone(&services.pipeline), config.batch.concurrency);
            let batch = runner.run_batch(&batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
            services.shutdown().await;
        }
        Command::CancelBatch { batch_id } => {
            for job in jobs::list_jobs_for_batch(db.pool(), &batch_id).await? {
                if job.status.is_terminal() {
                    continue;
                }
                match jobs::request_cancel(db.pool(), &job.id).await {
                    Ok(outcome) => println!("{}\t{outcome:?}", job.id),
                    Err(DatabaseError::Conflict(msg)) => tracing::debug!("{}", msg),
                    Err(e) => return Err(e.into()),
                }
            }
            let batch = batches::refresh_batch_status(db.pool(), &batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
        Command::Quota => {
            let quota = seeded_quota(&config, &db).await?;
            for source in [Source::Supplement, Source::Enrichment] {
                let limit = quota
                    .limit(source)
                    .map_or_else(|| "unlimited".to_string(), |l| l.to_string());
                println!("{source}\t{}\t{limit}", quota.usage(source));
            }
        }
    }

    db.close().await;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env_overrides(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => AppConfig::load_with_env()?,
    };
    Ok(config)
}

async fn open_database(config: &AppConfig) -> Result<Database> {
    let path = config.database_path()?;
    tracing::debug!("Opening database at {}", path.display());
    let db = Database::with_max_connections(&path, config.database.max_connections)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    db.run_migrations().await?;
    Ok(db)
}

/// Quota tracker primed with the usage already recorded this month.
async fn seeded_quota(config: &AppConfig, db: &Database) -> Result<Arc<QuotaTracker>> {
    let quota = Arc::new(QuotaTracker::from_config(&config.quota));
    let month = month_key(chrono::Utc::now());
    for source in [Source::Supplement, Source::Enrichment] {
        let used = jobs::monthly_usage(db.pool(), source, &month).await?;
        quota.seed(source, &month, used);
    }
    quota.log_status();
    Ok(quota)
}

/// Process-wide collaborators of a running pipeline.
struct Services {
    pipeline: Arc<Pipeline>,
    browser: Arc<BrowserEngine>,
}

impl Services {
    async fn start(config: Arc<AppConfig>, db: Database) -> Result<Self> {
        let quota = seeded_quota(&config, &db).await?;

        let gate = Arc::new(RateGate::new(Duration::from_millis(
            config.geocoder.min_interval_ms,
        )));
        let geocoder = Arc::new(NominatimGeocoder::new(&config.geocoder, gate)?);

        let browser = Arc::new(
            BrowserEngine::launch(&config.browser)
                .await
                .context("launching browser")?,
        );
        let primary = Arc::new(PrimaryCollector::new(
            Arc::clone(&browser) as _,
            config.browser.clone(),
            config.scraping.clone(),
        ));
        let supplement = Arc::new(SupplementCollector::new(
            config.supplement.clone(),
            config.browser.zoom,
            Arc::clone(&quota),
        )?);
        let enrichment = enrichment_source(&config, &quota)?;

        let pipeline = Pipeline::new(db, Arc::clone(&config), geocoder, primary, supplement, quota)
            .with_enrichment(enrichment);
        Ok(Self {
            pipeline: Arc::new(pipeline),
            browser,
        })
    }

    async fn shutdown(self) {
        let Self { pipeline, browser } = self;
        drop(pipeline);
        match Arc::try_unwrap(browser) {
            Ok(browser) => browser.shutdown().await,
            Err(_) => tracing::warn!("Browser still in use at shutdown"),
        }
    }
}

/// The metered API when it has a key, else the free website scraper if
/// enabled.
fn enrichment_source(
    config: &AppConfig,
    quota: &Arc<QuotaTracker>,
) -> Result<Arc<dyn DataSource>> {
    let collector = EnrichmentCollector::new(
        config.enrichment.clone(),
        Arc::clone(quota),
        Deduplicator::from_config(&config.dedup),
    )?;
    let fallback = config.enrichment.enabled && config.enrichment.website_fallback;
    if collector.is_configured() || !fallback {
        return Ok(Arc::new(collector));
    }
    tracing::info!("No enrichment API key, reading contacts from lead websites instead");
    Ok(Arc::new(WebsiteEnricher::new(&config.enrichment)?))
}

/// Run a job; Ctrl-C cancels it and waits for partial results to be saved.
async fn run_job_until_signal(pipeline: &Pipeline, job_id: &str) -> Result<JobStatus> {
    let run = pipeline.run_job(job_id);
    tokio::pin!(run);

    let status = tokio::select! {
        status = &mut run => status?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling job {}", job_id);
            pipeline.cancel_job(job_id).await?;
            run.await?
        }
    };
    tracing::info!("Job {} finished: {}", job_id, status);
    Ok(status)
}

async fn print_job(db: &Database, job_id: &str) -> Result<()> {
    let job = jobs::get_job(db.pool(), job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}
