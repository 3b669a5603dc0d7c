use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod coaching;
mod config;
mod db;
mod error;
mod features;
mod gamification;
mod import;
mod model;
mod models;
mod pipeline;
mod pricing;
mod report;
mod risk;
mod store;
mod timestamp;

use config::Settings;
use model::ForestParams;
use pipeline::ScoringPipeline;
use store::{MemoryStore, TelematicsStore};

#[derive(Parser)]
#[command(name = "telematics-risk")]
#[command(about = "Usage-based insurance risk scoring from driving telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo drivers and trips
    Seed,
    /// Import trip summaries from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the HTTP API
    Serve {
        /// Keep all data in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },
    /// List the riskiest drivers by stored score
    Score {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Recompute one driver's score and premium
    Rescore {
        #[arg(long)]
        driver: String,
    },
    /// Generate a markdown report for one driver
    Report {
        #[arg(long)]
        driver: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Train the synthetic random-forest model and write its artifacts
    TrainModel {
        #[arg(long, default_value = "models")]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 120)]
        trees: usize,
        #[arg(long, default_value_t = model::SYNTHETIC_SAMPLES)]
        samples: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::InitDb => {
            let pool = db::connect(settings.require_database_url()?).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pipeline = build_pipeline(&settings, postgres_store(&settings).await?).await?;
            let inserted = import::seed(&pipeline).await?;
            println!("Seed data inserted ({inserted} new trips).");
        }
        Commands::Import { csv } => {
            let pipeline = build_pipeline(&settings, postgres_store(&settings).await?).await?;
            let inserted = import::import_csv(&pipeline, &csv).await?;
            println!("Inserted {inserted} trips from {}.", csv.display());
        }
        Commands::Serve { in_memory } => {
            let store: Arc<dyn TelematicsStore> = if in_memory {
                Arc::new(MemoryStore::new())
            } else {
                postgres_store(&settings).await?
            };
            let pipeline = build_pipeline(&settings, store).await?;
            serve(&settings, pipeline, in_memory).await?;
        }
        Commands::Score { limit } => {
            let store = postgres_store(&settings).await?;
            let scores = store.top_driver_scores(limit).await?;

            if scores.is_empty() {
                println!("No driver scores yet.");
                return Ok(());
            }

            println!("Top drivers by risk score:");
            for score in &scores {
                let premium = store.premium(&score.driver_id).await?;
                println!(
                    "- {} score {:.2} across {} trips, premium {}",
                    score.driver_id,
                    score.score,
                    score.breakdown.trips.len(),
                    premium
                        .map(|p| format!("${:.2}", p.monthly_premium))
                        .unwrap_or_else(|| "n/a".to_string())
                );
            }
        }
        Commands::Rescore { driver } => {
            let pipeline = build_pipeline(&settings, postgres_store(&settings).await?).await?;
            let record = pipeline.rescore_driver(&driver).await?;
            println!(
                "Driver {} rescored: score {:.2}, premium ${:.2}.",
                driver, record.driver_score.score, record.premium.monthly_premium
            );
        }
        Commands::Report { driver, out } => {
            let store = postgres_store(&settings).await?;
            let profile = store
                .get_driver(&driver)
                .await?
                .with_context(|| format!("unknown driver {driver}"))?;
            let score = store.driver_score(&driver).await?;
            let premium = store.premium(&driver).await?;
            let streak = store.gamification(&driver).await?;
            let trips = store
                .trips_by_start(&driver, settings.history_limit)
                .await?;
            let report = report::build_driver_report(
                &profile,
                score.as_ref(),
                premium.as_ref(),
                &streak,
                &trips,
            );
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::TrainModel {
            out_dir,
            trees,
            samples,
        } => {
            let params = ForestParams {
                n_trees: trees,
                ..ForestParams::default()
            };
            let (forest, metrics) =
                tokio::task::spawn_blocking(move || model::train_synthetic(samples, params))
                    .await??;
            model::write_artifacts(&out_dir, &forest, &metrics)?;
            println!(
                "Trained {} trees: MAE {:.3}, R2 {:.3} on {} holdout samples. Artifacts in {}.",
                forest.tree_count(),
                metrics.mae,
                metrics.r2,
                metrics.n_test,
                out_dir.display()
            );
        }
    }

    Ok(())
}

async fn postgres_store(settings: &Settings) -> anyhow::Result<Arc<dyn TelematicsStore>> {
    let pool = db::connect(settings.require_database_url()?).await?;
    Ok(Arc::new(db::PgStore::new(pool)))
}

async fn build_pipeline(
    settings: &Settings,
    store: Arc<dyn TelematicsStore>,
) -> anyhow::Result<ScoringPipeline> {
    let scorer_settings = settings.clone();
    let scorer = tokio::task::spawn_blocking(move || model::scorer_for(&scorer_settings)).await??;
    Ok(ScoringPipeline::new(store, scorer, settings))
}

async fn serve(settings: &Settings, pipeline: ScoringPipeline, in_memory: bool) -> anyhow::Result<()> {
    let scorer = pipeline.scorer_name().to_string();
    let app = api::router(api::ApiState::new(pipeline, &settings.api_key));
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    info!(addr = %settings.bind_addr, scorer = %scorer, in_memory, "telematics api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}
