use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::coaching;
use crate::config::Settings;
use crate::error::{Result, TelematicsError};
use crate::features::{summarize_telemetry, validate_summary};
use crate::gamification;
use crate::models::{
    Driver, DriverScore, Enrichment, EnrichmentUpdate, Gamification, IngestRecord, Premium,
    RescoreRecord, TelemetryPoint, Trip, TripSummary,
};
use crate::pricing::premium_from_score;
use crate::risk::{aggregate_driver_score, TripScorer};
use crate::store::TelematicsStore;

pub const DEMO_DRIVER_NAME: &str = "Demo Driver";
pub const DEMO_VEHICLE: &str = "Sedan";

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub trip_id: Uuid,
    pub trip_score: f64,
    pub driver_score: f64,
    pub monthly_premium: f64,
}

/// Runs trips through scoring, aggregation, enrichment and pricing, then
/// hands the results to the store.
#[derive(Clone)]
pub struct ScoringPipeline {
    store: Arc<dyn TelematicsStore>,
    scorer: Arc<dyn TripScorer>,
    default_base_rate: f64,
    history_limit: usize,
}

impl ScoringPipeline {
    pub fn new(
        store: Arc<dyn TelematicsStore>,
        scorer: Arc<dyn TripScorer>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            scorer,
            default_base_rate: settings.default_base_rate,
            history_limit: settings.history_limit.max(1),
        }
    }

    pub fn store(&self) -> &dyn TelematicsStore {
        self.store.as_ref()
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    fn demo_driver(&self, driver_id: &str) -> Driver {
        Driver {
            id: driver_id.to_string(),
            name: DEMO_DRIVER_NAME.to_string(),
            base_rate: self.default_base_rate,
            vehicle: DEMO_VEHICLE.to_string(),
        }
    }

    /// Creates `driver` unless it already exists.
    pub async fn register_driver(&self, driver: &Driver) -> Result<Driver> {
        if driver.id.trim().is_empty() {
            return Err(TelematicsError::validation("driver id must not be empty"));
        }
        if !driver.base_rate.is_finite() || driver.base_rate < 0.0 {
            return Err(TelematicsError::validation("base rate must be non-negative"));
        }
        Ok(self.store.ensure_driver(driver).await?)
    }

    /// Scores and stores one trip. Returns `None` when `source_key` was
    /// already ingested.
    pub async fn ingest_trip(
        &self,
        summary: TripSummary,
        source_key: Option<String>,
    ) -> Result<Option<IngestOutcome>> {
        validate_summary(&summary)?;
        let driver = self
            .store
            .ensure_driver(&self.demo_driver(&summary.driver_id))
            .await?;

        let trip_id = Uuid::new_v4();
        let trip_score = self.scorer.score(&summary.features());

        let mut window = self
            .store
            .recent_trips(&driver.id, self.history_limit - 1)
            .await?;
        let next_seq = window.first().map_or(1, |t| t.seq + 1);
        window.insert(
            0,
            Trip {
                id: trip_id,
                seq: next_seq,
                summary: summary.clone(),
            },
        );

        let enrichment = self.store.enrichment(&driver.id).await?;
        let streak = self.store.gamification(&driver.id).await?;
        let rescored = self.rescore(&driver, &window, &enrichment, &streak, Utc::now())?;

        let outcome = IngestOutcome {
            trip_id,
            trip_score: trip_score.score,
            driver_score: rescored.driver_score.score,
            monthly_premium: rescored.premium.monthly_premium,
        };
        let record = IngestRecord {
            trip_id,
            summary,
            source_key,
            trip_score,
            rescored,
        };

        if self.store.record_ingest(&record).await?.is_none() {
            debug!(
                driver_id = %driver.id,
                source_key = ?record.source_key,
                "duplicate source key, trip skipped"
            );
            return Ok(None);
        }

        info!(
            driver_id = %driver.id,
            trip_id = %trip_id,
            trip_score = outcome.trip_score,
            driver_score = outcome.driver_score,
            monthly_premium = outcome.monthly_premium,
            scorer = self.scorer.name(),
            "trip ingested"
        );
        Ok(Some(outcome))
    }

    /// Summarises raw points into a trip, ingests it and returns coaching hints.
    pub async fn ingest_telemetry(
        &self,
        driver_id: &str,
        points: &[TelemetryPoint],
    ) -> Result<(IngestOutcome, Vec<String>)> {
        let summary = summarize_telemetry(driver_id, points)?;
        let outcome = self
            .ingest_trip(summary, None)
            .await?
            .ok_or_else(|| TelematicsError::Storage(anyhow!("telemetry trip was not recorded")))?;
        Ok((outcome, coaching::hints_for_points(points)))
    }

    /// Merges enrichment factors for a driver. Scores are not recomputed
    /// until the next trip or an explicit rescore.
    pub async fn set_enrichment(
        &self,
        driver_id: &str,
        update: &EnrichmentUpdate,
    ) -> Result<Enrichment> {
        if driver_id.trim().is_empty() {
            return Err(TelematicsError::validation("driver id must not be empty"));
        }
        let values = [
            update.vehicle_risk,
            update.driver_history_risk,
            update.local_crime_index,
            update.local_crash_rate,
            update.weather_risk,
        ];
        if values.iter().flatten().any(|v| !v.is_finite()) {
            return Err(TelematicsError::validation("enrichment values must be finite"));
        }

        self.store
            .ensure_driver(&self.demo_driver(driver_id))
            .await?;
        let enrichment = self.store.update_enrichment(driver_id, update).await?;
        info!(driver_id, ?enrichment, "enrichment updated");
        Ok(enrichment)
    }

    /// Recomputes a driver's score, premium and streak from stored trips.
    pub async fn rescore_driver(&self, driver_id: &str) -> Result<RescoreRecord> {
        let driver = self
            .store
            .get_driver(driver_id)
            .await?
            .ok_or_else(|| TelematicsError::NotFound(format!("unknown driver {driver_id}")))?;
        let window = self.store.recent_trips(driver_id, self.history_limit).await?;
        if window.is_empty() {
            return Err(TelematicsError::NotFound(format!(
                "no trips for driver {driver_id}"
            )));
        }

        let enrichment = self.store.enrichment(driver_id).await?;
        let streak = self.store.gamification(driver_id).await?;
        let record = self.rescore(&driver, &window, &enrichment, &streak, Utc::now())?;
        self.store.record_rescore(&record).await?;

        info!(
            driver_id,
            driver_score = record.driver_score.score,
            monthly_premium = record.premium.monthly_premium,
            trips = window.len(),
            "driver rescored"
        );
        Ok(record)
    }

    fn rescore(
        &self,
        driver: &Driver,
        window: &[Trip],
        enrichment: &Enrichment,
        streak: &Gamification,
        now: DateTime<Utc>,
    ) -> Result<RescoreRecord> {
        let (score, breakdown) = aggregate_driver_score(self.scorer.as_ref(), window, enrichment);
        let (monthly_premium, premium_breakdown) = premium_from_score(driver.base_rate, score)?;

        Ok(RescoreRecord {
            driver_score: DriverScore {
                driver_id: driver.id.clone(),
                score,
                breakdown,
                updated_at: now,
            },
            premium: Premium {
                driver_id: driver.id.clone(),
                monthly_premium,
                breakdown: premium_breakdown,
                updated_at: now,
            },
            gamification: gamification::update_on_score(streak, score, now.date_naive()),
        })
    }
}
