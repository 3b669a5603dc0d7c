use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::{
    Driver, DriverScore, Enrichment, EnrichmentUpdate, Gamification, IngestRecord, Premium,
    RescoreRecord, Trip, TripScore,
};

/// Persistence for drivers, trips and the derived score rows.
#[async_trait]
pub trait TelematicsStore: Send + Sync {
    async fn get_driver(&self, driver_id: &str) -> Result<Option<Driver>>;

    /// Inserts `driver` with zeroed enrichment and gamification rows unless a
    /// driver with that id exists. Returns the stored driver either way.
    async fn ensure_driver(&self, driver: &Driver) -> Result<Driver>;

    /// Most recently ingested trips first.
    async fn recent_trips(&self, driver_id: &str, limit: usize) -> Result<Vec<Trip>>;

    /// Trips ordered by start time, latest first.
    async fn trips_by_start(&self, driver_id: &str, limit: usize) -> Result<Vec<Trip>>;

    async fn trip_score(&self, trip_id: Uuid) -> Result<Option<TripScore>>;

    async fn enrichment(&self, driver_id: &str) -> Result<Enrichment>;

    /// Merges the non-null fields of `update` and returns the stored row.
    async fn update_enrichment(&self, driver_id: &str, update: &EnrichmentUpdate)
        -> Result<Enrichment>;

    async fn gamification(&self, driver_id: &str) -> Result<Gamification>;

    async fn driver_score(&self, driver_id: &str) -> Result<Option<DriverScore>>;

    async fn premium(&self, driver_id: &str) -> Result<Option<Premium>>;

    /// Highest stored driver scores first.
    async fn top_driver_scores(&self, limit: usize) -> Result<Vec<DriverScore>>;

    /// Writes the trip, its score and the recomputed driver rows atomically.
    /// Returns `None` without writing when the source key was seen before.
    async fn record_ingest(&self, record: &IngestRecord) -> Result<Option<Trip>>;

    async fn record_rescore(&self, record: &RescoreRecord) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    drivers: HashMap<String, Driver>,
    trips: Vec<Trip>,
    source_keys: HashSet<String>,
    trip_scores: HashMap<Uuid, TripScore>,
    driver_scores: HashMap<String, DriverScore>,
    premiums: HashMap<String, Premium>,
    enrichment: HashMap<String, Enrichment>,
    gamification: HashMap<String, Gamification>,
    next_seq: i64,
}

impl Tables {
    fn apply_rescore(&mut self, record: &RescoreRecord) {
        let driver_id = record.driver_score.driver_id.clone();
        self.driver_scores
            .insert(driver_id.clone(), record.driver_score.clone());
        self.premiums.insert(driver_id.clone(), record.premium.clone());
        self.gamification
            .insert(driver_id, record.gamification.clone());
    }
}

/// Process-local store used by `serve --in-memory` and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelematicsStore for MemoryStore {
    async fn get_driver(&self, driver_id: &str) -> Result<Option<Driver>> {
        Ok(self.tables.read().drivers.get(driver_id).cloned())
    }

    async fn ensure_driver(&self, driver: &Driver) -> Result<Driver> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.drivers.get(&driver.id) {
            return Ok(existing.clone());
        }
        tables.drivers.insert(driver.id.clone(), driver.clone());
        tables.enrichment.entry(driver.id.clone()).or_default();
        tables.gamification.entry(driver.id.clone()).or_default();
        Ok(driver.clone())
    }

    async fn recent_trips(&self, driver_id: &str, limit: usize) -> Result<Vec<Trip>> {
        let tables = self.tables.read();
        let mut trips: Vec<Trip> = tables
            .trips
            .iter()
            .filter(|t| t.summary.driver_id == driver_id)
            .cloned()
            .collect();
        trips.sort_by(|a, b| b.seq.cmp(&a.seq));
        trips.truncate(limit);
        Ok(trips)
    }

    async fn trips_by_start(&self, driver_id: &str, limit: usize) -> Result<Vec<Trip>> {
        let tables = self.tables.read();
        let mut trips: Vec<Trip> = tables
            .trips
            .iter()
            .filter(|t| t.summary.driver_id == driver_id)
            .cloned()
            .collect();
        trips.sort_by(|a, b| {
            b.summary
                .start_ts
                .cmp(&a.summary.start_ts)
                .then(b.seq.cmp(&a.seq))
        });
        trips.truncate(limit);
        Ok(trips)
    }

    async fn trip_score(&self, trip_id: Uuid) -> Result<Option<TripScore>> {
        Ok(self.tables.read().trip_scores.get(&trip_id).cloned())
    }

    async fn enrichment(&self, driver_id: &str) -> Result<Enrichment> {
        Ok(self
            .tables
            .read()
            .enrichment
            .get(driver_id)
            .copied()
            .unwrap_or_default())
    }

    async fn update_enrichment(
        &self,
        driver_id: &str,
        update: &EnrichmentUpdate,
    ) -> Result<Enrichment> {
        let mut tables = self.tables.write();
        if !tables.drivers.contains_key(driver_id) {
            bail!("unknown driver {driver_id}");
        }
        let slot = tables.enrichment.entry(driver_id.to_string()).or_default();
        *slot = slot.merged(update);
        Ok(*slot)
    }

    async fn gamification(&self, driver_id: &str) -> Result<Gamification> {
        Ok(self
            .tables
            .read()
            .gamification
            .get(driver_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn driver_score(&self, driver_id: &str) -> Result<Option<DriverScore>> {
        Ok(self.tables.read().driver_scores.get(driver_id).cloned())
    }

    async fn premium(&self, driver_id: &str) -> Result<Option<Premium>> {
        Ok(self.tables.read().premiums.get(driver_id).cloned())
    }

    async fn top_driver_scores(&self, limit: usize) -> Result<Vec<DriverScore>> {
        let mut scores: Vec<DriverScore> =
            self.tables.read().driver_scores.values().cloned().collect();
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.driver_id.cmp(&b.driver_id))
        });
        scores.truncate(limit);
        Ok(scores)
    }

    async fn record_ingest(&self, record: &IngestRecord) -> Result<Option<Trip>> {
        let mut tables = self.tables.write();
        if !tables.drivers.contains_key(&record.summary.driver_id) {
            bail!("unknown driver {}", record.summary.driver_id);
        }
        if let Some(key) = &record.source_key {
            if !tables.source_keys.insert(key.clone()) {
                return Ok(None);
            }
        }

        tables.next_seq += 1;
        let trip = Trip {
            id: record.trip_id,
            seq: tables.next_seq,
            summary: record.summary.clone(),
        };
        tables.trips.push(trip.clone());
        tables
            .trip_scores
            .insert(record.trip_id, record.trip_score.clone());
        tables.apply_rescore(&record.rescored);
        Ok(Some(trip))
    }

    async fn record_rescore(&self, record: &RescoreRecord) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.drivers.contains_key(&record.driver_score.driver_id) {
            bail!("unknown driver {}", record.driver_score.driver_id);
        }
        tables.apply_rescore(record);
        Ok(())
    }
}
