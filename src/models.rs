use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timestamp;

#[derive(Debug, Clone, Serialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub base_rate: f64,
    pub vehicle: String,
}

/// One raw telemetry sample as posted by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    #[serde(with = "timestamp::fixed")]
    pub ts: DateTime<FixedOffset>,
    pub speed_kph: f64,
    pub accel_mps2: f64,
    pub lat: f64,
    pub lon: f64,
}

/// Summary of a single trip, either posted directly or derived from points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripSummary {
    pub driver_id: String,
    #[serde(with = "timestamp::utc")]
    pub start_ts: DateTime<Utc>,
    #[serde(with = "timestamp::utc")]
    pub end_ts: DateTime<Utc>,
    pub distance_km: f64,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub harsh_brakes: u32,
    pub night_ratio: f64,
    pub speeding_events: u32,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
}

impl TripSummary {
    pub fn features(&self) -> TripFeatures {
        TripFeatures {
            distance_km: self.distance_km,
            avg_speed: self.avg_speed,
            max_speed: self.max_speed,
            harsh_brakes: self.harsh_brakes,
            night_ratio: self.night_ratio,
            speeding_events: self.speeding_events,
        }
    }
}

/// A persisted trip. `seq` orders trips by ingestion.
#[derive(Debug, Clone)]
pub struct Trip {
    pub id: Uuid,
    pub seq: i64,
    pub summary: TripSummary,
}

impl Trip {
    pub fn to_view(&self) -> TripView {
        let s = &self.summary;
        TripView {
            id: self.id,
            start_ts: s.start_ts,
            end_ts: s.end_ts,
            distance_km: s.distance_km,
            avg_speed: s.avg_speed,
            max_speed: s.max_speed,
            harsh_brakes: s.harsh_brakes,
            night_ratio: s.night_ratio,
            speeding_events: s.speeding_events,
            centroid: [s.centroid_lat, s.centroid_lon],
            score: None,
        }
    }
}

/// API shape of a trip; the centroid is reported as `[lat, lon]`.
#[derive(Debug, Clone, Serialize)]
pub struct TripView {
    pub id: Uuid,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub distance_km: f64,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub harsh_brakes: u32,
    pub night_ratio: f64,
    pub speeding_events: u32,
    pub centroid: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// The six numbers both scorers consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TripFeatures {
    pub distance_km: f64,
    pub avg_speed: f64,
    pub max_speed: f64,
    pub harsh_brakes: u32,
    pub night_ratio: f64,
    pub speeding_events: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Norms {
    pub harsh_per_100km: f64,
    pub speeding_per_100km: f64,
}

/// Rule contributions, each scaled to percent of its weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuleContributions {
    pub avg_speed_over_60: f64,
    pub harsh_brakes_per_100km: f64,
    pub night_ratio: f64,
    pub speeding_events_per_100km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripBreakdown {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributions: Option<RuleContributions>,
    pub norms: Norms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripScore {
    pub score: f64,
    pub breakdown: TripBreakdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTrip {
    pub trip_id: Uuid,
    pub score: f64,
    pub distance_km: f64,
    pub breakdown: TripBreakdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverBreakdown {
    pub trips: Vec<ScoredTrip>,
    pub enrichment_offsets: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverScore {
    pub driver_id: String,
    pub score: f64,
    pub breakdown: DriverBreakdown,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PremiumBreakdown {
    pub base_rate: f64,
    pub risk_score: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Premium {
    pub driver_id: String,
    pub monthly_premium: f64,
    pub breakdown: PremiumBreakdown,
    pub updated_at: DateTime<Utc>,
}

/// Externally supplied risk factors, applied as additive score offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub vehicle_risk: f64,
    pub driver_history_risk: f64,
    pub local_crime_index: f64,
    pub local_crash_rate: f64,
    pub weather_risk: f64,
}

/// Partial enrichment update; absent or null fields keep their stored value.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EnrichmentUpdate {
    pub vehicle_risk: Option<f64>,
    pub driver_history_risk: Option<f64>,
    pub local_crime_index: Option<f64>,
    pub local_crash_rate: Option<f64>,
    pub weather_risk: Option<f64>,
}

impl Enrichment {
    pub fn merged(mut self, update: &EnrichmentUpdate) -> Self {
        let fields = [
            (&mut self.vehicle_risk, update.vehicle_risk),
            (&mut self.driver_history_risk, update.driver_history_risk),
            (&mut self.local_crime_index, update.local_crime_index),
            (&mut self.local_crash_rate, update.local_crash_rate),
            (&mut self.weather_risk, update.weather_risk),
        ];
        for (slot, value) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
        self
    }

    pub fn factors(&self) -> [(&'static str, f64); 5] {
        [
            ("vehicle_risk", self.vehicle_risk),
            ("driver_history_risk", self.driver_history_risk),
            ("local_crime_index", self.local_crime_index),
            ("local_crash_rate", self.local_crash_rate),
            ("weather_risk", self.weather_risk),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gamification {
    pub safe_streak_days: u32,
    pub last_safe_date: Option<NaiveDate>,
    pub points: u32,
}

/// Everything one ingestion writes, persisted atomically.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub trip_id: Uuid,
    pub summary: TripSummary,
    pub source_key: Option<String>,
    pub trip_score: TripScore,
    pub rescored: RescoreRecord,
}

/// A recomputed driver score with its premium and gamification state.
#[derive(Debug, Clone)]
pub struct RescoreRecord {
    pub driver_score: DriverScore,
    pub premium: Premium,
    pub gamification: Gamification,
}
