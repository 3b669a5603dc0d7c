use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::models::{Driver, TripSummary};
use crate::pipeline::ScoringPipeline;
use crate::timestamp;

/// Loads three demo drivers with a handful of fixed trips. Safe to re-run:
/// trips carry `seed-*` source keys. Returns the number of trips inserted.
pub async fn seed(pipeline: &ScoringPipeline) -> anyhow::Result<usize> {
    let drivers = [
        ("D001", "Alex Rivera", 120.0, "Sedan"),
        ("D002", "Sam Chen", 140.0, "SUV"),
        ("D003", "Priya Nair", 95.0, "Hatchback"),
    ];

    for (id, name, base_rate, vehicle) in drivers {
        pipeline
            .register_driver(&Driver {
                id: id.to_string(),
                name: name.to_string(),
                base_rate,
                vehicle: vehicle.to_string(),
            })
            .await?;
    }

    // (key, driver, start, end, km, avg, max, harsh, night, speeding, lat, lon)
    let trips = [
        ("seed-001", "D001", "2026-01-26T07:45:00Z", "2026-01-26T08:20:00Z", 24.5, 46.0, 72.0, 0, 0.0, 0, 33.4255, -111.9400),
        ("seed-002", "D001", "2026-01-27T17:30:00Z", "2026-01-27T18:05:00Z", 21.0, 41.5, 68.0, 1, 0.0, 0, 33.4152, -111.8315),
        ("seed-003", "D001", "2026-01-28T12:10:00Z", "2026-01-28T12:40:00Z", 18.2, 39.0, 64.0, 0, 0.0, 1, 33.4484, -112.0740),
        ("seed-004", "D002", "2026-01-26T22:15:00Z", "2026-01-26T23:05:00Z", 42.0, 63.0, 104.0, 4, 0.8, 6, 33.3062, -111.8413),
        ("seed-005", "D002", "2026-01-27T23:40:00Z", "2026-01-28T00:25:00Z", 35.5, 58.0, 97.0, 3, 1.0, 5, 33.3528, -111.7890),
        ("seed-006", "D002", "2026-01-29T08:00:00Z", "2026-01-29T08:50:00Z", 51.0, 66.0, 112.0, 5, 0.0, 8, 33.4942, -111.9261),
        ("seed-007", "D003", "2026-01-26T09:30:00Z", "2026-01-26T09:55:00Z", 12.4, 34.0, 58.0, 0, 0.0, 0, 33.5722, -112.0880),
        ("seed-008", "D003", "2026-01-28T14:00:00Z", "2026-01-28T14:45:00Z", 29.8, 44.0, 71.0, 1, 0.0, 1, 33.6054, -111.9779),
    ];

    let mut inserted = 0usize;
    for (key, driver_id, start, end, km, avg, max, harsh, night, speeding, lat, lon) in trips {
        let summary = TripSummary {
            driver_id: driver_id.to_string(),
            start_ts: utc(start)?,
            end_ts: utc(end)?,
            distance_km: km,
            avg_speed: avg,
            max_speed: max,
            harsh_brakes: harsh,
            night_ratio: night,
            speeding_events: speeding,
            centroid_lat: lat,
            centroid_lon: lon,
        };
        if pipeline
            .ingest_trip(summary, Some(key.to_string()))
            .await?
            .is_some()
        {
            inserted += 1;
        }
    }

    Ok(inserted)
}

fn utc(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let ts = timestamp::parse(raw).map_err(anyhow::Error::msg)?;
    Ok(ts.with_timezone(&Utc))
}

/// Imports trip summaries from a CSV file. Rows whose `source_key` was seen
/// before are skipped; the return value counts inserted trips only.
pub async fn import_csv(pipeline: &ScoringPipeline, csv_path: &Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        driver_id: String,
        #[serde(with = "timestamp::utc")]
        start_ts: DateTime<Utc>,
        #[serde(with = "timestamp::utc")]
        end_ts: DateTime<Utc>,
        distance_km: f64,
        avg_speed: f64,
        max_speed: f64,
        harsh_brakes: u32,
        night_ratio: f64,
        speeding_events: u32,
        centroid_lat: f64,
        centroid_lon: f64,
        #[serde(default)]
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (idx, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = idx + 2;
        let row = result.with_context(|| format!("malformed row on line {line}"))?;
        let summary = TripSummary {
            driver_id: row.driver_id,
            start_ts: row.start_ts,
            end_ts: row.end_ts,
            distance_km: row.distance_km,
            avg_speed: row.avg_speed,
            max_speed: row.max_speed,
            harsh_brakes: row.harsh_brakes,
            night_ratio: row.night_ratio,
            speeding_events: row.speeding_events,
            centroid_lat: row.centroid_lat,
            centroid_lon: row.centroid_lon,
        };
        let source_key = row.source_key.filter(|key| !key.trim().is_empty());

        let outcome = pipeline
            .ingest_trip(summary, source_key)
            .await
            .with_context(|| format!("failed to ingest row on line {line}"))?;
        if outcome.is_some() {
            inserted += 1;
        }
    }

    Ok(inserted)
}
