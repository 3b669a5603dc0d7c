use chrono::{Timelike, Utc};

use crate::error::{Result, TelematicsError};
use crate::models::{Norms, TelemetryPoint, TripFeatures, TripSummary};

pub const HARSH_BRAKE_MPS2: f64 = -3.5;
pub const SPEED_LIMIT_KPH: f64 = 70.0;
const MIN_DISTANCE_KM: f64 = 0.1;
/// Event counts are stored as Postgres INTEGER.
pub const MAX_EVENT_COUNT: u32 = i32::MAX as u32;

pub fn is_night_hour(hour: u32) -> bool {
    hour < 6 || hour >= 22
}

/// Collapses a batch of raw points into a trip summary.
pub fn summarize_telemetry(driver_id: &str, points: &[TelemetryPoint]) -> Result<TripSummary> {
    if driver_id.trim().is_empty() {
        return Err(TelematicsError::validation("driver_id must not be empty"));
    }
    if points.len() < 2 {
        return Err(TelematicsError::validation("need at least 2 points"));
    }
    for (idx, point) in points.iter().enumerate() {
        validate_point(idx, point)?;
    }

    let mut sorted: Vec<&TelemetryPoint> = points.iter().collect();
    sorted.sort_by_key(|p| p.ts);

    let distance_km = sorted
        .windows(2)
        .map(|pair| {
            let hours = (pair[1].ts - pair[0].ts).num_milliseconds() as f64 / 3_600_000.0;
            pair[0].speed_kph * hours
        })
        .sum::<f64>();

    let n = points.len() as f64;
    let avg_speed = points.iter().map(|p| p.speed_kph).sum::<f64>() / n;
    let max_speed = points.iter().map(|p| p.speed_kph).fold(0.0, f64::max);
    let harsh_brakes = points
        .iter()
        .filter(|p| p.accel_mps2 < HARSH_BRAKE_MPS2)
        .count() as u32;
    let night_points = points.iter().filter(|p| is_night_hour(p.ts.hour())).count();
    let speeding_events = points
        .iter()
        .filter(|p| p.speed_kph > SPEED_LIMIT_KPH)
        .count() as u32;

    Ok(TripSummary {
        driver_id: driver_id.to_string(),
        start_ts: sorted[0].ts.with_timezone(&Utc),
        end_ts: sorted[sorted.len() - 1].ts.with_timezone(&Utc),
        distance_km,
        avg_speed,
        max_speed,
        harsh_brakes,
        night_ratio: night_points as f64 / n,
        speeding_events,
        centroid_lat: points.iter().map(|p| p.lat).sum::<f64>() / n,
        centroid_lon: points.iter().map(|p| p.lon).sum::<f64>() / n,
    })
}

fn validate_point(idx: usize, point: &TelemetryPoint) -> Result<()> {
    if !point.speed_kph.is_finite() || point.speed_kph < 0.0 {
        return Err(TelematicsError::validation(format!(
            "point {idx}: speed_kph must be a non-negative number"
        )));
    }
    if !point.accel_mps2.is_finite() {
        return Err(TelematicsError::validation(format!(
            "point {idx}: accel_mps2 must be finite"
        )));
    }
    if !(-90.0..=90.0).contains(&point.lat) || !(-180.0..=180.0).contains(&point.lon) {
        return Err(TelematicsError::validation(format!(
            "point {idx}: coordinates out of range"
        )));
    }
    Ok(())
}

/// Checks a posted trip summary before it enters the pipeline.
pub fn validate_summary(trip: &TripSummary) -> Result<()> {
    if trip.driver_id.trim().is_empty() {
        return Err(TelematicsError::validation("driver_id must not be empty"));
    }
    let non_negative = [
        ("distance_km", trip.distance_km),
        ("avg_speed", trip.avg_speed),
        ("max_speed", trip.max_speed),
    ];
    for (name, value) in non_negative {
        if !value.is_finite() || value < 0.0 {
            return Err(TelematicsError::validation(format!(
                "{name} must be a non-negative number"
            )));
        }
    }
    if !(0.0..=1.0).contains(&trip.night_ratio) {
        return Err(TelematicsError::validation("night_ratio must be within [0, 1]"));
    }
    for (name, count) in [
        ("harsh_brakes", trip.harsh_brakes),
        ("speeding_events", trip.speeding_events),
    ] {
        if count > MAX_EVENT_COUNT {
            return Err(TelematicsError::validation(format!(
                "{name} must be at most {MAX_EVENT_COUNT}"
            )));
        }
    }
    if !trip.centroid_lat.is_finite() || !trip.centroid_lon.is_finite() {
        return Err(TelematicsError::validation("centroid must be finite"));
    }
    if trip.end_ts < trip.start_ts {
        return Err(TelematicsError::validation("end_ts precedes start_ts"));
    }
    Ok(())
}

/// Per-100km rates plus the clamped night share, shared by both scorers.
pub fn normalize(f: &TripFeatures) -> (Norms, f64) {
    let dist = f.distance_km.max(MIN_DISTANCE_KM);
    let norms = Norms {
        harsh_per_100km: 100.0 * f.harsh_brakes as f64 / dist,
        speeding_per_100km: 100.0 * f.speeding_events as f64 / dist,
    };
    (norms, f.night_ratio.clamp(0.0, 1.0))
}

/// Distance used for weighting, floored so zero-length trips still count.
pub fn weight_distance(distance_km: f64) -> f64 {
    distance_km.max(MIN_DISTANCE_KM)
}
