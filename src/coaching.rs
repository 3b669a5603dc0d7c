use chrono::Timelike;

use crate::features::{is_night_hour, HARSH_BRAKE_MPS2};
use crate::models::{TelemetryPoint, TripSummary};

const COACH_SPEED_KPH: f64 = 75.0;
const MAX_SPEEDING: usize = 5;
const MAX_HARD_BRAKES: usize = 3;
const MAX_NIGHT_SHARE: f64 = 0.5;

pub const SPEEDING_HINT: &str =
    "You're frequently over the limit. Ease off to reduce risk and premium.";
pub const BRAKING_HINT: &str =
    "Lots of hard braking. Leave more following distance and plan earlier.";
pub const NIGHT_HINT: &str =
    "High share of night driving. Consider avoiding late hours when possible.";
pub const SMOOTH_HINT: &str = "Nice work, smooth driving detected.";

fn hints_from_counts(speeding: usize, hard_brakes: usize, night_share: f64) -> Vec<String> {
    let mut hints = Vec::new();
    if speeding > MAX_SPEEDING {
        hints.push(SPEEDING_HINT.to_string());
    }
    if hard_brakes > MAX_HARD_BRAKES {
        hints.push(BRAKING_HINT.to_string());
    }
    if night_share > MAX_NIGHT_SHARE {
        hints.push(NIGHT_HINT.to_string());
    }
    if hints.is_empty() {
        hints.push(SMOOTH_HINT.to_string());
    }
    hints
}

/// Coaching hints for a raw telemetry batch. Empty input yields no hints.
pub fn hints_for_points(points: &[TelemetryPoint]) -> Vec<String> {
    if points.is_empty() {
        return Vec::new();
    }
    let speeding = points.iter().filter(|p| p.speed_kph > COACH_SPEED_KPH).count();
    let hard = points
        .iter()
        .filter(|p| p.accel_mps2 < HARSH_BRAKE_MPS2)
        .count();
    let night = points.iter().filter(|p| is_night_hour(p.ts.hour())).count();
    hints_from_counts(speeding, hard, night as f64 / points.len() as f64)
}

/// Coaching hints for a stored trip, where only the summary survives.
pub fn hints_for_trip(trip: &TripSummary) -> Vec<String> {
    hints_from_counts(
        trip.speeding_events as usize,
        trip.harsh_brakes as usize,
        trip.night_ratio,
    )
}
