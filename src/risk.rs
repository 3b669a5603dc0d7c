use std::collections::BTreeMap;

use crate::features::{normalize, weight_distance};
use crate::models::{
    DriverBreakdown, Enrichment, Norms, RuleContributions, ScoredTrip, Trip, TripBreakdown,
    TripFeatures, TripScore,
};

/// Scores a single trip on a 0-100 risk scale.
pub trait TripScorer: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, features: &TripFeatures) -> TripScore;
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Closed-form weighted sum over speed, braking, night and speeding terms.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleScorer;

impl TripScorer for RuleScorer {
    fn name(&self) -> &str {
        "rules"
    }

    fn score(&self, f: &TripFeatures) -> TripScore {
        let (norms, night) = normalize(f);

        let c_speed = 0.25 * ((f.avg_speed - 60.0).max(0.0) / 40.0).clamp(0.0, 1.0)
            + 0.35 * ((f.max_speed - 80.0).max(0.0) / 40.0).clamp(0.0, 1.0);
        let c_brake = 0.30 * sigmoid((norms.harsh_per_100km - 6.0) / 2.0);
        let c_night = 0.20 * night;
        let c_speeding = 0.35 * sigmoid((norms.speeding_per_100km - 5.0) / 2.0);

        let linear = 30.0 * c_speed + 25.0 * c_brake + 20.0 * c_night + 25.0 * c_speeding;

        TripScore {
            score: linear.clamp(0.0, 100.0),
            breakdown: TripBreakdown {
                model: self.name().to_string(),
                contributions: Some(RuleContributions {
                    avg_speed_over_60: round_to(c_speed * 100.0, 1),
                    harsh_brakes_per_100km: round_to(c_brake * 100.0, 1),
                    night_ratio: round_to(c_night * 100.0, 1),
                    speeding_events_per_100km: round_to(c_speeding * 100.0, 1),
                }),
                norms: rounded(norms),
            },
        }
    }
}

pub(crate) fn rounded(norms: Norms) -> Norms {
    Norms {
        harsh_per_100km: round_to(norms.harsh_per_100km, 2),
        speeding_per_100km: round_to(norms.speeding_per_100km, 2),
    }
}

/// Score points added per unit of each enrichment factor.
pub fn enrichment_weight(factor: &str) -> f64 {
    match factor {
        "vehicle_risk" => 5.0,
        "driver_history_risk" => 7.0,
        "local_crime_index" => 3.0,
        "local_crash_rate" => 4.0,
        "weather_risk" => 6.0,
        _ => 0.0,
    }
}

/// Adds weighted enrichment offsets to a score. Only non-zero factors are
/// recorded. The result is clamped to 0-100.
pub fn apply_enrichment_offsets(
    score: f64,
    enrichment: &Enrichment,
) -> (f64, BTreeMap<String, f64>) {
    let mut adjusted = score;
    let mut offsets = BTreeMap::new();

    for (factor, value) in enrichment.factors() {
        if value != 0.0 {
            let offset = enrichment_weight(factor) * value;
            adjusted += offset;
            offsets.insert(factor.to_string(), round_to(offset, 2));
        }
    }

    (adjusted.clamp(0.0, 100.0), offsets)
}

/// Distance-weighted mean of trip scores plus enrichment offsets.
///
/// `trips` is the scoring window, newest first. An empty window scores 0
/// without applying enrichment.
pub fn aggregate_driver_score(
    scorer: &dyn TripScorer,
    trips: &[Trip],
    enrichment: &Enrichment,
) -> (f64, DriverBreakdown) {
    if trips.is_empty() {
        return (
            0.0,
            DriverBreakdown {
                note: Some("no trips".to_string()),
                ..DriverBreakdown::default()
            },
        );
    }

    let mut weighted = 0.0;
    let mut total = 0.0;
    let mut scored = Vec::with_capacity(trips.len());

    for trip in trips {
        let trip_score = scorer.score(&trip.summary.features());
        let distance = weight_distance(trip.summary.distance_km);
        weighted += trip_score.score * distance;
        total += distance;
        scored.push(ScoredTrip {
            trip_id: trip.id,
            score: trip_score.score,
            distance_km: distance,
            breakdown: trip_score.breakdown,
        });
    }

    let overall = weighted / weight_distance(total);
    let (adjusted, enrichment_offsets) = apply_enrichment_offsets(overall, enrichment);

    (
        round_to(adjusted, 2),
        DriverBreakdown {
            trips: scored,
            enrichment_offsets,
            note: None,
        },
    )
}
