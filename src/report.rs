use std::fmt::Write;

use crate::coaching;
use crate::models::{Driver, DriverScore, Gamification, Premium, Trip};

const RECENT_TRIPS: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripTotals {
    pub count: usize,
    pub distance_km: f64,
    pub harsh_brakes: u64,
    pub speeding_events: u64,
    pub night_share: f64,
}

/// Totals across `trips`; the night share is weighted by distance.
pub fn summarize_trips(trips: &[Trip]) -> TripTotals {
    let mut totals = TripTotals {
        count: trips.len(),
        ..TripTotals::default()
    };
    let mut night_km = 0.0;

    for trip in trips {
        let s = &trip.summary;
        totals.distance_km += s.distance_km;
        totals.harsh_brakes += u64::from(s.harsh_brakes);
        totals.speeding_events += u64::from(s.speeding_events);
        night_km += s.night_ratio * s.distance_km;
    }

    if totals.distance_km > 0.0 {
        totals.night_share = night_km / totals.distance_km;
    }
    totals
}

pub fn build_driver_report(
    driver: &Driver,
    score: Option<&DriverScore>,
    premium: Option<&Premium>,
    gamification: &Gamification,
    trips: &[Trip],
) -> String {
    let totals = summarize_trips(trips);
    let mut output = String::new();

    let _ = writeln!(output, "# Driver Risk Report: {}", driver.name);
    let _ = writeln!(
        output,
        "Driver {} ({}), base rate ${:.2}/month",
        driver.id, driver.vehicle, driver.base_rate
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Summary");

    match score {
        None => {
            let _ = writeln!(output, "No score computed yet.");
        }
        Some(score) => {
            let _ = writeln!(
                output,
                "- Risk score {:.2} (updated {})",
                score.score,
                score.updated_at.format("%Y-%m-%d %H:%M UTC")
            );
            let _ = writeln!(
                output,
                "- {} trips, {:.1} km, {} harsh brakes, {} speeding events, {:.0}% night",
                totals.count,
                totals.distance_km,
                totals.harsh_brakes,
                totals.speeding_events,
                totals.night_share * 100.0
            );
            for (factor, offset) in &score.breakdown.enrichment_offsets {
                let _ = writeln!(output, "- Enrichment {factor}: {offset:+.2}");
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Premium");

    match premium {
        None => {
            let _ = writeln!(output, "No premium computed yet.");
        }
        Some(premium) => {
            let _ = writeln!(
                output,
                "- ${:.2}/month (base ${:.2} x {:.3})",
                premium.monthly_premium,
                premium.breakdown.base_rate,
                premium.breakdown.multiplier
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Why This Score");

    match score.filter(|s| !s.breakdown.trips.is_empty()) {
        None => {
            let _ = writeln!(output, "No scored trips in the window.");
        }
        Some(score) => {
            let _ = writeln!(
                output,
                "| Trip | Score | Km | Speed % | Braking % | Night % | Speeding % |"
            );
            let _ = writeln!(output, "|---|---|---|---|---|---|---|");
            for trip in &score.breakdown.trips {
                let short_id = trip.trip_id.simple().to_string();
                match &trip.breakdown.contributions {
                    Some(c) => {
                        let _ = writeln!(
                            output,
                            "| {} | {:.2} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} |",
                            &short_id[..8],
                            trip.score,
                            trip.distance_km,
                            c.avg_speed_over_60,
                            c.harsh_brakes_per_100km,
                            c.night_ratio,
                            c.speeding_events_per_100km
                        );
                    }
                    None => {
                        let _ = writeln!(
                            output,
                            "| {} | {:.2} | {:.1} | - | - | - | - |",
                            &short_id[..8],
                            trip.score,
                            trip.distance_km
                        );
                    }
                }
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Trips");

    if trips.is_empty() {
        let _ = writeln!(output, "No trips recorded.");
    } else {
        for trip in trips.iter().take(RECENT_TRIPS) {
            let s = &trip.summary;
            let _ = writeln!(
                output,
                "- {}: {:.1} km, avg {:.0} kph, max {:.0} kph, {} harsh brakes, {} speeding",
                s.start_ts.format("%Y-%m-%d %H:%M"),
                s.distance_km,
                s.avg_speed,
                s.max_speed,
                s.harsh_brakes,
                s.speeding_events
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Safe Driving Streak");
    let _ = writeln!(
        output,
        "- {} day streak, {} points",
        gamification.safe_streak_days, gamification.points
    );
    if let Some(last) = gamification.last_safe_date {
        let _ = writeln!(output, "- Last safe day {last}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Coaching");

    match trips.first() {
        None => {
            let _ = writeln!(output, "Drive a trip to get coaching tips.");
        }
        Some(latest) => {
            for hint in coaching::hints_for_trip(&latest.summary) {
                let _ = writeln!(output, "- {hint}");
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DriverBreakdown, Norms, PremiumBreakdown, RuleContributions, ScoredTrip, TripBreakdown,
        TripSummary,
    };
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn driver() -> Driver {
        Driver {
            id: "D001".to_string(),
            name: "Alex Rivera".to_string(),
            base_rate: 120.0,
            vehicle: "Sedan".to_string(),
        }
    }

    fn trip(seq: i64, distance_km: f64, night_ratio: f64, harsh_brakes: u32) -> Trip {
        Trip {
            id: Uuid::new_v4(),
            seq,
            summary: TripSummary {
                driver_id: "D001".to_string(),
                start_ts: Utc.with_ymd_and_hms(2026, 2, seq as u32, 8, 0, 0).unwrap(),
                end_ts: Utc.with_ymd_and_hms(2026, 2, seq as u32, 8, 40, 0).unwrap(),
                distance_km,
                avg_speed: 50.0,
                max_speed: 74.0,
                harsh_brakes,
                night_ratio,
                speeding_events: 1,
                centroid_lat: 33.4,
                centroid_lon: -111.9,
            },
        }
    }

    #[test]
    fn totals_weight_night_share_by_distance() {
        let totals = summarize_trips(&[trip(2, 30.0, 1.0, 2), trip(1, 10.0, 0.0, 1)]);
        assert_eq!(totals.count, 2);
        assert_eq!(totals.distance_km, 40.0);
        assert_eq!(totals.harsh_brakes, 3);
        assert_eq!(totals.speeding_events, 2);
        assert!((totals.night_share - 0.75).abs() < 1e-9);

        assert_eq!(summarize_trips(&[]), TripTotals::default());

        let heavy = summarize_trips(&[
            trip(3, 10.0, 0.0, u32::MAX),
            trip(2, 10.0, 0.0, u32::MAX),
        ]);
        assert_eq!(heavy.harsh_brakes, 2 * u64::from(u32::MAX));
    }

    #[test]
    fn full_report_lists_every_section() {
        let trips = vec![trip(2, 30.0, 0.8, 5), trip(1, 10.0, 0.0, 0)];
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 9, 0, 0).unwrap();
        let mut offsets = BTreeMap::new();
        offsets.insert("weather_risk".to_string(), 3.0);
        let score = DriverScore {
            driver_id: "D001".to_string(),
            score: 21.5,
            breakdown: DriverBreakdown {
                trips: vec![ScoredTrip {
                    trip_id: trips[0].id,
                    score: 24.0,
                    distance_km: 30.0,
                    breakdown: TripBreakdown {
                        model: "rules".to_string(),
                        contributions: Some(RuleContributions {
                            avg_speed_over_60: 0.0,
                            harsh_brakes_per_100km: 25.1,
                            night_ratio: 16.0,
                            speeding_events_per_100km: 3.2,
                        }),
                        norms: Norms {
                            harsh_per_100km: 16.67,
                            speeding_per_100km: 3.33,
                        },
                    },
                }],
                enrichment_offsets: offsets,
                note: None,
            },
            updated_at: now,
        };
        let premium = Premium {
            driver_id: "D001".to_string(),
            monthly_premium: 98.4,
            breakdown: PremiumBreakdown {
                base_rate: 120.0,
                risk_score: 21.5,
                multiplier: 0.972,
            },
            updated_at: now,
        };
        let streak = Gamification {
            safe_streak_days: 0,
            last_safe_date: None,
            points: 15,
        };

        let report = build_driver_report(&driver(), Some(&score), Some(&premium), &streak, &trips);

        assert!(report.starts_with("# Driver Risk Report: Alex Rivera"));
        assert!(report.contains("- Risk score 21.50"));
        assert!(report.contains("- 2 trips, 40.0 km, 5 harsh brakes, 2 speeding events, 60% night"));
        assert!(report.contains("- Enrichment weather_risk: +3.00"));
        assert!(report.contains("- $98.40/month (base $120.00 x 0.972)"));
        assert!(report.contains("| 24.00 | 30.0 | 0.0 | 25.1 | 16.0 | 3.2 |"));
        assert!(report.contains("- 0 day streak, 15 points"));
        assert!(report.contains(coaching::BRAKING_HINT));
        assert!(report.contains(coaching::NIGHT_HINT));
    }

    #[test]
    fn empty_driver_report_has_placeholders() {
        let report = build_driver_report(&driver(), None, None, &Gamification::default(), &[]);
        assert!(report.contains("No score computed yet."));
        assert!(report.contains("No premium computed yet."));
        assert!(report.contains("No scored trips in the window."));
        assert!(report.contains("No trips recorded."));
        assert!(report.contains("Drive a trip to get coaching tips."));
    }
}
