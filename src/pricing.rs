use crate::error::{Result, TelematicsError};
use crate::models::PremiumBreakdown;
use crate::risk::round_to;

/// Piecewise-linear premium multiplier: 0.8-1.0 up to a score of 25,
/// 1.0-1.4 up to 85, then 1.4-1.6 at 100.
pub fn premium_multiplier(score: f64) -> f64 {
    if score <= 25.0 {
        0.8 + 0.2 * (score / 25.0)
    } else if score >= 85.0 {
        1.4 + 0.2 * ((score - 85.0) / 15.0)
    } else {
        1.0 + 0.4 * ((score - 25.0) / 60.0)
    }
}

/// Monthly premium for a driver with `base_rate` and risk `score`.
pub fn premium_from_score(base_rate: f64, score: f64) -> Result<(f64, PremiumBreakdown)> {
    if !base_rate.is_finite() || base_rate < 0.0 {
        return Err(TelematicsError::validation(format!(
            "base rate must be a non-negative number, got {base_rate}"
        )));
    }
    if !score.is_finite() {
        return Err(TelematicsError::validation("risk score must be finite"));
    }

    let multiplier = premium_multiplier(score);
    let premium = round_to(base_rate * multiplier, 2);
    Ok((
        premium,
        PremiumBreakdown {
            base_rate: round_to(base_rate, 2),
            risk_score: round_to(score, 2),
            multiplier: round_to(multiplier, 3),
        },
    ))
}
