use chrono::NaiveDate;

use crate::models::Gamification;

pub const SAFE_SCORE_THRESHOLD: f64 = 20.0;
pub const POINTS_PER_SAFE_DAY: u32 = 5;

/// Applies a fresh driver score to the streak record.
///
/// A safe score counts once per calendar day. Any unsafe score breaks the
/// streak but keeps accumulated points.
pub fn update_on_score(current: &Gamification, score: f64, today: NaiveDate) -> Gamification {
    let mut next = current.clone();
    if score <= SAFE_SCORE_THRESHOLD {
        if next.last_safe_date != Some(today) {
            next.safe_streak_days += 1;
            next.last_safe_date = Some(today);
            next.points += POINTS_PER_SAFE_DAY;
        }
    } else {
        next.safe_streak_days = 0;
    }
    next
}
