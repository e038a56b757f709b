use std::cmp::Ordering;

use uuid::Uuid;

use crate::models::assignment::DispatchCandidateScore;

const DISTANCE_WEIGHT: f64 = 1.0;
/// Each order a driver already holds costs as much as 5 km of extra travel.
const WORKLOAD_PENALTY: f64 = 5.0;
const RATING_WEIGHT: f64 = 2.0;
const MAX_RATING: f64 = 5.0;

/// Composite dispatch cost. Lower is better.
pub fn score(distance_km: f64, active_order_count: usize, rating: f64) -> f64 {
    (distance_km.max(0.0) * DISTANCE_WEIGHT)
        + (active_order_count as f64 * WORKLOAD_PENALTY)
        + (rating_gap(rating) * RATING_WEIGHT)
}

fn rating_gap(rating: f64) -> f64 {
    if rating.is_nan() {
        return MAX_RATING;
    }
    MAX_RATING - rating.clamp(0.0, MAX_RATING)
}

pub fn score_candidate(
    driver_id: Uuid,
    distance_km: f64,
    active_order_count: usize,
    rating: f64,
    eta_minutes: u32,
) -> DispatchCandidateScore {
    DispatchCandidateScore {
        driver_id,
        distance_km,
        active_order_count,
        rating,
        score: score(distance_km, active_order_count, rating),
        eta_minutes,
    }
}

/// Best first: ascending score, then distance, then driver id.
pub fn rank(mut candidates: Vec<DispatchCandidateScore>) -> Vec<DispatchCandidateScore> {
    candidates.sort_by(compare);
    candidates
}

fn compare(a: &DispatchCandidateScore, b: &DispatchCandidateScore) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.distance_km.total_cmp(&b.distance_km))
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}
