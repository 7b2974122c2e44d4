//! Distance to blink-interval mapping
//!
//! Buckets are half-open on the upper bound:
//! `[0, 5) -> 200ms`, `[5, 10) -> 500ms`, `[10, 15) -> 1s`, `[15, inf) -> 2s`.
//! Negative (and NaN) readings mean no signal and map to idle.

use crate::domain::types::{AlertTarget, DistanceSample};
use std::time::Duration;

const NEAR_CM: f32 = 5.0;
const CLOSE_CM: f32 = 10.0;
const MEDIUM_CM: f32 = 15.0;

const NEAR_INTERVAL: Duration = Duration::from_millis(200);
const CLOSE_INTERVAL: Duration = Duration::from_millis(500);
const MEDIUM_INTERVAL: Duration = Duration::from_millis(1000);
const FAR_INTERVAL: Duration = Duration::from_millis(2000);

/// Half-period to blink at for a distance in centimeters, or `None` for idle
pub fn compute_interval(distance_cm: f32) -> Option<Duration> {
    if distance_cm.is_nan() || distance_cm < 0.0 {
        return None;
    }
    let interval = if distance_cm < NEAR_CM {
        NEAR_INTERVAL
    } else if distance_cm < CLOSE_CM {
        CLOSE_INTERVAL
    } else if distance_cm < MEDIUM_CM {
        MEDIUM_INTERVAL
    } else {
        FAR_INTERVAL
    };
    Some(interval)
}

pub fn target_for_sample(sample: DistanceSample) -> AlertTarget {
    AlertTarget::from_interval(compute_interval(sample.cm()))
}
