use chrono::{DateTime, Utc};

use crate::domain::models::LastConsumption;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumptionDelta {
    pub energy_delta_wh: f64,
    pub duration_delta_secs: f64,
    pub instant_watts: f64,
    // never negative
    pub consumed_wh: f64,
    // only when no energy flowed
    pub inactivity_secs: f64,
}

impl ConsumptionDelta {
    pub fn has_progress(&self) -> bool {
        self.energy_delta_wh > 0.0 || self.duration_delta_secs > 0.0
    }
}

pub fn kwh_to_wh(kwh: f64) -> f64 {
    kwh * 1000.0
}

pub fn hours_to_secs(hours: f64) -> i64 {
    (hours * 3600.0).round() as i64
}

pub fn round_secs_between(start: DateTime<Utc>, stop: DateTime<Utc>) -> i64 {
    ((stop - start).num_milliseconds() as f64 / 1000.0).round() as i64
}

pub fn compute_consumption_delta(
    last: &LastConsumption,
    kwh: f64,
    updated_at: DateTime<Utc>,
) -> ConsumptionDelta {
    let energy_delta_wh = kwh_to_wh(kwh) - last.value;
    let duration_delta_secs = (updated_at - last.timestamp).num_milliseconds() as f64 / 1000.0;

    let instant_watts = if energy_delta_wh > 0.0 && duration_delta_secs > 0.0 {
        energy_delta_wh * (3600.0 / duration_delta_secs)
    } else {
        0.0
    };

    let (consumed_wh, inactivity_secs) = if energy_delta_wh > 0.0 {
        (energy_delta_wh, 0.0)
    } else {
        (0.0, duration_delta_secs.max(0.0))
    };

    ConsumptionDelta {
        energy_delta_wh,
        duration_delta_secs,
        instant_watts,
        consumed_wh,
        inactivity_secs,
    }
}
