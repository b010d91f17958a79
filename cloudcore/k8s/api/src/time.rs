//! Conversions between API timestamps and `chrono`.
//!
//! API timestamps travel as RFC 3339 strings with second precision; converting through their wire
//! form keeps these helpers independent of the timestamp type's backing representation.

use crate::Time;
use chrono::{DateTime, SubsecRound, Utc};

pub fn now() -> Option<Time> {
    from_utc(Utc::now())
}

pub fn from_utc(t: DateTime<Utc>) -> Option<Time> {
    let t = t.trunc_subsecs(0);
    serde_json::to_value(t)
        .and_then(serde_json::from_value)
        .ok()
}

pub fn to_utc(t: &Time) -> Option<DateTime<Utc>> {
    serde_json::to_value(t)
        .and_then(serde_json::from_value)
        .ok()
}

/// Truncates a timestamp to whole seconds, as the API server stores it.
pub fn normalize(t: &mut Time) {
    if let Some(normalized) = to_utc(t).and_then(from_utc) {
        *t = normalized;
    }
}

/// True if `t` is further in the past than `age`.
pub fn older_than(t: &Time, age: std::time::Duration) -> bool {
    let Some(t) = to_utc(t) else {
        return true;
    };
    match chrono::Duration::from_std(age) {
        Ok(age) => Utc::now() - t > age,
        Err(_) => false,
    }
}
