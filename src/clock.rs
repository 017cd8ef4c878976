//! Clock helpers: ISO timestamps, epoch seconds, and wall-clock hour buckets.
//!
//! The rate limiter counts agent invocations per wall-clock hour, so hours
//! are modeled as epoch-hour buckets (epoch seconds / 3600) rather than
//! local-time components.

use chrono::{DateTime, Utc};

/// Seconds per wall-clock hour bucket
const HOUR_SECS: i64 = 3600;

/// Current time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current time as an RFC 3339 string
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Current epoch seconds
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// The epoch-hour bucket a given epoch-seconds timestamp falls into
pub fn hour_bucket_of(epoch_secs: i64) -> i64 {
    epoch_secs.div_euclid(HOUR_SECS)
}

/// Current epoch-hour bucket
pub fn current_hour_bucket() -> i64 {
    hour_bucket_of(epoch_seconds())
}

/// Seconds remaining until the next hour boundary (at least 1)
pub fn seconds_until_next_hour() -> u64 {
    let now = epoch_seconds();
    let next_boundary = (hour_bucket_of(now) + 1) * HOUR_SECS;
    (next_boundary - now).max(1) as u64
}

/// Parse an RFC 3339 timestamp back into a `DateTime<Utc>`
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_bucket_boundaries() {
        assert_eq!(hour_bucket_of(0), 0);
        assert_eq!(hour_bucket_of(3599), 0);
        assert_eq!(hour_bucket_of(3600), 1);
        assert_eq!(hour_bucket_of(7201), 2);
    }

    #[test]
    fn test_seconds_until_next_hour_in_range() {
        let secs = seconds_until_next_hour();
        assert!(secs >= 1);
        assert!(secs <= 3600);
    }

    #[test]
    fn test_rfc3339_round_trip() {
        let stamp = now_rfc3339();
        let parsed = parse_rfc3339(&stamp).unwrap();
        assert_eq!(parsed.to_rfc3339(), stamp);
    }

    #[test]
    fn test_parse_rfc3339_rejects_garbage() {
        assert!(parse_rfc3339("not a timestamp").is_none());
    }
}
