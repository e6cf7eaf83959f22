//! Timestamp handling in the compact basic ISO 8601 form used on the wire
//! (`20241019T120000`, optional `,ffffff` fraction on input).

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{CseError, CseResult};

const WIRE_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Formats a timestamp for the wire.
#[must_use]
pub fn format(ts: DateTime<Utc>) -> String {
    ts.format(WIRE_FORMAT).to_string()
}

/// Parses a wire timestamp. Fractional seconds after `,` or `.` are ignored.
///
/// # Errors
///
/// Returns `BadRequest` if the string is not a valid basic-format timestamp.
pub fn parse(value: &str) -> CseResult<DateTime<Utc>> {
    let whole = value
        .split([',', '.'])
        .next()
        .unwrap_or(value)
        .trim_end_matches('Z');
    NaiveDateTime::parse_from_str(whole, WIRE_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| CseError::BadRequest(format!("invalid timestamp {value:?}: {e}")))
}

/// Current time truncated to whole seconds, so stored values survive a
/// format/parse cycle unchanged.
#[must_use]
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Drops sub-second precision.
#[must_use]
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

/// Clamps a requested expiration time into `[now + min, now + max]`.
/// An absent request yields `now + default`.
#[must_use]
pub fn clamp_expiration(
    requested: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    min: Duration,
    max: Duration,
    default: Duration,
) -> DateTime<Utc> {
    let lower = now + min;
    let upper = now + max;
    match requested {
        None => (now + default).clamp(lower, upper),
        Some(ts) => ts.clamp(lower, upper),
    }
}

/// Serde adapter for optional wire timestamps.
pub mod serde_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    ///
    /// Never fails for well-formed timestamps.
    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&super::format(*ts)),
            None => s.serialize_none(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the string is not a valid wire timestamp.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| super::parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn formats_basic_iso() {
        let ts = Utc.with_ymd_and_hms(2024, 10, 19, 8, 5, 3).unwrap();
        assert_eq!(format(ts), "20241019T080503");
        assert_eq!(parse("20241019T080503").unwrap(), ts);
        assert_eq!(parse("20241019T080503,123456").unwrap(), ts);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("yesterday").is_err());
        assert!(parse("2024-10-19").is_err());
    }

    #[test]
    fn expiration_below_minimum_is_raised() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let min = Duration::seconds(60);
        let max = Duration::days(1);
        let def = Duration::hours(1);

        let too_early = now + Duration::seconds(5);
        assert_eq!(clamp_expiration(Some(too_early), now, min, max, def), now + min);

        let too_late = now + Duration::days(30);
        assert_eq!(clamp_expiration(Some(too_late), now, min, max, def), now + max);

        assert_eq!(clamp_expiration(None, now, min, max, def), now + def);
    }
}
