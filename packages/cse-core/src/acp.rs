//! Access control rule types and their context checks.
//!
//! A rule grants an operation mask to a list of originators, optionally
//! bound to an authentication requirement and contexts (cron-style time
//! windows, source IP allow-lists). Rule-set resolution and the decision
//! procedure live in the server's access engine.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CseError, CseResult};
use crate::request::Operation;

/// Originator wildcard matching everyone.
pub const ALL_ORIGINATORS: &str = "all";

// ---------------------------------------------------------------------------
// Operation mask
// ---------------------------------------------------------------------------

/// Operation bitmask (`acop`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessControlOperations(pub u32);

impl AccessControlOperations {
    pub const CREATE: Self = Self(1);
    pub const RETRIEVE: Self = Self(2);
    pub const UPDATE: Self = Self(4);
    pub const DELETE: Self = Self(8);
    pub const NOTIFY: Self = Self(16);
    /// Synthetic bit checked instead of `RETRIEVE` during discovery.
    pub const DISCOVER: Self = Self(32);
    pub const ALL: Self = Self(63);

    /// Bit requested by an operation; retrieves under discovery ask for `DISCOVER`.
    #[must_use]
    pub fn for_operation(op: Operation, discovery: bool) -> Self {
        match op {
            Operation::Create => Self::CREATE,
            Operation::Retrieve if discovery => Self::DISCOVER,
            Operation::Retrieve => Self::RETRIEVE,
            Operation::Update => Self::UPDATE,
            Operation::Delete => Self::DELETE,
            Operation::Notify => Self::NOTIFY,
        }
    }

    #[must_use]
    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllowList {
    #[serde(rename = "ipv4", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4: Vec<String>,
    #[serde(rename = "ipv6", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv6: Vec<String>,
}

impl IpAllowList {
    /// Whether `addr` equals an entry or falls inside a CIDR entry.
    #[must_use]
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.ipv4
            .iter()
            .chain(self.ipv6.iter())
            .any(|entry| ip_matches(entry, addr))
    }
}

fn ip_matches(entry: &str, addr: IpAddr) -> bool {
    let (net, prefix) = match entry.split_once('/') {
        Some((net, bits)) => match bits.parse::<u32>() {
            Ok(bits) => (net, Some(bits)),
            Err(_) => return false,
        },
        None => (entry, None),
    };
    let Ok(net) = net.parse::<IpAddr>() else {
        return false;
    };
    match (net, addr, prefix) {
        (net, addr, None) => net == addr,
        (IpAddr::V4(net), IpAddr::V4(addr), Some(bits)) if bits <= 32 => {
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(net) & mask == u32::from(addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr), Some(bits)) if bits <= 128 => {
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(net) & mask == u128::from(addr) & mask
        }
        _ => false,
    }
}

/// Contextual constraints of a rule (`acco`); all present parts must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlContext {
    #[serde(rename = "actw", default, skip_serializing_if = "Vec::is_empty")]
    pub windows: Vec<String>,
    #[serde(rename = "acip", default, skip_serializing_if = "Option::is_none")]
    pub ip_addresses: Option<IpAllowList>,
}

impl AccessControlContext {
    #[must_use]
    pub fn permits(&self, now: DateTime<Utc>, source: Option<IpAddr>) -> bool {
        let in_window = self.windows.is_empty()
            || self.windows.iter().any(|w| match w.parse::<CronWindow>() {
                Ok(window) => window.matches(now),
                Err(e) => {
                    tracing::warn!(window = %w, error = %e, "ignoring malformed time window");
                    false
                }
            });
        let from_allowed = match (&self.ip_addresses, source) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(list), Some(addr)) => list.allows(addr),
        };
        in_window && from_allowed
    }
}

/// One access control rule (`acr` entry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlRule {
    #[serde(rename = "acor", default)]
    pub originators: Vec<String>,
    #[serde(rename = "acop", default)]
    pub operations: AccessControlOperations,
    #[serde(rename = "acco", default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<AccessControlContext>,
    #[serde(rename = "acaf", default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<bool>,
}

impl AccessControlRule {
    /// Rule granting `operations` to every originator.
    #[must_use]
    pub fn allow_all(operations: AccessControlOperations) -> Self {
        Self {
            originators: vec![ALL_ORIGINATORS.to_owned()],
            operations,
            ..Self::default()
        }
    }

    /// Contexts hold if there are none or any one of them permits.
    #[must_use]
    pub fn context_permits(&self, now: DateTime<Utc>, source: Option<IpAddr>) -> bool {
        self.contexts.is_empty() || self.contexts.iter().any(|c| c.permits(now, source))
    }

    #[must_use]
    pub fn authentication_satisfied(&self, authenticated: bool) -> bool {
        !self.authentication.unwrap_or(false) || authenticated
    }
}

/// Rule list of a policy (`pv` / `pvs`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privileges {
    #[serde(rename = "acr", default)]
    pub rules: Vec<AccessControlRule>,
}

impl Privileges {
    /// Parses a `pv`/`pvs` attribute value.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the value does not describe a rule list.
    pub fn from_value(value: &serde_json::Value) -> CseResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| CseError::BadRequest(format!("invalid privileges: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Cron windows
// ---------------------------------------------------------------------------

/// `*`, `n` or `n-m`, optionally followed by `/step`. The pattern is a
/// constant, so compiling it cannot fail.
static FIELD_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\*|(\d+)(?:-(\d+))?)(?:/(\d+))?$").expect("cron item pattern compiles")
});

/// Allowed values of one cron field as a bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn parse(field: &str, min: u32, max: u32) -> CseResult<Self> {
        let mut bits = 0u64;
        for item in field.split(',') {
            let caps = FIELD_ITEM
                .captures(item)
                .ok_or_else(|| CseError::BadRequest(format!("invalid cron item {item:?}")))?;
            let num = |i: usize| -> CseResult<Option<u32>> {
                caps.get(i)
                    .map(|m| {
                        m.as_str()
                            .parse::<u32>()
                            .map_err(|e| CseError::BadRequest(e.to_string()))
                    })
                    .transpose()
            };
            let step = num(4)?.unwrap_or(1).max(1);
            let (start, end) = match num(2)? {
                None => (min, max),
                Some(start) => {
                    let end = match num(3)? {
                        Some(end) => end,
                        None if caps.get(4).is_some() => max,
                        None => start,
                    };
                    (start, end)
                }
            };
            if start < min || end > max || start > end {
                return Err(CseError::BadRequest(format!(
                    "cron item {item:?} outside {min}-{max}"
                )));
            }
            let mut v = start;
            while v <= end {
                bits |= 1 << v;
                v += step;
            }
        }
        Ok(Self(bits))
    }

    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }
}

/// Time window in cron syntax: `sec min hour day-of-month month day-of-week`.
/// A five-field form without seconds is accepted too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronWindow {
    second: FieldSet,
    minute: FieldSet,
    hour: FieldSet,
    day: FieldSet,
    month: FieldSet,
    weekday: FieldSet,
}

impl FromStr for CronWindow {
    type Err = CseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let fields: Vec<&str> = match fields.len() {
            6 => fields,
            5 => std::iter::once("*").chain(fields).collect(),
            n => {
                return Err(CseError::BadRequest(format!(
                    "time window needs 5 or 6 fields, got {n}"
                )))
            }
        };
        // Sunday may be written as 0 or 7.
        let weekday = FieldSet::parse(fields[5], 0, 7)?;
        let weekday = if weekday.contains(7) {
            FieldSet(weekday.0 | 1)
        } else {
            weekday
        };
        Ok(Self {
            second: FieldSet::parse(fields[0], 0, 59)?,
            minute: FieldSet::parse(fields[1], 0, 59)?,
            hour: FieldSet::parse(fields[2], 0, 23)?,
            day: FieldSet::parse(fields[3], 1, 31)?,
            month: FieldSet::parse(fields[4], 1, 12)?,
            weekday,
        })
    }
}

impl CronWindow {
    #[must_use]
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        self.second.contains(t.second())
            && self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.day.contains(t.day())
            && self.month.contains(t.month())
            && self.weekday.contains(t.weekday().num_days_from_sunday())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        // 2024-05-01 is a Wednesday.
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn wildcard_window_always_matches() {
        let w: CronWindow = "* * * * * *".parse().unwrap();
        assert!(w.matches(at(3, 4, 5)));
    }

    #[test]
    fn ranges_steps_and_lists() {
        let office: CronWindow = "* * 9-17 * * 1-5".parse().unwrap();
        assert!(office.matches(at(10, 0, 0)));
        assert!(!office.matches(at(20, 0, 0)));

        let quarter: CronWindow = "0 */15 * * * *".parse().unwrap();
        assert!(quarter.matches(at(1, 30, 0)));
        assert!(!quarter.matches(at(1, 31, 0)));

        let minutes: CronWindow = "5,10 * * * *".parse().unwrap();
        assert!(minutes.matches(at(0, 10, 42)));
        assert!(!minutes.matches(at(0, 11, 0)));

        // Without seconds the second field is the hour.
        let hours: CronWindow = "* 5,10 * * *".parse().unwrap();
        assert!(hours.matches(at(10, 0, 0)));
        assert!(!hours.matches(at(0, 10, 42)));

        let sunday: CronWindow = "* * * * * 7".parse().unwrap();
        assert!(!sunday.matches(at(0, 0, 0)));
    }

    #[test]
    fn malformed_windows_rejected() {
        assert!("* * *".parse::<CronWindow>().is_err());
        assert!("* * 25 * * *".parse::<CronWindow>().is_err());
        assert!("* * a-b * * *".parse::<CronWindow>().is_err());
    }

    #[test]
    fn ip_allow_list_handles_cidr() {
        let list = IpAllowList {
            ipv4: vec!["10.0.0.0/8".into(), "192.168.1.7".into()],
            ipv6: vec!["fe80::/10".into()],
        };
        assert!(list.allows("10.2.3.4".parse().unwrap()));
        assert!(list.allows("192.168.1.7".parse().unwrap()));
        assert!(!list.allows("192.168.1.8".parse().unwrap()));
        assert!(list.allows("fe80::1".parse().unwrap()));
    }

    #[test]
    fn privileges_parse_from_short_names() {
        let pv = Privileges::from_value(&json!({
            "acr": [{
                "acor": ["all"],
                "acop": 2,
                "acco": [{"actw": ["* * * * * *"], "acip": {"ipv4": ["127.0.0.1"]}}],
                "acaf": true
            }]
        }))
        .unwrap();
        let rule = &pv.rules[0];
        assert!(rule.operations.intersects(AccessControlOperations::RETRIEVE));
        assert!(!rule.operations.intersects(AccessControlOperations::CREATE));
        assert!(!rule.authentication_satisfied(false));
        assert!(rule.context_permits(Utc::now(), Some("127.0.0.1".parse().unwrap())));
        assert!(!rule.context_permits(Utc::now(), None));
    }

    #[test]
    fn discovery_uses_its_own_bit() {
        assert_eq!(
            AccessControlOperations::for_operation(Operation::Retrieve, true),
            AccessControlOperations::DISCOVER
        );
        assert_eq!(
            AccessControlOperations::for_operation(Operation::Retrieve, false),
            AccessControlOperations::RETRIEVE
        );
    }

    proptest! {
        #[test]
        fn single_value_fields_match_exactly(h in 0u32..24, m in 0u32..60) {
            let w: CronWindow = format!("* {m} {h} * * *").parse().unwrap();
            prop_assert!(w.matches(at(h, m, 0)));
            prop_assert!(!w.matches(at((h + 1) % 24, m, 0)));
        }
    }
}
