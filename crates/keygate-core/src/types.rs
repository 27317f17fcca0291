//! License records and ISO-8601 timestamp handling.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::errors::RecordError;

/// A single license entitlement as persisted by a [`LicenseStore`](crate::store::LicenseStore).
///
/// `expires_at` is a naive timestamp interpreted as UTC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseRecord {
    /// License key, the primary key of the record
    pub key: String,
    /// Absolute expiry instant
    #[serde(with = "iso8601")]
    pub expires_at: NaiveDateTime,
    /// Whether the license has been claimed
    #[serde(default)]
    pub is_used: bool,
    /// Hardware identifier the license is bound to
    #[serde(default)]
    pub hwid: Option<String>,
}

impl LicenseRecord {
    /// Create a fresh, unclaimed record.
    pub fn unbound(key: impl Into<String>, expires_at: NaiveDateTime) -> Self {
        Self {
            key: key.into(),
            expires_at,
            is_used: false,
            hwid: None,
        }
    }

    /// A record is expired from its expiry instant onwards.
    pub fn is_expired_at(&self, now: NaiveDateTime) -> bool {
        now >= self.expires_at
    }

    /// Whether the record is bound to exactly this hardware identifier.
    pub fn is_bound_to(&self, hwid: &str) -> bool {
        self.is_used && self.hwid.as_deref() == Some(hwid)
    }

    /// Return the claimed form of this record.
    ///
    /// `hwid` is `None` when the license is only marked used without a
    /// hardware binding.
    pub fn claimed(&self, hwid: Option<&str>) -> Self {
        Self {
            key: self.key.clone(),
            expires_at: self.expires_at,
            is_used: true,
            hwid: hwid.map(str::to_owned),
        }
    }

    /// Check the schema invariants every stored record must satisfy.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.key.is_empty() {
            return Err(RecordError::EmptyKey);
        }
        match (&self.hwid, self.is_used) {
            (Some(_), false) => Err(RecordError::UnusedWithHwid(self.key.clone())),
            (Some(hwid), true) if hwid.is_empty() => Err(RecordError::EmptyHwid(self.key.clone())),
            _ => Ok(()),
        }
    }
}

/// Serde adapter and helpers for ISO-8601 expiry timestamps.
///
/// Parsing accepts a bare date, a date-time with `T` or space separator and
/// optional fractional seconds, or RFC 3339 with an offset (converted to UTC).
pub mod iso8601 {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const NAIVE_FORMATS: [&str; 5] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ];

    pub fn parse(raw: &str) -> Option<NaiveDateTime> {
        let raw = raw.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.naive_utc());
        }
        for fmt in NAIVE_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(dt);
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
    }

    pub fn format(dt: &NaiveDateTime) -> String {
        dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
    }

    pub fn serialize<S: Serializer>(dt: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid ISO-8601 timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn at(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_accepted_forms() {
        let midnight = at(2099, 1, 1);
        assert_eq!(iso8601::parse("2099-01-01"), Some(midnight));
        assert_eq!(iso8601::parse("2099-01-01T00:00:00"), Some(midnight));
        assert_eq!(iso8601::parse("2099-01-01 00:00:00"), Some(midnight));
        assert_eq!(iso8601::parse("2099-01-01T02:00:00+02:00"), Some(midnight));
        assert_eq!(iso8601::parse("2099-01-01T00:00:00Z"), Some(midnight));

        let fractional = iso8601::parse("2099-01-01T00:00:00.250000").unwrap();
        assert_eq!(fractional.nanosecond(), 250_000_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(iso8601::parse(""), None);
        assert_eq!(iso8601::parse("next tuesday"), None);
        assert_eq!(iso8601::parse("2099-13-01"), None);
    }

    #[test]
    fn test_format_drops_zero_fraction() {
        assert_eq!(iso8601::format(&at(2000, 1, 1)), "2000-01-01T00:00:00");
    }

    #[test]
    fn test_expiry_boundary_is_inclusive() {
        let record = LicenseRecord::unbound("K", at(2030, 6, 1));
        assert!(!record.is_expired_at(at(2030, 5, 31)));
        assert!(record.is_expired_at(at(2030, 6, 1)));
        assert!(record.is_expired_at(at(2031, 1, 1)));
    }

    #[test]
    fn test_validate() {
        let record = LicenseRecord::unbound("K", at(2099, 1, 1));
        assert!(record.validate().is_ok());
        assert!(record.claimed(Some("HW-A")).validate().is_ok());
        assert!(record.claimed(None).validate().is_ok());

        let mut dangling = record.clone();
        dangling.hwid = Some("HW-A".to_string());
        assert_eq!(dangling.validate(), Err(RecordError::UnusedWithHwid("K".to_string())));

        assert_eq!(
            record.claimed(Some("")).validate(),
            Err(RecordError::EmptyHwid("K".to_string()))
        );
        assert_eq!(
            LicenseRecord::unbound("", at(2099, 1, 1)).validate(),
            Err(RecordError::EmptyKey)
        );
    }

    #[test]
    fn test_is_bound_to() {
        let record = LicenseRecord::unbound("K", at(2099, 1, 1));
        assert!(!record.is_bound_to("HW-A"));
        let bound = record.claimed(Some("HW-A"));
        assert!(bound.is_bound_to("HW-A"));
        assert!(!bound.is_bound_to("HW-B"));
        assert!(!record.claimed(None).is_bound_to("HW-A"));
    }
}
