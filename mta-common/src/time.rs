//! Timestamp utilities
//!
//! Timestamps are persisted as RFC 3339 text in SQLite. Rows written by
//! other tools may carry SQLite's `CURRENT_TIMESTAMP` form instead, which is
//! read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage
pub fn to_db(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|e| {
            NaiveDateTime::parse_from_str(value, SQLITE_TIMESTAMP_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(|_| e)
        })
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp
pub fn from_db_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01
    }

    #[test]
    fn test_storage_format_survives_parse() {
        let ts = now();
        let parsed = from_db(&to_db(ts)).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_invalid_timestamp_is_internal_error() {
        let err = from_db("yesterday").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_sqlite_current_timestamp_form_is_utc() {
        let parsed = from_db("2024-01-01 10:00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T10:00:00+00:00");
    }

    #[test]
    fn test_optional_none_stays_none() {
        assert!(from_db_opt(None).unwrap().is_none());
    }
}
