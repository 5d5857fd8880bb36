use crate::error::SubscriptionError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// UTC timestamps are stored as RFC 3339 with a `Z` suffix.
pub fn to_db_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses RFC 3339, falling back to legacy `YYYY-MM-DD HH:MM:SS` GMT strings.
pub fn parse_db_string(s: &str) -> crate::error::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT)
        .map_err(|e| SubscriptionError::TimeParse(format!("{s}: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

pub(crate) fn column_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_db_string(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

pub(crate) fn column_opt_datetime(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(|v| column_datetime(idx, v)).transpose()
}

// Log timestamps in UTC, matching the database
pub struct UtcTimer;

impl tracing_subscriber::fmt::time::FormatTime for UtcTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format(DATETIME_FORMAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rfc3339() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 29, 10, 20, 30).unwrap();
        assert_eq!(to_db_string(&dt), "2024-02-29T10:20:30Z");
        assert_eq!(parse_db_string("2024-02-29T10:20:30Z").unwrap(), dt);
    }

    #[test]
    fn accepts_offsets() {
        let dt = parse_db_string("2024-02-29T18:20:30+08:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 2, 29, 10, 20, 30).unwrap());
    }

    #[test]
    fn legacy_gmt_strings_are_utc() {
        let dt = parse_db_string("2024-02-29 10:20:30").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 2, 29, 10, 20, 30).unwrap());
    }

    #[test]
    fn garbage_is_a_time_parse_error() {
        assert!(matches!(
            parse_db_string("yesterday"),
            Err(SubscriptionError::TimeParse(_))
        ));
    }
}
