//! Wall-clock timestamps for response envelopes.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as ISO-8601 with millisecond precision, e.g.
/// `2026-10-16T08:30:00.123Z`.
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iso_timestamp_is_utc_millis() {
        let ts = iso_timestamp();
        assert!(ts.ends_with('Z'), "expected Z suffix: {ts}");
        // YYYY-MM-DDTHH:MM:SS.mmmZ
        assert_eq!(ts.len(), 24, "unexpected format: {ts}");
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
