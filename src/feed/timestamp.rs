use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};

/// Formats seen in the wild beyond strict RFC 2822 / RFC 3339.
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const OFFSET_DATETIME_FORMATS: &[&str] = &[
    "%d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M %z",
    "%Y-%m-%d %H:%M:%S %z",
];

/// Best-effort parse of a feed timestamp.
///
/// Tries RFC 2822 (RSS `pubDate`), RFC 3339 (Atom `published`/`updated`),
/// then a handful of sloppy variants. Naive timestamps are taken as UTC.
/// Returns `None` when nothing matches; callers decide the fallback.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    // Weekday names are dropped: chrono rejects a weekday that disagrees with
    // the date, and feeds get it wrong often enough to matter.
    let normalized = normalize_zone_suffix(strip_weekday(raw));
    for fmt in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(&normalized, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    None
}

fn strip_weekday(raw: &str) -> &str {
    match raw.split_once(',') {
        Some((day, rest)) if day.chars().all(|c| c.is_ascii_alphabetic()) => rest.trim_start(),
        _ => raw,
    }
}

/// "GMT"/"UTC"/"UT"/"Z" suffixes are common but not accepted by `%z`.
fn normalize_zone_suffix(raw: &str) -> String {
    for suffix in [" GMT", " UTC", " UT", "Z"] {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return format!("{} +0000", stripped.trim_end());
        }
    }
    raw.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_rfc2822_pub_date() {
        assert_eq!(
            parse_timestamp("Mon, 01 Jan 2024 00:00:00 GMT"),
            Some(utc(2024, 1, 1, 0, 0, 0))
        );
        assert_eq!(
            parse_timestamp("Tue, 02 Jan 2024 10:30:00 +0200"),
            Some(utc(2024, 1, 2, 8, 30, 0))
        );
    }

    #[test]
    fn test_rfc3339_atom_dates() {
        assert_eq!(
            parse_timestamp("2024-01-03T12:00:00Z"),
            Some(utc(2024, 1, 3, 12, 0, 0))
        );
        assert_eq!(
            parse_timestamp(" 2024-01-03T12:00:00-05:00 "),
            Some(utc(2024, 1, 3, 17, 0, 0))
        );
    }

    #[test]
    fn test_wrong_weekday_still_parses() {
        // 1 Jan 2024 was a Monday; feeds get this wrong regularly
        assert_eq!(
            parse_timestamp("Fri, 01 Jan 2024 00:00:00 UTC"),
            Some(utc(2024, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_naive_and_date_only() {
        assert_eq!(
            parse_timestamp("2024-01-02 08:15:00"),
            Some(utc(2024, 1, 2, 8, 15, 0))
        );
        assert_eq!(parse_timestamp("2024-01-02"), Some(utc(2024, 1, 2, 0, 0, 0)));
    }

    #[test]
    fn test_garbage_is_none() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("   "), None);
        assert_eq!(parse_timestamp("yesterday-ish"), None);
    }
}
