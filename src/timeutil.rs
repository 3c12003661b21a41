//! Presentation-time helpers. Storage and API payloads are UTC only;
//! localized rendering happens strictly at the view boundary.

use chrono::{DateTime, FixedOffset, Utc};

const BEIJING_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Render a stored UTC time in Beijing local time (UTC+8).
pub fn format_beijing_time(t: DateTime<Utc>) -> String {
    let offset = FixedOffset::east_opt(BEIJING_UTC_OFFSET_SECS).unwrap();
    t.with_timezone(&offset).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_beijing_is_utc_plus_eight() {
        let t = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        assert_eq!(format_beijing_time(t), "2025-11-25 18:00:00");

        // Rendering equals shifting the UTC clock by 8h.
        let shifted = t + Duration::hours(8);
        assert_eq!(format_beijing_time(t), shifted.format("%Y-%m-%d %H:%M:%S").to_string());
    }

    #[test]
    fn test_beijing_crosses_date_line() {
        let t = Utc.with_ymd_and_hms(2025, 11, 25, 22, 30, 0).unwrap();
        assert_eq!(format_beijing_time(t), "2025-11-26 06:30:00");
    }
}
