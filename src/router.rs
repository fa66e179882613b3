//! Request classification against "today".

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How a `[start, end)` request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestKind {
    /// Entirely before today: cached or regenerated
    PastOnly,
    /// Touches today: cached past plus live today
    Mixed,
    /// Entirely after today: nothing to show
    FutureOnly,
}

/// Classify by calendar date, with `today` taken in UTC.
///
/// The comparison uses the dates of `start` and `end` as given, so a
/// request ending at today's midnight counts as touching today.
pub fn classify_request(start: DateTime<Utc>, end: DateTime<Utc>, today: NaiveDate) -> RequestKind {
    if end.date_naive() < today {
        RequestKind::PastOnly
    } else if start.date_naive() > today {
        RequestKind::FutureOnly
    } else {
        RequestKind::Mixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_classification() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        assert_eq!(classify_request(date(10), date(12), today), RequestKind::PastOnly);
        assert_eq!(classify_request(date(14), date(15), today), RequestKind::Mixed);
        assert_eq!(classify_request(date(15), date(15), today), RequestKind::Mixed);
        assert_eq!(classify_request(date(16), date(20), today), RequestKind::FutureOnly);
        assert_eq!(classify_request(date(10), date(20), today), RequestKind::Mixed);
    }
}
