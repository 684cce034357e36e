//! UTC period boundary computation.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::policy::Period;

/// Compute the `[start, end)` window containing `now` for `period`.
pub fn window_containing(period: Period, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    match period {
        Period::Hourly => {
            let start = now
                .date_naive()
                .and_hms_opt(now.hour(), 0, 0)
                .expect("valid hour boundary");
            let start = Utc.from_utc_datetime(&start);
            (start, start + Duration::hours(1))
        }
        Period::Daily => {
            let start = now.date_naive().and_hms_opt(0, 0, 0).expect("midnight");
            let start = Utc.from_utc_datetime(&start);
            (start, start + Duration::days(1))
        }
        Period::Weekly => {
            let days_since_monday = now.weekday().num_days_from_monday() as i64;
            let monday = now.date_naive() - Duration::days(days_since_monday);
            let start = Utc.from_utc_datetime(&monday.and_hms_opt(0, 0, 0).expect("midnight"));
            (start, start + Duration::days(7))
        }
        Period::Monthly => {
            let (y, m) = (now.year(), now.month());
            let start = Utc
                .with_ymd_and_hms(y, m, 1, 0, 0, 0)
                .single()
                .expect("first of month");
            let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
            let end = Utc
                .with_ymd_and_hms(ny, nm, 1, 0, 0, 0)
                .single()
                .expect("first of next month");
            (start, end)
        }
    }
}
