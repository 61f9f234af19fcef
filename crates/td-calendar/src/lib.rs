//! Market Calendar & Clock (C3).
//!
//! Pure logic, no IO of its own: [`now_market`] reads the wall clock but
//! every other function is a deterministic function of its inputs. The
//! weekday/holiday fallback table uses a civil-calendar conversion rather
//! than pulling in a date-math crate for holiday determination, following
//! the same hardcoded-table approach this codebase uses elsewhere for
//! exchange holidays.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

pub const MARKET_TZ: Tz = chrono_tz::America::New_York;

const SESSION_OPEN: (u32, u32) = (9, 30);
const SESSION_CLOSE: (u32, u32) = (16, 0);
const EARLY_CLOSE: (u32, u32) = (13, 0);

/// Current wall clock in the fixed market time zone.
pub fn now_market() -> DateTime<Tz> {
    Utc::now().with_timezone(&MARKET_TZ)
}

/// `false` for weekends and exchange holidays.
pub fn is_trading_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !is_full_closure(date)
}

/// Session open/close for `date`, honoring early closes. `None` if `date`
/// is not a trading day.
pub fn session_bounds(date: NaiveDate) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
    if !is_trading_day(date) {
        return None;
    }
    let close_time = if is_early_close(date) {
        NaiveTime::from_hms_opt(EARLY_CLOSE.0, EARLY_CLOSE.1, 0).unwrap()
    } else {
        NaiveTime::from_hms_opt(SESSION_CLOSE.0, SESSION_CLOSE.1, 0).unwrap()
    };
    let open_time = NaiveTime::from_hms_opt(SESSION_OPEN.0, SESSION_OPEN.1, 0).unwrap();

    let open = MARKET_TZ
        .from_local_datetime(&date.and_time(open_time))
        .single()?;
    let close = MARKET_TZ
        .from_local_datetime(&date.and_time(close_time))
        .single()?;
    Some((open, close))
}

/// The next session open strictly after `after`.
pub fn next_open(after: DateTime<Utc>) -> DateTime<Utc> {
    let mut d = after.with_timezone(&MARKET_TZ).date_naive();
    loop {
        if let Some((open, _close)) = session_bounds(d) {
            if open.with_timezone(&Utc) > after {
                return open.with_timezone(&Utc);
            }
        }
        d = d.succ_opt().expect("date overflow while scanning for next open");
    }
}

/// Broker-provided trading-calendar lookup (§4.3: "consults the broker's
/// calendar adapter when available"). Errors degrade to the local
/// weekday/holiday fallback with a logged warning.
pub trait CalendarAdapter {
    fn is_trading_day(&self, date: NaiveDate) -> Result<bool, anyhow::Error>;
}

/// Resolve trading-day status, preferring `adapter` and falling back to the
/// local holiday table when the adapter errors.
pub fn is_trading_day_with_adapter(
    adapter: Option<&dyn CalendarAdapter>,
    date: NaiveDate,
) -> bool {
    match adapter {
        Some(a) => match a.is_trading_day(date) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, %date, "calendar adapter failed, falling back to weekday-only");
                is_trading_day(date)
            }
        },
        None => is_trading_day(date),
    }
}

fn is_full_closure(date: NaiveDate) -> bool {
    let (y, m, d) = (date.year() as i64, date.month() as i64, date.day() as i64);
    FULL_CLOSURES.contains(&(y, m, d))
}

fn is_early_close(date: NaiveDate) -> bool {
    let (y, m, d) = (date.year() as i64, date.month() as i64, date.day() as i64);
    EARLY_CLOSES.contains(&(y, m, d))
}

/// NYSE full-market-closure holidays, observed dates.
const FULL_CLOSURES: &[(i64, i64, i64)] = &[
    (2023, 1, 2),
    (2023, 1, 16),
    (2023, 2, 20),
    (2023, 4, 7),
    (2023, 5, 29),
    (2023, 6, 19),
    (2023, 7, 4),
    (2023, 9, 4),
    (2023, 11, 23),
    (2023, 12, 25),
    (2024, 1, 1),
    (2024, 1, 15),
    (2024, 2, 19),
    (2024, 3, 29),
    (2024, 5, 27),
    (2024, 6, 19),
    (2024, 7, 4),
    (2024, 9, 2),
    (2024, 11, 28),
    (2024, 12, 25),
    (2025, 1, 1),
    (2025, 1, 20),
    (2025, 2, 17),
    (2025, 4, 18),
    (2025, 5, 26),
    (2025, 6, 19),
    (2025, 7, 4),
    (2025, 9, 1),
    (2025, 11, 27),
    (2025, 12, 25),
    (2026, 1, 1),
    (2026, 1, 19),
    (2026, 2, 16),
    (2026, 4, 3),
    (2026, 5, 25),
    (2026, 6, 19),
    (2026, 7, 3),
    (2026, 9, 7),
    (2026, 11, 26),
    (2026, 12, 25),
];

/// 1:00 p.m. early-close sessions (day before July 4th, day after
/// Thanksgiving, Christmas Eve when it falls on a weekday).
const EARLY_CLOSES: &[(i64, i64, i64)] = &[
    (2023, 7, 3),
    (2023, 11, 24),
    (2023, 12, 24),
    (2024, 7, 3),
    (2024, 11, 29),
    (2024, 12, 24),
    (2025, 7, 3),
    (2025, 11, 28),
    (2025, 12, 24),
    (2026, 7, 2),
    (2026, 11, 27),
    (2026, 12, 24),
];
