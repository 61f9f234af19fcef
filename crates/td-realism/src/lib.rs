//! Realism Simulator (C10).
//!
//! Activated iff the broker adapter reports paper-mode; in live mode every
//! method on [`RealismSimulator`] is a pass-through. Pure deterministic
//! logic otherwise — no IO, no clock reads (callers supply `today`/`now`).

use chrono::NaiveDate;
use std::collections::VecDeque;
use td_schemas::{Side, Ticker};

pub const SIMULATED_ACCOUNT_VALUE: f64 = 24_999.0;
pub const MARGIN_INTEREST_RATE: f64 = 0.12;
pub const BASE_SLIPPAGE_BPS: f64 = 2.0;
pub const MAX_SLIPPAGE_BPS: f64 = 10.0;
pub const PDT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdtStatus {
    Clear,
    Warning { day_trade_count: usize },
    Violation { day_trade_count: usize },
}

impl PdtStatus {
    pub fn blocks_new_trades(&self) -> bool {
        matches!(self, PdtStatus::Violation { .. })
    }
}

/// Ring-buffer of trade events over the last ~7 calendar days, keyed by
/// ticker+date, used to detect pattern day trading.
#[derive(Debug, Clone, Default)]
pub struct PdtTracker {
    events: VecDeque<TradeEvent>,
}

impl PdtTracker {
    pub fn new() -> Self {
        PdtTracker::default()
    }

    /// Record a fill and drop anything older than the rolling window
    /// relative to `today`.
    pub fn record(&mut self, event: TradeEvent, today: NaiveDate) {
        self.events.push_back(event);
        self.prune(today);
    }

    fn prune(&mut self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(PDT_WINDOW_DAYS);
        while let Some(front) = self.events.front() {
            if front.date < cutoff {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count of distinct (ticker, date) pairs in the window that had both a
    /// BUY and a SELL — the definition of a day trade.
    pub fn day_trade_count(&self, today: NaiveDate) -> usize {
        let cutoff = today - chrono::Duration::days(PDT_WINDOW_DAYS);
        let mut buys: std::collections::HashSet<(String, NaiveDate)> = Default::default();
        let mut sells: std::collections::HashSet<(String, NaiveDate)> = Default::default();
        for ev in self.events.iter().filter(|e| e.date >= cutoff) {
            let key = (ev.ticker.as_str().to_string(), ev.date);
            match ev.side {
                Side::Buy => {
                    buys.insert(key);
                }
                Side::Sell => {
                    sells.insert(key);
                }
            }
        }
        buys.intersection(&sells).count()
    }

    /// `>= 4` blocks new trades with a violation; `== 3` is a warning.
    pub fn check(&self, today: NaiveDate) -> PdtStatus {
        let count = self.day_trade_count(today);
        if count >= 4 {
            PdtStatus::Violation { day_trade_count: count }
        } else if count == 3 {
            PdtStatus::Warning { day_trade_count: count }
        } else {
            PdtStatus::Clear
        }
    }
}

/// `bps = clamp(2 + (shares/daily_volume) * (10-2), 2, 10)`.
pub fn slippage_bps(shares: i64, daily_volume: i64) -> f64 {
    if daily_volume <= 0 {
        return MAX_SLIPPAGE_BPS;
    }
    let ratio = shares as f64 / daily_volume as f64;
    (BASE_SLIPPAGE_BPS + ratio * (MAX_SLIPPAGE_BPS - BASE_SLIPPAGE_BPS))
        .clamp(BASE_SLIPPAGE_BPS, MAX_SLIPPAGE_BPS)
}

/// Absolute dollar slippage cost for a fill, never negative.
pub fn slippage_cost(price: f64, shares: i64, daily_volume: i64) -> f64 {
    let bps = slippage_bps(shares, daily_volume);
    (price * shares as f64 * bps / 10_000.0).max(0.0)
}

/// `interest = margin_used * 0.12 / 365 * days_held`.
pub fn margin_interest(margin_used: f64, days_held: i64) -> f64 {
    margin_used * MARGIN_INTEREST_RATE / 365.0 * days_held as f64
}

pub fn days_held(entry_date: NaiveDate, today: NaiveDate) -> i64 {
    (today - entry_date).num_days()
}

/// How a fill affects the `entry_dates` row for its ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDateEffect {
    /// First fill (or re-entry into a flat position): upsert the row.
    Upsert,
    /// Exit closed the position to zero shares: delete the row.
    Delete,
    /// Partial exit: leave the row untouched.
    Untouched,
}

pub fn entry_date_effect(side: Side, shares_before: i64, shares_after: i64) -> EntryDateEffect {
    match side {
        Side::Buy => EntryDateEffect::Upsert,
        Side::Sell => {
            if shares_after == 0 {
                EntryDateEffect::Delete
            } else if shares_after > 0 && shares_after < shares_before {
                EntryDateEffect::Untouched
            } else {
                EntryDateEffect::Upsert
            }
        }
    }
}

/// Wraps the realism rules behind a paper/live switch: every method is a
/// pass-through in live mode.
pub struct RealismSimulator {
    pub is_paper: bool,
}

impl RealismSimulator {
    pub fn new(is_paper: bool) -> Self {
        RealismSimulator { is_paper }
    }

    /// Effective account value for PDT calculations: always clamped to
    /// [`SIMULATED_ACCOUNT_VALUE`] in paper mode (fail-safe, strictest
    /// rule), passed through unchanged in live mode.
    pub fn effective_account_value(&self, real_value: f64) -> f64 {
        if self.is_paper {
            real_value.min(SIMULATED_ACCOUNT_VALUE)
        } else {
            real_value
        }
    }

    pub fn slippage_cost(&self, price: f64, shares: i64, daily_volume: i64) -> f64 {
        if self.is_paper {
            slippage_cost(price, shares, daily_volume)
        } else {
            0.0
        }
    }

    pub fn margin_interest(&self, margin_used: f64, days_held: i64) -> f64 {
        if self.is_paper {
            margin_interest(margin_used, days_held)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_schemas::Ticker;

    fn t(s: &str) -> Ticker {
        Ticker::new(s).unwrap()
    }

    #[test]
    fn three_day_trades_is_warning_four_is_violation() {
        let mut tracker = PdtTracker::new();
        let base = NaiveDate::from_ymd_opt(2026, 7, 20).unwrap();
        for i in 0..3 {
            let d = base + chrono::Duration::days(i);
            tracker.record(TradeEvent { ticker: t("AAPL"), date: d, side: Side::Buy }, d);
            tracker.record(TradeEvent { ticker: t("AAPL"), date: d, side: Side::Sell }, d);
        }
        assert_eq!(tracker.check(base + chrono::Duration::days(2)), PdtStatus::Warning { day_trade_count: 3 });

        let d4 = base + chrono::Duration::days(3);
        tracker.record(TradeEvent { ticker: t("MSFT"), date: d4, side: Side::Buy }, d4);
        tracker.record(TradeEvent { ticker: t("MSFT"), date: d4, side: Side::Sell }, d4);
        let status = tracker.check(d4);
        assert!(status.blocks_new_trades());
    }

    #[test]
    fn slippage_is_clamped() {
        assert_eq!(slippage_bps(0, 1_000_000), BASE_SLIPPAGE_BPS);
        assert_eq!(slippage_bps(10_000_000, 1_000_000), MAX_SLIPPAGE_BPS);
    }

    #[test]
    fn effective_account_value_clamps_in_paper_mode() {
        let sim = RealismSimulator::new(true);
        assert_eq!(sim.effective_account_value(1_000_000.0), SIMULATED_ACCOUNT_VALUE);

        let live = RealismSimulator::new(false);
        assert_eq!(live.effective_account_value(1_000_000.0), 1_000_000.0);
    }

    #[test]
    fn entry_date_effects() {
        assert_eq!(entry_date_effect(Side::Buy, 0, 10), EntryDateEffect::Upsert);
        assert_eq!(entry_date_effect(Side::Sell, 10, 0), EntryDateEffect::Delete);
        assert_eq!(entry_date_effect(Side::Sell, 10, 5), EntryDateEffect::Untouched);
    }
}
