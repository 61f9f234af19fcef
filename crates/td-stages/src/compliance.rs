//! Compliance (§4.6.5). Last stage before a plan is assembled: validates
//! every trade against a fixed rule set, then a hard safeguard against any
//! ticker appearing on both sides of the approved set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use td_schemas::{ComplianceCheck, Micros, Side, Stage, StageResult, TradeOrder};

use crate::{malformed_input, StageRunner};

#[derive(Debug, Deserialize, Serialize)]
pub struct ComplianceInput {
    pub trades: Vec<TradeOrder>,
    pub portfolio_value: f64,
    pub position_size_cap_pct: f64,
    pub sector_exposure_cap_pct: f64,
    pub per_trade_risk_cap_pct: f64,
    pub restricted_symbols: Vec<String>,
    pub sector_by_ticker: BTreeMap<String, String>,
}

pub struct ComplianceOutcome {
    pub approved: Vec<TradeOrder>,
    pub checks: Vec<ComplianceCheck>,
    /// Set when the same-ticker-both-sides safeguard fires: the whole plan
    /// is rejected, never silently rebalanced.
    pub safeguard_failure: Option<String>,
}

fn trade_notional(trade: &TradeOrder) -> f64 {
    if let Some(notional) = trade.notional {
        notional.as_dollars()
    } else if let (Some(qty), Some(stop)) = (trade.quantity, trade.stop_loss) {
        qty.as_f64() * stop.as_dollars()
    } else {
        0.0
    }
}

/// Per-trade risk dollars: shares times the stop distance, when known.
fn trade_risk_dollars(trade: &TradeOrder) -> f64 {
    match (trade.quantity, trade.stop_loss, trade.target) {
        (Some(qty), Some(stop), _) => {
            let entry = trade.notional.map(|n| n.as_dollars() / qty.as_f64().max(1e-9)).unwrap_or(stop.as_dollars());
            (entry - stop.as_dollars()).abs() * qty.as_f64()
        }
        _ => 0.0,
    }
}

pub fn evaluate(input: &ComplianceInput) -> ComplianceOutcome {
    let restricted: HashSet<&str> = input.restricted_symbols.iter().map(String::as_str).collect();

    let mut buy_tickers: HashSet<&str> = HashSet::new();
    let mut sell_tickers: HashSet<&str> = HashSet::new();
    for t in &input.trades {
        match t.side {
            Side::Buy => {
                buy_tickers.insert(t.ticker.as_str());
            }
            Side::Sell => {
                sell_tickers.insert(t.ticker.as_str());
            }
        }
    }
    let duplicate_intents: HashSet<&str> = buy_tickers.intersection(&sell_tickers).copied().collect();

    let mut sector_running: HashMap<&str, f64> = HashMap::new();
    let mut approved = Vec::new();
    let mut checks = Vec::new();

    for trade in &input.trades {
        let notional = trade_notional(trade);
        let sector = input.sector_by_ticker.get(trade.ticker.as_str()).map(String::as_str).unwrap_or("Unknown");

        let mut check_map = BTreeMap::new();

        let position_ok = input.portfolio_value <= 0.0 || notional / input.portfolio_value <= input.position_size_cap_pct;
        check_map.insert("position_size_cap".to_string(), position_ok);

        let projected_sector_total = sector_running.get(sector).copied().unwrap_or(0.0)
            + if matches!(trade.side, Side::Buy) { notional } else { 0.0 };
        let sector_ok =
            input.portfolio_value <= 0.0 || projected_sector_total / input.portfolio_value <= input.sector_exposure_cap_pct;
        check_map.insert("sector_exposure_cap".to_string(), sector_ok);

        let risk_dollars = trade_risk_dollars(trade);
        let risk_ok = input.portfolio_value <= 0.0 || risk_dollars / input.portfolio_value <= input.per_trade_risk_cap_pct;
        check_map.insert("per_trade_risk_cap".to_string(), risk_ok);

        let restricted_ok = !restricted.contains(trade.ticker.as_str());
        check_map.insert("restricted_symbol".to_string(), restricted_ok);

        // Recorded for transparency but not a per-trade rejection gate: the
        // hard safeguard below rejects the whole plan instead of silently
        // dropping one side of a same-ticker conflict.
        let duplicate_ok = !duplicate_intents.contains(trade.ticker.as_str());
        check_map.insert("duplicate_intent".to_string(), duplicate_ok);

        let all_ok = position_ok && sector_ok && risk_ok && restricted_ok;

        if all_ok {
            if matches!(trade.side, Side::Buy) {
                *sector_running.entry(sector).or_insert(0.0) += notional;
            }
            approved.push(trade.clone());
            checks.push(ComplianceCheck {
                approved: true,
                rejection_reason: None,
                rejection_category: None,
                checks: check_map,
                compliance_note: if duplicate_ok {
                    None
                } else {
                    Some("flagged: same ticker also appears on the opposite side of this plan".to_string())
                },
            });
        } else {
            let (reason, category) = first_failure(&check_map);
            checks.push(ComplianceCheck {
                approved: false,
                rejection_reason: Some(reason),
                rejection_category: Some(category),
                checks: check_map,
                compliance_note: None,
            });
        }
    }

    let mut approved_buys: HashSet<&str> = HashSet::new();
    let mut approved_sells: HashSet<&str> = HashSet::new();
    for t in &approved {
        match t.side {
            Side::Buy => {
                approved_buys.insert(t.ticker.as_str());
            }
            Side::Sell => {
                approved_sells.insert(t.ticker.as_str());
            }
        }
    }
    let conflict = approved_buys.intersection(&approved_sells).next().copied();

    if let Some(ticker) = conflict {
        return ComplianceOutcome {
            approved: Vec::new(),
            checks,
            safeguard_failure: Some(format!(
                "ticker {ticker} appears as both BUY and SELL in the approved set — rejecting the plan rather than rebalancing"
            )),
        };
    }

    ComplianceOutcome { approved, checks, safeguard_failure: None }
}

const GATING_CHECKS: [&str; 4] =
    ["position_size_cap", "sector_exposure_cap", "per_trade_risk_cap", "restricted_symbol"];

fn first_failure(checks: &BTreeMap<String, bool>) -> (String, String) {
    for name in GATING_CHECKS {
        let ok = checks.get(name).copied().unwrap_or(true);
        if !ok {
            let category = match name {
                "position_size_cap" => "POSITION_SIZE",
                "sector_exposure_cap" => "SECTOR_EXPOSURE",
                "per_trade_risk_cap" => "RISK",
                "restricted_symbol" => "RESTRICTED",
                "duplicate_intent" => "DUPLICATE_INTENT",
                _ => "UNKNOWN",
            };
            return (format!("failed check: {name}"), category.to_string());
        }
    }
    ("unknown".to_string(), "UNKNOWN".to_string())
}

pub struct ComplianceRunner;

#[async_trait]
impl StageRunner for ComplianceRunner {
    fn stage(&self) -> Stage {
        Stage::Compliance
    }

    async fn run(&self, input: Value) -> StageResult {
        let parsed: ComplianceInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return malformed_input(Stage::Compliance, e),
        };

        let total = parsed.trades.len();
        let outcome = evaluate(&parsed);

        if let Some(reason) = outcome.safeguard_failure {
            return StageResult::failed(Stage::Compliance, reason, 0, vec!["safeguard failure".to_string()]);
        }

        let approved_count = outcome.approved.len();
        let quality = if total == 0 { 100 } else { ((approved_count as f64 / total as f64) * 100.0).round() as i32 };

        let data = serde_json::json!({
            "approved": outcome.approved,
            "checks": outcome.checks,
        });

        StageResult::ok(
            Stage::Compliance,
            data,
            format!("{approved_count} of {total} trades approved"),
            quality,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_schemas::{OrderType, Ticker};

    fn trade(ticker: &str, side: Side, notional: f64) -> TradeOrder {
        TradeOrder {
            ticker: Ticker::new(ticker).unwrap(),
            side,
            order_type: OrderType::Notional,
            quantity: None,
            notional: Some(Micros::from_dollars(notional)),
            stop_loss: None,
            target: None,
            decision_id: None,
            note: String::new(),
        }
    }

    fn base_input(trades: Vec<TradeOrder>) -> ComplianceInput {
        ComplianceInput {
            trades,
            portfolio_value: 100_000.0,
            position_size_cap_pct: 0.10,
            sector_exposure_cap_pct: 0.30,
            per_trade_risk_cap_pct: 0.02,
            restricted_symbols: vec!["BADCO".to_string()],
            sector_by_ticker: BTreeMap::new(),
        }
    }

    #[test]
    fn restricted_symbol_is_rejected() {
        let input = base_input(vec![trade("BADCO", Side::Buy, 5_000.0)]);
        let outcome = evaluate(&input);
        assert!(outcome.approved.is_empty());
        assert_eq!(outcome.checks[0].rejection_category.as_deref(), Some("RESTRICTED"));
    }

    #[test]
    fn oversized_position_is_rejected() {
        let input = base_input(vec![trade("AAPL", Side::Buy, 20_000.0)]);
        let outcome = evaluate(&input);
        assert!(outcome.approved.is_empty());
    }

    #[test]
    fn same_ticker_both_sides_rejects_entire_plan() {
        let input = base_input(vec![trade("AAPL", Side::Buy, 5_000.0), trade("AAPL", Side::Sell, 5_000.0)]);
        let outcome = evaluate(&input);
        assert!(outcome.safeguard_failure.is_some());
        assert!(outcome.approved.is_empty());
    }

    #[test]
    fn clean_trade_is_approved() {
        let input = base_input(vec![trade("AAPL", Side::Buy, 5_000.0)]);
        let outcome = evaluate(&input);
        assert_eq!(outcome.approved.len(), 1);
        assert!(outcome.safeguard_failure.is_none());
    }
}
