//! Portfolio (§4.6.3): hard portfolio constraints, applied in order. Unlike
//! Risk, this stage actually drops candidates — every drop is recorded with
//! a structured reason.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use td_schemas::{Candidate, PortfolioSelection, RejectedCandidate, RejectionReason, Stage, StageResult};

use crate::{malformed_input, StageRunner};

#[derive(Debug, Deserialize, Serialize)]
pub struct PortfolioInput {
    /// Risk-enriched candidates (each carries `risk_metrics`).
    pub candidates: Vec<Candidate>,
    pub existing_position_count: i64,
    pub total_capital: f64,
    pub min_score: f64,
    pub max_positions: i64,
    pub max_capital_deployed_pct: f64,
}

pub struct PortfolioOutcome {
    pub accepted: Vec<PortfolioSelection>,
    pub rejected: Vec<RejectedCandidate>,
}

/// Applies the three hard gates in order: score floor, position-count cap,
/// capital-deployment cap. Never reorders survivors beyond the
/// composite-score sort the capacity gate needs.
pub fn apply_constraints(input: &PortfolioInput) -> PortfolioOutcome {
    let mut rejected = Vec::new();

    let (scored_ok, scored_out): (Vec<&Candidate>, Vec<&Candidate>) =
        input.candidates.iter().partition(|c| c.composite_score >= input.min_score);
    for c in scored_out {
        rejected.push(RejectedCandidate {
            ticker: c.ticker.clone(),
            reason: RejectionReason::LowScore,
            detail: format!(
                "composite score {:.1} is below the minimum threshold {:.1}",
                c.composite_score, input.min_score
            ),
        });
    }

    let mut ranked = scored_ok;
    ranked.sort_by(|a, b| b.composite_score.partial_cmp(&a.composite_score).unwrap());

    let available_slots = (input.max_positions - input.existing_position_count).max(0) as usize;
    if available_slots == 0 {
        for c in ranked {
            rejected.push(RejectedCandidate {
                ticker: c.ticker.clone(),
                reason: RejectionReason::MaxPositionsReached,
                detail: format!(
                    "portfolio is at maximum capacity ({}/{} positions)",
                    input.existing_position_count, input.max_positions
                ),
            });
        }
        return PortfolioOutcome { accepted: Vec::new(), rejected };
    }

    let (within_slots, beyond_slots) = if ranked.len() > available_slots {
        ranked.split_at(available_slots)
    } else {
        (ranked.as_slice(), [].as_slice())
    };
    for c in beyond_slots {
        rejected.push(RejectedCandidate {
            ticker: c.ticker.clone(),
            reason: RejectionReason::InsufficientCapacity,
            detail: format!(
                "only {available_slots} slots available out of {} max positions; this candidate (score {:.1}) ranked out",
                input.max_positions, c.composite_score
            ),
        });
    }

    let max_deploy = input.total_capital * input.max_capital_deployed_pct;
    let mut running_total = 0.0;
    let mut accepted = Vec::new();
    for c in within_slots {
        let Some(metrics) = c.risk_metrics.as_ref() else {
            rejected.push(RejectedCandidate {
                ticker: c.ticker.clone(),
                reason: RejectionReason::InsufficientCapital,
                detail: "no risk metrics attached, cannot size a position".to_string(),
            });
            continue;
        };
        let size = metrics.position_size_value.as_dollars();
        if running_total + size > max_deploy {
            rejected.push(RejectedCandidate {
                ticker: c.ticker.clone(),
                reason: RejectionReason::InsufficientCapital,
                detail: format!(
                    "deploying ${size:.2} would exceed the capital cap (${max_deploy:.2} of ${:.2} total)",
                    input.total_capital
                ),
            });
            continue;
        }
        running_total += size;
        accepted.push(PortfolioSelection {
            ticker: c.ticker.clone(),
            intended_shares: metrics.position_size_shares,
            intended_entry_price: metrics.entry_price,
            intended_stop: metrics.stop_loss,
            intended_target: metrics.target_price,
            sector: c.sector.clone(),
            composite_score: c.composite_score,
        });
    }

    PortfolioOutcome { accepted, rejected }
}

pub struct PortfolioRunner;

#[async_trait]
impl StageRunner for PortfolioRunner {
    fn stage(&self) -> Stage {
        Stage::Portfolio
    }

    async fn run(&self, input: Value) -> StageResult {
        let parsed: PortfolioInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return malformed_input(Stage::Portfolio, e),
        };

        let total_candidates = parsed.candidates.len();
        let outcome = apply_constraints(&parsed);
        let accepted_count = outcome.accepted.len();

        let quality = if total_candidates == 0 {
            0
        } else {
            ((accepted_count as f64 / total_candidates as f64) * 100.0).round() as i32
        };

        let data = serde_json::json!({
            "accepted": outcome.accepted,
            "rejected": outcome.rejected,
        });

        if accepted_count == 0 {
            return StageResult::failed(
                Stage::Portfolio,
                "no candidates survived the portfolio constraints",
                quality,
                vec!["zero accepted selections".to_string()],
            );
        }

        StageResult::ok(
            Stage::Portfolio,
            data,
            format!("{accepted_count} accepted, {} rejected", outcome.rejected.len()),
            quality,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_schemas::{CandidateContext, Micros, RiskMetrics, Shares, Ticker};

    fn candidate(ticker: &str, composite: f64, position_value: f64) -> Candidate {
        Candidate {
            ticker: Ticker::new(ticker).unwrap(),
            composite_score: composite,
            technical_score: composite,
            fundamental_score: composite,
            sentiment_score: 50.0,
            sector: "Technology".to_string(),
            current_price: Micros::from_dollars(100.0),
            context: CandidateContext::BuyCandidate,
            risk_metrics: Some(RiskMetrics {
                entry_price: Micros::from_dollars(100.0),
                stop_loss: Micros::from_dollars(90.0),
                target_price: Micros::from_dollars(120.0),
                atr: Micros::from_dollars(5.0),
                volatility_pct: 30.0,
                risk_reward_ratio: 2.0,
                position_size_shares: Shares::from_f64(10.0),
                position_size_value: Micros::from_dollars(position_value),
                total_risk_dollars: Micros::from_dollars(100.0),
                total_risk_pct: 1.0,
                risk_score: 80,
                warnings: Vec::new(),
            }),
            risk_score: Some(80),
            risk_warnings: Vec::new(),
        }
    }

    #[test]
    fn low_score_candidates_are_rejected() {
        let input = PortfolioInput {
            candidates: vec![candidate("AAPL", 40.0, 10_000.0)],
            existing_position_count: 0,
            total_capital: 100_000.0,
            min_score: 60.0,
            max_positions: 20,
            max_capital_deployed_pct: 0.90,
        };
        let outcome = apply_constraints(&input);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected[0].reason, RejectionReason::LowScore);
    }

    #[test]
    fn capital_cap_truncates_by_rank() {
        let input = PortfolioInput {
            candidates: vec![
                candidate("AAPL", 90.0, 60_000.0),
                candidate("MSFT", 80.0, 60_000.0),
            ],
            existing_position_count: 0,
            total_capital: 100_000.0,
            min_score: 60.0,
            max_positions: 20,
            max_capital_deployed_pct: 0.90,
        };
        let outcome = apply_constraints(&input);
        assert_eq!(outcome.accepted.len(), 1);
        assert_eq!(outcome.accepted[0].ticker.as_str(), "AAPL");
        assert_eq!(outcome.rejected[0].reason, RejectionReason::InsufficientCapital);
    }

    #[test]
    fn max_positions_reached_rejects_everyone() {
        let input = PortfolioInput {
            candidates: vec![candidate("AAPL", 90.0, 10_000.0)],
            existing_position_count: 20,
            total_capital: 100_000.0,
            min_score: 60.0,
            max_positions: 20,
            max_capital_deployed_pct: 0.90,
        };
        let outcome = apply_constraints(&input);
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected[0].reason, RejectionReason::MaxPositionsReached);
    }
}
