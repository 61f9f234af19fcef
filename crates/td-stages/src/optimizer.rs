//! AI Optimizer (§4.6.4). Hands the LLM provider a bounded prompt — at most
//! 40 candidates, already carrying full Risk data — and parses its
//! allocation back. Any error or constraint violation from the provider
//! falls back to a deterministic equal-weight allocation so a flaky
//! collaborator never blocks the pipeline.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use td_providers::llm::LlmOptimizer;
use td_schemas::{AIAllocation, Micros, PortfolioSelection, RiskMetrics, Stage, StageResult, Ticker};

use crate::{malformed_input, StageRunner};

const MAX_CANDIDATES_TO_LLM: usize = 40;
const FALLBACK_CANDIDATE_COUNT: usize = 10;
const FALLBACK_DEPLOYMENT_PCT: f64 = 0.90;
const MAX_SINGLE_ALLOCATION_PCT: f64 = 0.10;
const MIN_DEPLOYMENT_PCT: f64 = 0.90;
const MAX_DEPLOYMENT_PCT: f64 = 1.00;
const MAX_SECTOR_CONCENTRATION_PCT: f64 = 0.30;
const MIN_TARGET_POSITIONS: usize = 15;
const MAX_TARGET_POSITIONS: usize = 20;
const SELL_ON_DOWNGRADE_THRESHOLD: f64 = 55.0;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerCandidate {
    pub selection: PortfolioSelection,
    pub risk_metrics: RiskMetrics,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerHolding {
    pub ticker: Ticker,
    pub composite_score: f64,
    pub sector: String,
    pub market_value: Micros,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OptimizerInput {
    /// Ranked descending by composite score (Portfolio's output order).
    pub candidates: Vec<OptimizerCandidate>,
    pub holdings: Vec<OptimizerHolding>,
    pub available_capital: f64,
    pub total_portfolio_value: f64,
}

#[derive(Debug, Deserialize)]
struct LlmSell {
    ticker: Ticker,
    sell_pct: f64,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct LlmBuy {
    ticker: Ticker,
    allocated_capital: f64,
    #[serde(default)]
    is_position_adjustment: bool,
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct LlmResponse {
    #[serde(default)]
    sells: Vec<LlmSell>,
    buys: Vec<LlmBuy>,
    total_allocated: f64,
    #[serde(default)]
    deployment_pct: f64,
    #[serde(default)]
    portfolio_reasoning: String,
}

#[derive(Debug, Serialize)]
struct OptimizerDecision {
    allocations: Vec<AIAllocation>,
    used_llm: bool,
    portfolio_reasoning: String,
}

fn build_prompt(input: &OptimizerInput) -> String {
    let candidates: Vec<&OptimizerCandidate> = input.candidates.iter().take(MAX_CANDIDATES_TO_LLM).collect();
    let payload = serde_json::json!({
        "candidates": candidates,
        "holdings": input.holdings,
        "available_capital": input.available_capital,
        "total_portfolio_value": input.total_portfolio_value,
        "constraints": {
            "target_position_range": [MIN_TARGET_POSITIONS, MAX_TARGET_POSITIONS],
            "max_single_allocation_pct": MAX_SINGLE_ALLOCATION_PCT,
            "deployment_pct_range": [MIN_DEPLOYMENT_PCT, MAX_DEPLOYMENT_PCT],
            "max_sector_concentration_pct": MAX_SECTOR_CONCENTRATION_PCT,
        },
    });
    payload.to_string()
}

fn violates_constraints(resp: &LlmResponse, portfolio_value: f64, candidates: &[OptimizerCandidate]) -> bool {
    let n = resp.buys.len();
    if !(MIN_TARGET_POSITIONS..=MAX_TARGET_POSITIONS).contains(&n) {
        return true;
    }
    if portfolio_value <= 0.0 {
        return true;
    }
    for buy in &resp.buys {
        if buy.allocated_capital / portfolio_value > MAX_SINGLE_ALLOCATION_PCT + 1e-9 {
            return true;
        }
    }
    if !(MIN_DEPLOYMENT_PCT - 1e-6..=MAX_DEPLOYMENT_PCT + 1e-6).contains(&resp.deployment_pct) {
        return true;
    }

    let sector_of: std::collections::HashMap<&str, &str> =
        candidates.iter().map(|c| (c.selection.ticker.as_str(), c.selection.sector.as_str())).collect();
    let mut by_sector: std::collections::HashMap<&str, f64> = std::collections::HashMap::new();
    for buy in &resp.buys {
        if let Some(sector) = sector_of.get(buy.ticker.as_str()) {
            *by_sector.entry(sector).or_insert(0.0) += buy.allocated_capital;
        }
    }
    by_sector.values().any(|v| v / portfolio_value > MAX_SECTOR_CONCENTRATION_PCT + 1e-9)
}

fn llm_response_to_allocations(resp: LlmResponse) -> Vec<AIAllocation> {
    let mut out = Vec::with_capacity(resp.buys.len() + resp.sells.len());
    for buy in resp.buys {
        out.push(AIAllocation::Buy {
            ticker: buy.ticker,
            allocated_capital: Micros::from_dollars(buy.allocated_capital),
            is_position_adjustment: buy.is_position_adjustment,
            reasoning: buy.reasoning,
            conviction_level: 75,
        });
    }
    for sell in resp.sells {
        out.push(AIAllocation::Sell { ticker: sell.ticker, sell_pct: sell.sell_pct, reasoning: sell.reasoning });
    }
    out
}

/// Deterministic fallback, per §4.6.4: top 10 non-held candidates by
/// composite, equal-weight 90% of capital; any held ticker scoring below 55
/// is marked SELL. Same inputs always produce the same output.
pub fn fallback_allocation(input: &OptimizerInput) -> Vec<AIAllocation> {
    let held: HashSet<&str> = input.holdings.iter().map(|h| h.ticker.as_str()).collect();

    let mut ranked: Vec<&OptimizerCandidate> =
        input.candidates.iter().filter(|c| !held.contains(c.selection.ticker.as_str())).collect();
    ranked.sort_by(|a, b| b.selection.composite_score.partial_cmp(&a.selection.composite_score).unwrap());
    let top: Vec<&OptimizerCandidate> = ranked.into_iter().take(FALLBACK_CANDIDATE_COUNT).collect();

    let mut out = Vec::new();
    if !top.is_empty() {
        let per_position = input.available_capital * FALLBACK_DEPLOYMENT_PCT / top.len() as f64;
        for c in &top {
            out.push(AIAllocation::Buy {
                ticker: c.selection.ticker.clone(),
                allocated_capital: Micros::from_dollars(per_position),
                is_position_adjustment: false,
                reasoning: "Fallback deterministic allocation: LLM optimizer unavailable or produced invalid output."
                    .to_string(),
                conviction_level: 50,
            });
        }
    }

    for h in &input.holdings {
        if h.composite_score < SELL_ON_DOWNGRADE_THRESHOLD {
            out.push(AIAllocation::Sell {
                ticker: h.ticker.clone(),
                sell_pct: 100.0,
                reasoning: format!(
                    "Fallback: composite score {:.1} fell below the {SELL_ON_DOWNGRADE_THRESHOLD:.0} hold threshold.",
                    h.composite_score
                ),
            });
        }
    }

    out
}

async fn optimize(
    llm: &dyn LlmOptimizer,
    input: &OptimizerInput,
) -> OptimizerDecision {
    let prompt = build_prompt(input);
    let llm_result = llm.optimize(&prompt).await;

    let parsed = match llm_result {
        Ok(value) => serde_json::from_value::<LlmResponse>(value).ok(),
        Err(e) => {
            tracing::warn!(error = %e, "LLM optimizer call failed, using fallback allocation");
            None
        }
    };

    match parsed {
        Some(resp) if !violates_constraints(&resp, input.total_portfolio_value, &input.candidates) => {
            let reasoning = resp.portfolio_reasoning.clone();
            OptimizerDecision { allocations: llm_response_to_allocations(resp), used_llm: true, portfolio_reasoning: reasoning }
        }
        Some(_) => {
            tracing::warn!("LLM optimizer output violated allocation constraints, using fallback");
            OptimizerDecision {
                allocations: fallback_allocation(input),
                used_llm: false,
                portfolio_reasoning: "fallback: LLM output violated constraints".to_string(),
            }
        }
        None => OptimizerDecision {
            allocations: fallback_allocation(input),
            used_llm: false,
            portfolio_reasoning: "fallback: LLM call failed or returned unparsable output".to_string(),
        },
    }
}

pub struct AiOptimizerRunner {
    pub llm: Arc<dyn LlmOptimizer>,
}

impl AiOptimizerRunner {
    pub fn new(llm: Arc<dyn LlmOptimizer>) -> Self {
        AiOptimizerRunner { llm }
    }
}

#[async_trait]
impl StageRunner for AiOptimizerRunner {
    fn stage(&self) -> Stage {
        Stage::AiOptimizer
    }

    async fn run(&self, input: Value) -> StageResult {
        let parsed: OptimizerInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return malformed_input(Stage::AiOptimizer, e),
        };

        if parsed.candidates.is_empty() && parsed.holdings.is_empty() {
            return StageResult::failed(Stage::AiOptimizer, "no candidates or holdings to allocate", 0, vec![]);
        }

        let decision = optimize(self.llm.as_ref(), &parsed).await;
        let quality = if decision.used_llm { 90 } else { 60 };
        let issues = if decision.used_llm { vec![] } else { vec!["used deterministic fallback allocation".to_string()] };

        let data = serde_json::json!({
            "allocations": decision.allocations,
            "used_llm": decision.used_llm,
            "portfolio_reasoning": decision.portfolio_reasoning,
        });

        StageResult {
            stage: Stage::AiOptimizer,
            success: true,
            data,
            message: format!("{} allocations produced ({})", decision.allocations.len(), if decision.used_llm { "LLM" } else { "fallback" }),
            quality_score: quality,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use td_schemas::Shares;

    fn risk_metrics() -> RiskMetrics {
        RiskMetrics {
            entry_price: Micros::from_dollars(100.0),
            stop_loss: Micros::from_dollars(90.0),
            target_price: Micros::from_dollars(120.0),
            atr: Micros::from_dollars(5.0),
            volatility_pct: 30.0,
            risk_reward_ratio: 2.0,
            position_size_shares: Shares::from_f64(10.0),
            position_size_value: Micros::from_dollars(10_000.0),
            total_risk_dollars: Micros::from_dollars(100.0),
            total_risk_pct: 1.0,
            risk_score: 80,
            warnings: vec![],
        }
    }

    fn candidate(ticker: &str, composite: f64) -> OptimizerCandidate {
        OptimizerCandidate {
            selection: PortfolioSelection {
                ticker: Ticker::new(ticker).unwrap(),
                intended_shares: Shares::from_f64(10.0),
                intended_entry_price: Micros::from_dollars(100.0),
                intended_stop: Micros::from_dollars(90.0),
                intended_target: Micros::from_dollars(120.0),
                sector: "Technology".to_string(),
                composite_score: composite,
            },
            risk_metrics: risk_metrics(),
        }
    }

    #[test]
    fn fallback_is_deterministic_and_equal_weight() {
        let input = OptimizerInput {
            candidates: (0..12).map(|i| candidate(&format!("T{i}"), 90.0 - i as f64)).collect(),
            holdings: vec![OptimizerHolding {
                ticker: Ticker::new("HELD").unwrap(),
                composite_score: 40.0,
                sector: "Technology".to_string(),
                market_value: Micros::from_dollars(5_000.0),
            }],
            available_capital: 100_000.0,
            total_portfolio_value: 150_000.0,
        };

        let a = fallback_allocation(&input);
        let b = fallback_allocation(&input);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());

        let buys: Vec<&AIAllocation> = a.iter().filter(|x| matches!(x, AIAllocation::Buy { .. })).collect();
        assert_eq!(buys.len(), FALLBACK_CANDIDATE_COUNT);

        let sells: Vec<&AIAllocation> = a.iter().filter(|x| matches!(x, AIAllocation::Sell { .. })).collect();
        assert_eq!(sells.len(), 1);
    }

    #[test]
    fn constraint_violation_detects_oversized_allocation() {
        let candidates = vec![candidate("AAPL", 90.0)];
        let resp = LlmResponse {
            sells: vec![],
            buys: vec![LlmBuy {
                ticker: Ticker::new("AAPL").unwrap(),
                allocated_capital: 50_000.0,
                is_position_adjustment: false,
                reasoning: "test".to_string(),
            }],
            total_allocated: 50_000.0,
            deployment_pct: 0.95,
            portfolio_reasoning: "test".to_string(),
        };
        assert!(violates_constraints(&resp, 100_000.0, &candidates));
    }
}
