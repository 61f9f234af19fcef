//! Workflow Coordinator (C7) + Plan Lifecycle (C8).
//!
//! The Coordinator drives the five stage runners in strict order over the
//! Message Bus: a stage's result is published and routed to the next
//! stage's inbox only after it reports success; a non-success result stops
//! the cycle and is escalated instead of continuing with partial data.
//! [`PlanMachine`] (in [`plan_state`]) then owns every transition the
//! assembled plan makes from `READY_FOR_APPROVAL` onward.

pub mod execute;
pub mod plan_state;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use td_bus::Bus;
use td_providers::llm::LlmOptimizer;
use td_schemas::{
    message_type, AIAllocation, Candidate, Escalation, Micros, OrderType, PlanStatus, PlanSummary,
    Priority, RiskMetrics, Severity, Side, Stage, StageResult, StageSummaryEntry, TradeOrder, TradingPlan,
};
use td_stages::compliance::{ComplianceInput, ComplianceRunner};
use td_stages::optimizer::{AiOptimizerRunner, OptimizerCandidate, OptimizerHolding, OptimizerInput};
use td_stages::portfolio::{PortfolioInput, PortfolioRunner};
use td_stages::research::{ResearchCandidateSeed, ResearchInput, ResearchRunner};
use td_stages::risk::{RiskCandidateInput, RiskInput, RiskRunner};
use td_stages::StageRunner;

pub use execute::{ExecuteOutcome, PlanExecutor};
pub use plan_state::{is_terminal, PlanEvent, PlanMachine, TransitionError};

/// Composite score floor a candidate must clear to reach Portfolio's slot
/// ranking (§4.6.3's `min_score`). Not one of the recognized configuration
/// keys (§6.5); fixed here to match the nominal scenario's "score ≥ 60"
/// acceptance bar rather than invented without grounding. See DESIGN.md.
pub const MIN_COMPOSITE_SCORE: f64 = 60.0;

const SENDER: &str = "Coordinator";

#[derive(Debug, Clone)]
pub struct PortfolioConstraints {
    pub existing_position_count: i64,
    pub total_capital: f64,
    pub max_positions: i64,
    pub max_capital_deployed_pct: f64,
}

#[derive(Debug, Clone)]
pub struct ComplianceConstraints {
    pub portfolio_value: f64,
    pub position_size_cap_pct: f64,
    pub sector_exposure_cap_pct: f64,
    pub per_trade_risk_cap_pct: f64,
    pub restricted_symbols: Vec<String>,
    pub sector_by_ticker: BTreeMap<String, String>,
}

/// Everything one Coordinator cycle needs that isn't internal stage wiring:
/// the candidate universe, capital and position-count limits, the current
/// holdings the AI Optimizer must consider alongside new candidates, and
/// the Compliance rule set.
pub struct CycleRequest {
    pub universe: Vec<ResearchCandidateSeed>,
    pub research_target_count: usize,
    pub research_min_required: usize,
    pub available_capital: f64,
    pub portfolio: PortfolioConstraints,
    pub holdings: Vec<OptimizerHolding>,
    pub total_portfolio_value: f64,
    pub compliance: ComplianceConstraints,
}

pub enum CycleOutcome {
    Plan(TradingPlan),
    /// A stage reported `success = false`: an `Escalation` was published and
    /// the cycle stopped, per §4.7.
    Escalated {
        escalation: Escalation,
        workflow_summary: Vec<StageSummaryEntry>,
        stage_quality: BTreeMap<String, i32>,
    },
    /// The Coordinator itself could not make sense of a stage's output
    /// (missing field, shape mismatch) — an internal defect, not a
    /// stage-reported quality failure. No plan, partial or otherwise, is
    /// ever emitted.
    Failed {
        reason: String,
        workflow_summary: Vec<StageSummaryEntry>,
        stage_quality: BTreeMap<String, i32>,
    },
}

pub struct WorkflowCoordinator {
    bus: Bus,
    research: ResearchRunner,
    risk: RiskRunner,
    portfolio: PortfolioRunner,
    optimizer: AiOptimizerRunner,
    compliance: ComplianceRunner,
}

impl WorkflowCoordinator {
    pub fn new(bus: Bus, llm: Arc<dyn LlmOptimizer>) -> Self {
        WorkflowCoordinator {
            bus,
            research: ResearchRunner,
            risk: RiskRunner,
            portfolio: PortfolioRunner,
            optimizer: AiOptimizerRunner::new(llm),
            compliance: ComplianceRunner,
        }
    }

    pub async fn run_cycle(&self, plan_id: &str, generated_at: DateTime<Utc>, request: CycleRequest) -> CycleOutcome {
        let mut workflow_summary = Vec::new();
        let mut stage_quality = BTreeMap::new();

        let bars_by_ticker: BTreeMap<String, Vec<td_schemas::PriceBar>> = request
            .universe
            .iter()
            .map(|s| (s.ticker.as_str().to_string(), s.bars.clone()))
            .collect();

        // --- Research ---
        let research_input = serde_json::json!(ResearchInput {
            universe: request.universe,
            target_count: request.research_target_count,
            min_required: request.research_min_required,
        });
        let research_result = self.research.run(research_input).await;
        self.advance(&research_result, &mut workflow_summary, &mut stage_quality);
        if !research_result.success {
            return self.escalate(research_result, workflow_summary, stage_quality);
        }
        let mut candidates: Vec<Candidate> = match extract(&research_result, "candidates") {
            Ok(v) => v,
            Err(reason) => return CycleOutcome::Failed { reason, workflow_summary, stage_quality },
        };
        deterministic_order(&mut candidates);

        // --- Risk ---
        let risk_inputs: Vec<RiskCandidateInput> = candidates
            .into_iter()
            .map(|c| {
                let bars = bars_by_ticker.get(c.ticker.as_str()).cloned().unwrap_or_default();
                RiskCandidateInput { candidate: c, bars }
            })
            .collect();
        let risk_input = serde_json::json!(RiskInput {
            candidates: risk_inputs,
            available_capital: request.available_capital,
        });
        let risk_result = self.risk.run(risk_input).await;
        self.advance(&risk_result, &mut workflow_summary, &mut stage_quality);
        if !risk_result.success {
            return self.escalate(risk_result, workflow_summary, stage_quality);
        }
        let mut risk_candidates: Vec<Candidate> = match extract(&risk_result, "candidates") {
            Ok(v) => v,
            Err(reason) => return CycleOutcome::Failed { reason, workflow_summary, stage_quality },
        };
        deterministic_order(&mut risk_candidates);
        let risk_by_ticker: BTreeMap<String, RiskMetrics> = risk_candidates
            .iter()
            .filter_map(|c| c.risk_metrics.clone().map(|m| (c.ticker.as_str().to_string(), m)))
            .collect();

        // --- Portfolio ---
        let portfolio_input = serde_json::json!(PortfolioInput {
            candidates: risk_candidates,
            existing_position_count: request.portfolio.existing_position_count,
            total_capital: request.portfolio.total_capital,
            min_score: MIN_COMPOSITE_SCORE,
            max_positions: request.portfolio.max_positions,
            max_capital_deployed_pct: request.portfolio.max_capital_deployed_pct,
        });
        let portfolio_result = self.portfolio.run(portfolio_input).await;
        self.advance(&portfolio_result, &mut workflow_summary, &mut stage_quality);
        if !portfolio_result.success {
            return self.escalate(portfolio_result, workflow_summary, stage_quality);
        }
        let accepted: Vec<td_schemas::PortfolioSelection> = match extract(&portfolio_result, "accepted") {
            Ok(v) => v,
            Err(reason) => return CycleOutcome::Failed { reason, workflow_summary, stage_quality },
        };

        // --- AI Optimizer ---
        let optimizer_candidates: Vec<OptimizerCandidate> = accepted
            .into_iter()
            .filter_map(|selection| {
                let metrics = risk_by_ticker.get(selection.ticker.as_str())?.clone();
                Some(OptimizerCandidate { selection, risk_metrics: metrics })
            })
            .collect();
        let holdings_value_by_ticker: BTreeMap<String, Micros> = request
            .holdings
            .iter()
            .map(|h| (h.ticker.as_str().to_string(), h.market_value))
            .collect();
        let optimizer_input = serde_json::json!(OptimizerInput {
            candidates: optimizer_candidates,
            holdings: request.holdings,
            available_capital: request.available_capital,
            total_portfolio_value: request.total_portfolio_value,
        });
        let optimizer_result = self.optimizer.run(optimizer_input).await;
        self.advance(&optimizer_result, &mut workflow_summary, &mut stage_quality);
        if !optimizer_result.success {
            return self.escalate(optimizer_result, workflow_summary, stage_quality);
        }
        let allocations: Vec<AIAllocation> = match extract(&optimizer_result, "allocations") {
            Ok(v) => v,
            Err(reason) => return CycleOutcome::Failed { reason, workflow_summary, stage_quality },
        };

        // --- Compliance ---
        let trades: Vec<TradeOrder> = allocations
            .iter()
            .map(|a| allocation_to_trade_order(a, &holdings_value_by_ticker, &risk_by_ticker))
            .collect();
        let compliance_input = serde_json::json!(ComplianceInput {
            trades,
            portfolio_value: request.compliance.portfolio_value,
            position_size_cap_pct: request.compliance.position_size_cap_pct,
            sector_exposure_cap_pct: request.compliance.sector_exposure_cap_pct,
            per_trade_risk_cap_pct: request.compliance.per_trade_risk_cap_pct,
            restricted_symbols: request.compliance.restricted_symbols,
            sector_by_ticker: request.compliance.sector_by_ticker,
        });
        let compliance_result = self.compliance.run(compliance_input).await;
        self.advance(&compliance_result, &mut workflow_summary, &mut stage_quality);
        if !compliance_result.success {
            return self.escalate(compliance_result, workflow_summary, stage_quality);
        }
        let approved_trades: Vec<TradeOrder> = match extract(&compliance_result, "approved") {
            Ok(v) => v,
            Err(reason) => return CycleOutcome::Failed { reason, workflow_summary, stage_quality },
        };

        let overall = if stage_quality.is_empty() {
            0
        } else {
            (stage_quality.values().sum::<i32>() as f64 / stage_quality.len() as f64).round() as i32
        };

        let plan = TradingPlan {
            plan_id: plan_id.to_string(),
            generated_at,
            status: PlanStatus::ReadyForApproval,
            summary: PlanSummary { overall_quality_score: overall },
            stage_quality,
            trades: approved_trades,
            workflow_summary,
        };

        self.publish(
            SENDER,
            "PlanLifecycle",
            message_type::DAILY_BRIEFING,
            "trading plan ready for approval",
            &format!(
                "plan {} ready for approval, overall quality {}",
                plan.plan_id, plan.summary.overall_quality_score
            ),
            Some(serde_json::json!(plan)),
            Priority::High,
        );

        CycleOutcome::Plan(plan)
    }

    /// Records the stage's result in the running summary, then publishes it
    /// to the Bus addressed to the next stage's inbox (Compliance, having
    /// none, addresses the Coordinator itself, which is what assembles the
    /// final plan).
    fn advance(&self, result: &StageResult, workflow_summary: &mut Vec<StageSummaryEntry>, stage_quality: &mut BTreeMap<String, i32>) {
        stage_quality.insert(result.stage.as_str().to_string(), result.quality_score);
        workflow_summary.push(StageSummaryEntry {
            stage: result.stage.as_str().to_string(),
            success: result.success,
            quality_score: result.quality_score,
            message: result.message.clone(),
            issues: result.issues.clone(),
        });

        let to = result.stage.next().map(|s| s.as_str()).unwrap_or(SENDER);
        self.publish(
            result.stage.as_str(),
            to,
            stage_message_type(result.stage),
            &format!("{} stage result", result.stage.as_str()),
            &result.message,
            Some(serde_json::json!(result)),
            Priority::Routine,
        );
    }

    fn escalate(
        &self,
        result: StageResult,
        workflow_summary: Vec<StageSummaryEntry>,
        stage_quality: BTreeMap<String, i32>,
    ) -> CycleOutcome {
        let severity = if result.quality_score < 30 { Severity::Critical } else { Severity::Warning };
        let recommendation = if severity == Severity::Critical {
            "halt the cycle and page an operator".to_string()
        } else {
            "review the stage output before the next scheduled cycle".to_string()
        };
        let escalation = Escalation {
            stage: result.stage.as_str().to_string(),
            issue_type: "STAGE_FAILED".to_string(),
            severity,
            context: serde_json::json!({
                "message": result.message,
                "issues": result.issues,
                "quality_score": result.quality_score,
            }),
            options: vec!["retry the cycle".to_string(), "escalate to an operator".to_string()],
            recommendation,
        };

        self.publish(
            result.stage.as_str(),
            "Operator",
            message_type::ESCALATION,
            "stage escalation",
            &result.message,
            Some(serde_json::json!(escalation)),
            if severity == Severity::Critical { Priority::Critical } else { Priority::Urgent },
        );

        CycleOutcome::Escalated { escalation, workflow_summary, stage_quality }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish(&self, from: &str, to: &str, message_type: &str, subject: &str, body: &str, payload: Option<Value>, priority: Priority) {
        match self.bus.write(from, to, message_type, subject, body, payload, priority, false, None) {
            Ok(message_id) => {
                if let Err(e) = self.bus.route(&message_id, from, to) {
                    tracing::warn!(from, to, error = %e, "failed to route bus message");
                }
            }
            Err(e) => tracing::warn!(from, to, error = %e, "failed to publish bus message"),
        }
    }
}

/// Stage results that are reasonably described by one of the required
/// message types (§6.4) use it; the remaining two stage boundaries get
/// their own descriptive type rather than being mislabeled.
fn stage_message_type(stage: Stage) -> &'static str {
    match stage {
        Stage::Research => message_type::DAILY_BRIEFING,
        Stage::Risk => message_type::RISK_ASSESSMENT,
        Stage::Portfolio => "PortfolioSelection",
        Stage::AiOptimizer => "AiAllocation",
        Stage::Compliance => "ComplianceApproval",
    }
}

fn extract<T: DeserializeOwned>(result: &StageResult, field: &str) -> Result<T, String> {
    let value = result
        .data
        .get(field)
        .cloned()
        .ok_or_else(|| format!("{} stage result missing field '{field}'", result.stage.as_str()))?;
    serde_json::from_value(value)
        .map_err(|e| format!("{} stage result field '{field}' did not match the expected shape: {e}", result.stage.as_str()))
}

/// §4.7's ordering guarantee ("primary key: descending composite score,
/// tie-break: ticker ascending"), enforced once at the Coordinator boundary
/// rather than duplicated inside every stage that hands a candidate list
/// onward.
fn deterministic_order(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.composite_score
            .partial_cmp(&a.composite_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.ticker.as_str().cmp(b.ticker.as_str()))
    });
}

fn allocation_to_trade_order(
    alloc: &AIAllocation,
    holdings_value_by_ticker: &BTreeMap<String, Micros>,
    risk_by_ticker: &BTreeMap<String, RiskMetrics>,
) -> TradeOrder {
    match alloc {
        AIAllocation::Buy { ticker, allocated_capital, reasoning, .. } => {
            let risk = risk_by_ticker.get(ticker.as_str());
            TradeOrder {
                ticker: ticker.clone(),
                side: Side::Buy,
                order_type: OrderType::Notional,
                quantity: None,
                notional: Some(*allocated_capital),
                stop_loss: risk.map(|r| r.stop_loss),
                target: risk.map(|r| r.target_price),
                decision_id: None,
                note: reasoning.clone(),
            }
        }
        AIAllocation::Sell { ticker, sell_pct, reasoning } => {
            // `sell_pct` is on a 0-100 scale (100.0 == the whole position);
            // `Micros::mul_pct` wants a plain fraction.
            let notional = holdings_value_by_ticker.get(ticker.as_str()).map(|v| v.mul_pct(*sell_pct / 100.0));
            TradeOrder {
                ticker: ticker.clone(),
                side: Side::Sell,
                order_type: OrderType::Notional,
                quantity: None,
                notional,
                stop_loss: None,
                target: None,
                decision_id: None,
                note: format!("{reasoning} (sell {sell_pct:.0}% of position)"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use td_providers::llm::FixtureLlmOptimizer;
    use td_schemas::{Micros as M, Ticker};
    use td_stages::research::ResearchCandidateSeed;

    // Mirrors the `rising_bars` fixture in td-stages' own research tests: a
    // net uptrend with a pullback every fourth day, so the trailing RSI
    // settles in the 55-65 range rather than pegging at 100 (a pure
    // monotonic series has zero down days, which clears no filter preset's
    // upper band).
    fn rising_bars(ticker: &str, n: u32) -> Vec<td_schemas::PriceBar> {
        (1..=n)
            .map(|d| {
                let pullback = if d % 4 == 0 { -2.5 } else { 0.0 };
                let close = 50.0 + d as f64 * 0.3 + pullback;
                td_schemas::PriceBar {
                    ticker: Ticker::new(ticker).unwrap(),
                    date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap() + chrono::Duration::days(d as i64),
                    open: M::from_dollars(close),
                    high: M::from_dollars(close + 1.0),
                    low: M::from_dollars(close - 1.0),
                    close: M::from_dollars(close),
                    volume: 1_500_000,
                }
            })
            .collect()
    }

    fn seed(ticker: &str) -> ResearchCandidateSeed {
        ResearchCandidateSeed {
            ticker: Ticker::new(ticker).unwrap(),
            sector: "Technology".to_string(),
            bars: rising_bars(ticker, 60),
            fundamentals: td_providers::market_data::Fundamentals {
                sector: Some("Technology".to_string()),
                industry: Some("Software".to_string()),
                market_cap: Some(1.0e11),
                trailing_pe: Some(18.0),
                forward_pe: Some(16.0),
                price_to_book: Some(2.0),
                return_on_equity: Some(0.20),
                profit_margins: Some(0.20),
                revenue_growth: Some(0.15),
                earnings_growth: Some(0.15),
                debt_to_equity: Some(0.3),
                current_ratio: Some(2.5),
                week52_high: Some(120.0),
                week52_low: Some(60.0),
            },
            sentiment_score: Some(65.0),
        }
    }

    fn fixture_llm_response() -> serde_json::Value {
        serde_json::json!({
            "sells": [],
            "buys": [],
            "total_allocated": 0.0,
            "deployment_pct": 0.0,
            "portfolio_reasoning": "fixture response",
        })
    }

    #[tokio::test]
    async fn a_clean_cycle_produces_a_ready_for_approval_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        let llm = Arc::new(FixtureLlmOptimizer::new(fixture_llm_response()));
        let coordinator = WorkflowCoordinator::new(bus, llm);

        let request = CycleRequest {
            universe: vec![seed("AAPL"), seed("MSFT"), seed("GOOGL")],
            research_target_count: 3,
            research_min_required: 1,
            available_capital: 60_000.0,
            portfolio: PortfolioConstraints {
                existing_position_count: 0,
                total_capital: 100_000.0,
                max_positions: 20,
                max_capital_deployed_pct: 0.90,
            },
            holdings: vec![],
            total_portfolio_value: 100_000.0,
            compliance: ComplianceConstraints {
                portfolio_value: 100_000.0,
                position_size_cap_pct: 0.25,
                sector_exposure_cap_pct: 0.60,
                per_trade_risk_cap_pct: 0.02,
                restricted_symbols: vec![],
                sector_by_ticker: BTreeMap::new(),
            },
        };

        let outcome = coordinator.run_cycle("plan-test-1", Utc::now(), request).await;
        match outcome {
            CycleOutcome::Plan(plan) => {
                assert_eq!(plan.status, PlanStatus::ReadyForApproval);
                assert!(plan.scores_in_bounds());
                assert!(!plan.has_self_conflict());
                assert_eq!(plan.trades.len(), 3, "all three fallback-allocated buys should clear compliance");
            }
            CycleOutcome::Escalated { escalation, .. } => panic!("expected a plan, got escalation: {escalation:?}"),
            CycleOutcome::Failed { reason, .. } => panic!("expected a plan, got failure: {reason}"),
        }
    }

    #[tokio::test]
    async fn empty_universe_escalates_instead_of_panicking() {
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        let llm = Arc::new(FixtureLlmOptimizer::new(fixture_llm_response()));
        let coordinator = WorkflowCoordinator::new(bus, llm);

        let request = CycleRequest {
            universe: vec![],
            research_target_count: 10,
            research_min_required: 3,
            available_capital: 60_000.0,
            portfolio: PortfolioConstraints {
                existing_position_count: 0,
                total_capital: 100_000.0,
                max_positions: 20,
                max_capital_deployed_pct: 0.90,
            },
            holdings: vec![],
            total_portfolio_value: 100_000.0,
            compliance: ComplianceConstraints {
                portfolio_value: 100_000.0,
                position_size_cap_pct: 0.10,
                sector_exposure_cap_pct: 0.30,
                per_trade_risk_cap_pct: 0.02,
                restricted_symbols: vec![],
                sector_by_ticker: BTreeMap::new(),
            },
        };

        let outcome = coordinator.run_cycle("plan-test-2", Utc::now(), request).await;
        assert!(matches!(outcome, CycleOutcome::Escalated { .. }));
    }
}
