//! In-process harness wiring every engine crate into one deterministic
//! offline loop, for scenario-style integration tests. No crate here is a
//! dependency of `td-cli`; this only exists under `tests/`'s dev-dependency
//! edge and whatever else opts into it for the same reason.
//!
//! Mirrors the teacher's own in-process orchestrator: one struct owns a
//! fresh in-memory store, a tempdir-backed bus, and the fixture providers,
//! and exposes a handful of `run_*` methods that drive a full cycle the
//! same way the CLI commands do.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use td_bus::Bus;
use td_coordinator::{CycleOutcome, CycleRequest, PlanExecutor, PlanMachine, WorkflowCoordinator};
use td_guardrails::GuardrailInputs;
use td_providers::broker::{Account, BrokerAdapter, FixtureBroker};
use td_providers::llm::{LlmOptimizer, NewsSummarizer};
use td_providers::market_data::{Fundamentals, MarketDataProvider};
use td_providers::sentiment::SentimentProvider;
use td_schemas::{Micros, PriceBar, Ticker};
use td_stages::optimizer::OptimizerHolding;
use td_stages::research::ResearchCandidateSeed;

/// Stands in for a live LLM collaborator: always errors, so every scenario
/// exercises the AI Optimizer's documented deterministic fallback path
/// instead of depending on a network call. Same role as `td-cli`'s
/// `NullLlmOptimizer`.
pub struct AlwaysFailingLlm;

#[async_trait::async_trait]
impl LlmOptimizer for AlwaysFailingLlm {
    async fn optimize(&self, _prompt: &str) -> anyhow::Result<serde_json::Value> {
        anyhow::bail!("no LLM collaborator is wired into the test harness")
    }
}

pub struct NoOpNewsSummarizer;

#[async_trait::async_trait]
impl NewsSummarizer for NoOpNewsSummarizer {
    async fn summarize(&self, _payload: &serde_json::Value) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// One deterministic price bar. `day` is a day-of-month offset into a fixed
/// reference month, so a whole series is built by just varying `day`.
pub fn bar(day: u32, close: f64, high: f64, low: f64, volume: i64) -> PriceBar {
    PriceBar {
        ticker: Ticker::new("SEED").unwrap(),
        date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
        open: Micros::from_dollars(close),
        high: Micros::from_dollars(high),
        low: Micros::from_dollars(low),
        close: Micros::from_dollars(close),
        volume,
    }
}

/// A net uptrend with a pullback every fourth day, so trailing RSI lands in
/// Research's acceptance band instead of pegging at 100 on a pure run-up
/// (zero down days clears no preset's upper band). Same shape as
/// `td-stages::research`'s own test fixture.
pub fn rising_bars(n: u32) -> Vec<PriceBar> {
    (1..=n)
        .map(|d| {
            let pullback = if d % 4 == 0 { -2.5 } else { 0.0 };
            let close = 50.0 + d as f64 * 0.3 + pullback;
            bar(d, close, close + 1.0, close - 1.0, 1_500_000)
        })
        .collect()
}

/// Fundamentals that clear every healthy-financials threshold Research
/// scores against.
pub fn strong_fundamentals(sector: &str) -> Fundamentals {
    Fundamentals {
        sector: Some(sector.to_string()),
        industry: Some("General".to_string()),
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
    }
}

/// A `ResearchCandidateSeed` that is known to clear Research's selection bar:
/// a rising 60-bar history, strong fundamentals, neutral-to-good sentiment.
pub fn good_seed(ticker: &str, sector: &str) -> ResearchCandidateSeed {
    ResearchCandidateSeed {
        ticker: Ticker::new(ticker).unwrap(),
        sector: sector.to_string(),
        bars: rising_bars(60),
        fundamentals: strong_fundamentals(sector),
        sentiment_score: Some(70.0),
    }
}

/// A seed built to score below Research/Portfolio's composite floor: flat
/// bars, no fundamentals, neutral sentiment.
pub fn weak_seed(ticker: &str, sector: &str) -> ResearchCandidateSeed {
    let flat: Vec<PriceBar> = (1..=60).map(|d| bar(d, 50.0, 50.5, 49.5, 200_000)).collect();
    ResearchCandidateSeed {
        ticker: Ticker::new(ticker).unwrap(),
        sector: sector.to_string(),
        bars: flat,
        fundamentals: Fundamentals {
            sector: Some(sector.to_string()),
            industry: None,
            market_cap: None,
            trailing_pe: None,
            forward_pe: None,
            price_to_book: None,
            return_on_equity: None,
            profit_margins: None,
            revenue_growth: None,
            earnings_growth: None,
            debt_to_equity: None,
            current_ratio: None,
            week52_high: None,
            week52_low: None,
        },
        sentiment_score: Some(50.0),
    }
}

/// Sane default constraints for a $100,000 account with no existing
/// positions: 20% capital deployment cap headroom, 10% per-position cap,
/// matching `td-config::Settings`'s own base defaults.
pub fn default_compliance(portfolio_value: f64, sector_by_ticker: BTreeMap<String, String>) -> td_coordinator::ComplianceConstraints {
    td_coordinator::ComplianceConstraints {
        portfolio_value,
        position_size_cap_pct: 0.10,
        sector_exposure_cap_pct: 0.30,
        per_trade_risk_cap_pct: 0.02,
        restricted_symbols: Vec::new(),
        sector_by_ticker,
    }
}

/// Wires a fresh in-memory store, a tempdir-backed bus, and a fixture
/// broker/market-data/sentiment/llm set behind the same trait objects the
/// CLI uses, for one self-contained scenario test.
pub struct TestHarness {
    pub pool: sqlx::SqlitePool,
    _bus_dir: tempfile::TempDir,
    bus_root: std::path::PathBuf,
    pub broker: Arc<dyn BrokerAdapter>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub sentiment: Arc<dyn SentimentProvider>,
    pub llm: Arc<dyn LlmOptimizer>,
}

impl TestHarness {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_account(Account {
            portfolio_value: 100_000.0,
            equity: 100_000.0,
            last_equity: 100_000.0,
            cash: 100_000.0,
            buying_power: 100_000.0,
        })
        .await
    }

    pub async fn with_account(account: Account) -> anyhow::Result<Self> {
        let pool = td_store::connect("sqlite::memory:").await?;
        td_store::migrate(&pool).await?;
        let bus_dir = tempfile::tempdir()?;
        let bus_root = bus_dir.path().to_path_buf();

        Ok(TestHarness {
            pool,
            _bus_dir: bus_dir,
            bus_root,
            broker: Arc::new(FixtureBroker::new(account)),
            market_data: Arc::new(td_providers::market_data::FixtureMarketData::new()),
            sentiment: Arc::new(td_providers::sentiment::FixtureSentiment::new()),
            llm: Arc::new(AlwaysFailingLlm),
        })
    }

    pub fn bus(&self) -> Bus {
        Bus::new(&self.bus_root)
    }

    /// Runs one full Research -> Risk -> Portfolio -> AI Optimizer ->
    /// Compliance cycle, the same call `td-cli run --mode=plan` makes.
    pub async fn run_plan_cycle(&self, plan_id: &str, request: CycleRequest) -> CycleOutcome {
        let coordinator = WorkflowCoordinator::new(self.bus(), Arc::clone(&self.llm));
        coordinator.run_cycle(plan_id, Utc::now(), request).await
    }

    /// Persists `plan` as `DRAFT` then drives it straight to `APPROVED`,
    /// mirroring the CLI's own auto-approval path for a clean cycle with no
    /// escalation surface in this workspace.
    pub async fn persist_and_approve(&self, plan: &td_schemas::TradingPlan) -> anyhow::Result<PlanMachine> {
        let now = Utc::now();
        td_store::insert_plan(&self.pool, &plan.plan_id, "DRAFT", now, &serde_json::json!(plan)).await?;

        let mut machine = PlanMachine::new(plan.plan_id.clone(), td_schemas::PlanStatus::Draft);
        machine.apply(&td_coordinator::PlanEvent::MarkReadyForApproval, Some(&format!("{}-ready", plan.plan_id)))?;
        td_store::update_plan_status(&self.pool, &plan.plan_id, "READY_FOR_APPROVAL", now, &serde_json::json!(plan)).await?;
        machine.apply(&td_coordinator::PlanEvent::Approve, Some(&format!("{}-approve", plan.plan_id)))?;
        td_store::update_plan_status(&self.pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await?;

        Ok(machine)
    }

    /// Evaluates guardrails and, if clear, drives `machine` through
    /// `Executing` to `Executed`, dispatching trade messages to the bus.
    pub async fn run_execute_cycle(
        &self,
        machine: &mut PlanMachine,
        plan: &td_schemas::TradingPlan,
        guardrail_inputs: &GuardrailInputs,
        session_id: &str,
    ) -> anyhow::Result<td_coordinator::ExecuteOutcome> {
        let bus = self.bus();
        let executor = PlanExecutor::new(&self.pool, &bus);
        executor.execute(machine, plan, guardrail_inputs, session_id, guardrail_inputs.now).await
    }

    /// A clean, in-session, no-prior-execution guardrail input set for
    /// `now`, for scenarios that only want to vary one gate.
    pub fn clear_guardrail_inputs(&self, now: chrono::DateTime<Utc>) -> GuardrailInputs {
        GuardrailInputs {
            is_trading_day: true,
            session_open: Some(now - Duration::hours(1)),
            session_close: Some(now + Duration::hours(1)),
            now,
            already_executed_today: false,
            daily_execution_override: false,
            plan_generated_at: Some(now - Duration::minutes(10)),
            plan_freshness_hours: 4,
            plan_freshness_override: false,
            daily_pl_pct: 0.0,
            thresholds: td_config::CircuitBreakerThresholds::default(),
            confirmation_token: None,
            expected_confirmation: None,
        }
    }

    pub fn portfolio_constraints(&self, existing_position_count: i64, max_positions: i64) -> td_coordinator::PortfolioConstraints {
        td_coordinator::PortfolioConstraints {
            existing_position_count,
            total_capital: 100_000.0,
            max_positions,
            max_capital_deployed_pct: 0.90,
        }
    }
}

pub fn holding(ticker: &str, sector: &str, composite_score: f64, market_value: f64) -> OptimizerHolding {
    OptimizerHolding {
        ticker: Ticker::new(ticker).unwrap(),
        composite_score,
        sector: sector.to_string(),
        market_value: Micros::from_dollars(market_value),
    }
}
