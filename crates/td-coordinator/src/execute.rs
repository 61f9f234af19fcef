//! `APPROVED -> EXECUTING -> EXECUTED` (§4.8): gates the transition on the
//! Session Guardrail, persists every `PlanMachine` transition before the
//! caller observes success, and dispatches one Bus message per trade.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use td_bus::Bus;
use td_guardrails::{evaluate, GuardrailInputs};
use td_schemas::{message_type, GuardrailResult, PlanStatus, Priority, Side, TradeOrder, TradingPlan};

use crate::plan_state::{PlanEvent, PlanMachine};

pub enum ExecuteOutcome {
    Executed { trades_dispatched: usize },
    GuardrailBlocked(GuardrailResult),
}

fn status_str(status: PlanStatus) -> String {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => s,
        _ => unreachable!("PlanStatus serializes to a string"),
    }
}

pub struct PlanExecutor<'a> {
    pool: &'a SqlitePool,
    bus: &'a Bus,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(pool: &'a SqlitePool, bus: &'a Bus) -> Self {
        PlanExecutor { pool, bus }
    }

    /// Drives `machine` from `Approved` through `Executing` to `Executed`
    /// (or `Failed`, on a dispatch error), durably recording each hop.
    /// Returns `GuardrailBlocked` without mutating anything if the guardrail
    /// does not clear `can_execute`.
    pub async fn execute(
        &self,
        machine: &mut PlanMachine,
        plan: &TradingPlan,
        guardrail_inputs: &GuardrailInputs,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ExecuteOutcome> {
        let (gate, level) = evaluate(guardrail_inputs);
        if !gate.can_execute {
            return Ok(ExecuteOutcome::GuardrailBlocked(gate));
        }

        self.transition(machine, plan, &PlanEvent::StartExecuting, PlanStatus::Executing, now).await?;

        // §4.4 rule 4 / S6: ORANGE+ still lets the plan execute, but new
        // BUYs are held back at dispatch while SELLs proceed unaffected.
        let dispatched: Vec<&TradeOrder> = plan
            .trades
            .iter()
            .filter(|t| level.allows_new_buys() || t.side != Side::Buy)
            .collect();
        let held_back = plan.trades.len() - dispatched.len();
        if held_back > 0 {
            tracing::warn!(level = ?level, held_back, "circuit breaker level holds back BUY trades at dispatch");
        }

        for trade in &dispatched {
            self.record_targets(trade, now).await?;
            self.dispatch_trade(trade);
        }
        td_store::mark_session_executed(self.pool, session_id, now, dispatched.len() as i64).await?;

        self.transition(machine, plan, &PlanEvent::MarkExecuted, PlanStatus::Executed, now).await?;

        Ok(ExecuteOutcome::Executed { trades_dispatched: dispatched.len() })
    }

    async fn transition(
        &self,
        machine: &mut PlanMachine,
        plan: &TradingPlan,
        event: &PlanEvent,
        new_status: PlanStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let event_id = format!("{}-{:?}", plan.plan_id, event);
        machine.apply(event, Some(&event_id))?;
        td_store::record_plan_event(self.pool, &plan.plan_id, &event_id, &serde_json::json!(event), now).await?;

        let mut updated = plan.clone();
        updated.status = new_status;
        td_store::update_plan_status(self.pool, &plan.plan_id, &status_str(new_status), now, &serde_json::json!(updated))
            .await?;
        Ok(())
    }

    /// The broker adapter has no notion of our stop/target; a buy with both
    /// set is the only record the Position Monitor will later have of them.
    async fn record_targets(&self, trade: &TradeOrder, now: DateTime<Utc>) -> anyhow::Result<()> {
        if trade.side != Side::Buy {
            return Ok(());
        }
        let (Some(stop_loss), Some(target)) = (trade.stop_loss, trade.target) else {
            return Ok(());
        };
        td_store::upsert_position_target(
            self.pool,
            &td_store::PositionTargetRow {
                ticker: trade.ticker.as_str().to_string(),
                stop_loss: stop_loss.as_dollars(),
                target: target.as_dollars(),
                decision_id: trade.decision_id.clone(),
                updated_at: now,
            },
        )
        .await
    }

    fn dispatch_trade(&self, trade: &TradeOrder) {
        let mt = match trade.side {
            Side::Buy => message_type::BUY_ORDER,
            Side::Sell => message_type::SELL_ORDER,
        };
        let subject = format!("{:?} {}", trade.side, trade.ticker.as_str());
        let payload = serde_json::json!(trade);
        match self.bus.write("PlanLifecycle", "Trading", mt, &subject, &trade.note, Some(payload), Priority::High, false, None) {
            Ok(message_id) => {
                if let Err(e) = self.bus.route(&message_id, "PlanLifecycle", "Trading") {
                    tracing::warn!(ticker = trade.ticker.as_str(), error = %e, "failed to route trade dispatch");
                }
            }
            Err(e) => tracing::warn!(ticker = trade.ticker.as_str(), error = %e, "failed to publish trade dispatch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan_state::PlanMachine;
    use chrono::Duration;
    use td_config::CircuitBreakerThresholds;
    use td_schemas::{Micros, OrderType, PlanSummary, Ticker};

    fn buy(ticker: &str) -> TradeOrder {
        TradeOrder {
            ticker: Ticker::new(ticker).unwrap(),
            side: Side::Buy,
            order_type: OrderType::Notional,
            quantity: None,
            notional: Some(Micros::from_dollars(5_000.0)),
            stop_loss: Some(Micros::from_dollars(180.0)),
            target: Some(Micros::from_dollars(210.0)),
            decision_id: None,
            note: "test buy".to_string(),
        }
    }

    fn sell(ticker: &str) -> TradeOrder {
        TradeOrder {
            ticker: Ticker::new(ticker).unwrap(),
            side: Side::Sell,
            order_type: OrderType::Market,
            quantity: None,
            notional: None,
            stop_loss: None,
            target: None,
            decision_id: None,
            note: "test sell".to_string(),
        }
    }

    fn approved_plan() -> TradingPlan {
        TradingPlan {
            plan_id: "plan-exec-1".to_string(),
            generated_at: Utc::now(),
            status: PlanStatus::Approved,
            summary: PlanSummary { overall_quality_score: 80 },
            stage_quality: Default::default(),
            trades: vec![buy("AAPL"), buy("MSFT")],
            workflow_summary: vec![],
        }
    }

    fn clear_guardrail_inputs(now: DateTime<Utc>) -> GuardrailInputs {
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
            thresholds: CircuitBreakerThresholds::default(),
            confirmation_token: None,
            expected_confirmation: None,
        }
    }

    async fn memory_pool() -> SqlitePool {
        let pool = td_store::connect("sqlite::memory:").await.unwrap();
        td_store::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn clean_approval_executes_and_dispatches_every_trade() {
        let pool = memory_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        let now = Utc::now();
        let plan = approved_plan();

        td_store::insert_plan(&pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await.unwrap();
        td_store::insert_trading_session(
            &pool,
            &td_store::TradingSessionRow {
                session_id: "session-1".to_string(),
                date: now.format("%Y-%m-%d").to_string(),
                plan_generated_at: Some(now),
                plan_executed_at: None,
                market_status: "OPEN".to_string(),
                trades_submitted: None,
                user_override: false,
                circuit_breaker_level: "NORMAL".to_string(),
                notes: None,
                created_at: now,
            },
        )
        .await
        .unwrap();

        let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
        let executor = PlanExecutor::new(&pool, &bus);
        let outcome =
            executor.execute(&mut machine, &plan, &clear_guardrail_inputs(now), "session-1", now).await.unwrap();

        match outcome {
            ExecuteOutcome::Executed { trades_dispatched } => assert_eq!(trades_dispatched, 2),
            ExecuteOutcome::GuardrailBlocked(g) => panic!("expected execution, guardrail blocked: {g:?}"),
        }
        assert_eq!(machine.status, PlanStatus::Executed);

        let stored = td_store::get_plan(&pool, &plan.plan_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "EXECUTED");
        assert!(td_store::has_executed_session_for_date(&pool, &now.format("%Y-%m-%d").to_string()).await.unwrap());

        let target = td_store::get_position_target(&pool, "AAPL").await.unwrap().unwrap();
        assert_eq!(target.stop_loss, 180.0);
        assert_eq!(target.target, 210.0);
    }

    #[tokio::test]
    async fn orange_circuit_breaker_holds_back_buys_but_dispatches_sells() {
        let pool = memory_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        let now = Utc::now();
        let mut plan = approved_plan();
        plan.trades = vec![buy("AAPL"), sell("MSFT")];
        td_store::insert_plan(&pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await.unwrap();
        td_store::insert_trading_session(
            &pool,
            &td_store::TradingSessionRow {
                session_id: "session-1".to_string(),
                date: now.format("%Y-%m-%d").to_string(),
                plan_generated_at: Some(now),
                plan_executed_at: None,
                market_status: "OPEN".to_string(),
                trades_submitted: None,
                user_override: false,
                circuit_breaker_level: "NORMAL".to_string(),
                notes: None,
                created_at: now,
            },
        )
        .await
        .unwrap();

        let mut inputs = clear_guardrail_inputs(now);
        inputs.daily_pl_pct = -11.0; // ORANGE: can_execute stays true, BUYs held back.

        let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
        let executor = PlanExecutor::new(&pool, &bus);
        let outcome = executor.execute(&mut machine, &plan, &inputs, "session-1", now).await.unwrap();

        match outcome {
            ExecuteOutcome::Executed { trades_dispatched } => assert_eq!(trades_dispatched, 1),
            ExecuteOutcome::GuardrailBlocked(g) => panic!("expected execution, guardrail blocked: {g:?}"),
        }
        assert_eq!(machine.status, PlanStatus::Executed);
        assert!(td_store::get_position_target(&pool, "AAPL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blocked_guardrail_leaves_plan_untouched() {
        let pool = memory_pool().await;
        let tmp = tempfile::tempdir().unwrap();
        let bus = Bus::new(tmp.path());
        let now = Utc::now();
        let plan = approved_plan();
        td_store::insert_plan(&pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await.unwrap();

        let mut inputs = clear_guardrail_inputs(now);
        inputs.is_trading_day = false;

        let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
        let executor = PlanExecutor::new(&pool, &bus);
        let outcome = executor.execute(&mut machine, &plan, &inputs, "session-1", now).await.unwrap();

        assert!(matches!(outcome, ExecuteOutcome::GuardrailBlocked(_)));
        assert_eq!(machine.status, PlanStatus::Approved);

        let stored = td_store::get_plan(&pool, &plan.plan_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "APPROVED");
    }
}
