//! S6: an 11% daily loss (ORANGE, between the 10% and 15% thresholds) with
//! a plan carrying both BUYs and a SELL. The plan still executes, but new
//! BUYs are held back at dispatch while the SELL proceeds.

use chrono::Utc;
use td_coordinator::{ExecuteOutcome, PlanMachine};
use td_schemas::{Micros, OrderType, PlanStatus, PlanSummary, Side, Ticker, TradeOrder, TradingPlan};
use td_testkit::TestHarness;

fn buy(ticker: &str) -> TradeOrder {
    TradeOrder {
        ticker: Ticker::new(ticker).unwrap(),
        side: Side::Buy,
        order_type: OrderType::Notional,
        quantity: None,
        notional: Some(Micros::from_dollars(5_000.0)),
        stop_loss: Some(Micros::from_dollars(90.0)),
        target: Some(Micros::from_dollars(120.0)),
        decision_id: None,
        note: "s6 buy".to_string(),
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
        note: "s6 sell".to_string(),
    }
}

#[tokio::test]
async fn orange_breaker_holds_buys_but_dispatches_sells() {
    let harness = TestHarness::new().await.unwrap();
    let now = Utc::now();
    let plan = TradingPlan {
        plan_id: "plan-s6".to_string(),
        generated_at: now,
        status: PlanStatus::Approved,
        summary: PlanSummary { overall_quality_score: 70 },
        stage_quality: Default::default(),
        trades: vec![buy("AAPL"), buy("MSFT"), buy("GOOGL"), sell("NVDA")],
        workflow_summary: vec![],
    };

    td_store::insert_plan(&harness.pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await.unwrap();
    td_store::insert_trading_session(
        &harness.pool,
        &td_store::TradingSessionRow {
            session_id: "session-s6".to_string(),
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

    let mut inputs = harness.clear_guardrail_inputs(now);
    inputs.daily_pl_pct = -11.0;

    let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
    let outcome = harness.run_execute_cycle(&mut machine, &plan, &inputs, "session-s6").await.unwrap();

    match outcome {
        ExecuteOutcome::Executed { trades_dispatched } => assert_eq!(trades_dispatched, 1, "only the SELL should dispatch"),
        ExecuteOutcome::GuardrailBlocked(gate) => panic!("ORANGE should still allow execution: {gate:?}"),
    }
    assert_eq!(machine.status, PlanStatus::Executed);
}
