//! S5: a plan generated well outside the freshness window. Guardrails must
//! report `requires_override` rather than blocking outright, and execution
//! only proceeds once the caller sets the freshness override.

use chrono::Utc;
use td_coordinator::{ExecuteOutcome, PlanMachine};
use td_schemas::{PlanStatus, PlanSummary, TradingPlan};
use td_testkit::TestHarness;

fn approved_plan() -> TradingPlan {
    TradingPlan {
        plan_id: "plan-s5".to_string(),
        generated_at: Utc::now() - chrono::Duration::hours(5),
        status: PlanStatus::Approved,
        summary: PlanSummary { overall_quality_score: 75 },
        stage_quality: Default::default(),
        trades: vec![],
        workflow_summary: vec![],
    }
}

async fn seeded_inputs(harness: &TestHarness, plan: &TradingPlan, now: chrono::DateTime<Utc>) -> td_guardrails::GuardrailInputs {
    td_store::insert_plan(&harness.pool, &plan.plan_id, "APPROVED", now, &serde_json::json!(plan)).await.unwrap();
    let mut inputs = harness.clear_guardrail_inputs(now);
    inputs.plan_generated_at = Some(plan.generated_at);
    inputs
}

#[tokio::test]
async fn stale_plan_requires_override_and_is_blocked_without_one() {
    let harness = TestHarness::new().await.unwrap();
    let plan = approved_plan();
    let now = Utc::now();
    let inputs = seeded_inputs(&harness, &plan, now).await;

    let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
    let outcome = harness.run_execute_cycle(&mut machine, &plan, &inputs, "session-s5").await.unwrap();

    match outcome {
        ExecuteOutcome::GuardrailBlocked(gate) => {
            assert!(gate.requires_override);
            assert!(gate.gates_failed.iter().any(|g| g == "plan_freshness"));
        }
        ExecuteOutcome::Executed { .. } => panic!("a stale plan must not execute without an override"),
    }
}

#[tokio::test]
async fn stale_plan_executes_once_overridden() {
    let harness = TestHarness::new().await.unwrap();
    let plan = approved_plan();
    let now = Utc::now();
    let mut inputs = seeded_inputs(&harness, &plan, now).await;
    inputs.plan_freshness_override = true;

    td_store::insert_trading_session(
        &harness.pool,
        &td_store::TradingSessionRow {
            session_id: "session-s5".to_string(),
            date: now.format("%Y-%m-%d").to_string(),
            plan_generated_at: Some(plan.generated_at),
            plan_executed_at: None,
            market_status: "OPEN".to_string(),
            trades_submitted: None,
            user_override: true,
            circuit_breaker_level: "NORMAL".to_string(),
            notes: None,
            created_at: now,
        },
    )
    .await
    .unwrap();

    let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Approved);
    let outcome = harness.run_execute_cycle(&mut machine, &plan, &inputs, "session-s5").await.unwrap();

    match outcome {
        ExecuteOutcome::Executed { trades_dispatched } => assert_eq!(trades_dispatched, 0),
        ExecuteOutcome::GuardrailBlocked(gate) => panic!("override should have cleared the gate: {gate:?}"),
    }
    assert_eq!(machine.status, PlanStatus::Executed);
}
