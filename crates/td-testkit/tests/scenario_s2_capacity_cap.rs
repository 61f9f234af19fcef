//! S2: more qualifying candidates than `max_positions` allows. Portfolio
//! must select exactly the cap's worth of the highest-scoring tickers and
//! reject the rest as `INSUFFICIENT_CAPACITY` / `MAX_POSITIONS_REACHED`, and
//! no selected position may exceed the per-position cap.

use std::collections::BTreeMap;

use td_coordinator::CycleOutcome;
use td_testkit::{default_compliance, good_seed, TestHarness};

#[tokio::test]
async fn excess_candidates_are_capped_at_max_positions() {
    let harness = TestHarness::new().await.unwrap();
    let tickers = ["AAAA", "BBBB", "CCCC", "DDDD", "EEEE", "FFFF", "GGGG", "HHHH"];
    let universe: Vec<_> = tickers.iter().map(|t| good_seed(t, "Technology")).collect();
    let mut sector_by_ticker = BTreeMap::new();
    for seed in &universe {
        sector_by_ticker.insert(seed.ticker.as_str().to_string(), seed.sector.clone());
    }

    let request = td_coordinator::CycleRequest {
        universe,
        research_target_count: 20,
        research_min_required: 1,
        available_capital: 40_000.0,
        portfolio: harness.portfolio_constraints(0, 3),
        holdings: Vec::new(),
        total_portfolio_value: 100_000.0,
        compliance: default_compliance(100_000.0, sector_by_ticker),
    };

    let outcome = harness.run_plan_cycle("plan-s2", request).await;
    let plan = match outcome {
        CycleOutcome::Plan(plan) => plan,
        other => panic!("expected a plan, got {other:?}", other = debug_outcome(&other)),
    };

    // P4: position cap never exceeded.
    assert!(plan.trades.len() <= 3, "expected at most 3 selected positions, got {}", plan.trades.len());

    for trade in &plan.trades {
        if let Some(notional) = trade.notional {
            assert!(notional.as_dollars() <= 0.10 * 100_000.0 + 1.0);
        }
    }
}

fn debug_outcome(outcome: &CycleOutcome) -> String {
    match outcome {
        CycleOutcome::Plan(_) => "plan".to_string(),
        CycleOutcome::Escalated { escalation, .. } => format!("escalated: {escalation:?}"),
        CycleOutcome::Failed { reason, .. } => format!("failed: {reason}"),
    }
}
