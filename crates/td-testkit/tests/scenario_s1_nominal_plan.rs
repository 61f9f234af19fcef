//! S1: a small universe of strong candidates, ample cash, no existing
//! positions. Expects every candidate to clear Research/Portfolio and the
//! assembled plan to respect every capital/position cap.

use std::collections::BTreeMap;

use td_coordinator::CycleOutcome;
use td_schemas::Side;
use td_testkit::{default_compliance, good_seed, TestHarness};

#[tokio::test]
async fn nominal_universe_produces_a_capped_compliant_plan() {
    let harness = TestHarness::new().await.unwrap();
    let universe = vec![
        good_seed("AAPL", "Technology"),
        good_seed("MSFT", "Technology"),
        good_seed("GOOGL", "Communication"),
        good_seed("NVDA", "Technology"),
        good_seed("JPM", "Financials"),
    ];
    let mut sector_by_ticker = BTreeMap::new();
    for seed in &universe {
        sector_by_ticker.insert(seed.ticker.as_str().to_string(), seed.sector.clone());
    }

    let request = td_coordinator::CycleRequest {
        universe,
        research_target_count: 10,
        research_min_required: 1,
        // Sized so the fallback allocator's 90%-of-cash equal-weight split
        // across all 5 candidates still clears Compliance's 10%-of-portfolio
        // per-position cap ($9,000 < $10,000 at $50,000 cash / 5 positions).
        available_capital: 50_000.0,
        portfolio: harness.portfolio_constraints(0, 5),
        holdings: Vec::new(),
        total_portfolio_value: 100_000.0,
        compliance: default_compliance(100_000.0, sector_by_ticker),
    };

    let outcome = harness.run_plan_cycle("plan-s1", request).await;
    let plan = match outcome {
        CycleOutcome::Plan(plan) => plan,
        CycleOutcome::Escalated { escalation, .. } => panic!("expected a plan, got escalation: {escalation:?}"),
        CycleOutcome::Failed { reason, .. } => panic!("expected a plan, got failure: {reason}"),
    };

    // P1: every score in bounds.
    assert!(plan.summary.overall_quality_score >= 0 && plan.summary.overall_quality_score <= 100);
    for score in plan.stage_quality.values() {
        assert!(*score >= 0 && *score <= 100);
    }

    // P2: no ticker on both sides.
    let buys: std::collections::HashSet<&str> =
        plan.trades.iter().filter(|t| t.side == Side::Buy).map(|t| t.ticker.as_str()).collect();
    let sells: std::collections::HashSet<&str> =
        plan.trades.iter().filter(|t| t.side == Side::Sell).map(|t| t.ticker.as_str()).collect();
    assert!(buys.intersection(&sells).next().is_none());

    // P3/P5: every approved trade respects the 10% per-position cap.
    for trade in &plan.trades {
        if let Some(notional) = trade.notional {
            assert!(
                notional.as_dollars() <= 0.10 * 100_000.0 + 1.0,
                "trade for {} exceeds the per-position cap: {}",
                trade.ticker,
                notional.as_dollars()
            );
        }
    }

    assert!(!plan.trades.is_empty(), "at least one strong candidate should clear every stage");
}
