//! S3: the AI Optimizer returns the same ticker as both a BUY and a SELL in
//! one response (the LLM collaborator path, not the deterministic fallback
//! — the fallback structurally never recommends selling a ticker it's also
//! buying, since it excludes held tickers from its BUY ranking). Compliance
//! must reject the entire plan rather than silently keeping one side.

use std::collections::BTreeMap;
use std::sync::Arc;

use td_coordinator::CycleOutcome;
use td_providers::llm::FixtureLlmOptimizer;
use td_testkit::{default_compliance, good_seed, TestHarness};

const SECTORS: [&str; 5] = ["Technology", "Financials", "Healthcare", "Energy", "Industrials"];

fn ticker(i: usize) -> String {
    format!("T{i:02}")
}

#[tokio::test]
async fn llm_conflicting_allocation_rejects_the_whole_plan() {
    let mut harness = TestHarness::new().await.unwrap();

    let universe: Vec<_> = (1..=15).map(|i| good_seed(&ticker(i), SECTORS[i % SECTORS.len()])).collect();
    let mut sector_by_ticker = BTreeMap::new();
    for seed in &universe {
        sector_by_ticker.insert(seed.ticker.as_str().to_string(), seed.sector.clone());
    }

    // 15 buys (the AI Optimizer's accepted range is 15-20 positions) at 4%
    // of portfolio value each, plus a sell of the very first ticker — the
    // conflict the safeguard exists to catch.
    let buys: Vec<_> = (1..=15)
        .map(|i| {
            serde_json::json!({
                "ticker": ticker(i),
                "allocated_capital": 20_000.0,
                "reasoning": "well inside every allocation constraint",
            })
        })
        .collect();
    let llm_response = serde_json::json!({
        "buys": buys,
        "sells": [{"ticker": ticker(1), "sell_pct": 100.0, "reasoning": "conflicting sell of an also-bought ticker"}],
        "total_allocated": 300_000.0,
        "deployment_pct": 0.95,
        "portfolio_reasoning": "deliberately conflicting allocation for the safeguard test",
    });
    harness.llm = Arc::new(FixtureLlmOptimizer::new(llm_response));

    let request = td_coordinator::CycleRequest {
        universe,
        research_target_count: 20,
        research_min_required: 1,
        available_capital: 450_000.0,
        portfolio: td_coordinator::PortfolioConstraints {
            existing_position_count: 0,
            total_capital: 500_000.0,
            max_positions: 15,
            max_capital_deployed_pct: 0.90,
        },
        holdings: Vec::new(),
        total_portfolio_value: 500_000.0,
        compliance: default_compliance(500_000.0, sector_by_ticker),
    };

    let outcome = harness.run_plan_cycle("plan-s3", request).await;

    match outcome {
        CycleOutcome::Escalated { escalation, .. } => {
            assert_eq!(escalation.issue_type, "STAGE_FAILED");
            assert_eq!(escalation.stage, "Compliance");
        }
        CycleOutcome::Failed { reason, .. } => panic!("expected escalation from the safeguard, got Failed: {reason}"),
        CycleOutcome::Plan(plan) => panic!(
            "same-symbol conflict should never reach a plan, got {} trades",
            plan.trades.len()
        ),
    }
}
