//! The seven `td` subcommands. Each function owns one subcommand's full
//! behavior end to end; `main.rs` only parses arguments and dispatches.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use td_coordinator::execute::{ExecuteOutcome, PlanExecutor};
use td_coordinator::plan_state::PlanMachine;
use td_coordinator::{ComplianceConstraints, CycleOutcome, CycleRequest, PortfolioConstraints, WorkflowCoordinator};
use td_guardrails::{evaluate, GuardrailInputs};
use td_monitor::{MonitorConfig, MonitorOutcome, PositionMonitor};
use td_providers::broker::SubmitOrderRequest;
use td_schemas::{OrderType, PlanStatus, Side, TradeOrder, TradingPlan};

use crate::fetch::{build_holding_contexts, build_holdings, build_universe_seeds, UniverseEntry};
use crate::wiring::Runtime;

fn status_str(status: PlanStatus) -> String {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => s,
        _ => unreachable!("PlanStatus serializes to a string"),
    }
}

fn side_str(side: Side) -> String {
    match serde_json::to_value(side) {
        Ok(serde_json::Value::String(s)) => s,
        _ => unreachable!("Side serializes to a string"),
    }
}

fn order_type_str(order_type: OrderType) -> String {
    match serde_json::to_value(order_type) {
        Ok(serde_json::Value::String(s)) => s.to_lowercase(),
        _ => unreachable!("OrderType serializes to a string"),
    }
}

/// Fills the `arming.confirmation_format` template (`"OVERRIDE {date} LOSS
/// {loss_pct}"`) the way the caller would have to type it back at the `RED`
/// circuit-breaker gate.
fn expected_confirmation(template: &str, date: chrono::NaiveDate, loss_pct: f64) -> String {
    template
        .replace("{date}", &date.format("%Y-%m-%d").to_string())
        .replace("{loss_pct}", &format!("{loss_pct:.1}"))
}

pub async fn cmd_db_status(rt: &Runtime) -> Result<()> {
    let status = td_store::status(&rt.pool).await.context("querying state store status")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "ok": status.ok,
            "has_decisions_table": status.has_decisions_table,
            "config_hash": rt.loaded_config.config_hash,
        }))?
    );
    Ok(())
}

pub async fn cmd_db_migrate(rt: &Runtime) -> Result<()> {
    td_store::migrate(&rt.pool).await.context("running state store migrations")?;
    println!("migrations applied");
    Ok(())
}

pub fn cmd_config_hash(config_paths: &[&str]) -> Result<()> {
    let loaded = td_config::load_layered_yaml(config_paths).context("loading layered configuration")?;
    for key in td_config::report_unused_keys(&loaded.config_json) {
        tracing::warn!(key, "unrecognized configuration key");
    }
    println!("{}", loaded.config_hash);
    Ok(())
}

/// Exit code the binary should return for `run --mode=plan`, per the CLI
/// surface contract: 0 on a stored plan, 2 on escalation, 3 on failure.
pub enum PlanRunResult {
    Planned,
    Escalated,
    Failed,
}

pub async fn cmd_run_plan(rt: &Runtime, universe: &[UniverseEntry]) -> Result<PlanRunResult> {
    let account = rt.broker.get_account().await.context("fetching account for plan cycle")?;
    let positions = rt.broker.get_positions().await.context("fetching positions for plan cycle")?;
    let holdings = build_holdings(rt).await.context("re-scoring holdings")?;
    let seeds = build_universe_seeds(rt, universe).await;

    let mut sector_by_ticker: BTreeMap<String, String> = BTreeMap::new();
    for seed in &seeds {
        sector_by_ticker.insert(seed.ticker.as_str().to_string(), seed.sector.clone());
    }
    for holding in &holdings {
        sector_by_ticker.insert(holding.ticker.as_str().to_string(), holding.sector.clone());
    }

    let request = CycleRequest {
        universe: seeds,
        research_target_count: rt.settings.target_position_count.max(0) as usize,
        research_min_required: rt.settings.min_positions.max(0) as usize,
        available_capital: account.cash,
        portfolio: PortfolioConstraints {
            existing_position_count: positions.len() as i64,
            total_capital: account.portfolio_value,
            max_positions: rt.settings.max_positions,
            max_capital_deployed_pct: rt.settings.target_invested_ratio,
        },
        holdings,
        total_portfolio_value: account.portfolio_value,
        compliance: ComplianceConstraints {
            portfolio_value: account.portfolio_value,
            position_size_cap_pct: rt.settings.max_position_pct,
            // Not recognized `Settings` keys (only `max_position_pct` is);
            // these mirror compliance's own representative test defaults.
            sector_exposure_cap_pct: 0.30,
            per_trade_risk_cap_pct: 0.02,
            restricted_symbols: Vec::new(),
            sector_by_ticker,
        },
    };

    let plan_id = format!("plan-{}", uuid::Uuid::new_v4());
    let generated_at = Utc::now();
    let coordinator = WorkflowCoordinator::new(rt.bus(), Arc::clone(&rt.llm));

    let outcome = coordinator.run_cycle(&plan_id, generated_at, request).await;

    match outcome {
        CycleOutcome::Plan(plan) => {
            persist_and_approve_plan(rt, &plan, generated_at).await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(PlanRunResult::Planned)
        }
        CycleOutcome::Escalated { escalation, workflow_summary, stage_quality } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "escalation": escalation,
                    "workflow_summary": workflow_summary,
                    "stage_quality": stage_quality,
                }))?
            );
            Ok(PlanRunResult::Escalated)
        }
        CycleOutcome::Failed { reason, workflow_summary, stage_quality } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "reason": reason,
                    "workflow_summary": workflow_summary,
                    "stage_quality": stage_quality,
                }))?
            );
            Ok(PlanRunResult::Failed)
        }
    }
}

/// No UI/control-panel adapter exists in this workspace (it is explicitly
/// out of scope), so the CLI itself carries a generated plan straight
/// through `ReadyForApproval -> Approved` rather than leaving it stranded in
/// `Draft` forever. The on-disk plan row remains the durable source of
/// truth either way.
async fn persist_and_approve_plan(rt: &Runtime, plan: &TradingPlan, generated_at: chrono::DateTime<Utc>) -> Result<()> {
    td_store::insert_plan(&rt.pool, &plan.plan_id, &status_str(PlanStatus::Draft), generated_at, &serde_json::json!(plan))
        .await
        .context("inserting generated plan")?;

    let date = generated_at.format("%Y-%m-%d").to_string();
    if td_store::latest_session_for_date(&rt.pool, &date).await?.is_none() {
        td_store::insert_trading_session(
            &rt.pool,
            &td_store::TradingSessionRow {
                session_id: format!("session-{date}"),
                date: date.clone(),
                plan_generated_at: Some(generated_at),
                plan_executed_at: None,
                market_status: "OPEN".to_string(),
                trades_submitted: None,
                user_override: false,
                circuit_breaker_level: "NORMAL".to_string(),
                notes: None,
                created_at: generated_at,
            },
        )
        .await
        .context("inserting trading session for plan")?;
    }

    let mut machine = PlanMachine::new(plan.plan_id.clone(), PlanStatus::Draft);
    let mut approved = plan.clone();

    machine.apply(&td_coordinator::plan_state::PlanEvent::MarkReadyForApproval, Some(&format!("{}-ready", plan.plan_id)))?;
    approved.status = PlanStatus::ReadyForApproval;
    td_store::update_plan_status(&rt.pool, &plan.plan_id, &status_str(PlanStatus::ReadyForApproval), generated_at, &serde_json::json!(approved))
        .await
        .context("transitioning plan to ready-for-approval")?;

    machine.apply(&td_coordinator::plan_state::PlanEvent::Approve, Some(&format!("{}-approve", plan.plan_id)))?;
    approved.status = PlanStatus::Approved;
    td_store::update_plan_status(&rt.pool, &plan.plan_id, &status_str(PlanStatus::Approved), generated_at, &serde_json::json!(approved))
        .await
        .context("transitioning plan to approved")?;

    Ok(())
}

pub async fn cmd_run_execute(rt: &Runtime, override_flag: bool, confirm: Option<String>) -> Result<ExecuteOutcome> {
    let approved = status_str(PlanStatus::Approved);
    let row = td_store::get_latest_plan_by_status(&rt.pool, &approved)
        .await
        .context("looking up the most recent approved plan")?
        .context("no APPROVED plan is on file to execute")?;
    let plan: TradingPlan = serde_json::from_value(row.plan_json).context("corrupt stored plan")?;

    let now = Utc::now();
    let today = now.date_naive();
    let date = today.format("%Y-%m-%d").to_string();

    let already_executed_today = td_store::has_executed_session_for_date(&rt.pool, &date).await?;
    let (session_open, session_close) = td_calendar::session_bounds(today)
        .map(|(o, c)| (Some(o.with_timezone(&Utc)), Some(c.with_timezone(&Utc))))
        .unwrap_or((None, None));

    let daily_pl_pct = td_store::latest_portfolio_snapshot(&rt.pool).await?.unwrap_or(0.0);
    let loss_pct = (-daily_pl_pct).max(0.0);
    let expected = if loss_pct >= rt.settings.circuit_breaker.red {
        Some(expected_confirmation(&rt.settings.arming.confirmation_format, today, loss_pct))
    } else {
        None
    };

    let guardrail_inputs = GuardrailInputs {
        is_trading_day: td_calendar::is_trading_day(today),
        session_open,
        session_close,
        now,
        already_executed_today,
        daily_execution_override: override_flag,
        plan_generated_at: Some(plan.generated_at),
        plan_freshness_hours: rt.settings.plan_freshness_hours,
        plan_freshness_override: override_flag,
        daily_pl_pct,
        thresholds: rt.settings.circuit_breaker.clone(),
        confirmation_token: confirm,
        expected_confirmation: expected,
    };

    if let Some(existing) = td_store::latest_session_for_date(&rt.pool, &date).await? {
        let _ = existing;
    } else {
        td_store::insert_trading_session(
            &rt.pool,
            &td_store::TradingSessionRow {
                session_id: format!("session-{date}"),
                date: date.clone(),
                plan_generated_at: Some(plan.generated_at),
                plan_executed_at: None,
                market_status: if guardrail_inputs.is_trading_day { "OPEN".to_string() } else { "CLOSED".to_string() },
                trades_submitted: None,
                user_override: override_flag,
                circuit_breaker_level: "NORMAL".to_string(),
                notes: None,
                created_at: now,
            },
        )
        .await
        .context("inserting trading session for execution")?;
    }
    let session_id = format!("session-{date}");

    let mut machine = PlanMachine::new(plan.plan_id.clone(), plan.status);
    let bus = rt.bus();
    let executor = PlanExecutor::new(&rt.pool, &bus);
    let outcome = executor
        .execute(&mut machine, &plan, &guardrail_inputs, &session_id, now)
        .await
        .context("executing approved plan")?;

    if let ExecuteOutcome::Executed { .. } = &outcome {
        let dispatched = submit_dispatched_trades(rt).await.context("submitting dispatched trades to the broker")?;
        tracing::info!(dispatched, "trades submitted to broker after plan execution");
    }

    Ok(outcome)
}

/// Drains every message in the Trading inbox, submits it to the broker, and
/// records the outcome in `trades`. Mirrors the executor's own bus usage:
/// one message per trade, archived once handled so a restart doesn't
/// resubmit it.
pub async fn submit_dispatched_trades(rt: &Runtime) -> Result<usize> {
    let bus = rt.bus();
    let inbox = bus.inbox_messages("Trading").context("listing Trading inbox")?;
    let mut submitted = 0usize;

    for path in inbox {
        let message = match bus.read(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable trade message");
                continue;
            }
        };
        let Some(payload) = message.payload.clone() else {
            tracing::warn!(path = %path.display(), "trade message has no payload, skipping");
            continue;
        };
        let trade: TradeOrder = match serde_json::from_value(payload) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "trade message payload does not parse, skipping");
                continue;
            }
        };

        let req = SubmitOrderRequest {
            ticker: trade.ticker.clone(),
            side: trade.side,
            order_type: order_type_str(trade.order_type),
            qty: trade.quantity.map(|s| s.as_f64().round() as i64),
            notional: trade.notional.map(|n| n.as_dollars()),
            time_in_force: "day".to_string(),
        };

        let now = Utc::now();
        let (status, broker_order_id) = match rt.broker.submit_order(req).await {
            Ok(submitted) => ("submitted".to_string(), Some(submitted.id)),
            Err(e) => {
                tracing::warn!(ticker = trade.ticker.as_str(), error = %e, "broker rejected trade submission");
                ("execution_failed".to_string(), None)
            }
        };

        td_store::insert_trade(
            &rt.pool,
            &td_store::NewTrade {
                decision_id: trade.decision_id.as_ref().and_then(|s| s.parse::<i64>().ok()),
                timestamp: now,
                ticker: trade.ticker.as_str().to_string(),
                side: side_str(trade.side),
                quantity: trade.quantity.map(|s| s.as_f64().round() as i64).unwrap_or(0),
                status,
                broker_order_id,
            },
        )
        .await
        .context("recording submitted trade")?;

        if let Err(e) = bus.archive(&path, "Trading") {
            tracing::warn!(path = %path.display(), error = %e, "failed to archive handled trade message");
        }
        submitted += 1;
    }

    Ok(submitted)
}

pub async fn cmd_run_monitor(rt: &Runtime, once: bool, interval_hours: Option<i64>) -> Result<()> {
    let bus = Arc::new(rt.bus());
    let monitor = PositionMonitor::new(
        Arc::clone(&rt.broker),
        Arc::clone(&rt.market_data),
        Arc::clone(&rt.sentiment),
        bus,
        MonitorConfig::default(),
    );

    loop {
        let contexts = build_holding_contexts(rt).await.context("building holding contexts for monitor cycle")?;
        match monitor.run_cycle(&contexts, Utc::now()).await {
            MonitorOutcome::Ran { exits, positions_checked } => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "positions_checked": positions_checked,
                        "exits": exits,
                    }))?
                );
            }
            MonitorOutcome::SkippedOverlap => {
                println!("{}", serde_json::json!({"skipped": "overlap"}));
            }
        }

        if once {
            break;
        }
        let Some(hours) = interval_hours else { break };
        tokio::time::sleep(std::time::Duration::from_secs((hours.max(0) as u64) * 3600)).await;
    }

    Ok(())
}

pub async fn cmd_run_dashboard(rt: &Runtime) -> Result<()> {
    let account = rt.broker.get_account().await.context("fetching account for dashboard")?;
    let positions = rt.broker.get_positions().await.context("fetching positions for dashboard")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "account": {
                "portfolio_value": account.portfolio_value,
                "equity": account.equity,
                "cash": account.cash,
                "buying_power": account.buying_power,
            },
            "positions": positions.iter().map(|p| serde_json::json!({
                "ticker": p.ticker.as_str(),
                "qty": p.qty,
                "current_price": p.current_price,
                "market_value": p.market_value,
                "unrealized_pl": p.unrealized_pl,
                "unrealized_plpc": p.unrealized_plpc,
            })).collect::<Vec<_>>(),
        }))?
    );
    Ok(())
}
