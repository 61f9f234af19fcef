//! The State Store (C2): a single embedded SQLite database holding
//! decisions, trades, sessions, snapshots, and caches.
//!
//! Schema creation happens exactly once, through the migration runner in
//! [`migrate`]. No stage may create tables lazily on first use.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

pub const ENV_DB_URL: &str = "TD_DATABASE_URL";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("cached row had malformed JSON: {0}")]
    CorruptCache(serde_json::Error),
}

/// Connect to the single embedded SQLite file named by `TD_DATABASE_URL`
/// (e.g. `sqlite://tradedesk.db`).
pub async fn connect_from_env() -> Result<SqlitePool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url).await
}

pub async fn connect(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1) // single-writer semantics (§5)
        .connect(url)
        .await
        .context("failed to connect to state store")?;
    Ok(pool)
}

/// Run embedded migrations. Forward-only, idempotent to re-run.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("state store migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoreStatus {
    pub ok: bool,
    pub has_decisions_table: bool,
}

/// Connectivity plus schema-presence check, for the CLI's `db status`.
pub async fn status(pool: &SqlitePool) -> Result<StoreStatus> {
    let (one,): (i64,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (i64,) = sqlx::query_as(
        "select count(*) from sqlite_master where type='table' and name='decisions'",
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(StoreStatus {
        ok: one == 1,
        has_decisions_table: exists > 0,
    })
}

// ---------------------------------------------------------------------------
// decisions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub decision: String,
    pub conviction: f64,
    pub rationale: String,
    pub latest_price: Option<f64>,
    pub market_context: Option<String>,
}

pub async fn insert_decision(pool: &SqlitePool, d: &NewDecision) -> Result<i64> {
    let res = sqlx::query(
        r#"
        insert into decisions (timestamp, ticker, decision, conviction, rationale, latest_price, market_context)
        values (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(d.timestamp.to_rfc3339())
    .bind(&d.ticker)
    .bind(&d.decision)
    .bind(d.conviction)
    .bind(&d.rationale)
    .bind(d.latest_price)
    .bind(&d.market_context)
    .execute(pool)
    .await
    .context("insert_decision failed")?;
    Ok(res.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// trades
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub decision_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub side: String,
    pub quantity: i64,
    pub status: String,
    pub broker_order_id: Option<String>,
}

pub async fn insert_trade(pool: &SqlitePool, t: &NewTrade) -> Result<i64> {
    let res = sqlx::query(
        r#"
        insert into trades (decision_id, timestamp, ticker, side, quantity, status, broker_order_id)
        values (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(t.decision_id)
    .bind(t.timestamp.to_rfc3339())
    .bind(&t.ticker)
    .bind(&t.side)
    .bind(t.quantity)
    .bind(&t.status)
    .bind(&t.broker_order_id)
    .execute(pool)
    .await
    .context("insert_trade failed")?;
    Ok(res.last_insert_rowid())
}

pub async fn update_trade_status(pool: &SqlitePool, trade_id: i64, status: &str) -> Result<()> {
    sqlx::query("update trades set status = ? where id = ?")
        .bind(status)
        .bind(trade_id)
        .execute(pool)
        .await
        .context("update_trade_status failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// trading_sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TradingSessionRow {
    pub session_id: String,
    pub date: String,
    pub plan_generated_at: Option<DateTime<Utc>>,
    pub plan_executed_at: Option<DateTime<Utc>>,
    pub market_status: String,
    pub trades_submitted: Option<i64>,
    pub user_override: bool,
    pub circuit_breaker_level: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

fn parse_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(&s)).transpose()
}

/// Insert a fresh session row (called once per day, at plan generation).
pub async fn insert_trading_session(pool: &SqlitePool, row: &TradingSessionRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into trading_sessions
            (session_id, date, plan_generated_at, plan_executed_at, market_status,
             trades_submitted, user_override, circuit_breaker_level, notes, created_at)
        values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.session_id)
    .bind(&row.date)
    .bind(row.plan_generated_at.map(|t| t.to_rfc3339()))
    .bind(row.plan_executed_at.map(|t| t.to_rfc3339()))
    .bind(&row.market_status)
    .bind(row.trades_submitted)
    .bind(row.user_override as i64)
    .bind(&row.circuit_breaker_level)
    .bind(&row.notes)
    .bind(row.created_at.to_rfc3339())
    .execute(pool)
    .await
    .context("insert_trading_session failed")?;
    Ok(())
}

/// Mark the session for `date` as executed. Used by the daily execution
/// limit guardrail to detect a second execution attempt the same day.
pub async fn mark_session_executed(
    pool: &SqlitePool,
    session_id: &str,
    executed_at: DateTime<Utc>,
    trades_submitted: i64,
) -> Result<()> {
    sqlx::query(
        "update trading_sessions set plan_executed_at = ?, trades_submitted = ? where session_id = ?",
    )
    .bind(executed_at.to_rfc3339())
    .bind(trades_submitted)
    .bind(session_id)
    .execute(pool)
    .await
    .context("mark_session_executed failed")?;
    Ok(())
}

/// Does any `trading_sessions` row for `date` already have `plan_executed_at`
/// set? Implements the daily execution limit gate's core query.
pub async fn has_executed_session_for_date(pool: &SqlitePool, date: &str) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*) from trading_sessions where date = ? and plan_executed_at is not null",
    )
    .bind(date)
    .fetch_one(pool)
    .await
    .context("has_executed_session_for_date failed")?;
    Ok(n > 0)
}

pub async fn latest_session_for_date(
    pool: &SqlitePool,
    date: &str,
) -> Result<Option<TradingSessionRow>> {
    let row = sqlx::query(
        r#"
        select session_id, date, plan_generated_at, plan_executed_at, market_status,
               trades_submitted, user_override, circuit_breaker_level, notes, created_at
        from trading_sessions
        where date = ?
        order by created_at desc
        limit 1
        "#,
    )
    .bind(date)
    .fetch_optional(pool)
    .await
    .context("latest_session_for_date failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(TradingSessionRow {
        session_id: row.try_get("session_id")?,
        date: row.try_get("date")?,
        plan_generated_at: parse_opt_dt(row.try_get("plan_generated_at")?)?,
        plan_executed_at: parse_opt_dt(row.try_get("plan_executed_at")?)?,
        market_status: row.try_get("market_status")?,
        trades_submitted: row.try_get("trades_submitted")?,
        user_override: row.try_get::<i64, _>("user_override")? != 0,
        circuit_breaker_level: row.try_get("circuit_breaker_level")?,
        notes: row.try_get("notes")?,
        created_at: parse_dt(&row.try_get::<String, _>("created_at")?)?,
    }))
}

// ---------------------------------------------------------------------------
// portfolio_snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewPortfolioSnapshot {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub cash_balance: f64,
    pub equity_value: f64,
    pub buying_power: f64,
    pub margin_used: Option<f64>,
    pub positions_count: i64,
    pub daily_pl: f64,
    pub daily_pl_pct: f64,
    pub spy_close: Option<f64>,
    pub spy_change_pct: Option<f64>,
    pub source: String,
    pub notes: Option<String>,
}

/// Snapshot writes are a transient write per §7: log-and-drop on failure at
/// the call site rather than aborting the cycle; this function itself just
/// surfaces the error for the caller to decide.
pub async fn insert_portfolio_snapshot(pool: &SqlitePool, s: &NewPortfolioSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        insert into portfolio_snapshots
            (snapshot_id, timestamp, total_value, cash_balance, equity_value, buying_power,
             margin_used, positions_count, daily_pl, daily_pl_pct, spy_close, spy_change_pct,
             source, notes)
        values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&s.snapshot_id)
    .bind(s.timestamp.to_rfc3339())
    .bind(s.total_value)
    .bind(s.cash_balance)
    .bind(s.equity_value)
    .bind(s.buying_power)
    .bind(s.margin_used)
    .bind(s.positions_count)
    .bind(s.daily_pl)
    .bind(s.daily_pl_pct)
    .bind(s.spy_close)
    .bind(s.spy_change_pct)
    .bind(&s.source)
    .bind(&s.notes)
    .execute(pool)
    .await
    .context("insert_portfolio_snapshot failed")?;
    Ok(())
}

pub async fn latest_portfolio_snapshot(pool: &SqlitePool) -> Result<Option<f64>> {
    let row: Option<(f64,)> =
        sqlx::query_as("select daily_pl_pct from portfolio_snapshots order by timestamp desc limit 1")
            .fetch_optional(pool)
            .await
            .context("latest_portfolio_snapshot failed")?;
    Ok(row.map(|(v,)| v))
}

// ---------------------------------------------------------------------------
// entry_dates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EntryDateRow {
    pub ticker: String,
    pub entry_date: String,
    pub shares: i64,
    pub entry_price: f64,
    pub updated_at: DateTime<Utc>,
}

pub async fn upsert_entry_date(pool: &SqlitePool, row: &EntryDateRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into entry_dates (ticker, entry_date, shares, entry_price, updated_at)
        values (?, ?, ?, ?, ?)
        on conflict(ticker) do update set
            entry_date = excluded.entry_date,
            shares = excluded.shares,
            entry_price = excluded.entry_price,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&row.ticker)
    .bind(&row.entry_date)
    .bind(row.shares)
    .bind(row.entry_price)
    .bind(row.updated_at.to_rfc3339())
    .execute(pool)
    .await
    .context("upsert_entry_date failed")?;
    Ok(())
}

pub async fn get_entry_date(pool: &SqlitePool, ticker: &str) -> Result<Option<EntryDateRow>> {
    let row = sqlx::query(
        "select ticker, entry_date, shares, entry_price, updated_at from entry_dates where ticker = ?",
    )
    .bind(ticker)
    .fetch_optional(pool)
    .await
    .context("get_entry_date failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(EntryDateRow {
        ticker: row.try_get("ticker")?,
        entry_date: row.try_get("entry_date")?,
        shares: row.try_get("shares")?,
        entry_price: row.try_get("entry_price")?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    }))
}

pub async fn delete_entry_date(pool: &SqlitePool, ticker: &str) -> Result<()> {
    sqlx::query("delete from entry_dates where ticker = ?")
        .bind(ticker)
        .execute(pool)
        .await
        .context("delete_entry_date failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// position_targets
// ---------------------------------------------------------------------------

/// The stop/target pair attached to a position when its opening trade was
/// dispatched. The broker adapter has no notion of these, so the Position
/// Monitor's stop/target exit checks depend on this row surviving here.
#[derive(Debug, Clone)]
pub struct PositionTargetRow {
    pub ticker: String,
    pub stop_loss: f64,
    pub target: f64,
    pub decision_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub async fn upsert_position_target(pool: &SqlitePool, row: &PositionTargetRow) -> Result<()> {
    sqlx::query(
        r#"
        insert into position_targets (ticker, stop_loss, target, decision_id, updated_at)
        values (?, ?, ?, ?, ?)
        on conflict(ticker) do update set
            stop_loss = excluded.stop_loss,
            target = excluded.target,
            decision_id = excluded.decision_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&row.ticker)
    .bind(row.stop_loss)
    .bind(row.target)
    .bind(&row.decision_id)
    .bind(row.updated_at.to_rfc3339())
    .execute(pool)
    .await
    .context("upsert_position_target failed")?;
    Ok(())
}

pub async fn get_position_target(pool: &SqlitePool, ticker: &str) -> Result<Option<PositionTargetRow>> {
    let row = sqlx::query(
        "select ticker, stop_loss, target, decision_id, updated_at from position_targets where ticker = ?",
    )
    .bind(ticker)
    .fetch_optional(pool)
    .await
    .context("get_position_target failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(PositionTargetRow {
        ticker: row.try_get("ticker")?,
        stop_loss: row.try_get("stop_loss")?,
        target: row.try_get("target")?,
        decision_id: row.try_get("decision_id")?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
    }))
}

pub async fn delete_position_target(pool: &SqlitePool, ticker: &str) -> Result<()> {
    sqlx::query("delete from position_targets where ticker = ?")
        .bind(ticker)
        .execute(pool)
        .await
        .context("delete_position_target failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// market_data_cache / sentiment_cache
// ---------------------------------------------------------------------------

/// Write-through upsert; concurrent duplicate fetches for the same key are
/// acceptable and idempotent (§4.5).
pub async fn upsert_market_data_cache(
    pool: &SqlitePool,
    ticker: &str,
    data_type: &str,
    data_json: &Value,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into market_data_cache (ticker, data_type, data_json, fetched_at, expires_at)
        values (?, ?, ?, ?, ?)
        on conflict(ticker, data_type) do update set
            data_json = excluded.data_json,
            fetched_at = excluded.fetched_at,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(ticker)
    .bind(data_type)
    .bind(serde_json::to_string(data_json).context("serialize market data cache value")?)
    .bind(fetched_at.to_rfc3339())
    .bind(expires_at.to_rfc3339())
    .execute(pool)
    .await
    .context("upsert_market_data_cache failed")?;
    Ok(())
}

/// Returns `None` on a miss, an expired row, or a corrupt stored JSON blob
/// (corruption is treated as a miss per §4.5).
pub async fn get_market_data_cache(
    pool: &SqlitePool,
    ticker: &str,
    data_type: &str,
    now: DateTime<Utc>,
) -> Result<Option<Value>> {
    let row = sqlx::query(
        "select data_json, expires_at from market_data_cache where ticker = ? and data_type = ?",
    )
    .bind(ticker)
    .bind(data_type)
    .fetch_optional(pool)
    .await
    .context("get_market_data_cache failed")?;

    let Some(row) = row else { return Ok(None) };
    let expires_at: String = row.try_get("expires_at")?;
    let Ok(expires_at) = parse_dt(&expires_at) else {
        return Ok(None);
    };
    if expires_at <= now {
        return Ok(None);
    }
    let raw: String = row.try_get("data_json")?;
    Ok(serde_json::from_str(&raw).ok())
}

#[derive(Debug, Clone)]
pub struct SentimentCacheEntry {
    pub sentiment_score: f64,
    pub news_summary: String,
    pub sentiment_reasoning: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub async fn upsert_sentiment_cache(
    pool: &SqlitePool,
    ticker: &str,
    entry: &SentimentCacheEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into sentiment_cache
            (ticker, sentiment_score, news_summary, sentiment_reasoning, fetched_at, expires_at)
        values (?, ?, ?, ?, ?, ?)
        on conflict(ticker) do update set
            sentiment_score = excluded.sentiment_score,
            news_summary = excluded.news_summary,
            sentiment_reasoning = excluded.sentiment_reasoning,
            fetched_at = excluded.fetched_at,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(ticker)
    .bind(entry.sentiment_score)
    .bind(&entry.news_summary)
    .bind(&entry.sentiment_reasoning)
    .bind(entry.fetched_at.to_rfc3339())
    .bind(entry.expires_at.to_rfc3339())
    .execute(pool)
    .await
    .context("upsert_sentiment_cache failed")?;
    Ok(())
}

pub async fn get_sentiment_cache(
    pool: &SqlitePool,
    ticker: &str,
    now: DateTime<Utc>,
) -> Result<Option<SentimentCacheEntry>> {
    let row = sqlx::query(
        "select sentiment_score, news_summary, sentiment_reasoning, fetched_at, expires_at from sentiment_cache where ticker = ?",
    )
    .bind(ticker)
    .fetch_optional(pool)
    .await
    .context("get_sentiment_cache failed")?;

    let Some(row) = row else { return Ok(None) };
    let expires_at = parse_dt(&row.try_get::<String, _>("expires_at")?)?;
    if expires_at <= now {
        return Ok(None);
    }
    Ok(Some(SentimentCacheEntry {
        sentiment_score: row.try_get("sentiment_score")?,
        news_summary: row.try_get("news_summary")?,
        sentiment_reasoning: row.try_get("sentiment_reasoning")?,
        fetched_at: parse_dt(&row.try_get::<String, _>("fetched_at")?)?,
        expires_at,
    }))
}

// ---------------------------------------------------------------------------
// market_regime_assessments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewRegimeAssessment {
    pub assessment_id: String,
    pub date: String,
    pub timestamp: DateTime<Utc>,
    pub spy_price: Option<f64>,
    pub spy_change_pct: Option<f64>,
    pub vix_level: Option<f64>,
    pub vix_change_pct: Option<f64>,
    pub regime: String,
    pub confidence: f64,
    pub recommendation: String,
    pub reasoning: String,
}

pub async fn insert_regime_assessment(pool: &SqlitePool, a: &NewRegimeAssessment) -> Result<()> {
    sqlx::query(
        r#"
        insert into market_regime_assessments
            (assessment_id, date, timestamp, spy_price, spy_change_pct, vix_level, vix_change_pct,
             regime, confidence, recommendation, reasoning)
        values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&a.assessment_id)
    .bind(&a.date)
    .bind(a.timestamp.to_rfc3339())
    .bind(a.spy_price)
    .bind(a.spy_change_pct)
    .bind(a.vix_level)
    .bind(a.vix_change_pct)
    .bind(&a.regime)
    .bind(a.confidence)
    .bind(&a.recommendation)
    .bind(&a.reasoning)
    .execute(pool)
    .await
    .context("insert_regime_assessment failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// plans / plan_events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PlanRow {
    pub plan_id: String,
    pub status: String,
    pub generated_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub plan_json: Value,
}

pub async fn insert_plan(
    pool: &SqlitePool,
    plan_id: &str,
    status: &str,
    generated_at: DateTime<Utc>,
    plan_json: &Value,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into plans (plan_id, status, generated_at, updated_at, plan_json)
        values (?, ?, ?, ?, ?)
        "#,
    )
    .bind(plan_id)
    .bind(status)
    .bind(generated_at.to_rfc3339())
    .bind(generated_at.to_rfc3339())
    .bind(serde_json::to_string(plan_json).context("serialize plan_json")?)
    .execute(pool)
    .await
    .context("insert_plan failed")?;
    Ok(())
}

/// Overwrites status, timestamp, and the full plan document in one durable
/// write — a state-machine transition is only observed by the caller once
/// this returns (§4.8).
pub async fn update_plan_status(
    pool: &SqlitePool,
    plan_id: &str,
    status: &str,
    updated_at: DateTime<Utc>,
    plan_json: &Value,
) -> Result<()> {
    sqlx::query("update plans set status = ?, updated_at = ?, plan_json = ? where plan_id = ?")
        .bind(status)
        .bind(updated_at.to_rfc3339())
        .bind(serde_json::to_string(plan_json).context("serialize plan_json")?)
        .bind(plan_id)
        .execute(pool)
        .await
        .context("update_plan_status failed")?;
    Ok(())
}

pub async fn get_plan(pool: &SqlitePool, plan_id: &str) -> Result<Option<PlanRow>> {
    let row = sqlx::query(
        "select plan_id, status, generated_at, updated_at, plan_json from plans where plan_id = ?",
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await
    .context("get_plan failed")?;

    let Some(row) = row else { return Ok(None) };
    let raw: String = row.try_get("plan_json")?;
    Ok(Some(PlanRow {
        plan_id: row.try_get("plan_id")?,
        status: row.try_get("status")?,
        generated_at: parse_dt(&row.try_get::<String, _>("generated_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
        plan_json: serde_json::from_str(&raw).context("corrupt plan_json")?,
    }))
}

/// Most recently updated plan in `status`, for the CLI's `run --mode=execute`
/// ("the most recent APPROVED plan") — the plan-lookup twin of
/// `latest_session_for_date`.
pub async fn get_latest_plan_by_status(pool: &SqlitePool, status: &str) -> Result<Option<PlanRow>> {
    let row = sqlx::query(
        r#"
        select plan_id, status, generated_at, updated_at, plan_json
        from plans
        where status = ?
        order by updated_at desc
        limit 1
        "#,
    )
    .bind(status)
    .fetch_optional(pool)
    .await
    .context("get_latest_plan_by_status failed")?;

    let Some(row) = row else { return Ok(None) };
    let raw: String = row.try_get("plan_json")?;
    Ok(Some(PlanRow {
        plan_id: row.try_get("plan_id")?,
        status: row.try_get("status")?,
        generated_at: parse_dt(&row.try_get::<String, _>("generated_at")?)?,
        updated_at: parse_dt(&row.try_get::<String, _>("updated_at")?)?,
        plan_json: serde_json::from_str(&raw).context("corrupt plan_json")?,
    }))
}

/// Records a plan transition event. Idempotent on `(plan_id, event_id)`: a
/// duplicate `event_id` is a silent no-op, the DB-backed twin of the
/// in-memory replay guard in the order state machine this mirrors. Returns
/// `true` if the event was newly recorded, `false` if it was a replay.
pub async fn record_plan_event(
    pool: &SqlitePool,
    plan_id: &str,
    event_id: &str,
    event_json: &Value,
    applied_at: DateTime<Utc>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        insert into plan_events (plan_id, event_id, event_json, applied_at)
        values (?, ?, ?, ?)
        on conflict(plan_id, event_id) do nothing
        "#,
    )
    .bind(plan_id)
    .bind(event_id)
    .bind(serde_json::to_string(event_json).context("serialize event_json")?)
    .bind(applied_at.to_rfc3339())
    .execute(pool)
    .await
    .context("record_plan_event failed")?;
    Ok(res.rows_affected() > 0)
}

pub async fn has_plan_event(pool: &SqlitePool, plan_id: &str, event_id: &str) -> Result<bool> {
    let (n,): (i64,) = sqlx::query_as(
        "select count(*) from plan_events where plan_id = ? and event_id = ?",
    )
    .bind(plan_id)
    .bind(event_id)
    .fetch_one(pool)
    .await
    .context("has_plan_event failed")?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn mem_pool() -> SqlitePool {
        let pool = connect("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn migrate_then_status_ok() {
        let pool = mem_pool().await;
        let st = status(&pool).await.unwrap();
        assert!(st.ok);
        assert!(st.has_decisions_table);
    }

    #[tokio::test]
    async fn entry_date_upsert_round_trips() {
        let pool = mem_pool().await;
        let now = Utc::now();
        upsert_entry_date(
            &pool,
            &EntryDateRow {
                ticker: "AAPL".into(),
                entry_date: "2026-01-05".into(),
                shares: 10,
                entry_price: 190.5,
                updated_at: now,
            },
        )
        .await
        .unwrap();

        let fetched = get_entry_date(&pool, "AAPL").await.unwrap().unwrap();
        assert_eq!(fetched.shares, 10);

        upsert_entry_date(
            &pool,
            &EntryDateRow {
                ticker: "AAPL".into(),
                entry_date: "2026-01-05".into(),
                shares: 15,
                entry_price: 191.0,
                updated_at: now,
            },
        )
        .await
        .unwrap();
        let fetched = get_entry_date(&pool, "AAPL").await.unwrap().unwrap();
        assert_eq!(fetched.shares, 15);
    }

    #[tokio::test]
    async fn position_target_upsert_then_delete() {
        let pool = mem_pool().await;
        let now = Utc::now();
        upsert_position_target(
            &pool,
            &PositionTargetRow {
                ticker: "AAPL".into(),
                stop_loss: 180.0,
                target: 210.0,
                decision_id: Some("decision-1".into()),
                updated_at: now,
            },
        )
        .await
        .unwrap();

        let fetched = get_position_target(&pool, "AAPL").await.unwrap().unwrap();
        assert_eq!(fetched.stop_loss, 180.0);
        assert_eq!(fetched.target, 210.0);

        delete_position_target(&pool, "AAPL").await.unwrap();
        assert!(get_position_target(&pool, "AAPL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn market_data_cache_expires() {
        let pool = mem_pool().await;
        let now = Utc::now();
        upsert_market_data_cache(
            &pool,
            "AAPL",
            "price_history",
            &serde_json::json!({"close": 190.0}),
            now - chrono::Duration::hours(20),
            now - chrono::Duration::hours(4),
        )
        .await
        .unwrap();

        let hit = get_market_data_cache(&pool, "AAPL", "price_history", now)
            .await
            .unwrap();
        assert!(hit.is_none(), "expired entry must be treated as a miss");
    }

    #[tokio::test]
    async fn daily_execution_limit_query() {
        let pool = mem_pool().await;
        assert!(!has_executed_session_for_date(&pool, "2026-07-28")
            .await
            .unwrap());

        insert_trading_session(
            &pool,
            &TradingSessionRow {
                session_id: "s1".into(),
                date: "2026-07-28".into(),
                plan_generated_at: Some(Utc::now()),
                plan_executed_at: None,
                market_status: "OPEN".into(),
                trades_submitted: None,
                user_override: false,
                circuit_breaker_level: "NORMAL".into(),
                notes: None,
                created_at: Utc::now(),
            },
        )
        .await
        .unwrap();
        mark_session_executed(&pool, "s1", Utc::now(), 3)
            .await
            .unwrap();

        assert!(has_executed_session_for_date(&pool, "2026-07-28")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn plan_lifecycle_round_trips() {
        let pool = mem_pool().await;
        let now = Utc::now();
        let doc = serde_json::json!({"stage": "draft"});

        insert_plan(&pool, "plan-1", "DRAFT", now, &doc).await.unwrap();
        let fetched = get_plan(&pool, "plan-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, "DRAFT");

        let approved_doc = serde_json::json!({"stage": "approved"});
        update_plan_status(&pool, "plan-1", "APPROVED", Utc::now(), &approved_doc)
            .await
            .unwrap();
        let fetched = get_plan(&pool, "plan-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, "APPROVED");
        assert_eq!(fetched.plan_json, approved_doc);
    }

    #[tokio::test]
    async fn get_latest_plan_by_status_picks_most_recently_updated() {
        let pool = mem_pool().await;
        let now = Utc::now();

        insert_plan(&pool, "plan-old", "APPROVED", now, &serde_json::json!({"id": "old"})).await.unwrap();
        update_plan_status(&pool, "plan-old", "APPROVED", now, &serde_json::json!({"id": "old"})).await.unwrap();

        insert_plan(&pool, "plan-new", "APPROVED", now, &serde_json::json!({"id": "new"})).await.unwrap();
        update_plan_status(&pool, "plan-new", "APPROVED", now + Duration::seconds(1), &serde_json::json!({"id": "new"}))
            .await
            .unwrap();

        let latest = get_latest_plan_by_status(&pool, "APPROVED").await.unwrap().unwrap();
        assert_eq!(latest.plan_id, "plan-new");

        assert!(get_latest_plan_by_status(&pool, "EXECUTED").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plan_event_replay_is_idempotent() {
        let pool = mem_pool().await;
        let now = Utc::now();
        insert_plan(&pool, "plan-1", "DRAFT", now, &serde_json::json!({}))
            .await
            .unwrap();

        let event = serde_json::json!({"type": "approve"});
        let first = record_plan_event(&pool, "plan-1", "evt-1", &event, now).await.unwrap();
        assert!(first);

        let replay = record_plan_event(&pool, "plan-1", "evt-1", &event, now).await.unwrap();
        assert!(!replay, "duplicate event_id must be a silent no-op");

        assert!(has_plan_event(&pool, "plan-1", "evt-1").await.unwrap());
        assert!(!has_plan_event(&pool, "plan-1", "evt-2").await.unwrap());
    }
}
