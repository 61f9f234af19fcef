use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Micros;
use crate::ticker::Ticker;

/// Where a candidate came from: freshly surfaced by Research, or an existing
/// broker-reported holding being re-scored by the Position Monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateContext {
    BuyCandidate,
    Holding,
}

/// A ticker surfaced by Research as a potential trade, or an existing holding
/// being re-scored. Mutated only additively by later stages (risk metrics,
/// then an eventual allocation) — never re-derived from scratch downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub ticker: Ticker,
    pub composite_score: f64,
    pub technical_score: f64,
    pub fundamental_score: f64,
    pub sentiment_score: f64,
    pub sector: String,
    pub current_price: Micros,
    pub context: CandidateContext,
    pub risk_metrics: Option<RiskMetrics>,
    pub risk_score: Option<i32>,
    pub risk_warnings: Vec<String>,
}

impl Candidate {
    pub fn clamp_scores(&mut self) {
        self.composite_score = self.composite_score.clamp(0.0, 100.0);
        self.technical_score = self.technical_score.clamp(0.0, 100.0);
        self.fundamental_score = self.fundamental_score.clamp(0.0, 100.0);
        self.sentiment_score = self.sentiment_score.clamp(0.0, 100.0);
    }
}

/// One OHLCV bar, cached as an ordered sequence per ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub open: Micros,
    pub high: Micros,
    pub low: Micros,
    pub close: Micros,
    pub volume: i64,
}

/// A sentiment cache entry. Expires ~16h after fetch (see `td-cache`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentEntry {
    pub ticker: Ticker,
    pub score: f64,
    pub summary: String,
    pub reasoning: String,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SentimentEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Risk metrics derived from price history for one candidate. Never negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub entry_price: Micros,
    pub stop_loss: Micros,
    pub target_price: Micros,
    pub atr: Micros,
    pub volatility_pct: f64,
    pub risk_reward_ratio: f64,
    pub position_size_shares: crate::money::Shares,
    pub position_size_value: Micros,
    pub total_risk_dollars: Micros,
    pub total_risk_pct: f64,
    pub risk_score: i32,
    pub warnings: Vec<String>,
}

/// A candidate that has passed Portfolio's hard constraints and is queued for
/// the AI Optimizer to allocate capital to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSelection {
    pub ticker: Ticker,
    pub intended_shares: crate::money::Shares,
    pub intended_entry_price: Micros,
    pub intended_stop: Micros,
    pub intended_target: Micros,
    pub sector: String,
    pub composite_score: f64,
}

/// Why a candidate was dropped by Portfolio's hard-constraint filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    LowScore,
    InsufficientCapacity,
    MaxPositionsReached,
    InsufficientCapital,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedCandidate {
    pub ticker: Ticker,
    pub reason: RejectionReason,
    pub detail: String,
}

/// The AI Optimizer's final capital allocation for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "side", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AIAllocation {
    Buy {
        ticker: Ticker,
        allocated_capital: Micros,
        is_position_adjustment: bool,
        reasoning: String,
        conviction_level: i32,
    },
    Sell {
        ticker: Ticker,
        sell_pct: f64,
        reasoning: String,
    },
}

impl AIAllocation {
    pub fn ticker(&self) -> &Ticker {
        match self {
            AIAllocation::Buy { ticker, .. } => ticker,
            AIAllocation::Sell { ticker, .. } => ticker,
        }
    }
}

/// Per-trade compliance verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceCheck {
    pub approved: bool,
    pub rejection_reason: Option<String>,
    pub rejection_category: Option<String>,
    pub checks: std::collections::BTreeMap<String, bool>,
    pub compliance_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Notional,
    Quantity,
}

/// A single trade intended for submission to the broker adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOrder {
    pub ticker: Ticker,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Option<crate::money::Shares>,
    pub notional: Option<Micros>,
    pub stop_loss: Option<Micros>,
    pub target: Option<Micros>,
    pub decision_id: Option<String>,
    pub note: String,
}

/// One row in `entry_dates`: the broker-confirmed date a position opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDate {
    pub ticker: Ticker,
    pub entry_date: NaiveDate,
    pub shares: crate::money::Shares,
    pub entry_price: Micros,
    pub updated_at: DateTime<Utc>,
}

/// Append-only account/position snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_value: Micros,
    pub cash_balance: Micros,
    pub equity_value: Micros,
    pub buying_power: Micros,
    pub positions_count: i32,
    pub daily_pl: Micros,
    pub daily_pl_pct: f64,
    pub source: String,
}
