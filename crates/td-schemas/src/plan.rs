use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::TradeOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Draft,
    ReadyForApproval,
    Approved,
    Rejected,
    Executing,
    Executed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSummaryEntry {
    pub stage: String,
    pub success: bool,
    pub quality_score: i32,
    pub message: String,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSummary {
    pub overall_quality_score: i32,
}

/// The durable, approvable output of one Coordinator cycle (§3, §4.7, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPlan {
    pub plan_id: String,
    pub generated_at: DateTime<Utc>,
    pub status: PlanStatus,
    pub summary: PlanSummary,
    pub stage_quality: std::collections::BTreeMap<String, i32>,
    pub trades: Vec<TradeOrder>,
    pub workflow_summary: Vec<StageSummaryEntry>,
}

impl TradingPlan {
    /// P1: plan score bounds.
    pub fn scores_in_bounds(&self) -> bool {
        let overall_ok = (0..=100).contains(&self.summary.overall_quality_score);
        let stages_ok = self.stage_quality.values().all(|q| (0..=100).contains(q));
        overall_ok && stages_ok
    }

    /// P2: no ticker appears on both sides of the trade list.
    pub fn has_self_conflict(&self) -> bool {
        use crate::entities::Side;
        use std::collections::HashSet;
        let mut buys = HashSet::new();
        let mut sells = HashSet::new();
        for t in &self.trades {
            match t.side {
                Side::Buy => {
                    buys.insert(t.ticker.clone());
                }
                Side::Sell => {
                    sells.insert(t.ticker.clone());
                }
            }
        }
        buys.intersection(&sells).next().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitBreakerLevel {
    Normal,
    Yellow,
    Orange,
    Red,
}

impl CircuitBreakerLevel {
    pub fn allows_new_buys(&self) -> bool {
        matches!(self, CircuitBreakerLevel::Normal | CircuitBreakerLevel::Yellow)
    }

    pub fn blocks_everything(&self) -> bool {
        matches!(self, CircuitBreakerLevel::Red)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MarketStatus {
    Open,
    Closed,
}

/// A calendar-day bucket enforcing once-per-day execution (§3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSession {
    pub session_id: String,
    pub date: NaiveDate,
    pub plan_generated_at: Option<DateTime<Utc>>,
    pub plan_executed_at: Option<DateTime<Utc>>,
    pub market_status: String,
    pub trades_submitted: Option<i32>,
    pub user_override: bool,
    pub circuit_breaker_level: CircuitBreakerLevel,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cache/message document payload carrier used at the bus boundary (schema-light).
pub type Payload = Value;
