use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Routine,
    High,
    Urgent,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Routine => "routine",
            Priority::High => "high",
            Priority::Urgent => "urgent",
            Priority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "routine" => Some(Priority::Routine),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// The required message types of §6.4. Implementations may emit others;
/// these are the ones stage boundaries must recognize.
pub mod message_type {
    pub const DAILY_BRIEFING: &str = "DailyBriefing";
    pub const RISK_ASSESSMENT: &str = "RiskAssessment";
    pub const BUY_ORDER: &str = "BuyOrder";
    pub const SELL_ORDER: &str = "SellOrder";
    pub const EXECUTIVE_APPROVAL: &str = "ExecutiveApproval";
    pub const REGIME_ASSESSMENT: &str = "RegimeAssessment";
    pub const ESCALATION: &str = "Escalation";
}

/// A typed document routed through the Message Bus (§3, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub priority: Priority,
    pub requires_response: bool,
    pub parent_message_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A structured non-success result returned when a stage fails its quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub stage: String,
    pub issue_type: String,
    pub severity: Severity,
    pub context: Value,
    pub options: Vec<String>,
    pub recommendation: String,
}
