use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Research,
    Risk,
    Portfolio,
    AiOptimizer,
    Compliance,
}

impl Stage {
    /// Strict pipeline order, per §4.7.
    pub const ORDER: [Stage; 5] = [
        Stage::Research,
        Stage::Risk,
        Stage::Portfolio,
        Stage::AiOptimizer,
        Stage::Compliance,
    ];

    pub fn next(self) -> Option<Stage> {
        let idx = Self::ORDER.iter().position(|s| *s == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Research => "Research",
            Stage::Risk => "Risk",
            Stage::Portfolio => "Portfolio",
            Stage::AiOptimizer => "AI Optimizer",
            Stage::Compliance => "Compliance",
        }
    }
}

/// The uniform result contract every stage runner returns (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    pub data: Value,
    pub message: String,
    pub quality_score: i32,
    pub issues: Vec<String>,
}

impl StageResult {
    pub fn ok(stage: Stage, data: Value, message: impl Into<String>, quality_score: i32) -> Self {
        StageResult {
            stage,
            success: true,
            data,
            message: message.into(),
            quality_score: quality_score.clamp(0, 100),
            issues: Vec::new(),
        }
    }

    pub fn failed(stage: Stage, message: impl Into<String>, quality_score: i32, issues: Vec<String>) -> Self {
        StageResult {
            stage,
            success: false,
            data: Value::Null,
            message: message.into(),
            quality_score: quality_score.clamp(0, 100),
            issues,
        }
    }
}
