use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Clear,
    Caution,
    Override,
    Blocked,
}

/// The shape every Session Guardrail check returns (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailResult {
    pub can_execute: bool,
    pub gates_passed: Vec<String>,
    pub gates_failed: Vec<String>,
    pub warnings: Vec<String>,
    pub requires_override: bool,
    pub recommendation: Recommendation,
}

impl GuardrailResult {
    pub fn is_blocked(&self) -> bool {
        !self.can_execute && !self.requires_override
    }
}
