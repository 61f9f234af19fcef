//! Stage Runners (C6): the five pipeline stages, each behind the same
//! `StageRunner` contract so the Coordinator stays generic over "anything
//! that turns an input document into a `StageResult`" — the way the
//! strategy-plugin host elsewhere in this codebase keeps its caller
//! agnostic of which concrete strategy is registered.

pub mod compliance;
pub mod optimizer;
pub mod portfolio;
pub mod research;
pub mod risk;

use async_trait::async_trait;
use serde_json::Value;
use td_schemas::{Stage, StageResult};

#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// `input` is a stage-specific JSON document (the Coordinator routes the
    /// previous stage's `StageResult::data` in); a malformed document is a
    /// failed `StageResult`, never a panic.
    async fn run(&self, input: Value) -> StageResult;
}

/// Shared "couldn't even parse the input" failure, so every runner reports
/// malformed input the same way instead of inventing its own wording.
pub(crate) fn malformed_input(stage: Stage, err: serde_json::Error) -> StageResult {
    StageResult::failed(
        stage,
        format!("malformed input document: {err}"),
        0,
        vec![err.to_string()],
    )
}

pub use compliance::ComplianceRunner;
pub use optimizer::AiOptimizerRunner;
pub use portfolio::PortfolioRunner;
pub use research::ResearchRunner;
pub use risk::RiskRunner;
