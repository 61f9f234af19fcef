use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// The LLM-optimizer collaborator contract (§6.2, §4.6.4): single
/// request/response, structured prompt in, a JSON object out.
#[async_trait]
pub trait LlmOptimizer: Send + Sync {
    async fn optimize(&self, prompt: &str) -> Result<Value>;
}

/// Returns a canned, well-formed allocation response regardless of prompt;
/// enough to drive the AI Optimizer stage in tests without a network call.
pub struct FixtureLlmOptimizer {
    response: Value,
}

impl FixtureLlmOptimizer {
    pub fn new(response: Value) -> Self {
        FixtureLlmOptimizer { response }
    }
}

#[async_trait]
impl LlmOptimizer for FixtureLlmOptimizer {
    async fn optimize(&self, _prompt: &str) -> Result<Value> {
        Ok(self.response.clone())
    }
}

/// The news-summarizer collaborator contract (§6.2).
#[async_trait]
pub trait NewsSummarizer: Send + Sync {
    async fn summarize(&self, payload: &Value) -> Result<String>;
}

pub struct FixtureNewsSummarizer;

#[async_trait]
impl NewsSummarizer for FixtureNewsSummarizer {
    async fn summarize(&self, _payload: &Value) -> Result<String> {
        Ok("No material news.".to_string())
    }
}
