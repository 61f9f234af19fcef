use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use td_schemas::Ticker;

#[derive(Debug, Clone)]
pub struct SentimentResult {
    pub sentiment_score: f64,
    pub news_summary: String,
    pub sentiment_reasoning: String,
}

/// The sentiment collaborator contract (§6.2). May be batched; implementors
/// decide their own batching strategy internally, callers just await the
/// per-ticker result.
#[async_trait]
pub trait SentimentProvider: Send + Sync {
    async fn fetch(&self, ticker: &Ticker) -> Result<SentimentResult>;
}

pub struct FixtureSentiment {
    canned: HashMap<String, SentimentResult>,
}

impl Default for FixtureSentiment {
    fn default() -> Self {
        FixtureSentiment {
            canned: HashMap::new(),
        }
    }
}

impl FixtureSentiment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, ticker: &str, result: SentimentResult) -> Self {
        self.canned.insert(ticker.to_string(), result);
        self
    }
}

#[async_trait]
impl SentimentProvider for FixtureSentiment {
    async fn fetch(&self, ticker: &Ticker) -> Result<SentimentResult> {
        Ok(self.canned.get(ticker.as_str()).cloned().unwrap_or(SentimentResult {
            sentiment_score: 50.0,
            news_summary: "No notable news.".to_string(),
            sentiment_reasoning: "Neutral baseline, no fixture data seeded.".to_string(),
        }))
    }
}
