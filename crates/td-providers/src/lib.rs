//! External-Provider Adapters (C11), contract only.
//!
//! The core depends on these traits, never on a concrete HTTP client.
//! Each module carries one deterministic, dependency-free fixture
//! implementation sufficient to drive the Coordinator end-to-end in tests,
//! the same way this codebase's paper-broker crate stands in for a live
//! broker. Building a production HTTP client for any of these is out of
//! scope.

pub mod broker;
pub mod llm;
pub mod market_data;
pub mod sentiment;

pub use broker::{BrokerAdapter, FixtureBroker};
pub use llm::{FixtureLlmOptimizer, FixtureNewsSummarizer, LlmOptimizer, NewsSummarizer};
pub use market_data::{FixtureMarketData, MarketDataProvider};
pub use sentiment::{FixtureSentiment, SentimentProvider};
