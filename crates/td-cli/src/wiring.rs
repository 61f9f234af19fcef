//! Composition root: builds the concrete provider set, message bus root,
//! and state store pool every CLI command shares.
//!
//! No live broker, market-data, sentiment, or LLM adapter exists anywhere
//! in this workspace (see `td-providers`' own doc comment on why a
//! production HTTP client is out of scope), so this wires the fixture
//! implementations directly. A deployment that needs a real broker swaps
//! [`Runtime::connect`]'s provider construction for a concrete adapter
//! behind the same trait objects; nothing downstream changes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;

use td_config::{LoadedConfig, Settings};
use td_providers::broker::{Account, BrokerAdapter, FixtureBroker};
use td_providers::llm::LlmOptimizer;
use td_providers::market_data::{FixtureMarketData, MarketDataProvider};
use td_providers::sentiment::{FixtureSentiment, SentimentProvider};

pub const ENV_BUS_ROOT: &str = "TD_BUS_ROOT";
const DEFAULT_BUS_ROOT: &str = "bus";

/// Starting paper-account balance for a freshly wired fixture broker. Not a
/// recognized configuration key; this is wiring, not policy.
const STARTING_PAPER_CAPITAL: f64 = 100_000.0;

/// Stands in for a real LLM provider, which this workspace never builds.
/// Always errors, so the AI Optimizer stage always takes its documented
/// deterministic fallback path rather than the CLI silently skipping that
/// code path entirely.
pub struct NullLlmOptimizer;

#[async_trait]
impl LlmOptimizer for NullLlmOptimizer {
    async fn optimize(&self, _prompt: &str) -> Result<Value> {
        anyhow::bail!("no LLM provider is wired for this CLI; the caller should fall back")
    }
}

/// Everything a command needs that isn't command-specific. `bus_root` is
/// kept as a path rather than a live `Bus` because `Bus` carries no `Clone`
/// impl; [`Runtime::bus`] builds one fresh per use, which is cheap since a
/// `Bus` is just that path plus stateless file IO.
pub struct Runtime {
    pub pool: SqlitePool,
    bus_root: PathBuf,
    pub loaded_config: LoadedConfig,
    pub settings: Settings,
    pub broker: Arc<dyn BrokerAdapter>,
    pub market_data: Arc<dyn MarketDataProvider>,
    pub sentiment: Arc<dyn SentimentProvider>,
    pub llm: Arc<dyn LlmOptimizer>,
}

impl Runtime {
    pub async fn connect(config_paths: &[&str]) -> Result<Self> {
        let pool = td_store::connect_from_env()
            .await
            .context("connecting to the state store")?;
        td_store::migrate(&pool).await.context("running state store migrations")?;

        let loaded_config = td_config::load_layered_yaml(config_paths).context("loading layered configuration")?;
        let settings = loaded_config.settings();

        let bus_root = std::env::var(ENV_BUS_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_BUS_ROOT));

        let account = Account {
            portfolio_value: STARTING_PAPER_CAPITAL,
            equity: STARTING_PAPER_CAPITAL,
            last_equity: STARTING_PAPER_CAPITAL,
            cash: STARTING_PAPER_CAPITAL,
            buying_power: STARTING_PAPER_CAPITAL,
        };

        Ok(Runtime {
            pool,
            bus_root,
            loaded_config,
            settings,
            broker: Arc::new(FixtureBroker::new(account)),
            market_data: Arc::new(FixtureMarketData::new()),
            sentiment: Arc::new(FixtureSentiment::new()),
            llm: Arc::new(NullLlmOptimizer),
        })
    }

    pub fn bus(&self) -> td_bus::Bus {
        td_bus::Bus::new(&self.bus_root)
    }
}
