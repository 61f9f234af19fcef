use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use td_schemas::{PriceBar, Ticker};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fundamentals {
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub market_cap: Option<f64>,
    pub trailing_pe: Option<f64>,
    pub forward_pe: Option<f64>,
    pub price_to_book: Option<f64>,
    pub return_on_equity: Option<f64>,
    pub profit_margins: Option<f64>,
    pub revenue_growth: Option<f64>,
    pub earnings_growth: Option<f64>,
    pub debt_to_equity: Option<f64>,
    pub current_ratio: Option<f64>,
    pub week52_high: Option<f64>,
    pub week52_low: Option<f64>,
}

/// The market-data collaborator contract (§6.2).
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_price_history(
        &self,
        ticker: &Ticker,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PriceBar>>;

    async fn fetch_fundamentals(&self, ticker: &Ticker) -> Result<Fundamentals>;
}

/// Deterministic fixture: returns a flat, synthetic price series and a
/// fixed fundamentals record for any ticker it hasn't been seeded with.
pub struct FixtureMarketData {
    series: std::collections::HashMap<String, Vec<PriceBar>>,
    fundamentals: std::collections::HashMap<String, Fundamentals>,
}

impl Default for FixtureMarketData {
    fn default() -> Self {
        FixtureMarketData {
            series: std::collections::HashMap::new(),
            fundamentals: std::collections::HashMap::new(),
        }
    }
}

impl FixtureMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price_history(mut self, ticker: &str, bars: Vec<PriceBar>) -> Self {
        self.series.insert(ticker.to_string(), bars);
        self
    }

    pub fn with_fundamentals(mut self, ticker: &str, f: Fundamentals) -> Self {
        self.fundamentals.insert(ticker.to_string(), f);
        self
    }
}

fn flat_fundamentals() -> Fundamentals {
    Fundamentals {
        sector: Some("Technology".to_string()),
        industry: Some("Software".to_string()),
        market_cap: Some(1.0e11),
        trailing_pe: Some(25.0),
        forward_pe: Some(22.0),
        price_to_book: Some(8.0),
        return_on_equity: Some(0.25),
        profit_margins: Some(0.20),
        revenue_growth: Some(0.10),
        earnings_growth: Some(0.12),
        debt_to_equity: Some(0.5),
        current_ratio: Some(1.5),
        week52_high: Some(200.0),
        week52_low: Some(120.0),
    }
}

#[async_trait]
impl MarketDataProvider for FixtureMarketData {
    async fn fetch_price_history(
        &self,
        ticker: &Ticker,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<PriceBar>> {
        Ok(self.series.get(ticker.as_str()).cloned().unwrap_or_default())
    }

    async fn fetch_fundamentals(&self, ticker: &Ticker) -> Result<Fundamentals> {
        Ok(self
            .fundamentals
            .get(ticker.as_str())
            .cloned()
            .unwrap_or_else(flat_fundamentals))
    }
}
