//! Universe and holdings assembly: turns a ticker list or the broker's
//! current positions into the typed seeds the stage pipeline consumes,
//! fetching through the state store's write-through caches with the same
//! bounded fan-out the Position Monitor uses for its own re-score.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use td_monitor::HoldingContext;
use td_providers::market_data::{Fundamentals, MarketDataProvider};
use td_providers::sentiment::SentimentProvider;
use td_schemas::{CandidateContext, Micros, PriceBar, Ticker};
use td_stages::optimizer::OptimizerHolding;
use td_stages::research::{score_candidate, ResearchCandidateSeed};

use crate::wiring::Runtime;

/// One line of a universe file: the tickers Research should consider this
/// cycle, plus the sector label Research's own scoring needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UniverseEntry {
    pub ticker: String,
    pub sector: String,
}

async fn fetch_bars(
    pool: &SqlitePool,
    market_data: &Arc<dyn MarketDataProvider>,
    ttl_hours: i64,
    ticker: &Ticker,
) -> Vec<PriceBar> {
    let end = Utc::now().date_naive();
    let start = end - chrono::Duration::days(120);
    let fetch_ticker = ticker.clone();
    let provider = Arc::clone(market_data);
    let result = td_cache::get_or_fetch_market_data(pool, ticker.as_str(), "price_history", ttl_hours, || async move {
        let bars = provider.fetch_price_history(&fetch_ticker, start, end).await?;
        Ok(serde_json::to_value(bars)?)
    })
    .await;

    match result {
        Ok(v) => serde_json::from_value(v).unwrap_or_default(),
        Err(e) => {
            tracing::warn!(ticker = ticker.as_str(), error = %e, "price history fetch failed, using empty history");
            Vec::new()
        }
    }
}

fn unseeded_fundamentals() -> Fundamentals {
    Fundamentals {
        sector: None,
        industry: None,
        market_cap: None,
        trailing_pe: None,
        forward_pe: None,
        price_to_book: None,
        return_on_equity: None,
        profit_margins: None,
        revenue_growth: None,
        earnings_growth: None,
        debt_to_equity: None,
        current_ratio: None,
        week52_high: None,
        week52_low: None,
    }
}

async fn fetch_fundamentals(
    pool: &SqlitePool,
    market_data: &Arc<dyn MarketDataProvider>,
    ttl_hours: i64,
    ticker: &Ticker,
) -> Fundamentals {
    let fetch_ticker = ticker.clone();
    let provider = Arc::clone(market_data);
    let result = td_cache::get_or_fetch_market_data(pool, ticker.as_str(), "fundamentals", ttl_hours, || async move {
        let f = provider.fetch_fundamentals(&fetch_ticker).await?;
        Ok(serde_json::to_value(f)?)
    })
    .await;

    match result {
        Ok(v) => serde_json::from_value(v).unwrap_or_else(|_| unseeded_fundamentals()),
        Err(e) => {
            tracing::warn!(ticker = ticker.as_str(), error = %e, "fundamentals fetch failed");
            unseeded_fundamentals()
        }
    }
}

async fn fetch_sentiment_score(
    pool: &SqlitePool,
    sentiment: &Arc<dyn SentimentProvider>,
    ttl_hours: i64,
    ticker: &Ticker,
) -> Option<f64> {
    let fetch_ticker = ticker.clone();
    let provider = Arc::clone(sentiment);
    let result = td_cache::get_or_fetch_sentiment(pool, ticker.as_str(), ttl_hours, || async move {
        let s = provider.fetch(&fetch_ticker).await?;
        Ok(td_cache::SentimentFetchResult {
            sentiment_score: s.sentiment_score,
            news_summary: s.news_summary,
            sentiment_reasoning: s.sentiment_reasoning,
        })
    })
    .await;

    match result {
        Ok(entry) => Some(entry.sentiment_score),
        Err(e) => {
            tracing::warn!(ticker = ticker.as_str(), error = %e, "sentiment fetch failed");
            None
        }
    }
}

/// Builds a `ResearchCandidateSeed` per universe entry, `fetch_concurrency`
/// in flight at once. A malformed ticker is logged and dropped rather than
/// failing the whole cycle.
pub async fn build_universe_seeds(rt: &Runtime, entries: &[UniverseEntry]) -> Vec<ResearchCandidateSeed> {
    let concurrency = rt.settings.concurrency.per_stage_fanout.max(1);
    let ttl_hours = rt.settings.cache_ttl_hours;
    let pool = rt.pool.clone();
    let market_data = Arc::clone(&rt.market_data);
    let sentiment = Arc::clone(&rt.sentiment);

    stream::iter(entries.to_vec())
        .map(move |entry| {
            let pool = pool.clone();
            let market_data = Arc::clone(&market_data);
            let sentiment = Arc::clone(&sentiment);
            async move {
                let ticker = match Ticker::new(&entry.ticker) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::warn!(raw = %entry.ticker, error = %e, "skipping malformed universe ticker");
                        return None;
                    }
                };
                let bars = fetch_bars(&pool, &market_data, ttl_hours, &ticker).await;
                let fundamentals = fetch_fundamentals(&pool, &market_data, ttl_hours, &ticker).await;
                let sentiment_score = fetch_sentiment_score(&pool, &sentiment, ttl_hours, &ticker).await;
                Some(ResearchCandidateSeed { ticker, sector: entry.sector, bars, fundamentals, sentiment_score })
            }
        })
        .buffer_unordered(concurrency)
        .filter_map(|r| async move { r })
        .collect::<Vec<_>>()
        .await
}

/// Re-scores every current broker position into an `OptimizerHolding`, the
/// same composite the Position Monitor produces for its own exit checks.
pub async fn build_holdings(rt: &Runtime) -> Result<Vec<OptimizerHolding>> {
    let positions = rt.broker.get_positions().await.context("fetching broker positions for holdings")?;
    let concurrency = rt.settings.concurrency.per_stage_fanout.max(1);
    let ttl_hours = rt.settings.cache_ttl_hours;
    let pool = rt.pool.clone();
    let market_data = Arc::clone(&rt.market_data);
    let sentiment = Arc::clone(&rt.sentiment);

    let holdings = stream::iter(positions)
        .map(move |position| {
            let pool = pool.clone();
            let market_data = Arc::clone(&market_data);
            let sentiment = Arc::clone(&sentiment);
            async move {
                let ticker = position.ticker.clone();
                let bars = fetch_bars(&pool, &market_data, ttl_hours, &ticker).await;
                let fundamentals = fetch_fundamentals(&pool, &market_data, ttl_hours, &ticker).await;
                let sentiment_score = fetch_sentiment_score(&pool, &sentiment, ttl_hours, &ticker).await;
                let sector = fundamentals.sector.clone().unwrap_or_else(|| "Unknown".to_string());
                let seed = ResearchCandidateSeed {
                    ticker: ticker.clone(),
                    sector: sector.clone(),
                    bars,
                    fundamentals,
                    sentiment_score,
                };
                let candidate = score_candidate(&seed, CandidateContext::Holding);
                OptimizerHolding {
                    ticker,
                    composite_score: candidate.composite_score,
                    sector,
                    market_value: Micros::from_dollars(position.market_value),
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

    Ok(holdings)
}

/// The stop/target/entry-date context the Position Monitor needs per
/// position, assembled from whatever this system has durably recorded for
/// it. A position with no recorded target still gets the score-downgrade
/// check; every other check on it is a no-op.
pub async fn build_holding_contexts(rt: &Runtime) -> Result<BTreeMap<String, HoldingContext>> {
    let positions = rt.broker.get_positions().await.context("fetching broker positions for monitor contexts")?;
    let mut out = BTreeMap::new();

    for position in &positions {
        let ticker = position.ticker.as_str();
        let target = td_store::get_position_target(&rt.pool, ticker).await?;
        let entry = td_store::get_entry_date(&rt.pool, ticker).await?;
        let fundamentals = fetch_fundamentals(&rt.pool, &rt.market_data, rt.settings.cache_ttl_hours, &position.ticker).await;

        out.insert(
            ticker.to_string(),
            HoldingContext {
                sector: fundamentals.sector.unwrap_or_else(|| "Unknown".to_string()),
                stop_loss: target.as_ref().map(|t| t.stop_loss),
                target: target.as_ref().map(|t| t.target),
                entry_date: entry
                    .and_then(|e| chrono::NaiveDate::parse_from_str(&e.entry_date, "%Y-%m-%d").ok()),
            },
        );
    }

    Ok(out)
}
