//! Caches (C5): write-through price-data and sentiment caches over the
//! State Store, with a default 16-hour TTL.
//!
//! Both caches follow the same shape: a miss calls the provider, the result
//! is upserted with `expires_at = fetched_at + ttl`, and the value is
//! returned. Concurrent misses for the same key may cause duplicate
//! fetches; that's accepted (§4.5) because the upsert is idempotent.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use td_store::SentimentCacheEntry;

pub const DEFAULT_TTL_HOURS: i64 = 16;

/// Get cached market data for `(ticker, data_type)`, or fetch via `fetch`
/// and write it through on a miss/expiry/corruption.
pub async fn get_or_fetch_market_data<F, Fut>(
    pool: &SqlitePool,
    ticker: &str,
    data_type: &str,
    ttl_hours: i64,
    fetch: F,
) -> Result<Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let now = Utc::now();
    if let Some(hit) = td_store::get_market_data_cache(pool, ticker, data_type, now).await? {
        return Ok(hit);
    }

    tracing::debug!(ticker, data_type, "market data cache miss, fetching");
    let value = fetch().await?;
    let fetched_at = Utc::now();
    let expires_at = fetched_at + Duration::hours(ttl_hours);
    td_store::upsert_market_data_cache(pool, ticker, data_type, &value, fetched_at, expires_at)
        .await?;
    Ok(value)
}

pub struct SentimentFetchResult {
    pub sentiment_score: f64,
    pub news_summary: String,
    pub sentiment_reasoning: String,
}

pub async fn get_or_fetch_sentiment<F, Fut>(
    pool: &SqlitePool,
    ticker: &str,
    ttl_hours: i64,
    fetch: F,
) -> Result<SentimentCacheEntry>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<SentimentFetchResult>>,
{
    let now = Utc::now();
    if let Some(hit) = td_store::get_sentiment_cache(pool, ticker, now).await? {
        return Ok(hit);
    }

    tracing::debug!(ticker, "sentiment cache miss, fetching");
    let fetched = fetch().await?;
    let fetched_at = Utc::now();
    let expires_at = fetched_at + Duration::hours(ttl_hours);
    let entry = SentimentCacheEntry {
        sentiment_score: fetched.sentiment_score,
        news_summary: fetched.news_summary,
        sentiment_reasoning: fetched.sentiment_reasoning,
        fetched_at,
        expires_at,
    };
    td_store::upsert_sentiment_cache(pool, ticker, &entry).await?;
    Ok(entry)
}

/// `true` if a cache entry's recorded `fetched_at` is still within `ttl_hours`
/// of `now`. Exposed for stages that want to report cache age without a
/// round trip through the fetch-on-miss helpers above.
pub fn is_fresh(fetched_at: DateTime<Utc>, ttl_hours: i64, now: DateTime<Utc>) -> bool {
    now - fetched_at <= Duration::hours(ttl_hours)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_pool() -> SqlitePool {
        let pool = td_store::connect("sqlite::memory:").await.unwrap();
        td_store::migrate(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn miss_then_hit_does_not_refetch() {
        let pool = mem_pool().await;
        let mut calls = 0;
        for _ in 0..2 {
            let _ = get_or_fetch_market_data(&pool, "AAPL", "price_history", 16, || {
                calls += 1;
                async move { Ok(serde_json::json!({"close": 190.0})) }
            })
            .await
            .unwrap();
        }
        assert_eq!(calls, 1, "second call should be served from cache");
    }
}
