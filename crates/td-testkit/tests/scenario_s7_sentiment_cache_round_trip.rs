//! S7: fetching sentiment for the same ticker twice within the TTL window
//! issues exactly one provider call; the second call is served from cache
//! with the same payload shape.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use td_testkit::TestHarness;

#[tokio::test]
async fn repeated_fetch_within_ttl_hits_the_cache() {
    let harness = TestHarness::new().await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        let result = td_cache::get_or_fetch_sentiment(&harness.pool, "AAPL", 16, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(td_cache::SentimentFetchResult {
                sentiment_score: 62.0,
                news_summary: "steady demand, no material news".to_string(),
                sentiment_reasoning: "technical and fundamental signals both neutral-to-positive".to_string(),
            })
        })
        .await
        .unwrap();

        assert_eq!(result.sentiment_score, 62.0);
        assert!(!result.news_summary.is_empty());
        assert!(!result.sentiment_reasoning.is_empty());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "second fetch within the TTL window must be served from cache");
}

#[tokio::test]
async fn fetch_outside_ttl_refetches() {
    let harness = TestHarness::new().await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        // A 0-hour TTL means the very next call is already outside the
        // freshness window, exercising the re-fetch path deterministically.
        td_cache::get_or_fetch_sentiment(&harness.pool, "MSFT", 0, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(td_cache::SentimentFetchResult {
                sentiment_score: 55.0,
                news_summary: "no material news".to_string(),
                sentiment_reasoning: "neutral".to_string(),
            })
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2, "a TTL of zero should never serve a cache hit");
}
