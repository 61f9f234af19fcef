//! Position Monitor (C9): periodic re-scoring of current holdings, emitting
//! high-priority `SellOrder` messages when an exit trigger fires (§4.9).
//!
//! Runs on its own long-lived worker, independent of the Coordinator's
//! plan-generation cycle (§5). Re-scoring reuses Research's own scoring
//! functions against [`CandidateContext::Holding`] rather than duplicating
//! them, the same way the Coordinator reuses Portfolio/Optimizer/Compliance
//! instead of re-deriving their logic.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use td_bus::Bus;
use td_providers::broker::{BrokerAdapter, Position};
use td_providers::market_data::MarketDataProvider;
use td_providers::sentiment::SentimentProvider;
use td_schemas::{message_type, CandidateContext, OrderType, Priority, Side, Ticker, TradeOrder};
use td_stages::research::{score_candidate, ResearchCandidateSeed};

/// The original daily monitor exited flat positions at 5 days; kept as the
/// default here.
pub const DEFAULT_MAX_HOLD_DAYS: i64 = 5;
pub const DEFAULT_SCORE_DOWNGRADE_THRESHOLD: f64 = 55.0;
pub const DEFAULT_FLAT_PL_PCT: f64 = 0.02;
pub const DEFAULT_FETCH_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopHit,
    TargetHit,
    TimeBased,
    ScoreDowngrade,
}

impl ExitReason {
    fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopHit => "STOP_HIT",
            ExitReason::TargetHit => "TARGET_HIT",
            ExitReason::TimeBased => "TIME_BASED",
            ExitReason::ScoreDowngrade => "SCORE_DOWNGRADE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitSignal {
    pub ticker: Ticker,
    pub reason: ExitReason,
    pub last_price: f64,
    pub composite_score: Option<f64>,
    pub note: String,
}

impl ExitSignal {
    pub fn to_sell_order(&self) -> TradeOrder {
        TradeOrder {
            ticker: self.ticker.clone(),
            side: Side::Sell,
            order_type: OrderType::Market,
            quantity: None,
            notional: None,
            stop_loss: None,
            target: None,
            decision_id: None,
            note: self.note.clone(),
        }
    }
}

/// Everything the monitor knows about one broker-reported position beyond
/// what the broker itself carries: the stop/target this system placed it
/// under, its sector (for the re-score's candidate shape), and its entry
/// date when known (§4.9's "holdings with no known entry date" case).
#[derive(Debug, Clone)]
pub struct HoldingContext {
    pub sector: String,
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
    pub entry_date: Option<NaiveDate>,
}

pub struct MonitorConfig {
    pub max_hold_days: i64,
    pub score_downgrade_threshold: f64,
    pub flat_pl_pct: f64,
    pub fetch_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            max_hold_days: DEFAULT_MAX_HOLD_DAYS,
            score_downgrade_threshold: DEFAULT_SCORE_DOWNGRADE_THRESHOLD,
            flat_pl_pct: DEFAULT_FLAT_PL_PCT,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

/// One cycle's result. `SkippedOverlap` is returned, never panics or blocks,
/// when the previous cycle is still draining its output queue.
pub enum MonitorOutcome {
    Ran { exits: Vec<ExitSignal>, positions_checked: usize },
    SkippedOverlap,
}

pub struct PositionMonitor {
    broker: Arc<dyn BrokerAdapter>,
    market_data: Arc<dyn MarketDataProvider>,
    sentiment: Arc<dyn SentimentProvider>,
    bus: Arc<Bus>,
    config: MonitorConfig,
    draining: Mutex<()>,
}

impl PositionMonitor {
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        market_data: Arc<dyn MarketDataProvider>,
        sentiment: Arc<dyn SentimentProvider>,
        bus: Arc<Bus>,
        config: MonitorConfig,
    ) -> Self {
        PositionMonitor { broker, market_data, sentiment, bus, config, draining: Mutex::new(()) }
    }

    /// §4.9's one cycle: fetch ground-truth positions, re-score each one,
    /// evaluate exits in the mandated order, dispatch a `SellOrder` per
    /// trigger. `contexts` supplies the stop/target/sector/entry-date this
    /// system attached to each position; a ticker missing from it still gets
    /// the score-downgrade check, with every other check a no-op (no stop,
    /// no target, no known entry date).
    pub async fn run_cycle(&self, contexts: &BTreeMap<String, HoldingContext>, now: DateTime<Utc>) -> MonitorOutcome {
        let Ok(guard) = self.draining.try_lock() else {
            tracing::warn!("position monitor cycle skipped: previous cycle still draining its output queue");
            return MonitorOutcome::SkippedOverlap;
        };

        let positions = match self.broker.get_positions().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "position monitor could not reach the broker adapter, skipping cycle");
                return MonitorOutcome::Ran { exits: Vec::new(), positions_checked: 0 };
            }
        };

        let empty = HoldingContext { sector: "Unknown".to_string(), stop_loss: None, target: None, entry_date: None };
        let rescored = self.rescore(&positions, contexts).await;

        let mut exits = Vec::new();
        for position in &positions {
            let ctx = contexts.get(position.ticker.as_str()).unwrap_or(&empty);
            let composite = rescored.get(position.ticker.as_str()).copied();
            if let Some(signal) = evaluate_exits(position, ctx, composite, &self.config, now) {
                exits.push(signal);
            }
        }

        for signal in &exits {
            self.dispatch_exit(signal);
        }
        drop(guard);

        MonitorOutcome::Ran { exits, positions_checked: positions.len() }
    }

    /// Fetches bars/fundamentals/sentiment and re-scores every position with
    /// Research's own composite, bounded to `fetch_concurrency` in flight at
    /// once so the monitor respects the same provider rate limits Research
    /// does (§5).
    async fn rescore(&self, positions: &[Position], contexts: &BTreeMap<String, HoldingContext>) -> BTreeMap<String, f64> {
        let scores = stream::iter(positions.iter().cloned())
            .map(|position| {
                let market_data = Arc::clone(&self.market_data);
                let sentiment = Arc::clone(&self.sentiment);
                let known_sector = contexts.get(position.ticker.as_str()).map(|c| c.sector.clone());
                async move {
                    let ticker = position.ticker.clone();
                    let end = Utc::now().date_naive();
                    let start = end - chrono::Duration::days(120);
                    let bars = market_data.fetch_price_history(&ticker, start, end).await.unwrap_or_default();
                    let fundamentals = match market_data.fetch_fundamentals(&ticker).await {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::warn!(ticker = ticker.as_str(), error = %e, "could not fetch fundamentals for re-score");
                            return None;
                        }
                    };
                    let sentiment_score = sentiment.fetch(&ticker).await.ok().map(|s| s.sentiment_score);
                    let sector = known_sector
                        .or_else(|| fundamentals.sector.clone())
                        .unwrap_or_else(|| "Unknown".to_string());
                    let seed = ResearchCandidateSeed { ticker: ticker.clone(), sector, bars, fundamentals, sentiment_score };
                    let candidate = score_candidate(&seed, CandidateContext::Holding);
                    Some((ticker.as_str().to_string(), candidate.composite_score))
                }
            })
            .buffer_unordered(self.config.fetch_concurrency.max(1))
            .filter_map(|r| async move { r })
            .collect::<Vec<_>>()
            .await;

        scores.into_iter().collect()
    }

    fn dispatch_exit(&self, signal: &ExitSignal) {
        let subject = format!("SELL {} ({})", signal.ticker.as_str(), signal.reason.as_str());
        let payload = serde_json::json!(signal.to_sell_order());
        match self.bus.write(
            "PositionMonitor",
            "Trading",
            message_type::SELL_ORDER,
            &subject,
            &signal.note,
            Some(payload),
            Priority::High,
            false,
            None,
        ) {
            Ok(message_id) => {
                if let Err(e) = self.bus.route(&message_id, "PositionMonitor", "Trading") {
                    tracing::warn!(ticker = signal.ticker.as_str(), error = %e, "failed to route exit dispatch");
                }
            }
            Err(e) => tracing::warn!(ticker = signal.ticker.as_str(), error = %e, "failed to publish exit dispatch"),
        }
    }
}

/// §4.9 step 3, in the mandated order. The first trigger that fires wins —
/// a position is never sold twice in the same cycle.
fn evaluate_exits(
    position: &Position,
    ctx: &HoldingContext,
    composite: Option<f64>,
    config: &MonitorConfig,
    now: DateTime<Utc>,
) -> Option<ExitSignal> {
    let last = position.current_price;

    if let Some(stop) = ctx.stop_loss {
        if last <= stop {
            return Some(ExitSignal {
                ticker: position.ticker.clone(),
                reason: ExitReason::StopHit,
                last_price: last,
                composite_score: composite,
                note: format!("last {last:.2} <= stop {stop:.2}"),
            });
        }
    }

    if let Some(target) = ctx.target {
        if last >= target {
            return Some(ExitSignal {
                ticker: position.ticker.clone(),
                reason: ExitReason::TargetHit,
                last_price: last,
                composite_score: composite,
                note: format!("last {last:.2} >= target {target:.2}"),
            });
        }
    }

    if let Some(entry_date) = ctx.entry_date {
        let days_held = (now.date_naive() - entry_date).num_days();
        let flat = position.unrealized_plpc.abs() < config.flat_pl_pct;
        if days_held >= config.max_hold_days && flat {
            return Some(ExitSignal {
                ticker: position.ticker.clone(),
                reason: ExitReason::TimeBased,
                last_price: last,
                composite_score: composite,
                note: format!(
                    "held {days_held}d (>= {}d) flat at {:.2}% P&L",
                    config.max_hold_days,
                    position.unrealized_plpc * 100.0
                ),
            });
        }
    }

    if let Some(score) = composite {
        if score < config.score_downgrade_threshold && position.unrealized_pl < 0.0 {
            return Some(ExitSignal {
                ticker: position.ticker.clone(),
                reason: ExitReason::ScoreDowngrade,
                last_price: last,
                composite_score: Some(score),
                note: format!(
                    "composite dropped to {score:.1} (below {}), exiting ahead of the full stop",
                    config.score_downgrade_threshold
                ),
            });
        }
    }

    None
}
