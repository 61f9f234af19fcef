//! Research (§4.6.1): swing-suitability prefilter, then adaptive technical
//! filters, then a three-factor composite score.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use td_providers::market_data::Fundamentals;
use td_schemas::{Candidate, CandidateContext, PriceBar, Stage, StageResult, Ticker};

use crate::{malformed_input, StageRunner};

#[derive(Debug, Deserialize, Serialize)]
pub struct ResearchCandidateSeed {
    pub ticker: Ticker,
    pub sector: String,
    /// Ascending by date, oldest first.
    pub bars: Vec<PriceBar>,
    pub fundamentals: Fundamentals,
    pub sentiment_score: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResearchInput {
    pub universe: Vec<ResearchCandidateSeed>,
    #[serde(default = "default_target_count")]
    pub target_count: usize,
    #[serde(default = "default_min_required")]
    pub min_required: usize,
}

fn default_target_count() -> usize {
    80
}

fn default_min_required() -> usize {
    3
}

struct FilterPreset {
    rsi: (f64, f64),
    volume_min: f64,
    price_min: f64,
}

const PRESETS: [FilterPreset; 5] = [
    FilterPreset { rsi: (30.0, 45.0), volume_min: 2_000_000.0, price_min: 20.0 },
    FilterPreset { rsi: (25.0, 50.0), volume_min: 1_000_000.0, price_min: 10.0 },
    FilterPreset { rsi: (20.0, 60.0), volume_min: 500_000.0, price_min: 5.0 },
    FilterPreset { rsi: (15.0, 70.0), volume_min: 250_000.0, price_min: 2.0 },
    FilterPreset { rsi: (10.0, 80.0), volume_min: 100_000.0, price_min: 1.0 },
];

fn closes(bars: &[PriceBar]) -> Vec<f64> {
    bars.iter().map(|b| b.close.as_dollars()).collect()
}

/// Annualized pct volatility of daily close-to-close returns.
pub fn annualized_volatility_pct(bars: &[PriceBar]) -> f64 {
    let c = closes(bars);
    if c.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = c.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt() * (252.0f64).sqrt() * 100.0
}

pub fn average_volume(bars: &[PriceBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    bars.iter().map(|b| b.volume as f64).sum::<f64>() / bars.len() as f64
}

/// Classic Wilder ATR over the trailing `period` bars.
pub fn atr(bars: &[PriceBar], period: usize) -> f64 {
    if bars.len() < 2 {
        return 0.0;
    }
    let mut true_ranges = Vec::with_capacity(bars.len() - 1);
    for w in bars.windows(2) {
        let prev_close = w[0].close.as_dollars();
        let high = w[1].high.as_dollars();
        let low = w[1].low.as_dollars();
        let tr = (high - low).max((high - prev_close).abs()).max((low - prev_close).abs());
        true_ranges.push(tr);
    }
    let window = true_ranges.len().min(period);
    let tail = &true_ranges[true_ranges.len() - window..];
    tail.iter().sum::<f64>() / tail.len() as f64
}

fn rsi(bars: &[PriceBar], period: usize) -> f64 {
    let c = closes(bars);
    if c.len() < period + 1 {
        return 50.0;
    }
    let deltas: Vec<f64> = c.windows(2).map(|w| w[1] - w[0]).collect();
    let tail = &deltas[deltas.len() - period..];
    let gain = tail.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss = tail.iter().filter(|d| **d < 0.0).map(|d| -d).sum::<f64>() / period as f64;
    if loss == 0.0 {
        return 100.0;
    }
    let rs = gain / loss;
    100.0 - (100.0 / (1.0 + rs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MacdSignal {
    Bullish,
    Neutral,
    Bearish,
}

fn ema(values: &[f64], span: usize) -> Vec<f64> {
    let alpha = 2.0 / (span as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &v in &values[1..] {
        prev = alpha * v + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}

fn macd_signal(bars: &[PriceBar]) -> MacdSignal {
    let c = closes(bars);
    if c.len() < 26 {
        return MacdSignal::Neutral;
    }
    let ema12 = ema(&c, 12);
    let ema26 = ema(&c, 26);
    let macd_line: Vec<f64> = ema12.iter().zip(ema26.iter()).map(|(a, b)| a - b).collect();
    let signal_line = ema(&macd_line, 9);
    let macd_last = *macd_line.last().unwrap();
    let signal_last = *signal_line.last().unwrap();
    if macd_last > signal_last {
        MacdSignal::Bullish
    } else if macd_last < signal_last {
        MacdSignal::Bearish
    } else {
        MacdSignal::Neutral
    }
}

fn sma(bars: &[PriceBar], period: usize) -> Option<f64> {
    if bars.len() < period {
        return None;
    }
    let c = closes(bars);
    let tail = &c[c.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

fn vol_score(volatility_pct: f64) -> i32 {
    if (25.0..=35.0).contains(&volatility_pct) {
        25
    } else if (20.0..25.0).contains(&volatility_pct) || (35.0 < volatility_pct && volatility_pct <= 40.0) {
        20
    } else if (15.0..20.0).contains(&volatility_pct) || (40.0 < volatility_pct && volatility_pct <= 50.0) {
        10
    } else {
        5
    }
}

fn liquidity_score(avg_volume: f64) -> i32 {
    if avg_volume >= 2_000_000.0 {
        25
    } else if avg_volume >= 1_000_000.0 {
        20
    } else if avg_volume >= 500_000.0 {
        15
    } else if avg_volume >= 250_000.0 {
        10
    } else {
        5
    }
}

fn price_score(price: f64) -> i32 {
    if (10.0..=200.0).contains(&price) {
        25
    } else if (5.0..10.0).contains(&price) || (200.0 < price && price <= 500.0) {
        15
    } else if (2.0..5.0).contains(&price) {
        10
    } else {
        5
    }
}

fn atr_score(atr_pct: f64) -> i32 {
    if (6.0..=9.0).contains(&atr_pct) {
        25
    } else if (5.0..6.0).contains(&atr_pct) || (9.0 < atr_pct && atr_pct <= 10.0) {
        20
    } else if (4.0..5.0).contains(&atr_pct) || (10.0 < atr_pct && atr_pct <= 12.0) {
        10
    } else {
        5
    }
}

/// Swing-suitability score (0-100): four 25-point bands.
pub fn swing_score(bars: &[PriceBar]) -> i32 {
    let price = bars.last().map(|b| b.close.as_dollars()).unwrap_or(0.0);
    let a = atr(bars, 14);
    let atr_pct = if price > 0.0 { a / price * 100.0 } else { 0.0 };
    vol_score(annualized_volatility_pct(bars))
        + liquidity_score(average_volume(bars))
        + price_score(price)
        + atr_score(atr_pct)
}

fn passes_preset(bars: &[PriceBar], preset: &FilterPreset) -> bool {
    let price = bars.last().map(|b| b.close.as_dollars()).unwrap_or(0.0);
    if price < preset.price_min {
        return false;
    }
    if average_volume(bars) < preset.volume_min {
        return false;
    }
    let r = rsi(bars, 14);
    preset.rsi.0 <= r && r <= preset.rsi.1
}

/// Technical score (0-100): RSI (0-30) + MACD (0-30) + trend (0-40).
pub fn technical_score(bars: &[PriceBar]) -> i32 {
    let mut score = 0;
    let r = rsi(bars, 14);
    score += if (30.0..=70.0).contains(&r) {
        30
    } else if (20.0..30.0).contains(&r) || (70.0 < r && r <= 80.0) {
        20
    } else {
        10
    };

    score += match macd_signal(bars) {
        MacdSignal::Bullish => 30,
        MacdSignal::Neutral => 15,
        MacdSignal::Bearish => 0,
    };

    let current = bars.last().map(|b| b.close.as_dollars()).unwrap_or(0.0);
    let sma20 = sma(bars, 20);
    let sma50 = sma(bars, 50).or(sma20);
    score += match (sma20, sma50) {
        (Some(s20), Some(s50)) if current > s20 && s20 > s50 => 40,
        (Some(s20), _) if current > s20 => 25,
        (_, Some(s50)) if current > s50 => 15,
        _ => 0,
    };

    score.clamp(0, 100)
}

/// Fundamental score (0-100): profitability + valuation + growth + health,
/// each a 25-point band.
pub fn fundamental_score(f: &Fundamentals) -> i32 {
    let mut score = 0;

    score += match f.return_on_equity {
        Some(roe) if roe > 0.15 => 15,
        Some(roe) if roe > 0.10 => 10,
        Some(roe) if roe > 0.05 => 5,
        _ => 0,
    };
    score += match f.profit_margins {
        Some(m) if m > 0.15 => 10,
        Some(m) if m > 0.10 => 6,
        Some(m) if m > 0.05 => 3,
        _ => 0,
    };

    score += match f.trailing_pe {
        Some(pe) if pe > 10.0 && pe < 20.0 => 15,
        Some(pe) if pe > 5.0 && pe < 30.0 => 10,
        Some(pe) if pe > 0.0 => 5,
        _ => 0,
    };
    score += match f.price_to_book {
        Some(pb) if pb < 3.0 => 10,
        Some(pb) if pb < 5.0 => 5,
        _ => 0,
    };

    score += match f.revenue_growth {
        Some(g) if g > 0.10 => 12,
        Some(g) if g > 0.05 => 8,
        Some(g) if g > 0.0 => 4,
        _ => 0,
    };
    score += match f.earnings_growth {
        Some(g) if g > 0.10 => 13,
        Some(g) if g > 0.05 => 8,
        Some(g) if g > 0.0 => 4,
        _ => 0,
    };

    score += match f.debt_to_equity {
        Some(d) if d < 0.5 => 15,
        Some(d) if d < 1.0 => 10,
        Some(d) if d < 2.0 => 5,
        Some(_) => 0,
        None => 5,
    };
    score += match f.current_ratio {
        Some(c) if c > 2.0 => 10,
        Some(c) if c > 1.5 => 7,
        Some(c) if c > 1.0 => 4,
        _ => 0,
    };

    score.clamp(0, 100)
}

/// Stage 1 (swing suitability) then Stage 2 (adaptive technical filters),
/// per §4.6.1.
pub fn select_candidates(seeds: &[ResearchCandidateSeed], target_count: usize) -> Vec<&ResearchCandidateSeed> {
    let mut ranked: Vec<(&ResearchCandidateSeed, i32)> =
        seeds.iter().filter(|s| s.bars.len() >= 20).map(|s| (s, swing_score(&s.bars))).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));

    let top_n = ((ranked.len() as f64 * 0.15) as usize).max(target_count).min(ranked.len());
    let swing_qualified: Vec<&ResearchCandidateSeed> = ranked.into_iter().take(top_n).map(|(s, _)| s).collect();

    let target_min = ((target_count as f64) * 0.8) as usize;
    let target_max = ((target_count as f64) * 1.2) as usize;

    let mut last_pass: Vec<&ResearchCandidateSeed> = Vec::new();
    for (i, preset) in PRESETS.iter().enumerate() {
        let pass: Vec<&ResearchCandidateSeed> =
            swing_qualified.iter().copied().filter(|s| passes_preset(&s.bars, preset)).collect();

        if pass.len() >= target_min && pass.len() <= target_max {
            return pass.into_iter().take(target_count).collect();
        }
        let is_last = i == PRESETS.len() - 1;
        if is_last && pass.len() < target_min {
            tracing::warn!(count = pass.len(), "loosest technical preset still under target, using what was found");
            return pass;
        }
        last_pass = pass;
    }
    last_pass.into_iter().take(target_count).collect()
}

pub fn score_candidate(seed: &ResearchCandidateSeed, context: CandidateContext) -> Candidate {
    let technical = technical_score(&seed.bars) as f64;
    let fundamental = fundamental_score(&seed.fundamentals) as f64;
    let sentiment = seed.sentiment_score.unwrap_or(50.0);
    let composite = 0.4 * technical + 0.4 * fundamental + 0.2 * sentiment;
    let current_price = seed.bars.last().map(|b| b.close).unwrap_or(td_schemas::Micros::ZERO);

    Candidate {
        ticker: seed.ticker.clone(),
        composite_score: composite.clamp(0.0, 100.0),
        technical_score: technical,
        fundamental_score: fundamental,
        sentiment_score: sentiment,
        sector: seed.sector.clone(),
        current_price,
        context,
        risk_metrics: None,
        risk_score: None,
        risk_warnings: Vec::new(),
    }
}

pub struct ResearchRunner;

#[async_trait]
impl StageRunner for ResearchRunner {
    fn stage(&self) -> Stage {
        Stage::Research
    }

    async fn run(&self, input: Value) -> StageResult {
        let parsed: ResearchInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return malformed_input(Stage::Research, e),
        };

        let selected = select_candidates(&parsed.universe, parsed.target_count);
        let candidates: Vec<Candidate> =
            selected.iter().map(|s| score_candidate(s, CandidateContext::BuyCandidate)).collect();

        let count = candidates.len();
        let avg_composite = if count == 0 {
            0.0
        } else {
            candidates.iter().map(|c| c.composite_score).sum::<f64>() / count as f64
        };

        let quality = (count as f64 / parsed.min_required.max(5) as f64 * 50.0 + avg_composite / 100.0 * 50.0)
            .min(100.0)
            .round() as i32;

        if count < parsed.min_required {
            return StageResult::failed(
                Stage::Research,
                format!("only {count} candidates surfaced, below minimum of {}", parsed.min_required),
                quality,
                vec!["insufficient candidate count".to_string()],
            );
        }

        let data = serde_json::json!({ "candidates": candidates });
        StageResult::ok(Stage::Research, data, format!("{count} candidates surfaced"), quality)
    }
}
