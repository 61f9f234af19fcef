//! Risk (§4.6.2, advisory). Enriches candidates with stop/target/position
//! sizing and a swing-trade-suitability score. Never removes a candidate —
//! downstream stages decide what to do with `risk_score`/`risk_warnings`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use td_schemas::{Candidate, Micros, RiskMetrics, Shares, Stage, StageResult};

use crate::research::{annualized_volatility_pct, atr};
use crate::{malformed_input, StageRunner};

#[derive(Debug, Deserialize, Serialize)]
pub struct RiskCandidateInput {
    pub candidate: Candidate,
    /// Ascending by date, oldest first; same series Research used.
    pub bars: Vec<td_schemas::PriceBar>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RiskInput {
    pub candidates: Vec<RiskCandidateInput>,
    pub available_capital: f64,
}

const ATR_MULTIPLIER: f64 = 2.0;
const POSITION_SIZE_PCT: f64 = 0.10;

fn vol_score(volatility_pct: f64) -> i32 {
    if (25.0..=35.0).contains(&volatility_pct) {
        25
    } else if (20.0..25.0).contains(&volatility_pct) || (35.0 < volatility_pct && volatility_pct <= 40.0) {
        20
    } else if (15.0..20.0).contains(&volatility_pct) || (40.0 < volatility_pct && volatility_pct <= 50.0) {
        10
    } else if (10.0..15.0).contains(&volatility_pct) || (50.0 < volatility_pct && volatility_pct <= 60.0) {
        5
    } else {
        0
    }
}

fn rr_score(rr: f64) -> i32 {
    if rr >= 3.0 {
        25
    } else if rr >= 2.5 {
        20
    } else if rr >= 2.0 {
        15
    } else if rr >= 1.5 {
        10
    } else {
        0
    }
}

fn stop_distance_score(stop_distance_pct: f64) -> i32 {
    if (6.0..=9.0).contains(&stop_distance_pct) {
        25
    } else if (5.0..6.0).contains(&stop_distance_pct) || (9.0 < stop_distance_pct && stop_distance_pct <= 10.0) {
        20
    } else if (4.0..5.0).contains(&stop_distance_pct) || (10.0 < stop_distance_pct && stop_distance_pct <= 12.0) {
        15
    } else if (3.0..4.0).contains(&stop_distance_pct) || (12.0 < stop_distance_pct && stop_distance_pct <= 15.0) {
        10
    } else {
        5
    }
}

fn position_risk_score(total_risk_pct: f64) -> i32 {
    if total_risk_pct <= 0.75 {
        25
    } else if total_risk_pct <= 1.0 {
        20
    } else if total_risk_pct <= 1.5 {
        15
    } else if total_risk_pct <= 2.0 {
        10
    } else {
        5
    }
}

/// Computes stop/target/sizing and the 0-100 suitability score for one
/// candidate's price history, per §4.6.2.
pub fn assess(bars: &[td_schemas::PriceBar], available_capital: f64) -> RiskMetrics {
    let entry_price = bars.last().map(|b| b.close.as_dollars()).unwrap_or(0.0);
    let atr_value = atr(bars, 14);
    let stop_loss = entry_price - atr_value * ATR_MULTIPLIER;
    let risk_per_share = (entry_price - stop_loss).max(0.0);
    let reward_per_share = risk_per_share * 2.0;
    let target_price = entry_price + reward_per_share;

    let position_size_value = available_capital * POSITION_SIZE_PCT;
    let position_size_shares = if entry_price > 0.0 { (position_size_value / entry_price).floor() } else { 0.0 };

    let total_risk_dollars = position_size_shares * risk_per_share;
    let total_risk_pct = if available_capital > 0.0 { total_risk_dollars / available_capital * 100.0 } else { 0.0 };

    let volatility_pct = annualized_volatility_pct(bars);
    let risk_reward_ratio = if risk_per_share > 0.0 { reward_per_share / risk_per_share } else { 0.0 };
    let stop_distance_pct = if entry_price > 0.0 { (entry_price - stop_loss) / entry_price * 100.0 } else { 0.0 };

    let risk_score = (vol_score(volatility_pct)
        + rr_score(risk_reward_ratio)
        + stop_distance_score(stop_distance_pct)
        + position_risk_score(total_risk_pct))
    .clamp(0, 100);

    let mut warnings = Vec::new();
    if stop_distance_pct < 3.0 {
        warnings.push(format!("stop distance {stop_distance_pct:.1}% is too tight — death by a thousand cuts"));
    }
    if risk_reward_ratio < 1.5 {
        warnings.push(format!("poor risk/reward ({risk_reward_ratio:.2}:1), below the 1.5:1 floor"));
    }
    if total_risk_pct > 2.0 {
        warnings.push(format!("position risk {total_risk_pct:.2}% of capital is excessive"));
    }

    RiskMetrics {
        entry_price: Micros::from_dollars(entry_price),
        stop_loss: Micros::from_dollars(stop_loss),
        target_price: Micros::from_dollars(target_price),
        atr: Micros::from_dollars(atr_value),
        volatility_pct,
        risk_reward_ratio,
        position_size_shares: Shares::from_f64(position_size_shares),
        position_size_value: Micros::from_dollars(position_size_value),
        total_risk_dollars: Micros::from_dollars(total_risk_dollars),
        total_risk_pct,
        risk_score,
        warnings,
    }
}

pub struct RiskRunner;

#[async_trait]
impl StageRunner for RiskRunner {
    fn stage(&self) -> Stage {
        Stage::Risk
    }

    async fn run(&self, input: Value) -> StageResult {
        let parsed: RiskInput = match serde_json::from_value(input) {
            Ok(v) => v,
            Err(e) => return malformed_input(Stage::Risk, e),
        };

        if parsed.candidates.is_empty() {
            return StageResult::failed(Stage::Risk, "no candidates to assess", 0, vec!["empty candidate list".to_string()]);
        }

        let mut enriched = Vec::with_capacity(parsed.candidates.len());
        for item in parsed.candidates {
            let metrics = assess(&item.bars, parsed.available_capital);
            let mut candidate = item.candidate;
            candidate.risk_score = Some(metrics.risk_score);
            candidate.risk_warnings = metrics.warnings.clone();
            candidate.risk_metrics = Some(metrics);
            enriched.push(candidate);
        }

        let avg_risk_score =
            enriched.iter().filter_map(|c| c.risk_score).map(|s| s as f64).sum::<f64>() / enriched.len() as f64;
        let avg_rr = enriched
            .iter()
            .filter_map(|c| c.risk_metrics.as_ref())
            .map(|m| m.risk_reward_ratio)
            .sum::<f64>()
            / enriched.len() as f64;

        let quality = (avg_risk_score / 100.0 * 50.0 + (avg_rr / 3.0).min(1.0) * 50.0).round() as i32;

        let data = serde_json::json!({ "candidates": enriched });
        StageResult::ok(Stage::Risk, data, format!("{} candidates risk-assessed", enriched.len()), quality)
    }
}
