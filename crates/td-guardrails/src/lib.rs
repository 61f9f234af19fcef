//! Session Guardrails (C4): four gates, all evaluated, all failures
//! aggregated — never short-circuited. Pure function of its inputs; no IO,
//! no clock reads (the caller supplies `now`).

use chrono::{DateTime, Utc};
use td_config::CircuitBreakerThresholds;
use td_schemas::{CircuitBreakerLevel, GuardrailResult, Recommendation};

#[derive(Debug, Clone)]
pub struct GuardrailInputs {
    pub is_trading_day: bool,
    pub session_open: Option<DateTime<Utc>>,
    pub session_close: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,

    pub already_executed_today: bool,
    pub daily_execution_override: bool,

    pub plan_generated_at: Option<DateTime<Utc>>,
    pub plan_freshness_hours: i64,
    pub plan_freshness_override: bool,

    pub daily_pl_pct: f64,
    pub thresholds: CircuitBreakerThresholds,
    /// Token the caller supplied, to be checked against `expected_confirmation`.
    pub confirmation_token: Option<String>,
    /// Built by the caller from the config-driven template (§4.4 ambient
    /// addition); `None` means no override was requested for this gate.
    pub expected_confirmation: Option<String>,
}

/// Derive the circuit breaker level from `daily_pl_pct` (§4.4 rule 4).
pub fn circuit_breaker_level(
    daily_pl_pct: f64,
    thresholds: &CircuitBreakerThresholds,
) -> CircuitBreakerLevel {
    let loss_pct = (-daily_pl_pct).max(0.0);
    if loss_pct >= thresholds.red {
        CircuitBreakerLevel::Red
    } else if loss_pct >= thresholds.orange {
        CircuitBreakerLevel::Orange
    } else if loss_pct >= thresholds.yellow {
        CircuitBreakerLevel::Yellow
    } else {
        CircuitBreakerLevel::Normal
    }
}

/// Evaluate all four gates and aggregate. Returns the result plus the
/// circuit breaker level, since callers (the Coordinator) need the level to
/// distinguish buy-side from sell-side blocking even when the aggregate
/// `can_execute` is true.
pub fn evaluate(inputs: &GuardrailInputs) -> (GuardrailResult, CircuitBreakerLevel) {
    let mut gates_passed = Vec::new();
    let mut gates_failed = Vec::new();
    let mut warnings = Vec::new();
    let mut requires_override = false;

    // Gate 1: market hours.
    let market_hours_ok = inputs.is_trading_day
        && match (inputs.session_open, inputs.session_close) {
            (Some(open), Some(close)) => inputs.now >= open && inputs.now < close,
            _ => false,
        };
    if market_hours_ok {
        gates_passed.push("market_hours".to_string());
    } else {
        gates_failed.push("market_hours".to_string());
    }

    // Gate 2: daily execution limit.
    if !inputs.already_executed_today {
        gates_passed.push("daily_execution_limit".to_string());
    } else if inputs.daily_execution_override {
        gates_passed.push("daily_execution_limit".to_string());
        warnings.push("daily execution limit overridden by operator".to_string());
    } else {
        gates_failed.push("daily_execution_limit".to_string());
        requires_override = true;
    }

    // Gate 3: plan freshness.
    let fresh = inputs
        .plan_generated_at
        .map(|t| (inputs.now - t).num_hours() <= inputs.plan_freshness_hours)
        .unwrap_or(false);
    if fresh {
        gates_passed.push("plan_freshness".to_string());
    } else if inputs.plan_freshness_override {
        gates_passed.push("plan_freshness".to_string());
        warnings.push("stale plan executed under operator override".to_string());
    } else {
        gates_failed.push("plan_freshness".to_string());
        requires_override = true;
    }

    // Gate 4: graduated circuit breaker.
    let level = circuit_breaker_level(inputs.daily_pl_pct, &inputs.thresholds);
    let circuit_breaker_ok = match level {
        CircuitBreakerLevel::Normal => true,
        CircuitBreakerLevel::Yellow => {
            warnings.push("circuit breaker YELLOW: elevated daily loss".to_string());
            true
        }
        CircuitBreakerLevel::Orange => {
            warnings.push("circuit breaker ORANGE: new BUYs blocked, SELLs allowed".to_string());
            requires_override = true;
            true
        }
        CircuitBreakerLevel::Red => {
            requires_override = true;
            match (&inputs.confirmation_token, &inputs.expected_confirmation) {
                (Some(given), Some(expected)) if given == expected => {
                    warnings.push("circuit breaker RED overridden with confirmed token".to_string());
                    true
                }
                _ => false,
            }
        }
    };
    if circuit_breaker_ok {
        gates_passed.push("circuit_breaker".to_string());
    } else {
        gates_failed.push("circuit_breaker".to_string());
    }

    let can_execute = gates_failed.is_empty();

    let recommendation = if can_execute && warnings.is_empty() {
        Recommendation::Clear
    } else if can_execute {
        Recommendation::Caution
    } else if requires_override {
        // Distinguish "would pass if overridden" from "flatly blocked": RED
        // without a valid token is BLOCKED; everything else that only
        // needed an override and didn't get one is OVERRIDE (actionable).
        if gates_failed.contains(&"circuit_breaker".to_string()) && level == CircuitBreakerLevel::Red
        {
            Recommendation::Blocked
        } else {
            Recommendation::Override
        }
    } else {
        Recommendation::Blocked
    };

    (
        GuardrailResult {
            can_execute,
            gates_passed,
            gates_failed,
            warnings,
            requires_override,
            recommendation,
        },
        level,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn base_inputs() -> GuardrailInputs {
        let now = Utc::now();
        GuardrailInputs {
            is_trading_day: true,
            session_open: Some(now - Duration::hours(1)),
            session_close: Some(now + Duration::hours(1)),
            now,
            already_executed_today: false,
            daily_execution_override: false,
            plan_generated_at: Some(now - Duration::minutes(30)),
            plan_freshness_hours: 4,
            plan_freshness_override: false,
            daily_pl_pct: 0.0,
            thresholds: CircuitBreakerThresholds::default(),
            confirmation_token: None,
            expected_confirmation: None,
        }
    }

    #[test]
    fn all_gates_pass_is_clear() {
        let (result, level) = evaluate(&base_inputs());
        assert!(result.can_execute);
        assert_eq!(level, CircuitBreakerLevel::Normal);
        assert!(matches!(result.recommendation, Recommendation::Clear));
    }

    #[test]
    fn outside_market_hours_blocks() {
        let mut inputs = base_inputs();
        inputs.is_trading_day = false;
        let (result, _) = evaluate(&inputs);
        assert!(!result.can_execute);
        assert!(result.gates_failed.contains(&"market_hours".to_string()));
    }

    #[test]
    fn second_execution_same_day_requires_override() {
        let mut inputs = base_inputs();
        inputs.already_executed_today = true;
        let (result, _) = evaluate(&inputs);
        assert!(!result.can_execute);
        assert!(result.requires_override);

        inputs.daily_execution_override = true;
        let (result, _) = evaluate(&inputs);
        assert!(result.can_execute);
    }

    #[test]
    fn orange_blocks_buys_but_can_execute_stays_true() {
        let mut inputs = base_inputs();
        inputs.daily_pl_pct = -12.0;
        let (result, level) = evaluate(&inputs);
        assert_eq!(level, CircuitBreakerLevel::Orange);
        assert!(result.can_execute);
        assert!(!level.allows_new_buys());
    }

    #[test]
    fn red_without_confirmation_is_blocked() {
        let mut inputs = base_inputs();
        inputs.daily_pl_pct = -20.0;
        let (result, level) = evaluate(&inputs);
        assert_eq!(level, CircuitBreakerLevel::Red);
        assert!(!result.can_execute);
        assert!(matches!(result.recommendation, Recommendation::Blocked));
    }

    #[test]
    fn red_with_matching_confirmation_token_executes() {
        let mut inputs = base_inputs();
        inputs.daily_pl_pct = -20.0;
        inputs.expected_confirmation = Some("OVERRIDE 2026-07-28 LOSS 20.0".to_string());
        inputs.confirmation_token = Some("OVERRIDE 2026-07-28 LOSS 20.0".to_string());
        let (result, _) = evaluate(&inputs);
        assert!(result.can_execute);
    }

    /// Deeper losses never produce a less severe level, and `allows_new_buys`
    /// never flips back on as losses worsen.
    #[test]
    fn circuit_breaker_level_is_monotonic_in_daily_loss() {
        let thresholds = CircuitBreakerThresholds::default();
        let loss_pcts = [0.0, 2.0, 5.0, 7.0, 10.0, 12.0, 15.0, 25.0];
        let levels: Vec<CircuitBreakerLevel> =
            loss_pcts.iter().map(|pct| circuit_breaker_level(-pct, &thresholds)).collect();

        for pair in levels.windows(2) {
            assert!(pair[1] >= pair[0], "level regressed from {:?} to {:?}", pair[0], pair[1]);
            if pair[1] > pair[0] {
                assert!(
                    !pair[1].allows_new_buys() || pair[0].allows_new_buys(),
                    "allows_new_buys flipped back on going from {:?} to {:?}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }
}
