use serde::{Deserialize, Serialize};

/// Typed view over the recognized configuration keys of §6.5. Unknown keys in
/// a loaded document are reported separately (see `report_unused_keys`), not
/// silently dropped or silently accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_positions: i64,
    pub min_positions: i64,
    pub target_position_count: i64,
    pub target_invested_ratio: f64,
    pub max_position_pct: f64,
    pub min_trade_dollar_threshold: f64,
    pub cache_ttl_hours: i64,
    pub plan_freshness_hours: i64,
    pub circuit_breaker: CircuitBreakerThresholds,
    pub provider_timeouts: ProviderTimeouts,
    pub concurrency: ConcurrencySettings,
    pub time_zone: String,
    pub arming: ArmingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_positions: 20,
            min_positions: 10,
            target_position_count: 20,
            target_invested_ratio: 0.90,
            max_position_pct: 0.10,
            min_trade_dollar_threshold: 25.0,
            cache_ttl_hours: 16,
            plan_freshness_hours: 4,
            circuit_breaker: CircuitBreakerThresholds::default(),
            provider_timeouts: ProviderTimeouts::default(),
            concurrency: ConcurrencySettings::default(),
            time_zone: "America/New_York".to_string(),
            arming: ArmingSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerThresholds {
    pub yellow: f64,
    pub orange: f64,
    pub red: f64,
}

impl Default for CircuitBreakerThresholds {
    fn default() -> Self {
        CircuitBreakerThresholds {
            yellow: 5.0,
            orange: 10.0,
            red: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTimeouts {
    pub broker: u64,
    pub market_data: u64,
    pub sentiment: u64,
    pub llm_fast: u64,
    pub llm_deep: u64,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        ProviderTimeouts {
            broker: 30,
            market_data: 30,
            sentiment: 30,
            llm_fast: 45,
            llm_deep: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub per_stage_fanout: usize,
    pub sentiment_batch_size: usize,
    pub sentiment_batch_delay_s: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        ConcurrencySettings {
            per_stage_fanout: 5,
            sentiment_batch_size: 5,
            sentiment_batch_delay_s: 5,
        }
    }
}

/// Manual-confirmation policy for high-risk transitions (RED-level circuit
/// breaker override, live execution). Mirrors §4.4's "explicit confirmation".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmingSettings {
    pub require_manual_confirmation: bool,
    pub confirmation_format: String,
}

impl Default for ArmingSettings {
    fn default() -> Self {
        ArmingSettings {
            require_manual_confirmation: true,
            confirmation_format: "OVERRIDE {date} LOSS {loss_pct}".to_string(),
        }
    }
}
