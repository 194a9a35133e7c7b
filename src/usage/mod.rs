use crate::{config::PricingConfig, storage::StoreSnapshot};
use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;
const USAGE_STATS_KEY: &str = "usage_stats";

/// Token-usage block as returned by the chat service. Every field is optional; the service
/// omits counters it did not measure. Any JSON number is accepted and kept unclamped here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "lenient_count")]
    pub prompt: Option<i128>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub completion: Option<i128>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total: Option<i128>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub cached_tokens: Option<i128>,
}

impl TokenUsage {
    fn counts(&self) -> UsageCounts {
        UsageCounts {
            prompt: clamp_count(self.prompt),
            completion: clamp_count(self.completion),
            total: clamp_count(self.total),
            cached: clamp_count(self.cached_tokens),
        }
    }
}

/// Floats truncate toward zero and saturate; anything that is not a number reads as absent.
fn lenient_count<'de, D>(deserializer: D) -> std::result::Result<Option<i128>, D::Error>
where
    D: Deserializer<'de>,
{
    let count = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(number)) => number
            .as_i64()
            .map(i128::from)
            .or_else(|| number.as_u64().map(i128::from))
            .or_else(|| number.as_f64().map(|value| value as i128)),
        _ => None,
    };
    Ok(count)
}

/// A usage block that is not an object is dropped instead of failing the whole response.
pub(crate) fn lenient_usage<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<TokenUsage>, D::Error>
where
    D: Deserializer<'de>,
{
    let usage = Option::<Value>::deserialize(deserializer)?
        .and_then(|value| match serde_json::from_value(value) {
            Ok(usage) => Some(usage),
            Err(err) => {
                tracing::warn!(error = %err, "ignoring unreadable usage block");
                None
            }
        });
    Ok(usage)
}

#[derive(Debug, Clone, Copy)]
struct UsageCounts {
    prompt: u64,
    completion: u64,
    total: u64,
    cached: u64,
}

fn clamp_count(value: Option<i128>) -> u64 {
    value.unwrap_or(0).clamp(0, i128::from(u64::MAX)) as u64
}

/// Running totals for one UI instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageStats {
    pub query_count: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    /// Percentage in `[0, 100]`, recomputed from the totals on every record.
    pub cache_hit_rate: f64,
    pub total_cost: f64,
    pub cache_hit_cost: f64,
    pub cache_miss_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRates {
    pub cache_miss_per_1m: f64,
    pub cache_hit_per_1m: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self::from(&PricingConfig::default())
    }
}

impl From<&PricingConfig> for CostRates {
    fn from(pricing: &PricingConfig) -> Self {
        Self {
            cache_miss_per_1m: pricing.cache_miss_per_1m,
            cache_hit_per_1m: pricing.cache_hit_per_1m,
        }
    }
}

/// Cost breakdown for a single response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryCost {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub hit_cost: f64,
    pub miss_cost: f64,
    pub cost: f64,
    /// Only reported when some prompt tokens were served from cache.
    pub savings: Option<f64>,
    /// Share of this query's prompt served from cache, when the prompt was non-empty.
    pub hit_rate: Option<f64>,
}

pub struct UsageAccountant {
    rates: CostRates,
    stats: UsageStats,
}

impl UsageAccountant {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn new(rates: CostRates) -> Self {
        Self::with_stats(rates, UsageStats::default())
    }

    pub fn with_stats(rates: CostRates, stats: UsageStats) -> Self {
        Self { rates, stats }
    }

    pub fn restore(rates: CostRates, snapshot: &StoreSnapshot) -> Self {
        let stats = snapshot.get(USAGE_STATS_KEY).unwrap_or_default();
        Self::with_stats(rates, stats)
    }

    pub fn persist(&self, snapshot: &mut StoreSnapshot) -> Result<()> {
        snapshot.set(USAGE_STATS_KEY, &self.stats)
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }

    pub fn record(&mut self, usage: &TokenUsage) -> QueryCost {
        let counts = usage.counts();
        let miss_tokens = counts.prompt.saturating_sub(counts.cached);

        let hit_cost = counts.cached as f64 / TOKENS_PER_UNIT * self.rates.cache_hit_per_1m;
        let miss_cost = miss_tokens as f64 / TOKENS_PER_UNIT * self.rates.cache_miss_per_1m;
        let cost = hit_cost + miss_cost;

        let stats = &mut self.stats;
        stats.query_count = stats.query_count.saturating_add(1);
        stats.total_prompt_tokens = stats.total_prompt_tokens.saturating_add(counts.prompt);
        stats.total_completion_tokens = stats
            .total_completion_tokens
            .saturating_add(counts.completion);
        stats.total_tokens = stats.total_tokens.saturating_add(counts.total);
        stats.cached_tokens = stats.cached_tokens.saturating_add(counts.cached);
        stats.cache_hit_cost += hit_cost;
        stats.cache_miss_cost += miss_cost;
        stats.total_cost += cost;

        if stats.total_prompt_tokens > 0 {
            stats.cache_hit_rate = (stats.cached_tokens as f64
                / stats.total_prompt_tokens as f64
                * 100.0)
                .min(100.0);
        }

        let savings = (counts.cached > 0).then(|| {
            counts.cached as f64 / TOKENS_PER_UNIT
                * (self.rates.cache_miss_per_1m - self.rates.cache_hit_per_1m)
        });
        let hit_rate = (counts.prompt > 0)
            .then(|| (counts.cached as f64 / counts.prompt as f64 * 100.0).min(100.0));

        tracing::debug!(
            prompt = counts.prompt,
            cached = counts.cached,
            cost,
            total_cost = stats.total_cost,
            "usage recorded"
        );

        QueryCost {
            prompt_tokens: counts.prompt,
            completion_tokens: counts.completion,
            total_tokens: counts.total,
            cached_tokens: counts.cached,
            hit_cost,
            miss_cost,
            cost,
            savings,
            hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(prompt: i64, cached: i64) -> TokenUsage {
        TokenUsage {
            prompt: Some(prompt.into()),
            completion: None,
            total: None,
            cached_tokens: Some(cached.into()),
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn cost_breakdown_matches_published_rates() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        let cost = accountant.record(&usage(1_000_000, 400_000));

        assert!(close(cost.hit_cost, 0.028));
        assert!(close(cost.miss_cost, 0.162));
        assert!(close(cost.cost, 0.19));
        assert!(close(cost.savings.unwrap(), 0.08));
        assert!(close(cost.hit_rate.unwrap(), 40.0));

        let stats = accountant.stats();
        assert_eq!(stats.query_count, 1);
        assert!(close(stats.total_cost, 0.19));
        assert!(close(stats.cache_hit_cost, 0.028));
        assert!(close(stats.cache_miss_cost, 0.162));
    }

    #[test]
    fn zero_usage_only_counts_the_query() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        accountant.record(&usage(100, 50));
        let before = accountant.stats().clone();

        let cost = accountant.record(&TokenUsage {
            prompt: Some(0),
            completion: Some(0),
            total: Some(0),
            cached_tokens: Some(0),
        });

        let after = accountant.stats();
        assert_eq!(after.query_count, before.query_count + 1);
        assert!(close(after.total_cost, before.total_cost));
        assert!(close(after.cache_hit_rate, before.cache_hit_rate));
        assert!(cost.savings.is_none());
        assert!(cost.hit_rate.is_none());
    }

    #[test]
    fn zero_prompt_never_divides() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        accountant.record(&TokenUsage::default());
        assert_eq!(accountant.stats().query_count, 1);
        assert_eq!(accountant.stats().cache_hit_rate, 0.0);
    }

    #[test]
    fn cache_hit_rate_is_recomputed_from_totals() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        accountant.record(&usage(100, 50));
        accountant.record(&usage(100, 50));
        assert!(close(accountant.stats().cache_hit_rate, 50.0));

        accountant.record(&usage(200, 0));
        assert!(close(accountant.stats().cache_hit_rate, 25.0));
    }

    #[test]
    fn negative_and_missing_fields_clamp_to_zero() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        let cost = accountant.record(&TokenUsage {
            prompt: Some(-500),
            completion: None,
            total: Some(-1),
            cached_tokens: Some(-20),
        });

        assert_eq!(cost.prompt_tokens, 0);
        assert_eq!(cost.cached_tokens, 0);
        assert_eq!(cost.cost, 0.0);
        let stats = accountant.stats();
        assert_eq!(stats.total_prompt_tokens, 0);
        assert_eq!(stats.total_tokens, 0);
    }

    #[test]
    fn cached_beyond_prompt_has_no_miss_cost() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        let cost = accountant.record(&usage(100, 150));
        assert_eq!(cost.miss_cost, 0.0);
        assert!(close(cost.hit_cost, 150.0 / 1_000_000.0 * 0.07));
        assert!(close(accountant.stats().cache_hit_rate, 100.0));
    }

    #[test]
    fn stats_survive_snapshot_round_trip() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        accountant.record(&TokenUsage {
            prompt: Some(1_000),
            completion: Some(200),
            total: Some(1_200),
            cached_tokens: Some(600),
        });

        let mut snapshot = StoreSnapshot::default();
        accountant.persist(&mut snapshot).unwrap();

        let restored = UsageAccountant::restore(CostRates::default(), &snapshot);
        assert_eq!(restored.stats(), accountant.stats());
        assert_eq!(restored.stats().total_completion_tokens, 200);
    }

    #[test]
    fn token_usage_decodes_partial_blocks() {
        let parsed: TokenUsage = serde_json::from_str(r#"{"prompt": 12, "cached_tokens": 4}"#).unwrap();
        assert_eq!(parsed.prompt, Some(12));
        assert_eq!(parsed.completion, None);
        assert_eq!(parsed.cached_tokens, Some(4));
    }

    #[test]
    fn token_usage_accepts_any_json_number() {
        let parsed: TokenUsage = serde_json::from_str(
            r#"{"prompt": 100.0, "completion": 1e20, "total": 18446744073709551615, "cached_tokens": "40"}"#,
        )
        .unwrap();
        assert_eq!(parsed.prompt, Some(100));
        assert_eq!(parsed.total, Some(i128::from(u64::MAX)));
        assert_eq!(parsed.cached_tokens, None);

        let counts = parsed.counts();
        assert_eq!(counts.prompt, 100);
        assert_eq!(counts.completion, u64::MAX);
        assert_eq!(counts.cached, 0);
    }

    #[test]
    fn huge_counts_saturate_the_totals() {
        let mut accountant = UsageAccountant::new(CostRates::default());
        let huge: TokenUsage =
            serde_json::from_str(r#"{"prompt": 1e20, "cached_tokens": -3.5}"#).unwrap();
        accountant.record(&huge);
        accountant.record(&huge);

        let stats = accountant.stats();
        assert_eq!(stats.total_prompt_tokens, u64::MAX);
        assert_eq!(stats.cached_tokens, 0);
        assert!(stats.total_cost.is_finite());
    }
}
