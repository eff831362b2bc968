use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::complexity::{ComplexityLevel, ModelTier};

/// Rolling health and performance metrics for one provider. Latency and error
/// rate decay through exponential moving averages so recent behavior
/// dominates.
#[derive(Debug, Clone)]
pub struct ProviderMetrics {
    pub params_b: f64,
    pub health: f64,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub cost_per_mtoken: f64,
    pub requests: u64,
    pub unhealthy_until: Option<DateTime<Utc>>,
}

const LATENCY_ALPHA: f64 = 0.2;
const ERROR_ALPHA: f64 = 0.1;

impl ProviderMetrics {
    fn new(params_b: f64, cost_per_mtoken: f64) -> Self {
        Self {
            params_b,
            health: 1.0,
            avg_latency_ms: 0.0,
            error_rate: 0.0,
            cost_per_mtoken,
            requests: 0,
            unhealthy_until: None,
        }
    }

    pub fn tier(&self) -> ModelTier {
        ModelTier::from_params_b(self.params_b)
    }

    fn observe(&mut self, latency_ms: f64, errored: bool) {
        self.requests += 1;
        if self.requests == 1 {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms =
                LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * self.avg_latency_ms;
        }
        let sample = if errored { 1.0 } else { 0.0 };
        self.error_rate = ERROR_ALPHA * sample + (1.0 - ERROR_ALPHA) * self.error_rate;
    }
}

/// Ranks providers by suitability for a complexity tier. Thread-safe; the
/// dispatcher updates metrics on every response and the health ticker on
/// every probe.
#[derive(Default)]
pub struct ProviderScorer {
    metrics: DashMap<String, ProviderMetrics>,
}

impl ProviderScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_id: &str, params_b: f64, cost_per_mtoken: f64) {
        self.metrics
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderMetrics::new(params_b, cost_per_mtoken));
    }

    /// Records one completed request.
    pub fn record_response(&self, provider_id: &str, latency_ms: f64, errored: bool) {
        if let Some(mut entry) = self.metrics.get_mut(provider_id) {
            entry.observe(latency_ms, errored);
        }
    }

    /// Records a health probe outcome. Probes move the 0-1 health score a
    /// tenth at a time so one flaky probe does not flip routing.
    pub fn record_health_check(&self, provider_id: &str, healthy: bool) {
        if let Some(mut entry) = self.metrics.get_mut(provider_id) {
            if healthy {
                entry.health = (entry.health + 0.1).min(1.0);
            } else {
                entry.health = (entry.health - 0.1).max(0.0);
            }
        }
    }

    /// Takes the provider out of rotation, used on authentication failures.
    pub fn mark_unhealthy(&self, provider_id: &str, duration: Duration) {
        if let Some(mut entry) = self.metrics.get_mut(provider_id) {
            entry.unhealthy_until = Some(Utc::now() + duration);
            warn!(provider = provider_id, until = ?entry.unhealthy_until, "Provider marked unhealthy");
        }
    }

    pub fn is_healthy(&self, provider_id: &str) -> bool {
        match self.metrics.get(provider_id) {
            Some(entry) => match entry.unhealthy_until {
                Some(until) => Utc::now() >= until,
                None => true,
            },
            None => false,
        }
    }

    pub fn metrics_for(&self, provider_id: &str) -> Option<ProviderMetrics> {
        self.metrics.get(provider_id).map(|e| e.clone())
    }

    /// Ranks candidate providers for a complexity level.
    ///
    /// Providers whose tier satisfies the requirement come first, ordered by
    /// score with ties broken toward the smallest sufficient tier (cost
    /// efficiency). Insufficient providers follow, largest tier first, so the
    /// caller degrades to the most capable model available when nothing
    /// qualifies.
    pub fn rank_for_complexity(
        &self,
        provider_ids: &[String],
        complexity: ComplexityLevel,
    ) -> Vec<String> {
        let required = complexity.required_tier();

        let mut known: Vec<(String, ProviderMetrics)> = provider_ids
            .iter()
            .filter_map(|id| self.metrics.get(id).map(|m| (id.clone(), m.clone())))
            .collect();
        if known.is_empty() {
            return Vec::new();
        }

        let max_latency = known
            .iter()
            .map(|(_, m)| m.avg_latency_ms)
            .fold(0.0, f64::max);
        let max_cost = known
            .iter()
            .map(|(_, m)| m.cost_per_mtoken)
            .fold(0.0, f64::max);

        let score = |m: &ProviderMetrics| -> f64 {
            let norm_latency = if max_latency > 0.0 {
                m.avg_latency_ms / max_latency
            } else {
                0.0
            };
            let norm_cost = if max_cost > 0.0 {
                m.cost_per_mtoken / max_cost
            } else {
                0.0
            };
            0.4 * m.health
                + 0.3 * (1.0 - norm_latency)
                + 0.2 * (1.0 - m.error_rate)
                + 0.1 * (1.0 - norm_cost)
        };

        let (mut sufficient, mut insufficient): (Vec<_>, Vec<_>) = known
            .drain(..)
            .partition(|(_, m)| m.tier() >= required);

        // Score descending; equal scores prefer the smallest sufficient tier
        sufficient.sort_by(|(_, a), (_, b)| {
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.tier().cmp(&b.tier()))
        });

        // Fallback ordering: closest to the requirement first
        insufficient.sort_by(|(_, a), (_, b)| {
            b.tier()
                .cmp(&a.tier())
                .then(score(b).partial_cmp(&score(a)).unwrap_or(std::cmp::Ordering::Equal))
        });

        if sufficient.is_empty() {
            debug!(
                complexity = %complexity,
                "No provider satisfies required tier, degrading to largest available"
            );
        }

        sufficient
            .into_iter()
            .chain(insufficient)
            .map(|(id, _)| id)
            .collect()
    }
}
