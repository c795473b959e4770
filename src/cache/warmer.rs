//! Cache Warmer
//!
//! Pre-populates the tiers from the backing store, at startup and on the
//! scheduler's warming interval.
//!
//! - **Proactive**: the top-N keys by access count.
//! - **Predictive**: keys whose estimated probability of being read within
//!   the horizon is above a threshold. The estimate treats reads as a Poisson
//!   process with the key's observed rate, `p = 1 - exp(-rate * horizon)`,
//!   scaled down by how long ago the key was last read (half-life decay).

use crate::cache::coordinator::Coordinator;
use crate::cache::events::CacheEvent;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Warmer Configuration
// =============================================================================

/// Settings for the predictive mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Minimum score for a key to be warmed (0.0 to 1.0)
    pub threshold: f64,
    /// Window the access probability is estimated for
    pub horizon_secs: u64,
    /// Time for an idle key's score to halve
    pub half_life_secs: u64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            horizon_secs: 300,
            half_life_secs: 600,
        }
    }
}

/// Configuration for the warmer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
    pub enabled: bool,
    /// Seconds between scheduled passes
    pub interval_secs: u64,
    /// Keys warmed per pass
    pub top_n: usize,
    /// Seed from the backing store's popular keys at startup
    pub warm_on_startup: bool,
    /// Maximum concurrent loads
    pub max_concurrent: usize,
    /// Keys the access tracker remembers
    pub max_tracked_keys: usize,
    /// Switches from proactive to predictive selection when set
    pub predictive: Option<PredictiveConfig>,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            top_n: 100,
            warm_on_startup: true,
            max_concurrent: 8,
            max_tracked_keys: 10_000,
            predictive: None,
        }
    }
}

impl WarmerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// =============================================================================
// Access Tracker
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct AccessStats {
    count: u64,
    first_seen: Instant,
    last_seen: Instant,
}

/// Read frequency and recency per logical key
#[derive(Debug)]
pub struct AccessTracker {
    stats: DashMap<String, AccessStats>,
    max_keys: usize,
}

impl AccessTracker {
    pub fn new(max_keys: usize) -> Self {
        Self {
            stats: DashMap::new(),
            max_keys: max_keys.max(1),
        }
    }

    /// Record one read
    pub fn record(&self, key: &str) {
        self.record_at(key, Instant::now());
    }

    fn record_at(&self, key: &str, now: Instant) {
        self.stats
            .entry(key.to_string())
            .and_modify(|s| {
                s.count += 1;
                s.last_seen = now;
            })
            .or_insert(AccessStats {
                count: 1,
                first_seen: now,
                last_seen: now,
            });

        if self.stats.len() > self.max_keys + self.max_keys / 10 {
            self.prune();
        }
    }

    /// Forget the least recently read keys down to the limit
    fn prune(&self) {
        let mut by_recency: Vec<(String, Instant)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen))
            .collect();
        if by_recency.len() <= self.max_keys {
            return;
        }
        by_recency.sort_by_key(|(_, last)| *last);
        let excess = by_recency.len() - self.max_keys;
        for (key, _) in by_recency.into_iter().take(excess) {
            self.stats.remove(&key);
        }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Reads recorded for a key
    pub fn count(&self, key: &str) -> u64 {
        self.stats.get(key).map(|s| s.count).unwrap_or(0)
    }

    /// Most frequently read keys, ties broken by most recent read
    pub fn top_n(&self, n: usize) -> Vec<String> {
        let mut ranked: Vec<(String, AccessStats)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.count
                .cmp(&a.1.count)
                .then_with(|| b.1.last_seen.cmp(&a.1.last_seen))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.into_iter().take(n).map(|(k, _)| k).collect()
    }

    /// Estimated probability that a key is read within the horizon
    pub fn score(&self, key: &str, config: &PredictiveConfig) -> f64 {
        self.stats
            .get(key)
            .map(|s| access_likelihood(&s, Instant::now(), config))
            .unwrap_or(0.0)
    }

    /// Keys scoring at least the threshold, best first
    pub fn predicted(&self, config: &PredictiveConfig, limit: usize) -> Vec<String> {
        self.predicted_at(config, limit, Instant::now())
    }

    fn predicted_at(&self, config: &PredictiveConfig, limit: usize, now: Instant) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), access_likelihood(e.value(), now, config)))
            .filter(|(_, score)| *score >= config.threshold)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.into_iter().take(limit).map(|(k, _)| k).collect()
    }
}

fn access_likelihood(stats: &AccessStats, now: Instant, config: &PredictiveConfig) -> f64 {
    let observed = now.duration_since(stats.first_seen).as_secs_f64().max(1.0);
    let rate = stats.count as f64 / observed;
    let probability = 1.0 - (-rate * config.horizon_secs as f64).exp();

    let idle = now.duration_since(stats.last_seen).as_secs_f64();
    let half_life = (config.half_life_secs as f64).max(1.0);
    let decay = 0.5_f64.powf(idle / half_life);

    probability * decay
}

// =============================================================================
// Cache Warmer
// =============================================================================

/// Outcome of a warming pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    pub keys_requested: usize,
    pub keys_loaded: usize,
    /// Keys already cached or absent from the backing store
    pub keys_skipped: usize,
    pub keys_failed: usize,
    pub bytes_loaded: u64,
}

/// Loads selected keys through the coordinator's read path
pub struct CacheWarmer {
    config: WarmerConfig,
    coordinator: Arc<Coordinator>,
}

impl CacheWarmer {
    pub fn new(config: WarmerConfig, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    pub fn config(&self) -> &WarmerConfig {
        &self.config
    }

    /// Keys the next pass would warm
    pub fn candidates(&self) -> Vec<String> {
        let tracker = self.coordinator.access_tracker();
        match &self.config.predictive {
            Some(predictive) => tracker.predicted(predictive, self.config.top_n),
            None => tracker.top_n(self.config.top_n),
        }
    }

    /// One scheduled pass
    pub async fn run_once(&self) -> WarmReport {
        if !self.config.enabled {
            return WarmReport::default();
        }
        let keys = self.candidates();
        self.warm(keys).await
    }

    /// Startup pass seeded from the backing store
    pub async fn warm_startup(&self) -> WarmReport {
        if !self.config.enabled || !self.config.warm_on_startup {
            return WarmReport::default();
        }
        let mut keys: BTreeSet<String> = self.candidates().into_iter().collect();
        match self
            .coordinator
            .backing_store()
            .popular_keys(self.config.top_n)
            .await
        {
            Ok(popular) => keys.extend(popular),
            Err(e) => warn!(error = %e, "Could not list popular keys for startup warming"),
        }
        let keys: Vec<String> = keys.into_iter().take(self.config.top_n).collect();
        let report = self.warm(keys).await;
        info!(
            requested = report.keys_requested,
            loaded = report.keys_loaded,
            bytes = report.bytes_loaded,
            "Startup warming finished"
        );
        report
    }

    /// Load the given logical keys into the tiers
    pub async fn warm(&self, keys: Vec<String>) -> WarmReport {
        let mut report = WarmReport {
            keys_requested: keys.len(),
            ..Default::default()
        };
        if keys.is_empty() {
            return report;
        }

        let coordinator = &self.coordinator;
        let mut results = stream::iter(keys)
            .map(|key| async move {
                let result = coordinator.warm_key(&key).await;
                (key, result)
            })
            .buffer_unordered(self.config.max_concurrent.max(1));

        while let Some((key, result)) = results.next().await {
            match result {
                Ok(Some(bytes)) => {
                    report.keys_loaded += 1;
                    report.bytes_loaded += bytes;
                }
                Ok(None) => report.keys_skipped += 1,
                Err(e) => {
                    report.keys_failed += 1;
                    debug!(key = %key, error = %e, "Warming load failed");
                }
            }
        }

        coordinator
            .metrics()
            .coordinator
            .warmed_keys
            .fetch_add(report.keys_loaded as u64, Ordering::Relaxed);
        coordinator.events().publish(CacheEvent::WarmingComplete {
            keys_requested: report.keys_requested,
            keys_loaded: report.keys_loaded,
            bytes_loaded: report.bytes_loaded,
        });
        if report.keys_failed > 0 {
            warn!(failed = report.keys_failed, "Some keys could not be warmed");
        }
        report
    }
}
