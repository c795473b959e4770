//! Cache Metrics
//!
//! Cache-line aligned counters for high-performance concurrent access, a
//! fixed-bucket latency histogram per tier, and Prometheus text rendering
//! for the ops endpoint.

use crate::cache::tier::TierKind;
use crate::error::{Error, Result};
use chrono::Utc;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// =============================================================================
// Cache Line Size
// =============================================================================

/// Cache line size for alignment (64 bytes on most modern CPUs)
pub const CACHE_LINE_SIZE: usize = 64;

/// Upper bounds of the latency buckets in microseconds; the last bucket is open
pub const LATENCY_BUCKETS_US: [u64; 14] = [
    10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000,
];

// =============================================================================
// Per-Tier Counters (Cache-Line Aligned)
// =============================================================================

/// Request counters for one tier, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct TierCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    /// Frames that failed to decode (served as a miss)
    pub codec_failures: AtomicU64,
    /// Sets dropped because the entry can never fit
    pub rejected: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<TierCounters>() <= CACHE_LINE_SIZE);

/// Current occupancy of one tier
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct Occupancy {
    pub entries: AtomicU64,
    pub bytes: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

// =============================================================================
// Latency Histogram
// =============================================================================

/// Lock-free fixed-bucket latency histogram
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_US.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    #[inline]
    pub fn record(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let idx = LATENCY_BUCKETS_US
            .iter()
            .position(|&bound| us <= bound)
            .unwrap_or(LATENCY_BUCKETS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let count: u64 = counts.iter().sum();
        let max_us = self.max_us.load(Ordering::Relaxed);
        let avg_us = if count == 0 {
            0.0
        } else {
            self.sum_us.load(Ordering::Relaxed) as f64 / count as f64
        };

        LatencySnapshot {
            count,
            avg_us,
            p50_us: percentile(&counts, count, 0.50, max_us),
            p95_us: percentile(&counts, count, 0.95, max_us),
            p99_us: percentile(&counts, count, 0.99, max_us),
            max_us,
        }
    }
}

/// Upper bound of the bucket holding the q-th observation, capped by the max
fn percentile(counts: &[u64], total: u64, q: f64, max_us: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    let rank = ((total as f64) * q).ceil().max(1.0) as u64;
    let mut seen = 0;
    for (idx, count) in counts.iter().enumerate() {
        seen += count;
        if seen >= rank {
            let bound = LATENCY_BUCKETS_US.get(idx).copied().unwrap_or(max_us);
            return bound.min(max_us);
        }
    }
    max_us
}

/// Point-in-time latency summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub avg_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

// =============================================================================
// Tier Metrics
// =============================================================================

/// Everything recorded for one tier
#[derive(Debug, Default)]
pub struct TierMetrics {
    pub counters: TierCounters,
    pub occupancy: Occupancy,
    pub latency: LatencyHistogram,
}

impl TierMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_set(&self) {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_delete(&self) {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_evictions(&self, count: usize) {
        self.counters
            .evictions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_expirations(&self, count: usize) {
        self.counters
            .expirations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_codec_failure(&self) {
        self.counters.codec_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed);
    }

    /// Publish the tier's current size
    #[inline]
    pub fn set_occupancy(&self, entries: u64, bytes: u64) {
        self.occupancy.entries.store(entries, Ordering::Relaxed);
        self.occupancy.bytes.store(bytes, Ordering::Relaxed);
        self.occupancy
            .last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    /// Calculate hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let total = hits + self.counters.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self, tier: TierKind) -> TierMetricsSnapshot {
        let c = &self.counters;
        TierMetricsSnapshot {
            tier,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            sets: c.sets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            codec_failures: c.codec_failures.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            entries: self.occupancy.entries.load(Ordering::Relaxed),
            bytes: self.occupancy.bytes.load(Ordering::Relaxed),
            latency: self.latency.snapshot(),
        }
    }
}

/// Point-in-time snapshot of tier metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierMetricsSnapshot {
    pub tier: TierKind,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub codec_failures: u64,
    pub rejected: u64,
    pub entries: u64,
    pub bytes: u64,
    pub latency: LatencySnapshot,
}

impl TierMetricsSnapshot {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Engine Counters
// =============================================================================

/// Read/write path counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CoordinatorCounters {
    /// Backing-store loads actually issued
    pub loads: AtomicU64,
    /// Loads that failed after retries
    pub load_failures: AtomicU64,
    /// Individual backing-store attempts that hit the timeout
    pub load_timeouts: AtomicU64,
    /// Callers that joined an in-flight load instead of issuing one
    pub collapsed_loads: AtomicU64,
    /// Background refreshes started
    pub refreshes: AtomicU64,
    /// Synchronous backing-store writes
    pub store_writes: AtomicU64,
    /// Keys loaded by the warmer
    pub warmed_keys: AtomicU64,
}

/// Invalidation engine counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct InvalidationCounters {
    pub invalidations: AtomicU64,
    pub keys_invalidated: AtomicU64,
    pub generation_bumps: AtomicU64,
    pub dependency_cascades: AtomicU64,
    pub swept: AtomicU64,
    pub propagation_failures: AtomicU64,
}

/// Write-behind queue counters
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WriteBehindCounters {
    pub enqueued: AtomicU64,
    pub applied: AtomicU64,
    pub failed: AtomicU64,
    pub saturated: AtomicU64,
    /// Operations queued or in flight
    pub depth: AtomicU64,
}

// =============================================================================
// Shard Distribution
// =============================================================================

/// Key distribution of one distributed node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardStats {
    pub node_id: String,
    pub entries: u64,
    pub bytes: u64,
    /// False if the node could not be queried
    pub reachable: bool,
}

// =============================================================================
// Global Cache Metrics
// =============================================================================

/// Metrics shared by every engine component
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub local: TierMetrics,
    pub distributed: TierMetrics,
    pub coordinator: CoordinatorCounters,
    pub invalidation: InvalidationCounters,
    pub write_behind: WriteBehindCounters,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get metrics for a specific tier
    pub fn tier(&self, tier: TierKind) -> &TierMetrics {
        match tier {
            TierKind::Local => &self.local,
            TierKind::Distributed => &self.distributed,
        }
    }

    /// Create a snapshot of all metrics
    ///
    /// Shard distribution is queried from the nodes and attached by the engine.
    pub fn snapshot(&self) -> StatsSnapshot {
        let co = &self.coordinator;
        let inv = &self.invalidation;
        let wb = &self.write_behind;
        StatsSnapshot {
            local: self.local.snapshot(TierKind::Local),
            distributed: self.distributed.snapshot(TierKind::Distributed),
            engine: EngineSnapshot {
                loads: co.loads.load(Ordering::Relaxed),
                load_failures: co.load_failures.load(Ordering::Relaxed),
                load_timeouts: co.load_timeouts.load(Ordering::Relaxed),
                collapsed_loads: co.collapsed_loads.load(Ordering::Relaxed),
                refreshes: co.refreshes.load(Ordering::Relaxed),
                store_writes: co.store_writes.load(Ordering::Relaxed),
                warmed_keys: co.warmed_keys.load(Ordering::Relaxed),
                invalidations: inv.invalidations.load(Ordering::Relaxed),
                keys_invalidated: inv.keys_invalidated.load(Ordering::Relaxed),
                generation_bumps: inv.generation_bumps.load(Ordering::Relaxed),
                dependency_cascades: inv.dependency_cascades.load(Ordering::Relaxed),
                swept: inv.swept.load(Ordering::Relaxed),
                propagation_failures: inv.propagation_failures.load(Ordering::Relaxed),
                write_behind_enqueued: wb.enqueued.load(Ordering::Relaxed),
                write_behind_applied: wb.applied.load(Ordering::Relaxed),
                write_behind_failed: wb.failed.load(Ordering::Relaxed),
                write_behind_saturated: wb.saturated.load(Ordering::Relaxed),
                write_behind_depth: wb.depth.load(Ordering::Relaxed),
            },
            shards: Vec::new(),
        }
    }
}

/// Engine-wide counter snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub loads: u64,
    pub load_failures: u64,
    pub load_timeouts: u64,
    pub collapsed_loads: u64,
    pub refreshes: u64,
    pub store_writes: u64,
    pub warmed_keys: u64,
    pub invalidations: u64,
    pub keys_invalidated: u64,
    pub generation_bumps: u64,
    pub dependency_cascades: u64,
    pub swept: u64,
    pub propagation_failures: u64,
    pub write_behind_enqueued: u64,
    pub write_behind_applied: u64,
    pub write_behind_failed: u64,
    pub write_behind_saturated: u64,
    pub write_behind_depth: u64,
}

/// Aggregate statistics served by `/stats` and `/metrics`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub local: TierMetricsSnapshot,
    pub distributed: TierMetricsSnapshot,
    pub engine: EngineSnapshot,
    pub shards: Vec<ShardStats>,
}

impl StatsSnapshot {
    /// Overall hit ratio (a lookup hits if any tier hits)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.local.hits + self.distributed.hits;
        // Local misses cascade into the distributed tier
        let total = hits + self.distributed.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Render in the Prometheus text exposition format
    pub fn render_prometheus(&self) -> Result<String> {
        let registry = Registry::new_custom(Some("risk_cache".to_string()), None)
            .map_err(prom_err)?;

        let requests = IntCounterVec::new(
            Opts::new("tier_requests_total", "Lookups per tier by result"),
            &["tier", "result"],
        )
        .map_err(prom_err)?;
        let removals = IntCounterVec::new(
            Opts::new("tier_removals_total", "Entries removed per tier by reason"),
            &["tier", "reason"],
        )
        .map_err(prom_err)?;
        let sets = IntCounterVec::new(
            Opts::new("tier_sets_total", "Sets per tier by outcome"),
            &["tier", "outcome"],
        )
        .map_err(prom_err)?;
        let size = IntGaugeVec::new(
            Opts::new("tier_size", "Current size per tier"),
            &["tier", "unit"],
        )
        .map_err(prom_err)?;
        let latency = IntGaugeVec::new(
            Opts::new("tier_latency_microseconds", "Lookup latency per tier"),
            &["tier", "quantile"],
        )
        .map_err(prom_err)?;
        let engine = IntCounterVec::new(
            Opts::new("engine_events_total", "Engine-wide event counters"),
            &["event"],
        )
        .map_err(prom_err)?;
        let queue_depth = IntGauge::new("write_behind_queue_depth", "Write-behind operations pending")
            .map_err(prom_err)?;
        let shard_keys = IntGaugeVec::new(
            Opts::new("shard_keys", "Keys held per distributed node"),
            &["node"],
        )
        .map_err(prom_err)?;

        for tier in [&self.local, &self.distributed] {
            let label = tier.tier.label();
            requests.with_label_values(&[label, "hit"]).inc_by(tier.hits);
            requests.with_label_values(&[label, "miss"]).inc_by(tier.misses);
            removals.with_label_values(&[label, "delete"]).inc_by(tier.deletes);
            removals.with_label_values(&[label, "eviction"]).inc_by(tier.evictions);
            removals.with_label_values(&[label, "expiration"]).inc_by(tier.expirations);
            removals.with_label_values(&[label, "corrupt"]).inc_by(tier.codec_failures);
            sets.with_label_values(&[label, "stored"]).inc_by(tier.sets);
            sets.with_label_values(&[label, "rejected"]).inc_by(tier.rejected);
            size.with_label_values(&[label, "entries"]).set(tier.entries as i64);
            size.with_label_values(&[label, "bytes"]).set(tier.bytes as i64);
            latency.with_label_values(&[label, "avg"]).set(tier.latency.avg_us as i64);
            latency.with_label_values(&[label, "0.5"]).set(tier.latency.p50_us as i64);
            latency.with_label_values(&[label, "0.95"]).set(tier.latency.p95_us as i64);
            latency.with_label_values(&[label, "0.99"]).set(tier.latency.p99_us as i64);
        }

        let e = &self.engine;
        for (event, value) in [
            ("backing_load", e.loads),
            ("backing_load_failure", e.load_failures),
            ("backing_load_timeout", e.load_timeouts),
            ("collapsed_load", e.collapsed_loads),
            ("refresh_ahead", e.refreshes),
            ("backing_store_write", e.store_writes),
            ("warmed_key", e.warmed_keys),
            ("invalidation", e.invalidations),
            ("key_invalidated", e.keys_invalidated),
            ("generation_bump", e.generation_bumps),
            ("dependency_cascade", e.dependency_cascades),
            ("ttl_sweep_removal", e.swept),
            ("propagation_failure", e.propagation_failures),
            ("write_behind_enqueued", e.write_behind_enqueued),
            ("write_behind_applied", e.write_behind_applied),
            ("write_behind_failed", e.write_behind_failed),
            ("write_behind_saturated", e.write_behind_saturated),
        ] {
            engine.with_label_values(&[event]).inc_by(value);
        }
        queue_depth.set(e.write_behind_depth as i64);

        for shard in &self.shards {
            shard_keys
                .with_label_values(&[shard.node_id.as_str()])
                .set(shard.entries as i64);
        }

        registry.register(Box::new(requests)).map_err(prom_err)?;
        registry.register(Box::new(removals)).map_err(prom_err)?;
        registry.register(Box::new(sets)).map_err(prom_err)?;
        registry.register(Box::new(size)).map_err(prom_err)?;
        registry.register(Box::new(latency)).map_err(prom_err)?;
        registry.register(Box::new(engine)).map_err(prom_err)?;
        registry.register(Box::new(queue_depth)).map_err(prom_err)?;
        registry.register(Box::new(shard_keys)).map_err(prom_err)?;

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }
}

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("Prometheus encoding failed: {}", e))
}
