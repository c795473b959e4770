//! Background Scheduler
//!
//! A single task drives the periodic TTL sweep and cache warming. Stopping
//! cancels the task, waits for the pass in progress, then drains the engine.

use crate::cache::coordinator::Coordinator;
use crate::cache::warmer::CacheWarmer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to the running scheduler
pub struct Scheduler {
    engine: Arc<Coordinator>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Start sweeping and warming on the configured intervals
    ///
    /// Startup warming runs first when enabled.
    pub fn start(engine: Arc<Coordinator>) -> Self {
        let config = engine.config();
        let sweep = config.sweep_interval();
        let warm = config.warmer.enabled.then(|| config.warmer.interval());
        Self::with_intervals(engine, sweep, warm)
    }

    pub(crate) fn with_intervals(
        engine: Arc<Coordinator>,
        sweep_every: Duration,
        warm_every: Option<Duration>,
    ) -> Self {
        let token = CancellationToken::new();
        let warmer = CacheWarmer::new(engine.config().warmer.clone(), Arc::clone(&engine));
        let handle = tokio::spawn(run(warmer, Arc::clone(&engine), sweep_every, warm_every, token.clone()));
        info!(
            sweep_interval_ms = sweep_every.as_millis() as u64,
            warm_interval_ms = warm_every.map(|d| d.as_millis() as u64),
            "Scheduler started"
        );
        Self {
            engine,
            token,
            handle,
        }
    }

    /// Token that stops the scheduler when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop, then drain write-behind and pending invalidations
    pub async fn stop(self, drain_timeout: Duration) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
        self.engine.shutdown(drain_timeout).await;
        info!("Scheduler stopped");
    }
}

async fn run(
    warmer: CacheWarmer,
    engine: Arc<Coordinator>,
    sweep_every: Duration,
    warm_every: Option<Duration>,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = warmer.warm_startup() => {}
    }

    let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Without warming the second timer never fires
    let warm_period = warm_every.unwrap_or(Duration::from_secs(86_400));
    let mut warm = interval_at(Instant::now() + warm_period, warm_period);
    warm.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sweep.tick() => {
                let report = engine.sweep_expired().await;
                debug!(
                    local = report.local,
                    distributed = report.distributed,
                    edges_pruned = report.edges_pruned,
                    "Sweep pass"
                );
            }
            _ = warm.tick(), if warm_every.is_some() => {
                let report = warmer.run_once().await;
                debug!(
                    requested = report.keys_requested,
                    loaded = report.keys_loaded,
                    "Warming pass"
                );
            }
        }
    }
    debug!("Scheduler loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LocalNode, MemoryStore};
    use crate::cache::storage::TierStorage;
    use crate::cache::{CacheKey, RiskCache};
    use crate::config::EngineConfig;
    use crate::domain::ports::SharedBackingStore;
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn engine(store: Arc<MemoryStore>) -> Arc<Coordinator> {
        let mut config = EngineConfig::default();
        config.warmer.warm_on_startup = false;
        let nodes = LocalNode::shared_from_config(&config.distributed);
        Coordinator::new(config, store as SharedBackingStore, nodes).unwrap()
    }

    #[tokio::test]
    async fn test_sweep_runs_on_interval() {
        let engine = engine(Arc::new(MemoryStore::new()));
        engine
            .local()
            .set("session:u1:v0", Bytes::from("s"), Duration::from_millis(10))
            .await
            .unwrap();

        let scheduler = Scheduler::with_intervals(Arc::clone(&engine), Duration::from_millis(30), None);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.metrics().invalidation.swept.load(Ordering::Relaxed) >= 1);
        assert_eq!(engine.local().store().len(), 0);

        scheduler.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_warming_pass_loads_tracked_keys() {
        let store = Arc::new(MemoryStore::new());
        store.seed("features:acme", "0.42");
        let engine = engine(Arc::clone(&store));

        let key = CacheKey::new("features", "acme");
        engine.get(&key).await.unwrap();
        engine.local().clear().await.unwrap();

        let scheduler = Scheduler::with_intervals(
            Arc::clone(&engine),
            Duration::from_secs(60),
            Some(Duration::from_millis(30)),
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(engine.local().store().peek("features:acme:v0").is_some());
        assert!(engine.metrics().coordinator.warmed_keys.load(Ordering::Relaxed) >= 1);

        let token = scheduler.token();
        scheduler.stop(Duration::from_secs(1)).await;
        assert!(token.is_cancelled());
        assert!(!engine.health_check().await.unwrap());
    }
}
