//! Background pool maintenance
//!
//! The reaper sweeps the pool on an interval: warm runtimes past their idle
//! deadline are cooled down, runtimes whose runner missed its liveness
//! deadline are reset and reborn, and retrieved donor sandboxes are brought
//! back into allocation. Each sweep also refreshes the pool gauges.

use cirrus_funclet::{CoolDownParams, FuncletClient, RebornParams};
use cirrus_observability::CirrusMetrics;
use cirrus_rtctrl::{RuntimeManager, RuntimeState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Reaper {
    manager: Arc<RuntimeManager>,
    funclet: Arc<dyn FuncletClient>,
    metrics: Arc<CirrusMetrics>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        manager: Arc<RuntimeManager>,
        funclet: Arc<dyn FuncletClient>,
        metrics: Arc<CirrusMetrics>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            funclet,
            metrics,
            interval,
        })
    }

    /// Sweep until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reaper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One maintenance pass over the whole pool
    pub async fn sweep(&self) {
        for description in self.manager.runtime_descriptions() {
            match description.state {
                RuntimeState::Warm => self.try_cool_down(&description.runtime_id).await,
                RuntimeState::WarmUp
                | RuntimeState::Stopping
                | RuntimeState::Stopped
                | RuntimeState::Closed => self.try_reset(&description.runtime_id).await,
                RuntimeState::Cold | RuntimeState::Merged | RuntimeState::Reclaiming => {}
            }
        }
        self.refresh_gauges();
    }

    /// Cool down one warm runtime if it is past its idle deadline
    async fn try_cool_down(&self, runtime_id: &str) {
        let recommendation = match self.manager.cool_down_runtime(runtime_id) {
            Ok(Some(recommendation)) => recommendation,
            Ok(None) => return,
            Err(e) => {
                debug!(runtime_id, error = %e, "cooldown skipped");
                return;
            }
        };
        if !recommendation.retrieved.is_empty() {
            self.metrics.scale_down_total.inc();
        }

        let params = CoolDownParams {
            runtime_id: recommendation.target.clone(),
            retrieved: recommendation.retrieved.clone(),
        };
        match self.funclet.cool_down(&params).await {
            Ok(_) => {
                info!(
                    runtime_id,
                    retrieved = recommendation.retrieved.len(),
                    "runtime cooled down"
                );
                self.recycle(&recommendation.target);
                for retrieved in &recommendation.retrieved {
                    self.recycle(retrieved);
                }
            }
            Err(e) => {
                // Leave the runtime in Stopping; the defunct pass picks it
                // up once its liveness deadline lapses
                warn!(runtime_id, error = %e, "funclet cooldown failed");
            }
        }
    }

    /// Reset one runtime whose runner went defunct, then have the funclet
    /// recreate the sandbox
    async fn try_reset(&self, runtime_id: &str) {
        let recommendation = match self.manager.reset_runtime(runtime_id) {
            Ok(Some(recommendation)) => recommendation,
            Ok(None) => return,
            Err(e) => {
                debug!(runtime_id, error = %e, "reset skipped");
                return;
            }
        };

        let params = RebornParams {
            runtime_id: recommendation.target.clone(),
            retrieved: recommendation.retrieved.clone(),
        };
        match self.funclet.reborn(&params).await {
            Ok(_) => {
                info!(runtime_id, "defunct runtime reborn");
                self.recycle(&recommendation.target);
                for retrieved in &recommendation.retrieved {
                    self.recycle(retrieved);
                }
            }
            Err(e) => {
                warn!(runtime_id, error = %e, "funclet reborn failed");
            }
        }
    }

    /// Return a confirmed-torn-down slot to allocation as Cold
    fn recycle(&self, runtime_id: &str) {
        let Some(runtime) = self.manager.get(runtime_id) else {
            return;
        };
        // Hand back the used accounting before close clears the binding
        self.manager.confirm_runtime_closed(&runtime);
        runtime.close();
        if let Err(e) = runtime.activate() {
            warn!(runtime_id, error = %e, "recycled runtime failed to activate");
        }
    }

    fn refresh_gauges(&self) {
        let counts = self.manager.counts_by_state();
        for state in RuntimeState::all() {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.metrics
                .runtimes_by_state
                .with_label_values(&[state.as_str()])
                .set(count as f64);
        }

        let ledger = self.manager.resource_overview();
        for (kind, value) in [
            ("capacity", ledger.capacity.memory),
            ("allocatable", ledger.allocatable.memory),
            ("marked", ledger.marked.memory),
            ("used", ledger.used.memory),
        ] {
            self.metrics
                .memory_bytes
                .with_label_values(&[kind])
                .set(value as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_funclet::{FuncletCall, MockFunclet};
    use cirrus_rtctrl::{ManagerOptions, OccupyInput};
    use cirrus_spec::Resource;
    use std::time::Instant;

    const BASE_MB: i64 = 128;

    fn setup(pool: usize) -> (Arc<Reaper>, Arc<RuntimeManager>, Arc<MockFunclet>) {
        let manager = Arc::new(RuntimeManager::new(ManagerOptions::default()));
        manager.update_capacity(
            Resource::from_memory_mb(BASE_MB * 16, 10),
            Resource::from_memory_mb(BASE_MB * 16, 10),
        );
        let ids: Vec<String> = (0..pool).map(|i| format!("runtime-{i}")).collect();
        manager.init_runtime_list(ids.clone());
        let funclet = Arc::new(MockFunclet::new(ids));
        let reaper = Reaper::new(
            manager.clone(),
            funclet.clone(),
            Arc::new(CirrusMetrics::new().unwrap()),
            Duration::from_secs(10),
        );
        (reaper, manager, funclet)
    }

    fn occupy(manager: &RuntimeManager, memory_mb: i64) -> cirrus_rtctrl::OccupiedRuntime {
        manager
            .occupy_cold_runtime(&OccupyInput {
                commit_id: "commit-1".to_string(),
                user_id: "acct".to_string(),
                memory_mb,
                stream_mode: false,
                concurrent_mode: false,
                concurrent_quota: 1,
            })
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_cools_down_idle_warm_runtime() {
        let (reaper, manager, funclet) = setup(3);
        let occupied = occupy(&manager, BASE_MB);
        let runtime = occupied.runtime.clone();
        runtime.mark_warm();
        manager.confirm_runtime_warm(&runtime);
        runtime.release().unwrap();
        runtime.set_last_access(Instant::now() - Duration::from_secs(3600));

        reaper.sweep().await;

        assert!(matches!(
            funclet.calls().as_slice(),
            [FuncletCall::CoolDown { .. }]
        ));
        // Cooled down, recycled, and back in allocation
        assert_eq!(runtime.state(), RuntimeState::Cold);
    }

    #[tokio::test]
    async fn test_sweep_leaves_busy_and_fresh_runtimes_alone() {
        let (reaper, manager, funclet) = setup(2);
        let occupied = occupy(&manager, BASE_MB);
        occupied.runtime.mark_warm();
        // Still holding its occupy slot, and recently accessed

        reaper.sweep().await;
        assert!(funclet.calls().is_empty());
        assert_eq!(occupied.runtime.state(), RuntimeState::Warm);
    }

    #[tokio::test]
    async fn test_sweep_reborns_defunct_warmup_runtime() {
        let (reaper, manager, funclet) = setup(2);
        let occupied = occupy(&manager, BASE_MB);
        let runtime = occupied.runtime.clone();
        // Stuck in WarmUp with a long-stale liveness heartbeat
        runtime.set_last_liveness(Instant::now() - Duration::from_secs(3600));

        reaper.sweep().await;

        assert!(matches!(
            funclet.calls().as_slice(),
            [FuncletCall::Reborn { .. }]
        ));
        assert_eq!(runtime.state(), RuntimeState::Cold);
        assert_eq!(runtime.commit_id(), None);
    }
}
