// =============================================================================
// Scheduler — fans out slot loops, reconcilers, pending monitor, reaper
// (spec §4.6)
// =============================================================================
//
// Owns nothing but `Arc<AppState>` and a shutdown token. Every subordinate
// task observes the token at its suspension points; shutdown waits up to a
// bounded deadline for in-flight work before returning.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::slot::SlotLoop;
use crate::types::PositionStatus;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub struct Scheduler {
    state: Arc<AppState>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            tasks: Vec::new(),
        }
    }

    /// Spawns every subordinate task and returns immediately; call `shutdown`
    /// to stop them. Re-entrant: calling `start` again after a config reload
    /// that changes the profile set is safe (old slot loops detect their
    /// profile disappeared and exit on their own, per `SlotLoop::run`).
    pub fn start(&mut self) {
        let shutdown = self.state.shutdown.clone();

        for profile_id in self.state.profile_ids() {
            let Some(runtime) = self.state.profile(&profile_id) else { continue };
            let symbols = {
                let config = self.state.config.read();
                config
                    .profiles
                    .iter()
                    .find(|p| p.id == profile_id)
                    .map(|p| (p.symbols.clone(), p.timeframes.clone()))
            };
            let Some((symbols, timeframes)) = symbols else { continue };

            for symbol in &symbols {
                for timeframe in &timeframes {
                    let slot = SlotLoop::new(profile_id.clone(), symbol.clone(), timeframe.clone(), self.state.clone());
                    let token = shutdown.clone();
                    self.tasks.push(tokio::spawn(slot.run(token)));
                }
            }

            let reconciler_task = self.spawn_reconciler(profile_id.clone(), runtime.clone(), symbols);
            self.tasks.push(reconciler_task);
        }

        let pending_task = self.spawn_pending_monitor();
        let reload_task = self.spawn_config_reload();
        self.tasks.push(pending_task);
        self.tasks.push(reload_task);

        info!("scheduler started");
    }

    /// Runs the profile's pre-wired `Reconciler` (shared per-symbol locks
    /// with its `Trader`) on the periodic full-scan cadence (spec §4.4b).
    /// The complementary fast deep-sync runs inline in `SlotLoop::tick`.
    fn spawn_reconciler(
        &self,
        profile_id: String,
        runtime: Arc<crate::app_state::ProfileRuntime>,
        universe: Vec<String>,
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let full_scan_secs = state.config.read().reconcile_full_scan_secs;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(full_scan_secs)) => {}
                }
                let config = state.config.read().clone();
                if let Err(e) = runtime.reconciler.reconcile(&universe, &config).await {
                    warn!(profile = %profile_id, error = %e, "reconciliation failed");
                }
            }
        })
    }

    fn spawn_pending_monitor(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let poll_secs = state.config.read().pending_poll_secs;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(poll_secs)) => {}
                }
                let config = state.config.read().clone();
                for profile_id in state.profile_ids() {
                    let Some(runtime) = state.profile(&profile_id) else { continue };
                    let Ok(active) = runtime.store.list_active(&profile_id).await else { continue };
                    for pos in active.into_iter().filter(|p| p.status == PositionStatus::Pending) {
                        let signal = state.signal_source.latest(&pos.symbol);
                        if let Err(e) = runtime.trader.tick_pending(&pos, &signal, &config).await {
                            warn!(profile = %profile_id, symbol = %pos.symbol, error = %e, "pending-fill tick failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_config_reload(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(crate::config::CONFIG_POLL_SECS)) => {}
                }
                state.poll_config().await;
            }
        })
    }

    /// Cancels the shared token and waits up to `SHUTDOWN_DEADLINE` for every
    /// spawned task to finish; anything still running past the deadline is
    /// abandoned (its adapter calls are expected to time out on their own).
    pub async fn shutdown(mut self) {
        self.state.shutdown.cancel();
        let deadline = tokio::time::sleep(SHUTDOWN_DEADLINE);
        tokio::pin!(deadline);
        for task in self.tasks.drain(..) {
            tokio::select! {
                _ = &mut deadline => {
                    warn!("shutdown deadline exceeded, abandoning remaining tasks");
                    task.abort();
                }
                res = task => {
                    if let Err(e) = res {
                        if !e.is_cancelled() {
                            warn!(error = %e, "task panicked during shutdown");
                        }
                    }
                }
            }
        }
        info!("scheduler shut down");
    }
}
