//! Driver loop
//!
//! Runs reconciliation cycles until cancelled. Between two cycles the driver
//! waits on a three-way race: the cycle timer, a configuration change, or
//! cancellation. The first ready event wins.

use crate::config::Config;
use crate::engine::{CycleReport, ReconciliationEngine};
use crate::error::{Error, Result};
use crate::watcher::ChangeSignal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Produces a fresh, prepared configuration (normally by re-reading the file)
pub type ConfigLoader = Box<dyn Fn() -> Result<Config> + Send + Sync>;

/// Called after a configuration replacement succeeded
pub type ReloadHook = Box<dyn Fn(&Config) + Send + Sync>;

/// Owns the polling loop around a [`ReconciliationEngine`]
pub struct Driver {
    engine: Arc<ReconciliationEngine>,
    loader: ConfigLoader,
    on_reload: Option<ReloadHook>,
}

impl Driver {
    pub fn new(engine: Arc<ReconciliationEngine>, loader: ConfigLoader) -> Self {
        Self {
            engine,
            loader,
            on_reload: None,
        }
    }

    /// Run `hook` with the new configuration after every successful reload
    pub fn with_reload_hook(mut self, hook: ReloadHook) -> Self {
        self.on_reload = Some(hook);
        self
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    /// Startup check: the zone must be visible to the credential
    ///
    /// # Errors
    ///
    /// [`Error::ZoneRejected`] when it is not; any failure of the check
    /// itself is returned as is.
    pub async fn startup(&self, ctx: &CancellationToken) -> Result<()> {
        let zone_id = self.engine.store().get().zone_id.clone();
        if self.engine.validate_zone(ctx).await? {
            info!(zone_id = %zone_id, "zone validated");
            Ok(())
        } else {
            Err(Error::ZoneRejected(zone_id))
        }
    }

    /// Validate the zone and run one reconciliation cycle
    ///
    /// Returns `Ok(None)` when the cycle was skipped because validation
    /// failed.
    pub async fn run_cycle(&self, ctx: &CancellationToken) -> Result<Option<CycleReport>> {
        match self.engine.validate_zone(ctx).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("zone validation failed, skipping this cycle");
                return Ok(None);
            }
            Err(e) if e.is_cancelled() || e.is_unavailable() => return Err(e),
            Err(e) => {
                warn!(error = %e, "zone validation errored, skipping this cycle");
                return Ok(None);
            }
        }

        let report = self.engine.process(ctx).await?;
        self.engine.wait().await;

        let duration = Duration::from_millis(report.duration.as_millis() as u64);
        info!(
            generation = report.generation,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed(),
            cancelled = report.cancelled,
            duration = %humantime::format_duration(duration),
            "reconciliation cycle finished"
        );

        Ok(Some(report))
    }

    /// Reload the configuration and publish it
    ///
    /// On failure the previous configuration stays active and `false` is
    /// returned.
    pub fn reload(&self) -> bool {
        let config = match (self.loader)() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to reload configuration, keeping previous");
                return false;
            }
        };

        if let Err(e) = self.engine.store().replace(config) {
            error!(error = %e, "failed to apply configuration, keeping previous");
            return false;
        }

        if let Some(hook) = &self.on_reload {
            hook(&self.engine.store().get());
        }
        true
    }

    /// Run a single cycle, for one-shot operation
    pub async fn run_once(&self, ctx: &CancellationToken) -> Result<Option<CycleReport>> {
        let report = self.run_cycle(ctx).await;
        if ctx.is_cancelled() {
            self.engine.close();
        }
        report
    }

    /// Run cycles until `ctx` is cancelled
    ///
    /// With `changes`, a configuration change triggers a reload followed by
    /// an immediate cycle. On cancellation the active pool is aborted and
    /// the loop returns `Ok(())`.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        mut changes: Option<ChangeSignal>,
    ) -> Result<()> {
        loop {
            match self.run_cycle(ctx).await {
                Ok(_) => {}
                Err(_) if ctx.is_cancelled() => break,
                Err(e) if e.is_unavailable() => {
                    error!(error = %e, "worker pool unavailable, stopping");
                    return Err(e);
                }
                Err(e) => error!(error = %e, "reconciliation cycle failed"),
            }

            let frequency = self.engine.store().get().frequency;
            debug!(next_in = %humantime::format_duration(frequency), "waiting for next cycle");

            let sleep = tokio::time::sleep(frequency);
            tokio::pin!(sleep);

            loop {
                let change = async {
                    match changes.as_mut() {
                        Some(signal) => signal.changed().await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => {
                        info!("shutdown requested");
                        self.engine.close();
                        return Ok(());
                    }
                    still_watching = change => {
                        if !still_watching {
                            debug!("config watcher stopped, continuing on the timer");
                            changes = None;
                            continue;
                        }
                        if self.reload() {
                            break;
                        }
                    }
                    _ = &mut sleep => break,
                }
            }
        }

        info!("shutdown requested");
        self.engine.close();
        Ok(())
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("store", self.engine.store())
            .field("reload_hook", &self.on_reload.is_some())
            .finish()
    }
}
