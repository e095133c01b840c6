//! Long-running reconcile agent
//!
//! One task per configured region. Each task loads the region's spec, status
//! and the prefix catalog from the [`StateStore`], runs a reconcile pass on a
//! blocking thread (netlink and `setns(2)` are synchronous and thread-bound),
//! persists the status when it changed, and sleeps until the next pass.
//!
//! Ctrl-C stops every loop between passes; a pass in flight always finishes.

use crate::audit::{self, AuditLog};
use crate::config::{AgentConfig, RegionConfig};
use crate::core::engine::Firewall;
use crate::core::error::{Error, Result};
use crate::core::reconcile::{ReconcileResult, Reconciler};
use crate::core::store::StateStore;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Per-region loop state
#[derive(Debug, Clone)]
struct RegionTask {
    region: RegionConfig,
    firewall: Firewall,
    store: StateStore,
    audit: AuditLog,
    resync_interval: Duration,
    retry_after: Duration,
}

#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
    store: StateStore,
    audit: AuditLog,
}

impl Agent {
    /// # Errors
    ///
    /// `StateDirUnavailable` when neither the config nor XDG names a state
    /// directory, and I/O errors creating it.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let root = config
            .state_dir()
            .ok_or(crate::core::store::StoreError::StateDirUnavailable)?;
        crate::utils::ensure_dir(&root)?;
        Ok(Self {
            store: StateStore::new(&root),
            audit: AuditLog::in_dir(&root),
            config,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn firewall(&self, region: &RegionConfig) -> Firewall {
        Firewall::new(region.netns.clone(), self.config.ip_family)
            .with_icmp_limit(self.config.icmp_limit)
    }

    /// Runs every region until Ctrl-C.
    ///
    /// # Errors
    ///
    /// Failure to install the signal handler. Per-region errors are logged
    /// and retried, never returned.
    pub async fn run(self) -> Result<()> {
        if self.config.regions.is_empty() {
            warn!("No regions configured, nothing to reconcile");
        }

        if self.config.bootstrap_on_start {
            for region in &self.config.regions {
                // A failed bootstrap is retried implicitly: the first pass
                // reports the missing table and the loop backs off.
                if let Err(e) = bootstrap_region(&self.firewall(region), &region.name, &self.audit).await {
                    error!("Bootstrap of region {} failed: {}", region.name, e);
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for region in &self.config.regions {
            let task = RegionTask {
                region: region.clone(),
                firewall: self.firewall(region),
                store: self.store.clone(),
                audit: self.audit.clone(),
                resync_interval: self.config.resync_interval(),
                retry_after: self.config.retry_after(),
            };
            handles.push(tokio::spawn(region_loop(task, shutdown_rx.clone())));
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Region task panicked: {}", e);
            }
        }
        Ok(())
    }
}

/// Resets the table of one region and records the outcome in the audit log.
///
/// # Errors
///
/// The bootstrap error, or `Internal` if the blocking task panicked.
pub async fn bootstrap_region(firewall: &Firewall, region: &str, audit: &AuditLog) -> Result<usize> {
    let fw = firewall.clone();
    let result = tokio::task::spawn_blocking(move || fw.bootstrap())
        .await
        .map_err(|e| Error::Internal(format!("bootstrap task: {e}")))?;

    match &result {
        Ok(mutations) => {
            info!("Region {} bootstrapped ({} changes)", region, mutations);
            audit::log_bootstrap(audit, region, *mutations, true, None).await;
        }
        Err(e) => audit::log_bootstrap(audit, region, 0, false, Some(e.to_string())).await,
    }
    result
}

async fn region_loop(task: RegionTask, mut shutdown: watch::Receiver<bool>) {
    info!(
        "Reconciling region {} (namespace {})",
        task.region.name,
        task.region.netns.as_deref().unwrap_or("<own>")
    );
    loop {
        let delay = match run_pass(&task).await {
            Ok(result) => next_delay(&result, task.resync_interval),
            Err(e) if e.is_retryable() => {
                warn!("Region {}: {} (retrying in {:?})", task.region.name, e, task.retry_after);
                task.retry_after
            }
            Err(e) => {
                error!("Region {}: {}", task.region.name, e);
                task.resync_interval
            }
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("Region {} stopped", task.region.name);
}

/// Delay before the pass after one that returned `result`.
pub fn next_delay(result: &ReconcileResult, resync_interval: Duration) -> Duration {
    if result.requeue {
        Duration::ZERO
    } else {
        result.requeue_after.unwrap_or(resync_interval)
    }
}

async fn run_pass(task: &RegionTask) -> Result<ReconcileResult> {
    let name = task.region.name.clone();
    let spec = task.store.load_spec(&name).await?;
    let mut status = task.store.load_status(&name).await?;
    let catalog = task.store.load_prefixes().await?;

    let firewall = task.firewall.clone();
    let retry_after = task.retry_after;
    let region = name.clone();
    let (result, outcomes, status) = tokio::task::spawn_blocking(move || {
        let mut reconciler = Reconciler::new(&region, firewall, &catalog, retry_after);
        let result = reconciler.reconcile(&spec, &mut status);
        (result, reconciler.take_outcomes(), status)
    })
    .await
    .map_err(|e| Error::Internal(format!("reconcile task: {e}")))?;

    for (zone, outcome) in &outcomes {
        audit::log_sync(&task.audit, &name, *zone, outcome).await;
    }

    match result {
        Ok(result) => {
            if result.status_updated {
                task.store.save_status(&name, &status).await?;
            }
            Ok(result)
        }
        Err(e) => {
            audit::log_failure(&task.audit, &name, e.is_retryable(), e.to_string()).await;
            Err(e)
        }
    }
}
