//! Background garbage collection of expired silences.
//!
//! Each cycle marks ended silences as expired, purges those past the
//! retention period, reports silences about to end and reloads the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SilenceCache;
use crate::clock::SharedClock;
use crate::config::ManagerConfig;
use crate::error::{Result, SilenceError};
use crate::store::{ExpireMode, SilenceStore};

/// Orders full cache reloads against write-through updates.
///
/// Writers hold it shared while they update storage and the cache; a reload
/// holds it exclusively while it reads storage and swaps the cache.
pub(crate) type RefreshGate = tokio::sync::RwLock<()>;

/// Outcome of one GC cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    /// Silences newly marked expired.
    pub soft_expired: u64,
    /// Expired silences removed after retention.
    pub hard_deleted: u64,
    /// Active silences ending within the warning window.
    pub expiring_soon: usize,
    /// Cache size after the reload.
    pub cached: usize,
    /// Wall time of the cycle.
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Runs GC cycles against a store and keeps the cache in step.
#[derive(Debug, Clone)]
pub struct GcWorker {
    store: Arc<dyn SilenceStore>,
    cache: Arc<SilenceCache>,
    gate: Arc<RefreshGate>,
    clock: SharedClock,
    config: ManagerConfig,
}

impl GcWorker {
    pub(crate) fn new(
        store: Arc<dyn SilenceStore>,
        cache: Arc<SilenceCache>,
        gate: Arc<RefreshGate>,
        clock: SharedClock,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            gate,
            clock,
            config,
        }
    }

    /// Reloads the cache from storage and returns the number of silences.
    pub async fn refresh_cache(&self) -> Result<usize> {
        let _exclusive = self.gate.write().await;
        let silences = self.store.all_silences().await?;
        let count = silences.len();
        self.cache.replace_all(silences);
        debug!(count, "silence cache reloaded");
        Ok(count)
    }

    /// Runs one cycle bounded by `gc_timeout`.
    ///
    /// # Errors
    ///
    /// The first storage error, or `Unavailable` if the deadline passes.
    pub async fn run_once(&self) -> Result<GcReport> {
        let deadline = self.config.gc_timeout();
        tokio::time::timeout(deadline, self.cycle())
            .await
            .unwrap_or_else(|_| {
                Err(SilenceError::Unavailable {
                    reason: format!("gc cycle exceeded {}s", deadline.as_secs()),
                })
            })
    }

    async fn cycle(&self) -> Result<GcReport> {
        let started = Instant::now();
        let now = self.clock.now();

        let soft_expired = self
            .store
            .expire_silences(now, ExpireMode::SoftExpire)
            .await?;
        let hard_deleted = self
            .store
            .expire_silences(retention_cutoff(now, self.config.retention()), ExpireMode::HardDelete)
            .await?;

        let expiring = self
            .store
            .expiring_soon(self.config.expiry_warning_window())
            .await?;
        for silence in &expiring {
            info!(
                silence_id = %silence.id,
                created_by = %silence.created_by,
                ends_at = %silence.ends_at,
                "silence expiring soon"
            );
        }

        let cached = self.refresh_cache().await?;

        Ok(GcReport {
            soft_expired,
            hard_deleted,
            expiring_soon: expiring.len(),
            cached,
            elapsed: started.elapsed(),
        })
    }

    /// Spawns the periodic loop; it exits when `cancel` fires.
    ///
    /// The first cycle runs one full interval after spawning.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> WorkerHandle {
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.gc_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        info!(
            interval_secs = self.config.gc_interval_secs,
            retention_secs = self.config.retention_secs,
            "silence gc worker started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A started cycle runs to completion; cancellation is only
            // observed between cycles. `run_once` is bounded by `gc_timeout`.
            match self.run_once().await {
                Ok(report) => info!(
                    soft_expired = report.soft_expired,
                    hard_deleted = report.hard_deleted,
                    expiring_soon = report.expiring_soon,
                    cached = report.cached,
                    elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                    "silence gc cycle complete"
                ),
                Err(e) => warn!(error = %e, "silence gc cycle failed"),
            }
        }

        info!("silence gc worker stopped");
    }
}

/// Handle to a spawned [`GcWorker`] loop.
#[derive(Debug)]
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signals the loop to stop and waits up to `timeout` for it.
    ///
    /// Returns false if the task had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let mut join = self.join;
        match tokio::time::timeout(timeout, &mut join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "silence gc worker task failed");
                true
            }
            Err(_) => {
                join.abort();
                false
            }
        }
    }
}

fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    // Timestamps are persisted as i64 nanoseconds; clamp to that range.
    let earliest = DateTime::<Utc>::from_timestamp_nanos(i64::MIN);
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .map_or(earliest, |cutoff| cutoff.max(earliest))
}
