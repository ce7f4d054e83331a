//! Silence manager: the single entry point for silence operations.
//!
//! This module provides the [`SilenceManager`], which writes through to a
//! [`SilenceStore`], keeps a read cache for the alert hot path and runs the
//! background [`GcWorker`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SilenceCache;
use crate::clock::{SharedClock, SystemClock};
use crate::config::ManagerConfig;
use crate::error::{Result, SilenceError};
use crate::matcher::{MatchMode, MatcherEngine, SilenceDecision};
use crate::store::{SilenceFilter, SilenceStore};
use crate::types::{NewSilence, Silence, SilencePatch, SilenceStatus};
use crate::worker::{GcReport, GcWorker, RefreshGate, WorkerHandle};

/// Lifecycle state of a [`SilenceManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    /// Not running; the worker is not spawned.
    Stopped,
    /// Loading the cache.
    Starting,
    /// Cache loaded and worker running.
    Running,
    /// Waiting for the worker to exit.
    Stopping,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Owns the silence cache and the GC worker, and decides whether alerts
/// are silenced.
///
/// Mutations are write-through: storage first, then the cache, so a caller
/// always reads its own writes. Reads on the alert path only touch the
/// cache.
#[derive(Debug)]
pub struct SilenceManager {
    store: Arc<dyn SilenceStore>,
    cache: Arc<SilenceCache>,
    gate: Arc<RefreshGate>,
    engine: MatcherEngine,
    clock: SharedClock,
    config: ManagerConfig,
    worker: GcWorker,
    state: Mutex<ManagerState>,
    handle: Mutex<Option<WorkerHandle>>,
}

impl SilenceManager {
    /// Creates a stopped manager over `store` using wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the configuration is unusable.
    pub fn new(store: Arc<dyn SilenceStore>, config: ManagerConfig) -> Result<Self> {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Creates a stopped manager with an explicit clock.
    ///
    /// The clock should be the one the store was built with.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the configuration is unusable.
    pub fn with_clock(
        store: Arc<dyn SilenceStore>,
        config: ManagerConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(SilenceCache::new());
        let gate = Arc::new(RefreshGate::new(()));
        let worker = GcWorker::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&gate),
            Arc::clone(&clock),
            config.clone(),
        );

        Ok(Self {
            store,
            cache,
            gate,
            engine: MatcherEngine::new(),
            clock,
            config,
            worker,
            state: Mutex::new(ManagerState::Stopped),
            handle: Mutex::new(None),
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Number of silences in the cache.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// The matcher engine used for decisions.
    #[must_use]
    pub const fn engine(&self) -> &MatcherEngine {
        &self.engine
    }

    fn write_path(&self) -> WritePath {
        WritePath {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            gate: Arc::clone(&self.gate),
            engine: self.engine.clone(),
        }
    }

    // ============ Lifecycle ============

    /// Loads the cache and spawns the GC worker.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless stopped; any storage error from the initial
    /// load, after which the manager is stopped again.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ManagerState::Stopped {
                return Err(SilenceError::InvalidState {
                    expected: ManagerState::Stopped.to_string(),
                    actual: state.to_string(),
                });
            }
            *state = ManagerState::Starting;
        }
        let transition = Transition::new(&self.state);

        let loaded = match self.worker.refresh_cache().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "initial silence load failed");
                return Err(e);
            }
        };
        for silence in self.cache.snapshot() {
            self.engine.regex_cache().warm(&silence.matchers);
        }

        let handle = self.worker.clone().spawn(CancellationToken::new());
        *self.handle.lock() = Some(handle);
        transition.complete(ManagerState::Running);

        info!(
            cached = loaded,
            gc_interval_secs = self.config.gc_interval_secs,
            "silence manager started"
        );
        Ok(())
    }

    /// Stops the GC worker, waiting at most `shutdown_timeout`.
    ///
    /// A worker that does not exit in time is aborted; that is logged, not
    /// returned. Stopping a stopped manager does nothing.
    ///
    /// # Errors
    ///
    /// `InvalidState` while the manager is starting or already stopping.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Stopped => return Ok(()),
                ManagerState::Running => *state = ManagerState::Stopping,
                other => {
                    return Err(SilenceError::InvalidState {
                        expected: ManagerState::Running.to_string(),
                        actual: other.to_string(),
                    });
                }
            }
        }

        let transition = Transition::new(&self.state);

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // Signal first: if this call is dropped the worker still exits.
            handle.cancel();
            let timeout = self.config.shutdown_timeout();
            if !handle.shutdown(timeout).await {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "silence gc worker did not stop in time and was aborted"
                );
            }
        }

        transition.complete(ManagerState::Stopped);
        info!("silence manager stopped");
        Ok(())
    }

    // ============ Silence Management ============

    /// Validates and stores a new silence, then caches it.
    ///
    /// # Errors
    ///
    /// `Validation`, `AlreadyExists` or `Unavailable` from storage.
    pub async fn create_silence(&self, silence: NewSilence) -> Result<Silence> {
        let created = detached("create_silence", self.write_path().create(silence)).await?;

        info!(
            silence_id = %created.id,
            created_by = %created.created_by,
            matchers = created.matchers.len(),
            status = %created.status,
            "silence created"
        );
        Ok(created)
    }

    /// Looks a silence up, from the cache when possible.
    ///
    /// # Errors
    ///
    /// `NotFound` if storage has no such silence.
    pub async fn get_silence(&self, id: &str) -> Result<Silence> {
        if let Some(cached) = self.cache.get(id) {
            return Ok(cached.with_status_at(self.clock.now()));
        }

        let _shared = self.gate.read().await;
        let silence = self.store.get_silence(id).await?;
        if self.cache.upsert(silence.clone()) {
            debug!(silence_id = %id, "silence cache filled from storage");
        }
        Ok(silence)
    }

    /// Lists silences straight from storage.
    ///
    /// # Errors
    ///
    /// `Unavailable` if storage fails.
    pub async fn list_silences(&self, filter: &SilenceFilter) -> Result<Vec<Silence>> {
        self.store.list_silences(filter).await
    }

    /// Counts silences straight from storage.
    ///
    /// # Errors
    ///
    /// `Unavailable` if storage fails.
    pub async fn count_silences(&self, filter: &SilenceFilter) -> Result<u64> {
        self.store.count_silences(filter).await
    }

    /// Active silences ending within `window`, soonest first.
    ///
    /// # Errors
    ///
    /// `Unavailable` if storage fails.
    pub async fn expiring_soon(&self, window: Duration) -> Result<Vec<Silence>> {
        self.store.expiring_soon(window).await
    }

    /// Applies a guarded partial update and replaces the cached copy.
    ///
    /// # Errors
    ///
    /// `Conflict` if the silence changed since the caller read it,
    /// `NotFound` if it is gone, `Validation` if the result is invalid.
    pub async fn update_silence(&self, patch: &SilencePatch) -> Result<Silence> {
        let updated = detached("update_silence", self.write_path().update(patch.clone())).await?;

        info!(silence_id = %updated.id, status = %updated.status, "silence updated");
        Ok(updated)
    }

    /// Hard-deletes a silence and drops it from the cache.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub async fn delete_silence(&self, id: &str) -> Result<()> {
        detached("delete_silence", self.write_path().delete(id.to_string())).await?;

        info!(silence_id = %id, "silence deleted");
        Ok(())
    }

    /// Forces a status on several silences at once, then reloads each of
    /// them into the cache. A silence that cannot be reloaded is evicted
    /// until the next refresh.
    ///
    /// # Errors
    ///
    /// Any failure leaves every silence untouched: `NotFound` for a missing
    /// ID, `Validation` for an impossible transition.
    pub async fn bulk_update_status(&self, ids: &[String], status: SilenceStatus) -> Result<u64> {
        let affected = detached(
            "bulk_update_status",
            self.write_path().bulk_update_status(ids.to_vec(), status),
        )
        .await?;

        info!(count = affected, status = %status, "silence status updated in bulk");
        Ok(affected)
    }

    /// Ends a silence now.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    pub async fn expire_silence(&self, id: &str) -> Result<Silence> {
        self.bulk_update_status(&[id.to_string()], SilenceStatus::Expired)
            .await?;
        self.get_silence(id).await
    }

    // ============ Evaluation ============

    /// Decides whether an alert with `labels` is silenced right now.
    ///
    /// Every cached silence active at the current instant is evaluated and
    /// all matching IDs are reported, sorted. If `cancel` fires during
    /// evaluation the alert is reported as not silenced.
    pub fn is_alert_silenced(
        &self,
        labels: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> SilenceDecision {
        let mut active = self.cache.active_at(self.clock.now());
        active.sort_unstable_by(|a, b| a.id.cmp(&b.id));

        let decision = self.engine.is_silenced(
            labels,
            active.iter().map(Arc::as_ref),
            cancel,
            MatchMode::AllMatches,
        );

        if decision.interrupted {
            warn!(
                labels = labels.len(),
                candidates = active.len(),
                "silence evaluation interrupted; alert not silenced"
            );
        } else if decision.silenced {
            debug!(matched = ?decision.matched_ids, "alert silenced");
        }
        decision
    }

    // ============ Maintenance ============

    /// Runs one GC cycle now, independent of the worker schedule.
    ///
    /// # Errors
    ///
    /// The first storage error of the cycle, or `Unavailable` on timeout.
    pub async fn run_gc_once(&self) -> Result<GcReport> {
        self.worker.run_once().await
    }

    /// Reloads the whole cache from storage.
    ///
    /// # Errors
    ///
    /// `Unavailable` if storage fails; the old cache is kept.
    pub async fn refresh_cache(&self) -> Result<usize> {
        self.worker.refresh_cache().await
    }
}

impl Drop for SilenceManager {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.cancel();
        }
    }
}

// ============ Write Path ============

/// Runs a write-through step on its own task.
///
/// The storage write and the matching cache update finish together even if
/// the caller stops waiting, so a dropped call cannot leave the cache
/// serving a silence that storage no longer has.
async fn detached<T>(
    op: &'static str,
    step: impl Future<Output = Result<T>> + Send + 'static,
) -> Result<T>
where
    T: Send + 'static,
{
    match tokio::spawn(step).await {
        Ok(result) => result,
        Err(e) => Err(SilenceError::Unavailable {
            reason: format!("{op} task failed: {e}"),
        }),
    }
}

/// Owned handles for one write-through step.
#[derive(Debug)]
struct WritePath {
    store: Arc<dyn SilenceStore>,
    cache: Arc<SilenceCache>,
    gate: Arc<RefreshGate>,
    engine: MatcherEngine,
}

impl WritePath {
    async fn create(self, silence: NewSilence) -> Result<Silence> {
        let _shared = self.gate.read().await;
        let requested = silence.requested_id().map(str::to_string);
        match self.store.create_silence(silence).await {
            Ok(created) => {
                self.engine.regex_cache().warm(&created.matchers);
                self.cache.insert_created(created.clone());
                Ok(created)
            }
            Err(e) => {
                if let (SilenceError::Unavailable { .. }, Some(id)) = (&e, &requested) {
                    self.reconcile(id).await;
                }
                Err(e)
            }
        }
    }

    async fn update(self, patch: SilencePatch) -> Result<Silence> {
        let _shared = self.gate.read().await;
        match self.store.update_silence(&patch).await {
            Ok(updated) => {
                self.engine.regex_cache().warm(&updated.matchers);
                self.cache.upsert(updated.clone());
                Ok(updated)
            }
            Err(e) => {
                if matches!(e, SilenceError::Unavailable { .. }) {
                    self.reconcile(&patch.id).await;
                }
                Err(e)
            }
        }
    }

    async fn delete(self, id: String) -> Result<()> {
        let _shared = self.gate.read().await;
        match self.store.delete_silence(&id).await {
            Ok(()) => {
                self.cache.remove(&id);
                Ok(())
            }
            Err(e) => {
                if matches!(e, SilenceError::Unavailable { .. }) {
                    self.reconcile(&id).await;
                }
                Err(e)
            }
        }
    }

    async fn bulk_update_status(self, ids: Vec<String>, status: SilenceStatus) -> Result<u64> {
        let _shared = self.gate.read().await;
        let result = self.store.bulk_update_status(&ids, status).await;
        if matches!(result, Ok(_) | Err(SilenceError::Unavailable { .. })) {
            for id in &ids {
                self.reconcile(id).await;
            }
        }
        result
    }

    /// Brings the cached copy of `id` in line with storage after a write.
    ///
    /// If storage cannot be read the entry is evicted, so the silence stops
    /// applying until the next refresh.
    async fn reconcile(&self, id: &str) {
        match self.store.get_silence(id).await {
            Ok(silence) => {
                self.engine.regex_cache().warm(&silence.matchers);
                self.cache.upsert(silence);
            }
            Err(SilenceError::NotFound { .. }) => {
                self.cache.remove(id);
            }
            Err(e) => {
                warn!(
                    silence_id = %id,
                    error = %e,
                    "failed to reload silence after write; evicting it"
                );
                self.cache.remove(id);
            }
        }
    }
}

// ============ Lifecycle Guard ============

/// Returns the manager to `Stopped` unless a transition completes.
///
/// Covers `start` and `stop` futures dropped while awaiting.
struct Transition<'a> {
    state: &'a Mutex<ManagerState>,
    done: bool,
}

impl<'a> Transition<'a> {
    const fn new(state: &'a Mutex<ManagerState>) -> Self {
        Self { state, done: false }
    }

    fn complete(mut self, to: ManagerState) {
        *self.state.lock() = to;
        self.done = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.done {
            *self.state.lock() = ManagerState::Stopped;
        }
    }
}
