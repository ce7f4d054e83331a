//! A [`SilenceStore`] wrapper that injects latency and failures.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, SilenceError};
use crate::store::{ExpireMode, SilenceFilter, SilenceStore, SqliteStore};
use crate::types::{NewSilence, Silence, SilencePatch, SilenceStatus};

/// Delegates to a [`SqliteStore`], sleeping around selected calls.
#[derive(Debug)]
pub(crate) struct SlowStore {
    inner: SqliteStore,
    /// Sleep after a write has committed, before it returns.
    pub(crate) write_delay: Duration,
    /// Sleep before each `expire_silences` call.
    pub(crate) expire_delay: Duration,
    /// Sleep before each `all_silences` call.
    pub(crate) load_delay: Duration,
    /// Report `Unavailable` after a write has committed.
    pub(crate) fail_after_write: AtomicBool,
    loads: AtomicUsize,
}

impl SlowStore {
    pub(crate) fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            expire_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_after_write: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }

    /// Number of completed `all_silences` calls.
    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    async fn after_write<T>(&self, result: Result<T>) -> Result<T> {
        let value = result?;
        tokio::time::sleep(self.write_delay).await;
        if self.fail_after_write.load(Ordering::SeqCst) {
            return Err(SilenceError::Unavailable {
                reason: "connection lost after commit".to_string(),
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl SilenceStore for SlowStore {
    async fn create_silence(&self, silence: NewSilence) -> Result<Silence> {
        let result = self.inner.create_silence(silence).await;
        self.after_write(result).await
    }

    async fn get_silence(&self, id: &str) -> Result<Silence> {
        self.inner.get_silence(id).await
    }

    async fn list_silences(&self, filter: &SilenceFilter) -> Result<Vec<Silence>> {
        self.inner.list_silences(filter).await
    }

    async fn count_silences(&self, filter: &SilenceFilter) -> Result<u64> {
        self.inner.count_silences(filter).await
    }

    async fn update_silence(&self, patch: &SilencePatch) -> Result<Silence> {
        let result = self.inner.update_silence(patch).await;
        self.after_write(result).await
    }

    async fn delete_silence(&self, id: &str) -> Result<()> {
        let result = self.inner.delete_silence(id).await;
        self.after_write(result).await
    }

    async fn expire_silences(&self, before: DateTime<Utc>, mode: ExpireMode) -> Result<u64> {
        tokio::time::sleep(self.expire_delay).await;
        self.inner.expire_silences(before, mode).await
    }

    async fn expiring_soon(&self, window: Duration) -> Result<Vec<Silence>> {
        self.inner.expiring_soon(window).await
    }

    async fn bulk_update_status(&self, ids: &[String], status: SilenceStatus) -> Result<u64> {
        let result = self.inner.bulk_update_status(ids, status).await;
        self.after_write(result).await
    }

    async fn all_silences(&self) -> Result<Vec<Silence>> {
        tokio::time::sleep(self.load_delay).await;
        let silences = self.inner.all_silences().await?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(silences)
    }
}
