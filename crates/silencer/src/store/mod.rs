//! Durable storage for silences.
//!
//! [`SilenceStore`] is the seam between the manager and persistence;
//! [`SqliteStore`] implements it over SQLite.

mod sqlite;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{NewSilence, Silence, SilencePatch, SilenceStatus};

pub use sqlite::SqliteStore;

/// Column a listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    /// Creation time.
    #[default]
    CreatedAt,
    /// Start of the window.
    StartsAt,
    /// End of the window.
    EndsAt,
}

impl SortField {
    pub(crate) const fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "s.created_at",
            Self::StartsAt => "s.starts_at",
            Self::EndsAt => "s.ends_at",
        }
    }
}

/// Direction of a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Oldest / smallest first.
    Asc,
    /// Newest / largest first.
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) const fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Criteria for listing and counting silences.
///
/// Every set field narrows the result. Time bounds are half-open:
/// `*_after` is inclusive, `*_before` is exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SilenceFilter {
    /// Any of these statuses, derived at query time.
    pub statuses: Vec<SilenceStatus>,
    /// Exact author.
    pub created_by: Option<String>,
    /// Some matcher has exactly this label name.
    pub matcher_name: Option<String>,
    /// Some matcher's value contains this substring (the same matcher as
    /// `matcher_name` when both are set).
    pub matcher_value: Option<String>,
    /// Window starts at or after.
    pub starts_after: Option<DateTime<Utc>>,
    /// Window starts before.
    pub starts_before: Option<DateTime<Utc>>,
    /// Window ends at or after.
    pub ends_after: Option<DateTime<Utc>>,
    /// Window ends before.
    pub ends_before: Option<DateTime<Utc>>,
    /// Page size; defaulted and capped by the store.
    pub limit: Option<u32>,
    /// Rows to skip.
    pub offset: u32,
    /// Sort column.
    pub sort_by: SortField,
    /// Sort direction.
    pub order: SortOrder,
}

impl SilenceFilter {
    /// A filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a status to match.
    #[must_use]
    pub fn status(mut self, status: SilenceStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Restricts to one author.
    #[must_use]
    pub fn created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    /// Restricts to silences with a matcher on `name`.
    #[must_use]
    pub fn matcher_name(mut self, name: impl Into<String>) -> Self {
        self.matcher_name = Some(name.into());
        self
    }

    /// Restricts to silences with a matcher value containing `value`.
    #[must_use]
    pub fn matcher_value(mut self, value: impl Into<String>) -> Self {
        self.matcher_value = Some(value.into());
        self
    }

    /// Sets the page.
    #[must_use]
    pub const fn page(mut self, limit: u32, offset: u32) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub const fn sort(mut self, sort_by: SortField, order: SortOrder) -> Self {
        self.sort_by = sort_by;
        self.order = order;
        self
    }
}

/// What an expiry pass does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireMode {
    /// Mark silences whose window ended as expired.
    SoftExpire,
    /// Remove silences already marked expired.
    HardDelete,
}

impl fmt::Display for ExpireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SoftExpire => f.write_str("soft-expire"),
            Self::HardDelete => f.write_str("hard-delete"),
        }
    }
}

/// Durable, queryable persistence for silences.
///
/// Implementations provide atomic mutations and an optimistic lock on
/// `updated_at`; they hold no in-process locks of their own.
#[async_trait]
pub trait SilenceStore: Send + Sync + fmt::Debug {
    /// Validates and persists a new silence.
    ///
    /// # Errors
    ///
    /// `Validation` on bad input, `AlreadyExists` on a duplicate ID.
    async fn create_silence(&self, silence: NewSilence) -> Result<Silence>;

    /// Looks a silence up by ID.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    async fn get_silence(&self, id: &str) -> Result<Silence>;

    /// Lists silences matching `filter`, one page at a time.
    async fn list_silences(&self, filter: &SilenceFilter) -> Result<Vec<Silence>>;

    /// Counts silences matching `filter`, ignoring pagination.
    async fn count_silences(&self, filter: &SilenceFilter) -> Result<u64>;

    /// Applies a partial update if `expected_updated_at` still matches.
    ///
    /// # Errors
    ///
    /// `Conflict` on a stale token, `NotFound` if absent, `Validation` if
    /// the merged silence is invalid.
    async fn update_silence(&self, patch: &SilencePatch) -> Result<Silence>;

    /// Hard-deletes a silence.
    ///
    /// # Errors
    ///
    /// `NotFound` if absent.
    async fn delete_silence(&self, id: &str) -> Result<()>;

    /// Runs one capped expiry batch and returns the affected row count.
    ///
    /// `SoftExpire` marks silences with `ends_at < before`; `HardDelete`
    /// removes already-marked silences with `ends_at < before`.
    async fn expire_silences(&self, before: DateTime<Utc>, mode: ExpireMode) -> Result<u64>;

    /// Active silences ending within `window`, soonest first.
    async fn expiring_soon(&self, window: Duration) -> Result<Vec<Silence>>;

    /// Forces `status` on every listed silence, all or nothing.
    async fn bulk_update_status(&self, ids: &[String], status: SilenceStatus) -> Result<u64>;

    /// Every stored silence; the cache load path.
    async fn all_silences(&self) -> Result<Vec<Silence>>;
}
