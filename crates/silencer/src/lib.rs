//! Alertmanager-compatible silence engine.
//!
//! `silencer` decides whether an alert is silenced. Operators create
//! silences (label matchers plus a time window); the engine persists them,
//! keeps an in-memory cache for the alert hot path and expires them in the
//! background.
//!
//! # Features
//!
//! - **Matchers**: `=`, `!=`, `=~` and `!~` with fully anchored regexes
//! - **Durable storage**: SQLite via `sqlx`, with optimistic locking on `updated_at`
//! - **Filtering**: status, creator, matcher and time-range filters with pagination
//! - **Garbage collection**: soft expiry, retention-based purging in capped batches
//! - **Fail open**: an interrupted evaluation never silences an alert
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use chrono::{Duration, Utc};
//! use silencer::{
//!     ManagerConfig, Matcher, NewSilence, SilenceManager, SqliteStore, StoreConfig, SystemClock,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> silencer::Result<()> {
//! let clock = Arc::new(SystemClock);
//! let store = SqliteStore::connect("sqlite://silences.db?mode=rwc", StoreConfig::default(), clock.clone()).await?;
//! let manager = SilenceManager::with_clock(Arc::new(store), ManagerConfig::default(), clock)?;
//! manager.start().await?;
//!
//! let now = Utc::now();
//! let silence = NewSilence::builder("alice", "database failover")
//!     .window(now, now + Duration::hours(2))
//!     .matcher(Matcher::equal("service", "postgres"))
//!     .matcher(Matcher::regex("severity", "warning|critical"))
//!     .build()?;
//! manager.create_silence(silence).await?;
//!
//! let mut labels = HashMap::new();
//! labels.insert("service".to_string(), "postgres".to_string());
//! labels.insert("severity".to_string(), "critical".to_string());
//!
//! let decision = manager.is_alert_silenced(&labels, &CancellationToken::new());
//! assert!(decision.silenced);
//!
//! manager.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod matcher;
pub mod store;
pub mod types;
pub mod worker;

// Re-export main types at crate root
pub use cache::SilenceCache;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ManagerConfig, SilencerConfig, StoreConfig};
pub use error::{Result, SilenceError};
pub use manager::{ManagerState, SilenceManager};
pub use matcher::{MatchMode, MatcherEngine, RegexCache, SilenceDecision};
pub use store::{ExpireMode, SilenceFilter, SilenceStore, SortField, SortOrder, SqliteStore};
pub use types::{
    MatchType, Matcher, NewSilence, NewSilenceBuilder, SilencePatch, SilenceStatus, Silence,
};
pub use worker::{GcReport, GcWorker, WorkerHandle};
