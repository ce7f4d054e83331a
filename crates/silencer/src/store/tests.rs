use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use super::*;
use crate::clock::{Clock, ManualClock};
use crate::config::StoreConfig;
use crate::error::SilenceError;
use crate::types::{Matcher, NewSilence, SilencePatch, SilenceStatus};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

async fn store() -> (SqliteStore, ManualClock) {
    let clock = ManualClock::new(t0());
    let store = SqliteStore::in_memory(Arc::new(clock.clone())).await.unwrap();
    (store, clock)
}

fn new_silence(created_by: &str, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> NewSilence {
    NewSilence::builder(created_by, "planned maintenance")
        .window(starts_at, ends_at)
        .matcher(Matcher::equal("alertname", "HighCPU"))
        .matcher(Matcher::regex("instance", "web-.*"))
        .build()
        .unwrap()
}

fn active_silence() -> NewSilence {
    new_silence("alice", t0() - Duration::hours(1), t0() + Duration::hours(1))
}

#[tokio::test]
async fn create_then_get_round_trips() {
    let (store, _clock) = store().await;

    let created = store.create_silence(active_silence()).await.unwrap();
    let fetched = store.get_silence(&created.id).await.unwrap();

    assert_eq!(created, fetched);
    assert_eq!(fetched.status, SilenceStatus::Active);
    assert_eq!(fetched.matchers.len(), 2);
    assert_eq!(fetched.matchers[1], Matcher::regex("instance", "web-.*"));
    assert_eq!(fetched.created_at, t0());
    assert_eq!(fetched.updated_at, t0());
}

#[tokio::test]
async fn create_generates_id_when_absent() {
    let (store, _clock) = store().await;

    let a = store.create_silence(active_silence()).await.unwrap();
    let b = store.create_silence(active_silence()).await.unwrap();

    assert!(!a.id.is_empty());
    assert_ne!(a.id, b.id);
}

#[tokio::test]
async fn create_keeps_caller_id() {
    let (store, _clock) = store().await;
    let mut silence = active_silence();
    silence.id = Some("maint-42".to_string());

    let created = store.create_silence(silence).await.unwrap();

    assert_eq!(created.id, "maint-42");
}

#[tokio::test]
async fn create_duplicate_id_already_exists() {
    let (store, _clock) = store().await;
    let mut silence = active_silence();
    silence.id = Some("dup".to_string());

    store.create_silence(silence.clone()).await.unwrap();
    let result = store.create_silence(silence).await;

    assert!(matches!(result, Err(SilenceError::AlreadyExists { id }) if id == "dup"));
}

#[tokio::test]
async fn create_invalid_window_rejected() {
    let (store, _clock) = store().await;
    let mut silence = active_silence();
    silence.ends_at = silence.starts_at;

    let result = store.create_silence(silence).await;

    assert!(matches!(result, Err(SilenceError::Validation { .. })));
    assert_eq!(store.count_silences(&SilenceFilter::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn get_missing_is_not_found() {
    let (store, _clock) = store().await;

    let result = store.get_silence("nope").await;

    assert!(matches!(result, Err(SilenceError::NotFound { id }) if id == "nope"));
}

#[tokio::test]
async fn status_follows_the_clock() {
    let (store, clock) = store().await;
    let created = store
        .create_silence(new_silence(
            "alice",
            t0() + Duration::minutes(10),
            t0() + Duration::minutes(20),
        ))
        .await
        .unwrap();
    assert_eq!(created.status, SilenceStatus::Pending);

    clock.set(t0() + Duration::minutes(10));
    assert_eq!(
        store.get_silence(&created.id).await.unwrap().status,
        SilenceStatus::Active
    );

    clock.set(t0() + Duration::minutes(20));
    assert_eq!(
        store.get_silence(&created.id).await.unwrap().status,
        SilenceStatus::Expired
    );
}

#[tokio::test]
async fn update_applies_patch_and_rotates_token() {
    let (store, clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();
    clock.advance(Duration::seconds(5));

    let patch = SilencePatch::for_silence(&created)
        .comment("extended")
        .ends_at(t0() + Duration::hours(3));
    let updated = store.update_silence(&patch).await.unwrap();

    assert_eq!(updated.comment, "extended");
    assert_eq!(updated.ends_at, t0() + Duration::hours(3));
    assert_eq!(updated.updated_at, t0() + Duration::seconds(5));
    assert_eq!(updated.created_at, created.created_at);
    assert_eq!(updated.matchers, created.matchers);
    assert_eq!(store.get_silence(&created.id).await.unwrap(), updated);
}

#[tokio::test]
async fn update_token_changes_even_when_clock_is_frozen() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();

    let first = store
        .update_silence(&SilencePatch::for_silence(&created).comment("one"))
        .await
        .unwrap();
    let second = store
        .update_silence(&SilencePatch::for_silence(&first).comment("two"))
        .await
        .unwrap();

    assert!(first.updated_at > created.updated_at);
    assert!(second.updated_at > first.updated_at);
}

#[tokio::test]
async fn update_replaces_matchers() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();

    let patch =
        SilencePatch::for_silence(&created).matchers(vec![Matcher::not_equal("env", "prod")]);
    store.update_silence(&patch).await.unwrap();

    let fetched = store.get_silence(&created.id).await.unwrap();
    assert_eq!(fetched.matchers, vec![Matcher::not_equal("env", "prod")]);
}

#[tokio::test]
async fn update_with_stale_token_conflicts() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();
    store
        .update_silence(&SilencePatch::for_silence(&created).comment("first"))
        .await
        .unwrap();

    let result = store
        .update_silence(&SilencePatch::for_silence(&created).comment("second"))
        .await;

    assert!(matches!(result, Err(SilenceError::Conflict { .. })));
    assert_eq!(store.get_silence(&created.id).await.unwrap().comment, "first");
}

#[tokio::test]
async fn concurrent_updates_exactly_one_wins() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();

    let a = SilencePatch::for_silence(&created).comment("from a");
    let b = SilencePatch::for_silence(&created).comment("from b");
    let (ra, rb) = tokio::join!(store.update_silence(&a), store.update_silence(&b));

    let conflicts = [&ra, &rb]
        .iter()
        .filter(|r| matches!(r, Err(SilenceError::Conflict { .. })))
        .count();
    assert_eq!(conflicts, 1);
    assert!(ra.is_ok() || rb.is_ok());
}

#[tokio::test]
async fn update_missing_is_not_found() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();
    let mut patch = SilencePatch::for_silence(&created).comment("x");
    patch.id = "ghost".to_string();

    let result = store.update_silence(&patch).await;

    assert!(matches!(result, Err(SilenceError::NotFound { .. })));
}

#[tokio::test]
async fn update_invalid_merge_rejected() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();

    let patch = SilencePatch::for_silence(&created).ends_at(created.starts_at - Duration::hours(1));
    let result = store.update_silence(&patch).await;

    assert!(matches!(result, Err(SilenceError::Validation { .. })));
}

#[tokio::test]
async fn delete_removes_silence_and_matchers() {
    let (store, _clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();

    store.delete_silence(&created.id).await.unwrap();

    assert!(matches!(
        store.get_silence(&created.id).await,
        Err(SilenceError::NotFound { .. })
    ));
    let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM silence_matchers")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(orphans, 0);
}

#[tokio::test]
async fn delete_missing_is_not_found() {
    let (store, _clock) = store().await;
    assert!(matches!(
        store.delete_silence("nope").await,
        Err(SilenceError::NotFound { .. })
    ));
}

#[tokio::test]
async fn list_pages_do_not_overlap() {
    let (store, clock) = store().await;
    for _ in 0..15 {
        store.create_silence(active_silence()).await.unwrap();
        clock.advance(Duration::seconds(1));
    }

    let first = store
        .list_silences(&SilenceFilter::new().page(10, 0))
        .await
        .unwrap();
    let second = store
        .list_silences(&SilenceFilter::new().page(10, 10))
        .await
        .unwrap();

    assert_eq!(first.len(), 10);
    assert_eq!(second.len(), 5);
    assert!(first.iter().all(|a| second.iter().all(|b| a.id != b.id)));
    // Newest first by default.
    assert!(first.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    assert!(first[9].created_at >= second[0].created_at);
}

#[tokio::test]
async fn list_default_limit_applies() {
    let (store, _clock) = store().await;
    let store = store
        .with_config(StoreConfig {
            max_connections: 1,
            default_list_limit: 3,
            max_list_limit: 5,
            ..StoreConfig::default()
        })
        .unwrap();
    for _ in 0..8 {
        store.create_silence(active_silence()).await.unwrap();
    }

    assert_eq!(store.list_silences(&SilenceFilter::new()).await.unwrap().len(), 3);
    assert_eq!(
        store
            .list_silences(&SilenceFilter::new().page(50, 0))
            .await
            .unwrap()
            .len(),
        5
    );
}

#[tokio::test]
async fn list_filters_by_status() {
    let (store, _clock) = store().await;
    let pending = store
        .create_silence(new_silence("alice", t0() + Duration::hours(1), t0() + Duration::hours(2)))
        .await
        .unwrap();
    let active = store.create_silence(active_silence()).await.unwrap();
    let expired = store
        .create_silence(new_silence("alice", t0() - Duration::hours(2), t0() - Duration::hours(1)))
        .await
        .unwrap();

    let ids = |silences: Vec<Silence>| silences.into_iter().map(|s| s.id).collect::<Vec<_>>();

    let only_active = store
        .list_silences(&SilenceFilter::new().status(SilenceStatus::Active))
        .await
        .unwrap();
    assert_eq!(ids(only_active), vec![active.id.clone()]);

    let not_active = store
        .list_silences(
            &SilenceFilter::new()
                .status(SilenceStatus::Pending)
                .status(SilenceStatus::Expired)
                .sort(SortField::StartsAt, SortOrder::Asc),
        )
        .await
        .unwrap();
    assert_eq!(ids(not_active), vec![expired.id, pending.id]);
}

#[tokio::test]
async fn list_filters_by_creator_and_matcher() {
    let (store, _clock) = store().await;
    store.create_silence(active_silence()).await.unwrap();
    let bob = store
        .create_silence(
            NewSilence::builder("bob", "db upgrade")
                .window(t0(), t0() + Duration::hours(1))
                .matcher(Matcher::equal("service", "postgres-primary"))
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

    let by_creator = store
        .list_silences(&SilenceFilter::new().created_by("bob"))
        .await
        .unwrap();
    assert_eq!(by_creator.len(), 1);
    assert_eq!(by_creator[0].id, bob.id);

    let by_name = store
        .list_silences(&SilenceFilter::new().matcher_name("service"))
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);

    let by_value = store
        .list_silences(&SilenceFilter::new().matcher_value("postgres"))
        .await
        .unwrap();
    assert_eq!(by_value.len(), 1);
    // Matchers of the returned silence are complete, not just the hit.
    assert_eq!(by_value[0].matchers.len(), 1);

    let mismatched = store
        .list_silences(
            &SilenceFilter::new()
                .matcher_name("alertname")
                .matcher_value("postgres"),
        )
        .await
        .unwrap();
    assert!(mismatched.is_empty());
}

#[tokio::test]
async fn list_filters_by_time_range() {
    let (store, _clock) = store().await;
    let early = store
        .create_silence(new_silence("alice", t0(), t0() + Duration::hours(1)))
        .await
        .unwrap();
    let late = store
        .create_silence(new_silence("alice", t0() + Duration::hours(5), t0() + Duration::hours(6)))
        .await
        .unwrap();

    let filter = SilenceFilter {
        starts_after: Some(t0() + Duration::hours(1)),
        ..SilenceFilter::default()
    };
    let found = store.list_silences(&filter).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, late.id);

    let filter = SilenceFilter {
        ends_before: Some(t0() + Duration::hours(2)),
        ..SilenceFilter::default()
    };
    let found = store.list_silences(&filter).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, early.id);
}

#[tokio::test]
async fn count_ignores_pagination() {
    let (store, _clock) = store().await;
    for _ in 0..7 {
        store.create_silence(active_silence()).await.unwrap();
    }
    store
        .create_silence(new_silence("bob", t0() - Duration::hours(2), t0() - Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(
        store
            .count_silences(&SilenceFilter::new().page(2, 0))
            .await
            .unwrap(),
        8
    );
    assert_eq!(
        store
            .count_silences(&SilenceFilter::new().status(SilenceStatus::Active))
            .await
            .unwrap(),
        7
    );
}

#[tokio::test]
async fn soft_expire_is_idempotent() {
    let (store, clock) = store().await;
    let created = store.create_silence(active_silence()).await.unwrap();
    clock.advance(Duration::hours(2));

    let first = store
        .expire_silences(clock.now(), ExpireMode::SoftExpire)
        .await
        .unwrap();
    let second = store
        .expire_silences(clock.now(), ExpireMode::SoftExpire)
        .await
        .unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 0);
    let fetched = store.get_silence(&created.id).await.unwrap();
    assert_eq!(fetched.status, SilenceStatus::Expired);
    assert_eq!(fetched.updated_at, created.updated_at);
}

#[tokio::test]
async fn soft_expire_skips_live_silences() {
    let (store, _clock) = store().await;
    store.create_silence(active_silence()).await.unwrap();

    let affected = store
        .expire_silences(t0(), ExpireMode::SoftExpire)
        .await
        .unwrap();

    assert_eq!(affected, 0);
}

#[tokio::test]
async fn hard_delete_respects_retention_and_marking() {
    let (store, clock) = store().await;
    let old = store
        .create_silence(new_silence("alice", t0() - Duration::hours(30), t0() - Duration::hours(26)))
        .await
        .unwrap();
    let recent = store
        .create_silence(new_silence("alice", t0() - Duration::hours(2), t0() - Duration::hours(1)))
        .await
        .unwrap();
    let retention_cutoff = t0() - Duration::hours(24);

    // Nothing is marked yet, so nothing is deleted.
    assert_eq!(
        store
            .expire_silences(retention_cutoff, ExpireMode::HardDelete)
            .await
            .unwrap(),
        0
    );

    store
        .expire_silences(clock.now(), ExpireMode::SoftExpire)
        .await
        .unwrap();
    let deleted = store
        .expire_silences(retention_cutoff, ExpireMode::HardDelete)
        .await
        .unwrap();

    assert_eq!(deleted, 1);
    assert!(matches!(
        store.get_silence(&old.id).await,
        Err(SilenceError::NotFound { .. })
    ));
    assert!(store.get_silence(&recent.id).await.is_ok());
}

#[tokio::test]
async fn expiry_is_capped_per_call() {
    let (store, _clock) = store().await;
    let store = store
        .with_config(StoreConfig {
            max_connections: 1,
            expire_batch_size: 3,
            ..StoreConfig::default()
        })
        .unwrap();
    for _ in 0..5 {
        store
            .create_silence(new_silence("alice", t0() - Duration::hours(2), t0() - Duration::hours(1)))
            .await
            .unwrap();
    }

    assert_eq!(store.expire_silences(t0(), ExpireMode::SoftExpire).await.unwrap(), 3);
    assert_eq!(store.expire_silences(t0(), ExpireMode::SoftExpire).await.unwrap(), 2);
    assert_eq!(store.expire_silences(t0(), ExpireMode::SoftExpire).await.unwrap(), 0);
}

#[tokio::test]
async fn expiring_soon_orders_by_end() {
    let (store, _clock) = store().await;
    let later = store
        .create_silence(new_silence("alice", t0() - Duration::hours(1), t0() + Duration::minutes(10)))
        .await
        .unwrap();
    let sooner = store
        .create_silence(new_silence("alice", t0() - Duration::hours(1), t0() + Duration::minutes(5)))
        .await
        .unwrap();
    store
        .create_silence(new_silence("alice", t0() - Duration::hours(1), t0() + Duration::hours(3)))
        .await
        .unwrap();
    store
        .create_silence(new_silence("alice", t0() + Duration::minutes(1), t0() + Duration::minutes(2)))
        .await
        .unwrap();

    let found = store
        .expiring_soon(std::time::Duration::from_secs(15 * 60))
        .await
        .unwrap();

    let ids: Vec<_> = found.into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![sooner.id, later.id]);
}

#[tokio::test]
async fn bulk_expire_retimes_window() {
    let (store, _clock) = store().await;
    let active = store.create_silence(active_silence()).await.unwrap();
    let pending = store
        .create_silence(new_silence("alice", t0() + Duration::hours(1), t0() + Duration::hours(2)))
        .await
        .unwrap();

    let affected = store
        .bulk_update_status(
            &[active.id.clone(), pending.id.clone()],
            SilenceStatus::Expired,
        )
        .await
        .unwrap();

    assert_eq!(affected, 2);
    for id in [&active.id, &pending.id] {
        let silence = store.get_silence(id).await.unwrap();
        assert_eq!(silence.status, SilenceStatus::Expired);
        assert_eq!(silence.ends_at, t0());
        assert!(silence.starts_at < silence.ends_at);
    }
    let active_after = store.get_silence(&active.id).await.unwrap();
    assert!(active_after.updated_at > active.updated_at);
}

#[tokio::test]
async fn bulk_activate_pulls_start_forward() {
    let (store, _clock) = store().await;
    let pending = store
        .create_silence(new_silence("alice", t0() + Duration::hours(1), t0() + Duration::hours(2)))
        .await
        .unwrap();

    store
        .bulk_update_status(&[pending.id.clone()], SilenceStatus::Active)
        .await
        .unwrap();

    let silence = store.get_silence(&pending.id).await.unwrap();
    assert_eq!(silence.status, SilenceStatus::Active);
    assert_eq!(silence.starts_at, t0());
    assert_eq!(silence.ends_at, pending.ends_at);
}

#[tokio::test]
async fn bulk_update_is_all_or_nothing() {
    let (store, _clock) = store().await;
    let active = store.create_silence(active_silence()).await.unwrap();

    let result = store
        .bulk_update_status(
            &[active.id.clone(), "missing".to_string()],
            SilenceStatus::Expired,
        )
        .await;

    assert!(matches!(result, Err(SilenceError::NotFound { id }) if id == "missing"));
    let untouched = store.get_silence(&active.id).await.unwrap();
    assert_eq!(untouched, active);
}

#[tokio::test]
async fn bulk_cannot_revive_ended_silence() {
    let (store, _clock) = store().await;
    let expired = store
        .create_silence(new_silence("alice", t0() - Duration::hours(2), t0() - Duration::hours(1)))
        .await
        .unwrap();

    let result = store
        .bulk_update_status(&[expired.id.clone()], SilenceStatus::Active)
        .await;

    assert!(matches!(result, Err(SilenceError::Validation { .. })));
}

#[tokio::test]
async fn bulk_pending_is_rejected() {
    let (store, _clock) = store().await;
    let active = store.create_silence(active_silence()).await.unwrap();

    let result = store
        .bulk_update_status(&[active.id], SilenceStatus::Pending)
        .await;

    assert!(matches!(result, Err(SilenceError::Validation { .. })));
}

#[tokio::test]
async fn all_silences_returns_everything_with_matchers() {
    let (store, _clock) = store().await;
    for _ in 0..3 {
        store.create_silence(active_silence()).await.unwrap();
    }

    let all = store.all_silences().await.unwrap();

    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|s| s.matchers.len() == 2));
}

#[tokio::test]
async fn file_store_persists_across_reopen() {
    let dir = std::env::temp_dir().join(format!("silencer-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.join("silences.db").display());
    let clock: crate::clock::SharedClock = Arc::new(ManualClock::new(t0()));

    let store = SqliteStore::connect(&url, StoreConfig::default(), Arc::clone(&clock))
        .await
        .unwrap();
    let created = store.create_silence(active_silence()).await.unwrap();
    store.close().await;

    let reopened = SqliteStore::connect(&url, StoreConfig::default(), clock)
        .await
        .unwrap();
    assert_eq!(reopened.get_silence(&created.id).await.unwrap(), created);
    reopened.close().await;

    std::fs::remove_dir_all(&dir).unwrap();
}
