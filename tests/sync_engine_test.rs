mod common;

use anyhow::anyhow;
use common::*;
use std::time::Duration;

use content_sync::db;
use content_sync::error::ErrorKind;
use content_sync::model::{CacheMode, DownloadStatus, NewOutboxRecord, PayloadMode, SyncResult};
use content_sync::remote::model::PullResponse;
use content_sync::sync::SyncOptions;

#[tokio::test]
async fn minimal_pull_stores_summaries_and_advances_cursor() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![unit_entry("u1", "Greetings"), unit_entry("u2", "Numbers")],
        "c1",
    ))]);
    let h = Harness::new(pull).await;

    let outcome = h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    assert_eq!(outcome.units_applied, 2);
    assert_eq!(outcome.cursor.as_deref(), Some("c1"));
    assert!(!outcome.coalesced);

    let u1 = db::get_unit(&h.pool, "u1").await.unwrap().unwrap();
    assert_eq!(u1.cache_mode, CacheMode::Minimal);
    assert_eq!(u1.download_status, DownloadStatus::Idle);
    assert_eq!(u1.title, "Greetings");
    assert!(u1.unit_payload.body.contains("owner_id"));

    let state = db::get_sync_state(&h.pool).await.unwrap();
    assert_eq!(state.cursor.as_deref(), Some("c1"));
    assert!(state.last_pulled_at.is_some());
}

#[tokio::test]
async fn incremental_pull_sends_stored_cursor_and_force_drops_it() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(vec![unit_entry("u1", "Greetings")], "c1")),
        Ok(response(vec![], "c2")),
        Ok(response(vec![], "c3")),
    ]);
    let h = Harness::new(pull).await;

    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    h.engine
        .run_sync_cycle(&SyncOptions::minimal().forced())
        .await
        .unwrap();

    let calls = h.pull.calls().await;
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].cursor, None);
    assert_eq!(calls[1].cursor.as_deref(), Some("c1"));
    assert_eq!(calls[2].cursor, None);
    assert!(calls[2].force);
    let state = db::get_sync_state(&h.pool).await.unwrap();
    assert_eq!(state.cursor.as_deref(), Some("c3"));
}

#[tokio::test]
async fn scoped_pull_keeps_global_cursor() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(vec![unit_entry("u1", "Greetings")], "c1")),
        Ok(response(
            vec![with_lessons(unit_entry("u2", "Numbers"), &["l1"])],
            "scoped-cursor",
        )),
    ]);
    let h = Harness::new(pull).await;

    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    h.engine
        .run_sync_cycle(&SyncOptions::full().for_units(vec!["u2".into()]))
        .await
        .unwrap();

    let calls = h.pull.calls().await;
    assert_eq!(calls[1].unit_ids, vec!["u2".to_string()]);
    assert_eq!(calls[1].payload, PayloadMode::Full);
    let state = db::get_sync_state(&h.pool).await.unwrap();
    assert_eq!(state.cursor.as_deref(), Some("c1"));
    assert!(db::get_unit(&h.pool, "u2").await.unwrap().is_some());
}

#[tokio::test]
async fn minimal_pull_leaves_completed_download_untouched() {
    let full = with_assets(with_lessons(unit_entry("u1", "Greetings"), &["l1", "l2"]), &["a1"]);
    let mut renamed = unit_entry("u1", "Greetings, revised");
    renamed.summary.updated_at = ts(500);
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(vec![unit_entry("u1", "Greetings")], "c1")),
        Ok(response(vec![full], "c2")),
        Ok(response(vec![renamed], "c3")),
    ]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();

    let pending = h.engine.request_unit_download("u1").await.unwrap();
    let report = pending.handle.await.unwrap().unwrap();
    assert!(report.is_success());
    let before = db::get_unit(&h.pool, "u1").await.unwrap().unwrap();
    assert_eq!(before.download_status, DownloadStatus::Completed);

    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();

    let after = db::get_unit(&h.pool, "u1").await.unwrap().unwrap();
    assert_eq!(after.title, "Greetings, revised");
    assert_eq!(after.cache_mode, CacheMode::Full);
    assert_eq!(after.download_status, DownloadStatus::Completed);
    assert_eq!(after.downloaded_at, before.downloaded_at);
    assert_eq!(db::list_lessons(&h.pool, "u1").await.unwrap().len(), 2);
    let assets = db::list_assets(&h.pool, "u1").await.unwrap();
    assert_eq!(assets[0].status, DownloadStatus::Completed);
}

#[tokio::test]
async fn forced_pull_purges_tombstoned_units() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(
            vec![
                unit_entry("u1", "Greetings"),
                with_assets(with_lessons(unit_entry("u2", "Numbers"), &["l1"]), &["a1"]),
            ],
            "c1",
        )),
        Ok(PullResponse {
            deleted_unit_ids: vec!["u2".into()],
            cursor: Some("c2".into()),
            ..Default::default()
        }),
    ]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::full()).await.unwrap();
    h.engine.fetcher().download_unit_assets("u2").await.unwrap();
    let unit_dir = h.engine.fetcher().unit_dir("u2");
    assert!(unit_dir.exists());

    let outcome = h
        .engine
        .run_sync_cycle(&SyncOptions::minimal().forced())
        .await
        .unwrap();
    assert_eq!(outcome.units_deleted, 1);
    assert!(db::get_unit_detail(&h.pool, "u2").await.unwrap().is_none());
    assert!(db::list_lessons(&h.pool, "u2").await.unwrap().is_empty());
    assert!(db::list_assets(&h.pool, "u2").await.unwrap().is_empty());
    assert!(!unit_dir.exists());
    assert!(db::get_unit(&h.pool, "u1").await.unwrap().is_some());
}

#[tokio::test]
async fn incremental_pull_applies_lesson_tombstones() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(
            vec![with_lessons(unit_entry("u1", "Greetings"), &["l1", "l2"])],
            "c1",
        )),
        Ok(PullResponse {
            deleted_lesson_ids: vec!["l1".into()],
            cursor: Some("c2".into()),
            ..Default::default()
        }),
    ]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::full()).await.unwrap();
    let outcome = h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    assert_eq!(outcome.lessons_deleted, 1);
    let lessons = db::list_lessons(&h.pool, "u1").await.unwrap();
    assert_eq!(lessons.len(), 1);
    assert_eq!(lessons[0].id, "l2");
}

#[tokio::test]
async fn failed_pull_keeps_cursor_and_cache() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(vec![unit_entry("u1", "Greetings")], "c1")),
        Err(anyhow!("connection refused")),
    ]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();

    let err = h
        .engine
        .run_sync_cycle(&SyncOptions::minimal())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.to_string().contains("connection refused"));

    let state = db::get_sync_state(&h.pool).await.unwrap();
    assert_eq!(state.cursor.as_deref(), Some("c1"));
    assert!(db::get_unit(&h.pool, "u1").await.unwrap().is_some());

    let status = h.engine.status().await.unwrap();
    assert_eq!(status.last_sync_result, SyncResult::Error);
    assert!(status
        .last_sync_error
        .unwrap()
        .contains("connection refused"));
    assert_eq!(status.last_cursor.as_deref(), Some("c1"));
}

#[tokio::test]
async fn overlapping_cycles_share_one_pull() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![unit_entry("u1", "Greetings")],
        "c1",
    ))])
    .delayed(Duration::from_millis(50));
    let h = Harness::new(pull).await;

    let options = SyncOptions::minimal();
    let (first, second) = tokio::join!(
        h.engine.run_sync_cycle(&options),
        h.engine.run_sync_cycle(&options)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(h.pull.calls().await.len(), 1);
    assert_eq!(h.pull.max_in_flight(), 1);
    assert!(first.coalesced != second.coalesced);
    assert_eq!(first.units_applied, second.units_applied);
}

#[tokio::test]
async fn stronger_request_waits_then_pulls_again() {
    let pull = ScriptedPull::with_responses(vec![
        Ok(response(vec![unit_entry("u1", "Greetings")], "c1")),
        Ok(response(vec![], "c2")),
    ])
    .delayed(Duration::from_millis(30));
    let h = Harness::new(pull).await;

    let minimal = SyncOptions::minimal();
    let forced = SyncOptions::full().forced();
    let (first, second) = tokio::join!(
        h.engine.run_sync_cycle(&minimal),
        h.engine.run_sync_cycle(&forced)
    );
    assert!(!first.unwrap().coalesced);
    assert!(!second.unwrap().coalesced);
    assert_eq!(h.pull.calls().await.len(), 2);
    assert_eq!(h.pull.max_in_flight(), 1);
}

#[tokio::test]
async fn anonymous_session_skips_sync() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![unit_entry("u1", "Greetings")],
        "c1",
    ))]);
    let h = Harness::anonymous(pull).await;
    let outcome = h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    assert!(outcome.anonymous);
    assert!(h.pull.calls().await.is_empty());
    assert_eq!(db::count_units(&h.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn cycle_drains_outbox_after_pull() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![unit_entry("u1", "Greetings")],
        "c1",
    ))]);
    let h = Harness::new(pull).await;
    for key in ["progress-l1", "progress-l2"] {
        h.engine
            .outbox()
            .enqueue(&NewOutboxRecord::new(
                "POST",
                "v1/progress",
                serde_json::json!({ "lesson": key }),
                key,
            ))
            .await
            .unwrap();
    }
    h.push.fail_next("503 service unavailable").await;
    let outcome = h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();

    assert_eq!(outcome.units_applied, 1);
    let report = outcome.outbox.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.remaining, 2);
    assert!(outcome.outbox_error.is_some());
    assert!(db::get_unit(&h.pool, "u1").await.unwrap().is_some());
    assert_eq!(h.push.calls().await, vec!["progress-l1"]);

    let report = h.engine.drain_outbox().await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(
        h.push.calls().await,
        vec!["progress-l1", "progress-l1", "progress-l2"]
    );
    let status = h.engine.status().await.unwrap();
    assert_eq!(status.pending_writes, 0);
    assert_eq!(status.last_sync_result, SyncResult::Success);
}

#[tokio::test]
async fn startup_marks_interrupted_downloads_failed() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![with_assets(unit_entry("u1", "Greetings"), &["a1"])],
        "c1",
    ))]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();
    h.engine.begin_unit_download("u1").await.unwrap();
    db::mark_asset_pending(&h.pool, "a1").await.unwrap();

    let (units, assets) = h.engine.reconcile_interrupted_downloads().await.unwrap();
    assert_eq!((units, assets), (1, 1));

    let unit = db::get_unit(&h.pool, "u1").await.unwrap().unwrap();
    assert_eq!(unit.cache_mode, CacheMode::Full);
    assert_eq!(unit.download_status, DownloadStatus::Failed);
    let asset = db::get_asset(&h.pool, "a1").await.unwrap().unwrap();
    assert_eq!(asset.status, DownloadStatus::Failed);
    assert_eq!(asset.last_error.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn status_counts_cache_modes() {
    let pull = ScriptedPull::with_responses(vec![Ok(response(
        vec![
            unit_entry("u1", "Greetings"),
            unit_entry("u2", "Numbers"),
            with_lessons(unit_entry("u3", "Colours"), &["l1"]),
        ],
        "c1",
    ))]);
    let h = Harness::new(pull).await;
    h.engine.run_sync_cycle(&SyncOptions::minimal()).await.unwrap();

    let status = h.engine.status().await.unwrap();
    assert_eq!(status.cache_mode_counts.minimal, 2);
    assert_eq!(status.cache_mode_counts.full, 1);
    assert_eq!(status.last_sync_result, SyncResult::Success);
    assert!(status.last_sync_attempt.is_some());
}
