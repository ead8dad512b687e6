//! Event log contract: durable store, filtered query, stats, pruning,
//! replay, and the set-once processed_at stamp.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use event_core::{EventFilter, EventSink, SqliteEventStore};
use ve_protocol::{Event, EventKind, Severity};

fn store() -> SqliteEventStore {
    SqliteEventStore::open_in_memory().expect("in-memory store")
}

fn event_at(id: &str, kind: EventKind, severity: Severity, minute: u32) -> Event {
    let mut event = Event::new(kind, severity, "title", "message");
    event.id = id.to_owned();
    event.timestamp = Utc.with_ymd_and_hms(2025, 8, 1, 10, minute, 0).unwrap();
    event
}

#[test]
fn store_then_get_by_id_round_trips() {
    let store = store();
    let event = event_at("evt-1", EventKind::VerificationCompleted, Severity::Info, 0)
        .with_model("m1")
        .with_verification("ver-1")
        .with_detail("checks_passed", 48);
    store.store(&event).expect("store");

    let loaded = store
        .get_by_id("evt-1")
        .expect("get_by_id")
        .expect("event must exist");
    assert_eq!(loaded, event);

    assert!(store.get_by_id("missing").expect("get_by_id").is_none());
}

#[test]
fn open_on_disk_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.db");
    {
        let store = SqliteEventStore::open(&path).expect("open");
        store
            .store(&event_at(
                "evt-disk",
                EventKind::ModelAdded,
                Severity::Info,
                0,
            ))
            .expect("store");
    }
    let store = SqliteEventStore::open(&path).expect("reopen");
    assert!(store.get_by_id("evt-disk").expect("get").is_some());
}

#[test]
fn query_filters_by_kind_severity_and_correlation() {
    let store = store();
    store
        .store(
            &event_at("evt-1", EventKind::ScoreChanged, Severity::Info, 0).with_model("m1"),
        )
        .expect("store");
    store
        .store(
            &event_at("evt-2", EventKind::IssueDetected, Severity::Error, 1).with_model("m1"),
        )
        .expect("store");
    store
        .store(
            &event_at("evt-3", EventKind::IssueDetected, Severity::Critical, 2).with_model("m2"),
        )
        .expect("store");

    let by_kind = store
        .query(&EventFilter::new().kind(EventKind::IssueDetected))
        .expect("query");
    assert_eq!(by_kind.len(), 2);

    let severe = store
        .query(&EventFilter::new().min_severity(Severity::Error))
        .expect("query");
    assert_eq!(severe.len(), 2);

    let for_model = store
        .query(&EventFilter::new().model("m1"))
        .expect("query");
    assert_eq!(for_model.len(), 2);

    let conjunction = store
        .query(
            &EventFilter::new()
                .kind(EventKind::IssueDetected)
                .min_severity(Severity::Error)
                .model("m2"),
        )
        .expect("query");
    assert_eq!(conjunction.len(), 1);
    assert_eq!(conjunction[0].id, "evt-3");
}

#[test]
fn query_returns_newest_first_and_honours_limit_and_window() {
    let store = store();
    for minute in 0..10 {
        store
            .store(&event_at(
                &format!("evt-{minute}"),
                EventKind::ScoreChanged,
                Severity::Info,
                minute,
            ))
            .expect("store");
    }

    let newest_first = store.query(&EventFilter::new()).expect("query");
    assert_eq!(newest_first[0].id, "evt-9");
    assert_eq!(newest_first[9].id, "evt-0");

    let limited = store.query(&EventFilter::new().limit(3)).expect("query");
    assert_eq!(limited.len(), 3);
    assert_eq!(limited[0].id, "evt-9");

    let windowed = store
        .query(
            &EventFilter::new()
                .since(Utc.with_ymd_and_hms(2025, 8, 1, 10, 3, 0).unwrap())
                .until(Utc.with_ymd_and_hms(2025, 8, 1, 10, 5, 0).unwrap()),
        )
        .expect("query");
    assert_eq!(windowed.len(), 3);
    assert_eq!(windowed[0].id, "evt-5");
    assert_eq!(windowed[2].id, "evt-3");
}

#[test]
fn stats_count_severities_and_track_bounds() {
    let store = store();
    store
        .store(&event_at("evt-1", EventKind::ScoreChanged, Severity::Info, 0))
        .expect("store");
    store
        .store(&event_at("evt-2", EventKind::IssueDetected, Severity::Warning, 1))
        .expect("store");
    store
        .store(&event_at("evt-3", EventKind::IssueDetected, Severity::Error, 2))
        .expect("store");
    store
        .store(&event_at("evt-4", EventKind::SecurityAlert, Severity::Critical, 3))
        .expect("store");
    store
        .mark_processed("evt-1", Utc::now())
        .expect("mark_processed");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.total, 4);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.critical, 1);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.warning, 1);
    assert_eq!(
        stats.oldest.unwrap(),
        Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap()
    );
    assert_eq!(
        stats.newest.unwrap(),
        Utc.with_ymd_and_hms(2025, 8, 1, 10, 3, 0).unwrap()
    );
}

#[test]
fn delete_older_than_prunes_and_reports_count() {
    let store = store();
    let mut old = event_at("evt-old", EventKind::ScoreChanged, Severity::Info, 0);
    old.timestamp = Utc::now() - chrono::Duration::hours(48);
    store.store(&old).expect("store");

    let mut fresh = event_at("evt-fresh", EventKind::ScoreChanged, Severity::Info, 0);
    fresh.timestamp = Utc::now();
    store.store(&fresh).expect("store");

    let deleted = store
        .delete_older_than(Duration::from_secs(24 * 60 * 60))
        .expect("delete");
    assert_eq!(deleted, 1);
    assert!(store.get_by_id("evt-old").expect("get").is_none());
    assert!(store.get_by_id("evt-fresh").expect("get").is_some());
}

#[test]
fn delete_older_than_with_oversized_age_is_a_no_op() {
    let store = store();
    store
        .store(&event_at("evt-1", EventKind::ScoreChanged, Severity::Info, 0))
        .expect("store");

    // Far beyond chrono's representable range: must not panic, must not
    // delete anything.
    let deleted = store
        .delete_older_than(Duration::from_secs(u64::MAX))
        .expect("oversized age");
    assert_eq!(deleted, 0);
    assert!(store.get_by_id("evt-1").expect("get").is_some());
}

#[test]
fn replay_is_chronological_and_respects_kind_filter() {
    let store = store();
    store
        .store(&event_at("evt-0", EventKind::ScoreChanged, Severity::Info, 0))
        .expect("store");
    store
        .store(&event_at("evt-1", EventKind::IssueDetected, Severity::Error, 1))
        .expect("store");
    store
        .store(&event_at("evt-2", EventKind::ScoreChanged, Severity::Info, 2))
        .expect("store");

    let mut seen = Vec::new();
    let since = Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap();
    let replayed = store
        .replay(since, &[EventKind::ScoreChanged], &mut |event| {
            seen.push(event.id);
            Ok(())
        })
        .expect("replay");
    assert_eq!(replayed, 2);
    assert_eq!(seen, vec!["evt-0", "evt-2"], "ascending order");

    // `since` is inclusive and later cursors skip earlier events.
    let mut seen = Vec::new();
    let since = Utc.with_ymd_and_hms(2025, 8, 1, 10, 1, 0).unwrap();
    store
        .replay(since, &[], &mut |event| {
            seen.push(event.id);
            Ok(())
        })
        .expect("replay");
    assert_eq!(seen, vec!["evt-1", "evt-2"]);
}

#[test]
fn replay_callback_error_aborts_and_surfaces() {
    let store = store();
    for minute in 0..3 {
        store
            .store(&event_at(
                &format!("evt-{minute}"),
                EventKind::ScoreChanged,
                Severity::Info,
                minute,
            ))
            .expect("store");
    }

    let mut calls = 0;
    let since = Utc.with_ymd_and_hms(2025, 8, 1, 10, 0, 0).unwrap();
    let result = store.replay(since, &[], &mut |_event| {
        calls += 1;
        if calls == 2 {
            Err("consumer went away".into())
        } else {
            Ok(())
        }
    });
    assert!(matches!(
        result,
        Err(event_core::StoreError::ReplayAborted(_))
    ));
    assert_eq!(calls, 2, "replay must stop at the failing callback");
}

#[test]
fn mark_processed_is_set_once() {
    let store = store();
    store
        .store(&event_at("evt-1", EventKind::ScoreChanged, Severity::Info, 0))
        .expect("store");

    let first = Utc.with_ymd_and_hms(2025, 8, 1, 11, 0, 0).unwrap();
    store.mark_processed("evt-1", first).expect("mark");
    let second = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
    store.mark_processed("evt-1", second).expect("mark again");

    let loaded = store.get_by_id("evt-1").expect("get").expect("exists");
    assert_eq!(loaded.processed_at, Some(first));
}
