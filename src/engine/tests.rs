use super::*;
use crate::config::{ResetPolicy, RetryPolicy};
use crate::model::*;
use crate::realtime::{FeedState, SubscriptionEvent};
use crate::store::collections::{BOOKINGS, NOTIFICATIONS, SLOTS};
use crate::store::{Filter, MemoryBackend, MemoryConnector, StoreError};

use chrono::NaiveDate;
use proptest::prelude::*;
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
        reset: ResetPolicy {
            settle_delay: Duration::from_millis(1),
            ..ResetPolicy::default()
        },
        ..EngineConfig::default()
    }
}

async fn test_engine() -> (Engine, Arc<MemoryConnector>) {
    let connector = Arc::new(MemoryConnector::new(MemoryBackend::new()));
    let engine = Engine::connect(connector.clone(), fast_config())
        .await
        .unwrap();
    (engine, connector)
}

fn t(s: &str) -> ClockTime {
    s.parse().unwrap()
}

fn day(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn request(date: &str, start: &str, end: &str) -> NewBooking {
    NewBooking {
        patient_id: "pat".into(),
        professional_id: "pro".into(),
        patient_name: "Ana Souza".into(),
        professional_name: "Dr. Reis".into(),
        date: day(date),
        start_time: t(start),
        end_time: t(end),
        price: 150.0,
        session_type: SessionType::Video,
        notes: None,
    }
}

fn candidate(date: &str, time: &str) -> SlotCandidate {
    SlotCandidate {
        date: day(date),
        time: t(time),
        duration_minutes: 60,
    }
}

async fn notifications_for(engine: &Engine, recipient: &str) -> Vec<Notification> {
    let docs = engine
        .connection()
        .store()
        .unwrap()
        .query(NOTIFICATIONS, &[Filter::eq("recipientId", recipient)])
        .await
        .unwrap();
    docs.iter()
        .map(|d| crate::store::from_document(&d.data).unwrap())
        .collect()
}

// ── Creation and conflicts ───────────────────────────────

#[tokio::test]
async fn overlapping_request_is_rejected() {
    let (engine, connector) = test_engine().await;
    let first = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    assert_eq!(first.status, BookingStatus::Pending);
    assert_eq!(first.duration_minutes, 60);

    let err = engine
        .create_booking(request("2025-01-06", "09:30", "10:30"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SlotConflict(first.id.clone()));
    assert_eq!(connector.backend().document_count(BOOKINGS), 1);
}

#[tokio::test]
async fn back_to_back_and_other_days_are_allowed() {
    let (engine, _) = test_engine().await;
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .create_booking(request("2025-01-06", "10:00", "11:00"))
        .await
        .unwrap();
    engine
        .create_booking(request("2025-01-07", "09:00", "10:00"))
        .await
        .unwrap();

    let mut other_pro = request("2025-01-06", "09:00", "10:00");
    other_pro.professional_id = "pro2".into();
    engine.create_booking(other_pro).await.unwrap();

    assert_eq!(
        engine
            .bookings_for_professional("pro", Some(day("2025-01-06")))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(engine.bookings_for_patient("pat").await.unwrap().len(), 4);
}

#[tokio::test]
async fn cancelled_booking_no_longer_blocks() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    engine.cancel_booking(&b.id, Actor::Patient).await.unwrap();
    engine
        .create_booking(request("2025-01-06", "09:30", "10:30"))
        .await
        .unwrap();
}

#[tokio::test]
async fn invalid_request_writes_nothing() {
    let (engine, connector) = test_engine().await;
    let err = engine
        .create_booking(request("2025-01-06", "10:00", "09:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(connector.backend().document_count(BOOKINGS), 0);
}

#[tokio::test]
async fn creation_notifies_professional() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    let inbox = notifications_for(&engine, "pro").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::BookingRequested);
    assert_eq!(inbox[0].related_id, b.id);
    assert!(inbox[0].body.contains("Ana Souza"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_exactly_one() {
    let (engine, connector) = test_engine().await;
    let engine = Arc::new(engine);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            let mut req = request("2025-01-06", "09:00", "10:00");
            req.patient_id = format!("pat{i}");
            engine.create_booking(req).await
        }));
    }
    let mut ok = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::SlotConflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(connector.backend().document_count(BOOKINGS), 1);
}

#[tokio::test]
async fn scope_locks_are_released_after_use() {
    let (engine, _) = test_engine().await;
    for i in 0..20 {
        let mut req = request("2025-01-06", "09:00", "10:00");
        req.professional_id = format!("pro{i}");
        let b = engine.create_booking(req).await.unwrap();
        engine.cancel_booking(&b.id, Actor::Patient).await.unwrap();
    }
    engine
        .remove_slot("pro0", day("2025-01-06"), t("09:00"))
        .await
        .unwrap_err();
    assert_eq!(engine.scope_locks.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_scope_lock_survives_until_last_holder() {
    let (engine, _) = test_engine().await;
    let engine = Arc::new(engine);
    let first = engine.lock_scope("pro|2025-01-06".into()).await;
    let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let _second = engine.lock_scope("pro|2025-01-06".into()).await;
            acquired_tx.send(()).unwrap();
            let _ = release_rx.await;
        })
    };
    while Arc::strong_count(engine.scope_locks.get("pro|2025-01-06").unwrap().value()) < 2 {
        tokio::task::yield_now().await;
    }
    drop(first);
    acquired_rx.await.unwrap();
    assert_eq!(engine.scope_locks.len(), 1, "live holder keeps the entry");
    release_tx.send(()).unwrap();
    waiter.await.unwrap();
    assert_eq!(engine.scope_locks.len(), 0);
}

// ── Advisory availability ────────────────────────────────

#[tokio::test]
async fn check_availability_reports_overlap() {
    let (engine, _) = test_engine().await;
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    let d = day("2025-01-06");
    assert!(!engine.check_availability("pro", d, t("09:30"), t("10:30")).await);
    assert!(engine.check_availability("pro", d, t("10:00"), t("11:00")).await);
    assert!(engine.check_availability("pro", d, t("08:00"), t("09:00")).await);
    assert!(engine.check_availability("other", d, t("09:00"), t("10:00")).await);
}

#[tokio::test]
async fn check_availability_fails_open() {
    let (engine, connector) = test_engine().await;
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    for _ in 0..3 {
        connector
            .backend()
            .inject_fault(StoreError::Unavailable("offline".into()));
    }
    assert!(
        engine
            .check_availability("pro", day("2025-01-06"), t("09:00"), t("10:00"))
            .await
    );
}

fn minutes() -> impl Strategy<Value = u16> {
    0u16..1440
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn check_availability_matches_overlap_predicate(
        a in minutes(), b in minutes(), c in minutes(), d in minutes()
    ) {
        let (s_min, e_min) = (a.min(b), a.max(b));
        prop_assume!(s_min < e_min);
        let (s, e) = (
            ClockTime::from_hm(s_min / 60, s_min % 60).unwrap(),
            ClockTime::from_hm(e_min / 60, e_min % 60).unwrap(),
        );
        let (qs, qe) = (
            ClockTime::from_hm(c / 60, c % 60).unwrap(),
            ClockTime::from_hm(d / 60, d % 60).unwrap(),
        );
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let free = rt.block_on(async {
            let (engine, _) = test_engine().await;
            let mut req = request("2025-01-06", "09:00", "10:00");
            req.start_time = s;
            req.end_time = e;
            engine.create_booking(req).await.unwrap();
            engine.check_availability("pro", day("2025-01-06"), qs, qe).await
        });
        prop_assert_eq!(free, !(qs < e && qe > s));
    }
}

// ── Transitions ──────────────────────────────────────────

#[tokio::test]
async fn confirm_emits_one_notification_and_one_status_change() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    let mut status_rx = engine.status.subscribe("pat");

    let confirmed = engine.confirm_booking(&b.id).await.unwrap();
    assert_eq!(confirmed.status, BookingStatus::Confirmed);
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status,
        BookingStatus::Confirmed
    );

    let inbox = notifications_for(&engine, "pat").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::BookingConfirmed);
    assert_eq!(inbox[0].related_type, "booking");

    let change = status_rx.recv().await.unwrap();
    assert_eq!(change.status, BookingStatus::Confirmed);
    assert_eq!(change.professional_name, "Dr. Reis");
    assert_eq!(change.start_time, t("09:00"));
    assert!(status_rx.try_recv().is_err());
    assert_eq!(
        engine.status.latest(&format!("pat/{}", b.id)).map(|c| c.status),
        Some(BookingStatus::Confirmed)
    );
}

#[tokio::test]
async fn complete_records_notes_without_status_event() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    engine.confirm_booking(&b.id).await.unwrap();
    let mut status_rx = engine.status.subscribe("pat");

    let done = engine
        .complete_booking(&b.id, Some("follow up in 2 weeks".into()))
        .await
        .unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    let stored = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(stored.notes.as_deref(), Some("follow up in 2 weeks"));
    assert!(status_rx.try_recv().is_err());

    let kinds: Vec<_> = notifications_for(&engine, "pat")
        .await
        .into_iter()
        .map(|n| n.kind)
        .collect();
    assert!(kinds.contains(&NotificationKind::BookingCompleted));
}

#[tokio::test]
async fn complete_on_cancelled_is_invalid_and_writes_nothing() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    let cancelled = engine.cancel_booking(&b.id, Actor::Patient).await.unwrap();
    let inbox_before = notifications_for(&engine, "pro").await.len();

    let err = engine.complete_booking(&b.id, None).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            action: "complete"
        }
    );
    let stored = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(stored.updated_at, cancelled.updated_at);
    assert_eq!(notifications_for(&engine, "pro").await.len(), inbox_before);
}

#[tokio::test]
async fn cancel_notifies_the_other_side() {
    let (engine, _) = test_engine().await;
    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .cancel_booking(&b.id, Actor::Professional)
        .await
        .unwrap();
    let inbox = notifications_for(&engine, "pat").await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, NotificationKind::BookingCancelled);
}

#[tokio::test]
async fn transition_on_missing_booking_is_not_found() {
    let (engine, _) = test_engine().await;
    assert!(matches!(
        engine.confirm_booking("nope").await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Transport failures ───────────────────────────────────

#[tokio::test]
async fn write_surfaces_typed_error_when_store_is_down() {
    let (engine, connector) = test_engine().await;
    for _ in 0..3 {
        connector
            .backend()
            .inject_fault(StoreError::Unavailable("offline".into()));
    }
    let err = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TransportUnavailable(_)));
    assert!(err.is_transport());
}

#[tokio::test]
async fn fatal_error_is_recovered_once_then_write_succeeds() {
    let (engine, connector) = test_engine().await;
    connector
        .backend()
        .inject_fault(StoreError::Internal("INTERNAL ASSERTION FAILED: Unexpected state".into()));
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    assert_eq!(connector.connect_count(), 2);
    assert!(engine.connection().is_ready());
}

#[tokio::test]
async fn permission_denied_is_not_retried() {
    let (engine, connector) = test_engine().await;
    connector
        .backend()
        .inject_fault(StoreError::PermissionDenied("rules".into()));
    let err = engine.get_booking("x").await.unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
    assert_eq!(connector.connect_count(), 1);
}

// ── Slots ────────────────────────────────────────────────

#[tokio::test]
async fn booking_claims_and_cancel_releases_slot() {
    let (engine, _) = test_engine().await;
    let d = day("2025-01-06");
    engine
        .publish_slots(
            "pro",
            &[candidate("2025-01-06", "09:00"), candidate("2025-01-06", "10:00")],
            None,
        )
        .await
        .unwrap();

    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    let slots = engine.slots_for_owner("pro", d, d).await.unwrap();
    assert!(slots[0].is_booked);
    assert_eq!(slots[0].booking_ref.as_deref(), Some(b.id.as_str()));
    let free = engine.available_slots("pro", d, d).await.unwrap();
    assert_eq!(free.iter().map(|s| s.time).collect::<Vec<_>>(), vec![t("10:00")]);

    engine.cancel_booking(&b.id, Actor::Patient).await.unwrap();
    let slots = engine.slots_for_owner("pro", d, d).await.unwrap();
    assert!(!slots[0].is_booked);
    assert!(slots[0].booking_ref.is_none());
    assert_eq!(engine.available_slots("pro", d, d).await.unwrap().len(), 2);
}

#[tokio::test]
async fn active_booking_hides_slot_even_if_flag_is_stale() {
    let (engine, connector) = test_engine().await;
    let d = day("2025-01-06");
    // Booking first, slot published afterwards: the slot flag never got set.
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    engine
        .publish_slots("pro", &[candidate("2025-01-06", "09:00")], None)
        .await
        .unwrap();
    assert_eq!(connector.backend().document_count("slots"), 1);
    assert!(engine.available_slots("pro", d, d).await.unwrap().is_empty());
}

#[tokio::test]
async fn generate_and_publish_skips_existing_keys() {
    let (engine, _) = test_engine().await;
    let schedule = WeeklySchedule::new().with_day(DayOfWeek::Monday, t("09:00"), t("11:00"));
    let repetition = RepetitionConfig {
        kind: RepetitionKind::Weekly,
        start_date: day("2025-01-06"),
        end_date: day("2025-01-20"),
    };
    let written = engine
        .generate_and_publish("pro", &schedule, &repetition, Some(60))
        .await
        .unwrap();
    assert_eq!(written, 6);
    let again = engine
        .generate_and_publish("pro", &schedule, &repetition, None)
        .await
        .unwrap();
    assert_eq!(again, 0);

    assert!(matches!(
        engine
            .generate_and_publish("pro", &schedule, &repetition, Some(1))
            .await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn remove_slot_refuses_booked_slots() {
    let (engine, _) = test_engine().await;
    let d = day("2025-01-06");
    engine
        .publish_slots(
            "pro",
            &[candidate("2025-01-06", "09:00"), candidate("2025-01-06", "10:00")],
            None,
        )
        .await
        .unwrap();
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();

    assert!(matches!(
        engine.remove_slot("pro", d, t("09:00")).await,
        Err(EngineError::PreconditionFailed(_))
    ));
    engine.remove_slot("pro", d, t("10:00")).await.unwrap();
    assert!(matches!(
        engine.remove_slot("pro", d, t("10:00")).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(engine.slots_for_owner("pro", d, d).await.unwrap().len(), 1);
}

#[tokio::test]
async fn purge_removes_only_past_unbooked_slots() {
    let (engine, connector) = test_engine().await;
    engine
        .publish_slots(
            "pro",
            &[
                candidate("2025-01-06", "09:00"),
                candidate("2025-01-06", "10:00"),
                candidate("2025-01-08", "09:00"),
            ],
            None,
        )
        .await
        .unwrap();
    engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();

    let purged = engine
        .purge_past_unbooked_slots(day("2025-01-07"))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(connector.backend().document_count("slots"), 2);
    assert_eq!(engine.purge_past_unbooked_slots(day("2025-01-07")).await, Ok(0));
}

#[tokio::test]
async fn slot_instants_in_any_stored_shape_are_ranged_and_purged() {
    let (engine, connector) = test_engine().await;
    let store = engine.connection().store().unwrap();
    // 2025-01-06T09:00:00Z and 2025-01-08T09:00:00Z written by other clients.
    let raw = |start: serde_json::Value, end: serde_json::Value| {
        serde_json::json!({
            "ownerId": "pro",
            "title": "Available",
            "startInstant": start,
            "endInstant": end,
            "isAvailable": true,
            "isRecurring": false,
            "createdAt": "2025-01-01T00:00:00Z",
            "updatedAt": "2025-01-01T00:00:00Z",
        })
        .as_object()
        .cloned()
        .unwrap()
    };
    store
        .insert(
            SLOTS,
            "ts",
            raw(
                serde_json::json!({"seconds": 1736154000, "nanoseconds": 0}),
                serde_json::json!({"seconds": 1736157600, "nanoseconds": 0}),
            ),
        )
        .await
        .unwrap();
    store
        .insert(
            SLOTS,
            "millis",
            raw(
                serde_json::json!(1736326800000i64),
                serde_json::json!(1736330400000i64),
            ),
        )
        .await
        .unwrap();

    let monday = engine
        .slots_for_owner("pro", day("2025-01-06"), day("2025-01-06"))
        .await
        .unwrap();
    assert_eq!(monday.len(), 1);
    assert_eq!(monday[0].time, t("09:00"));
    assert_eq!(monday[0].duration_minutes, 60);
    let week = engine
        .slots_for_owner("pro", day("2025-01-06"), day("2025-01-12"))
        .await
        .unwrap();
    assert_eq!(week.len(), 2);

    assert_eq!(engine.purge_past_unbooked_slots(day("2025-01-07")).await, Ok(1));
    assert_eq!(connector.backend().document_count(SLOTS), 1);
}

#[tokio::test]
async fn query_window_is_bounded() {
    let (engine, _) = test_engine().await;
    assert!(matches!(
        engine
            .available_slots("pro", day("2025-01-07"), day("2025-01-06"))
            .await,
        Err(EngineError::Validation(_))
    ));
    assert_eq!(
        engine
            .slots_for_owner("pro", day("2025-01-01"), day("2026-06-01"))
            .await,
        Err(EngineError::LimitExceeded("query window too wide"))
    );
}

// ── Live feeds ───────────────────────────────────────────

#[tokio::test]
async fn booking_feed_tracks_changes() {
    let (engine, _) = test_engine().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = engine.watch_bookings(BookingRole::Patient, "pat", Vec::new(), tx);
    assert_eq!(handle.scope().to_string(), "bookings:patient:pat");

    let mut feed = FeedState::default();
    assert!(feed.is_loading());
    feed.apply(rx.recv().await.unwrap());
    assert_eq!(feed, FeedState::Ready(Vec::new()));

    let b = engine
        .create_booking(request("2025-01-06", "09:00", "10:00"))
        .await
        .unwrap();
    feed.apply(rx.recv().await.unwrap());
    assert_eq!(feed.items().len(), 1);
    assert_eq!(feed.items()[0].id, b.id);

    handle.teardown();
    assert_eq!(engine.realtime().registry().live_count(), 0);
}

#[tokio::test]
async fn slot_feed_degrades_on_fatal_error() {
    let (engine, connector) = test_engine().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _h = engine.watch_slots("pro", Vec::new(), tx);
    assert_eq!(rx.recv().await, Some(SubscriptionEvent::Snapshot(Vec::new())));

    connector
        .backend()
        .fail_watchers(StoreError::Internal("INTERNAL ASSERTION FAILED".into()));
    assert_eq!(rx.recv().await, Some(SubscriptionEvent::Degraded));
    assert_eq!(connector.connect_count(), 2);

    // The owner re-registers once the transport is back.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _h = engine.watch_slots("pro", Vec::new(), tx);
    assert_eq!(rx.recv().await, Some(SubscriptionEvent::Snapshot(Vec::new())));
}

#[tokio::test]
async fn shutdown_tears_down_feeds_and_transport() {
    let (engine, _) = test_engine().await;
    let (tx, _rx) = mpsc::unbounded_channel();
    let _h = engine.watch_slots("pro", Vec::new(), tx);
    assert_eq!(engine.realtime().registry().live_count(), 1);
    engine.shutdown().await;
    assert_eq!(engine.realtime().registry().live_count(), 0);
    assert!(!engine.connection().is_ready());
    assert!(engine.get_booking("x").await.is_err());
}
