//! Integration tests for the session cache facade
//!
//! Every test drives a real `SessionCache` (all actors running) against the
//! in-process `ChannelEventSource`; no network is involved.

use chat_cache::cache::BudgetOverrides;
use chat_cache::config::PersistenceBackend;
use chat_cache::core::{ManualClock, MessageContent, StreamState};
use chat_cache::{
    ChannelEventSource, InMemoryPersistence, MessageEvent, ReconcilerState, SessionCache, SessionId, Settings,
    Snapshot, StreamEvent,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::{sleep, Duration};

fn settled(id: &str, seq: u64, text: &str) -> MessageEvent {
    MessageEvent::snapshot(id, seq, 1, MessageContent::text(text), StreamState::Complete)
}

async fn open_cache(settings: Settings) -> (SessionCache, ChannelEventSource, Arc<InMemoryPersistence>) {
    let source = ChannelEventSource::new();
    let adapter = Arc::new(InMemoryPersistence::new());
    let cache = SessionCache::builder(settings, Arc::new(source.clone()))
        .adapter(adapter.clone())
        .open()
        .await
        .unwrap();
    (cache, source, adapter)
}

async fn wait_for_snapshot(cache: &SessionCache, id: &str, predicate: impl Fn(&Snapshot) -> bool) -> Snapshot {
    for _ in 0..1_000 {
        let snapshot = cache.get_snapshot(id).await;
        if predicate(&snapshot) {
            return snapshot;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("session {} never reached the expected state: {:?}", id, cache.get_snapshot(id).await);
}

async fn wait_terminal(cache: &SessionCache, id: &str) -> ReconcilerState {
    cache
        .wait_for_stream_state(&SessionId::from(id), |state| state.is_terminal())
        .await
        .unwrap()
}

async fn wait_live(cache: &SessionCache, id: &str) {
    let state = cache
        .wait_for_stream_state(&SessionId::from(id), |state| *state == ReconcilerState::Live)
        .await;
    assert_eq!(state, Some(ReconcilerState::Live));
}

fn text_of(snapshot: &Snapshot, id: &str) -> Option<String> {
    snapshot
        .messages
        .iter()
        .find(|m| m.message_id.as_str() == id)
        .map(|m| m.content.text.clone())
}

#[tokio::test(start_paused = true)]
async fn test_scenario_a_backfill_fills_session_in_order() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    for seq in 1..=500 {
        source.record(&s1, settled(&format!("m{}", seq), seq, "hello"));
    }

    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    assert!(cache.get_snapshot("S1").await.session.is_some());

    wait_live(&cache, "S1").await;
    let snapshot = cache.get_snapshot("S1").await;
    let meta = snapshot.session.clone().unwrap();
    assert!(meta.is_fully_cached);
    assert_eq!(snapshot.messages.len(), 500);
    let sequence: Vec<u64> = snapshot.messages.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequence, (1..=500).collect::<Vec<u64>>());
    assert!(!snapshot.is_stale);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scenario_b_new_message_trims_oldest() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    for seq in 1..=500 {
        source.record(&s1, settled(&format!("m{}", seq), seq, "hello"));
    }
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    source.publish(&s1, settled("m501", 501, "newest"));
    let snapshot = wait_for_snapshot(&cache, "S1", |s| text_of(s, "m501").is_some()).await;

    assert!(snapshot.messages.len() <= 500);
    assert!(text_of(&snapshot, "m1").is_none());
    assert_eq!(snapshot.messages.first().map(|m| m.sequence_number), Some(2));
    assert_eq!(snapshot.messages.last().map(|m| m.sequence_number), Some(501));

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_eleventh_full_session_demotes_first() {
    let clock = ManualClock::default();
    let source = ChannelEventSource::new();
    let cache = SessionCache::builder(Settings::default(), Arc::new(source.clone()))
        .adapter(Arc::new(InMemoryPersistence::new()))
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap();

    for i in 1..=11 {
        let id = format!("s{}", i);
        source.record(&SessionId::from(id.as_str()), settled("m1", 1, "hi"));
        cache.prefetch(id.as_str()).await.unwrap();
        assert_eq!(wait_terminal(&cache, &id).await, ReconcilerState::Closed);
        clock.advance(chrono::Duration::seconds(1));
    }

    let sessions = cache.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 11);
    let first = sessions.iter().find(|m| m.session_id.as_str() == "s1").unwrap();
    assert!(!first.is_fully_cached);
    assert_eq!(first.message_count, 0);
    for meta in sessions.iter().filter(|m| m.session_id.as_str() != "s1") {
        assert!(meta.is_fully_cached, "{} should still be fully cached", meta.session_id);
    }
    assert_eq!(cache.stats().await.unwrap().full_sessions, 10);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_demoted_live_session_is_backfilled_again() {
    let clock = ManualClock::default();
    let source = ChannelEventSource::new();
    let mut settings = Settings::default();
    settings.cache.max_full_sessions = 1;
    let cache = SessionCache::builder(settings, Arc::new(source.clone()))
        .adapter(Arc::new(InMemoryPersistence::new()))
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap();

    let s1 = SessionId::from("s1");
    let _subscription = cache.subscribe("s1", |_| {}).await.unwrap();
    wait_live(&cache, "s1").await;
    source.publish(&s1, MessageEvent::delta("m1", 1, 1, "Hello"));
    wait_for_snapshot(&cache, "s1", |s| text_of(s, "m1").as_deref() == Some("Hello")).await;
    clock.advance(chrono::Duration::seconds(1));

    // a second fully cached session pushes s1 back to a stub
    source.record(&SessionId::from("s2"), settled("m1", 1, "other"));
    cache.prefetch("s2").await.unwrap();
    assert_eq!(wait_terminal(&cache, "s2").await, ReconcilerState::Closed);
    let demoted = cache.get_snapshot("s1").await;
    assert!(!demoted.session.unwrap().is_fully_cached);
    assert!(demoted.messages.is_empty());

    source.publish(&s1, MessageEvent::delta("m1", 1, 2, " world"));
    let snapshot = wait_for_snapshot(&cache, "s1", |s| {
        text_of(s, "m1").as_deref() == Some("Hello world")
            && s.session.as_ref().map_or(false, |meta| meta.is_fully_cached)
    })
    .await;
    assert_eq!(snapshot.messages.len(), 1);
    assert!(source.last_cursor(&s1).is_none());

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_scenario_d_older_revision_is_ignored() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    source.publish(
        &s1,
        MessageEvent::snapshot("m1", 1, 5, MessageContent::text("five"), StreamState::Streaming),
    );
    source.publish(&s1, MessageEvent::delta("m1", 1, 3, " three"));
    source.publish(&s1, settled("marker", 2, "done"));

    let snapshot = wait_for_snapshot(&cache, "S1", |s| text_of(s, "marker").is_some()).await;
    let m1 = snapshot.messages.iter().find(|m| m.message_id.as_str() == "m1").unwrap();
    assert_eq!(m1.revision, 5);
    assert_eq!(m1.content.text, "five");

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_event_applies_once() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    let event = MessageEvent::delta("m1", 1, 1, "hello").with_role("assistant");
    source.publish(&s1, event.clone());
    assert!(source.deliver(&s1, StreamEvent::Message(event)));
    source.publish(&s1, settled("marker", 2, "done"));

    let snapshot = wait_for_snapshot(&cache, "S1", |s| text_of(s, "marker").is_some()).await;
    assert_eq!(text_of(&snapshot, "m1").as_deref(), Some("hello"));
    assert_eq!(snapshot.messages.len(), 2);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_within_window_matches_in_order_delivery() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let _a = cache.subscribe("ordered", |_| {}).await.unwrap();
    let _b = cache.subscribe("shuffled", |_| {}).await.unwrap();
    wait_live(&cache, "ordered").await;
    wait_live(&cache, "shuffled").await;

    let deltas = [
        MessageEvent::delta("m1", 1, 1, "a"),
        MessageEvent::delta("m1", 1, 2, "b"),
        MessageEvent::delta("m1", 1, 3, "c"),
    ];
    let ordered = SessionId::from("ordered");
    for event in &deltas {
        source.publish(&ordered, event.clone());
    }
    let shuffled = SessionId::from("shuffled");
    for index in [0, 2, 1] {
        source.publish(&shuffled, deltas[index].clone());
    }

    let expected = wait_for_snapshot(&cache, "ordered", |s| text_of(s, "m1").as_deref() == Some("abc")).await;
    let actual = wait_for_snapshot(&cache, "shuffled", |s| text_of(s, "m1").as_deref() == Some("abc")).await;
    assert_eq!(expected.messages[0].revision, actual.messages[0].revision);
    assert_eq!(expected.messages[0].content, actual.messages[0].content);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_session_limit_evicts_least_recent_stub() {
    let clock = ManualClock::default();
    let source = ChannelEventSource::new();
    let mut settings = Settings::default();
    settings.cache.max_sessions = 3;
    settings.cache.max_full_sessions = 3;
    let cache = SessionCache::builder(settings, Arc::new(source.clone()))
        .adapter(Arc::new(InMemoryPersistence::new()))
        .clock(Arc::new(clock.clone()))
        .open()
        .await
        .unwrap();

    // oldest, but fully cached
    source.record(&SessionId::from("full"), settled("m1", 1, "hi"));
    cache.prefetch("full").await.unwrap();
    assert_eq!(wait_terminal(&cache, "full").await, ReconcilerState::Closed);
    clock.advance(chrono::Duration::seconds(1));

    for id in ["a", "b"] {
        source.reject(&SessionId::from(id), "not found");
        cache.prefetch(id).await.unwrap();
        assert_eq!(wait_terminal(&cache, id).await, ReconcilerState::Failed);
        clock.advance(chrono::Duration::seconds(1));
    }

    cache.get_snapshot("a").await;
    clock.advance(chrono::Duration::seconds(1));

    source.reject(&SessionId::from("c"), "not found");
    cache.prefetch("c").await.unwrap();

    let resident: HashSet<String> = cache
        .list_sessions()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.session_id.as_str().to_string())
        .collect();
    let expected: HashSet<String> = ["full", "a", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(resident, expected);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_neither_loses_nor_duplicates() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    for seq in 1..=3 {
        source.publish(&s1, settled(&format!("m{}", seq), seq, "before"));
    }
    let before = wait_for_snapshot(&cache, "S1", |s| s.messages.len() == 3).await;

    source.disconnect(&s1);
    source.record(&s1, settled("m4", 4, "missed"));

    let after = wait_for_snapshot(&cache, "S1", |s| text_of(s, "m4").is_some()).await;
    assert_eq!(after.messages.len(), 4);
    assert_eq!(&after.messages[..3], &before.messages[..]);
    let ids: HashSet<&str> = after.messages.iter().map(|m| m.message_id.as_str()).collect();
    assert_eq!(ids.len(), 4);
    assert!(source.open_count(&s1) >= 2);
    assert!(source.last_cursor(&s1).and_then(|c| c.token).is_some());

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_mark_snapshot_stale() {
    let mut settings = Settings::default();
    settings.stream.max_attempts = 2;
    let (cache, source, _) = open_cache(settings).await;
    let s1 = SessionId::from("S1");

    source.record(&s1, settled("m1", 1, "cached earlier"));
    cache.prefetch("S1").await.unwrap();
    assert_eq!(wait_terminal(&cache, "S1").await, ReconcilerState::Closed);

    source.fail_next_opens(&s1, 100);
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    assert_eq!(wait_terminal(&cache, "S1").await, ReconcilerState::Failed);

    let snapshot = cache.get_snapshot("S1").await;
    assert!(snapshot.is_stale);
    assert_eq!(snapshot.stream_state, Some(ReconcilerState::Failed));
    assert_eq!(text_of(&snapshot, "m1").as_deref(), Some("cached earlier"));

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_changes_is_coalesced() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let _subscription = cache
        .subscribe("S1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
    wait_live(&cache, "S1").await;
    sleep(Duration::from_millis(50)).await;
    fired.store(0, Ordering::SeqCst);

    for revision in 1..=50 {
        source.publish(&s1, MessageEvent::delta("m1", 1, revision, "x"));
    }
    wait_for_snapshot(&cache, "S1", |s| text_of(s, "m1").map(|t| t.len()) == Some(50)).await;
    sleep(Duration::from_millis(50)).await;

    let count = fired.load(Ordering::SeqCst);
    assert!(count >= 1);
    assert!(count <= 50, "expected at most one notification per change, got {}", count);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_last_unsubscribe_closes_reconciler() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let first = cache.subscribe("S1", |_| {}).await.unwrap();
    let second = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;
    assert_eq!(source.open_count(&s1), 1);

    first.unsubscribe().await;
    assert_eq!(cache.stream_state(&s1), Some(ReconcilerState::Live));

    second.unsubscribe().await;
    assert_eq!(cache.stream_state(&s1), None);
    assert!(!source.is_connected(&s1));

    // cached content outlives the subscription
    assert!(cache.get_snapshot("S1").await.session.is_some());

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_upgrades_prefetch_to_live() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    source.fail_next_opens(&s1, 1);

    cache.prefetch("S1").await.unwrap();
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    source.publish(&s1, settled("m1", 1, "live"));
    let snapshot = wait_for_snapshot(&cache, "S1", |s| text_of(s, "m1").is_some()).await;
    assert_eq!(snapshot.stream_state, Some(ReconcilerState::Live));

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_set_budgets_trims_immediately() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    for seq in 1..=5 {
        source.record(&s1, settled(&format!("m{}", seq), seq, "hi"));
    }
    cache.prefetch("S1").await.unwrap();
    wait_terminal(&cache, "S1").await;

    let report = cache
        .set_budgets(BudgetOverrides {
            max_messages_per_session: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.trimmed_messages, 3);

    let snapshot = cache.get_snapshot("S1").await;
    let sequence: Vec<u64> = snapshot.messages.iter().map(|m| m.sequence_number).collect();
    assert_eq!(sequence, vec![4, 5]);

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_evict_all_empties_cache_and_persistence() {
    let (cache, source, adapter) = open_cache(Settings::default()).await;
    for id in ["a", "b"] {
        source.record(&SessionId::from(id), settled("m1", 1, "hi"));
        cache.prefetch(id).await.unwrap();
        wait_terminal(&cache, id).await;
    }
    cache.flush().await.unwrap();
    assert!(!adapter.keys().await.is_empty());

    assert_eq!(cache.evict_all().await.unwrap(), 2);
    assert!(cache.list_sessions().await.unwrap().is_empty());
    assert!(adapter.keys().await.is_empty());
    assert!(cache.get_snapshot("a").await.session.is_none());

    cache.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_from_filesystem_after_restart() {
    let dir = tempdir().unwrap();
    let mut settings = Settings::default();
    settings.persistence.backend = PersistenceBackend::Fs;
    settings.persistence.path = dir.path().to_string_lossy().to_string();

    let source = ChannelEventSource::new();
    let s1 = SessionId::from("S1");
    source.record(&s1, settled("m1", 1, "first"));
    source.record(&s1, settled("m2", 2, "second"));

    let cache = SessionCache::builder(settings.clone(), Arc::new(source.clone()))
        .open()
        .await
        .unwrap();
    cache.prefetch("S1").await.unwrap();
    wait_terminal(&cache, "S1").await;
    cache.set_title("S1", Some("Greetings".to_string())).await.unwrap();
    cache.shutdown().await.unwrap();

    let reopened = SessionCache::builder(settings, Arc::new(ChannelEventSource::new()))
        .open()
        .await
        .unwrap();
    assert_eq!(reopened.load_report().sessions, 1);
    assert_eq!(reopened.load_report().messages, 2);

    let snapshot = reopened.get_snapshot("S1").await;
    let meta = snapshot.session.clone().unwrap();
    assert!(meta.is_fully_cached);
    assert_eq!(meta.title.as_deref(), Some("Greetings"));
    assert_eq!(text_of(&snapshot, "m1").as_deref(), Some("first"));
    assert_eq!(text_of(&snapshot, "m2").as_deref(), Some("second"));

    reopened.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_remove_session_stops_its_reconciler() {
    let (cache, source, _) = open_cache(Settings::default()).await;
    let s1 = SessionId::from("S1");
    let _subscription = cache.subscribe("S1", |_| {}).await.unwrap();
    wait_live(&cache, "S1").await;

    assert!(cache.remove_session("S1").await.unwrap());
    assert!(!source.is_connected(&s1));
    assert!(cache.get_snapshot("S1").await.session.is_none());

    // a late event has nowhere to go
    source.publish(&s1, settled("m1", 1, "late"));
    sleep(Duration::from_millis(100)).await;
    assert!(cache.get_snapshot("S1").await.session.is_none());

    cache.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_id_is_rejected() {
    let (cache, _, _) = open_cache(Settings::default()).await;
    assert!(cache.subscribe("", |_| {}).await.is_err());
    assert!(cache.prefetch("").await.is_err());
    cache.shutdown().await.unwrap();
}
