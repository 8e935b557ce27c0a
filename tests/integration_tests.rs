//! Integration tests for keyspace-bulk
//!
//! Every test drives the public manager API against the in-process
//! MemoryStore, so no store server is needed.

use keyspace_bulk::error::{RequestError, StoreError, StoreResult};
use keyspace_bulk::store::{async_trait, KeyOutcome, Mutation, NodeHandle};
use keyspace_bulk::{
    ActionStatus, BulkActionManager, BulkActionRequest, BulkConfig, BulkError, KeyFilter, KeyType,
    MemoryStore, ProgressEvent, ProgressSubscription, SeedEntry, ShardedStoreClient,
};
use std::io::{BufReader, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::timeout;
use uuid::Uuid;

const CONN: &str = "test";

fn config(page_size: usize) -> BulkConfig {
    BulkConfig {
        page_size,
        min_page_size: 1,
        per_call_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn setup(config: BulkConfig, store: Arc<MemoryStore>) -> BulkActionManager {
    let manager = BulkActionManager::new(config).unwrap();
    manager.register_connection(CONN, store);
    manager
}

async fn collect(mut sub: ProgressSubscription) -> Vec<ProgressEvent> {
    let drain = async {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        events
    };
    timeout(Duration::from_secs(10), drain)
        .await
        .expect("run did not finish")
}

/// Create, subscribe, start and collect every event of a run
async fn run_to_end(manager: &BulkActionManager, request: BulkActionRequest) -> (Uuid, Vec<ProgressEvent>) {
    let id = manager.create(request).unwrap();
    let sub = manager.subscribe(id).unwrap();
    manager.start(id).unwrap();
    (id, collect(sub).await)
}

fn page_keys(events: &[ProgressEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ReportKeys { keys, .. } => Some(keys.clone()),
            _ => None,
        })
        .collect()
}

fn assert_consistent(events: &[ProgressEvent]) {
    for event in events {
        let summary = &event.overview().summary;
        assert_eq!(
            summary.processed,
            summary.succeeded + summary.failed,
            "inconsistent {} event",
            event.name()
        );
    }
}

#[tokio::test]
async fn test_single_node_delete_two_pages() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 3);
    let manager = setup(config(2), store.clone());

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    assert_eq!(
        page_keys(&events),
        vec![
            vec!["k0".to_string(), "k1".to_string()],
            vec!["k2".to_string()],
        ]
    );

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.processed, 3);
    assert_eq!(overview.summary.succeeded, 3);
    assert_eq!(overview.summary.failed, 0);
    assert!(store.is_empty());
    assert_consistent(&events);
}

#[tokio::test]
async fn test_event_order() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 5);
    let manager = setup(config(2), store);

    let (_, events) = run_to_end(
        &manager,
        BulkActionRequest::unlink(CONN, KeyFilter::default()),
    )
    .await;

    let names: Vec<_> = events.iter().map(|e| e.name()).collect();
    assert_eq!(names.first(), Some(&"snapshot"));
    assert_eq!(names.iter().filter(|n| **n == "ready").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "complete").count(), 1);
    assert_eq!(names.last(), Some(&"complete"));

    let ready = names.iter().position(|n| *n == "ready").unwrap();
    let first_keys = names.iter().position(|n| *n == "keys").unwrap();
    assert!(ready < first_keys);
}

#[tokio::test]
async fn test_one_key_fails() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 3);
    store.fail_key("k1", "key not found");
    let manager = setup(config(10), store);

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.processed, 3);
    assert_eq!(overview.summary.succeeded, 2);
    assert_eq!(overview.summary.failed, 1);
    assert_eq!(overview.summary.errors.len(), 1);
    assert_eq!(overview.summary.errors[0].key, "k1");
}

#[tokio::test]
async fn test_error_cap_with_all_keys_failing() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 600);
    for i in 0..600 {
        store.fail_key(&format!("k{}", i), "WRONGTYPE");
    }
    let manager = setup(config(100), store);

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.summary.failed, 600);
    assert_eq!(overview.summary.errors.len(), 500);
    assert!(events
        .iter()
        .all(|e| e.overview().summary.errors.len() <= 500));
}

#[tokio::test]
async fn test_capped_lists_stay_bounded() {
    let store = Arc::new(MemoryStore::cluster(3));
    store.populate("k", 300);
    for i in (0..300).step_by(2) {
        store.fail_key(&format!("k{}", i), "boom");
    }
    let manager = setup(
        BulkConfig {
            error_cap: 5,
            sample_cap: 7,
            ..config(16)
        },
        store,
    );

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    for event in &events {
        let summary = &event.overview().summary;
        assert!(summary.errors.len() <= 5);
        assert!(summary.sample_keys.len() <= 7);
    }
    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.summary.total_keys_seen, 300);
    assert_eq!(overview.summary.sample_keys.len(), 7);
    assert_eq!(overview.summary.failed, 150);
    assert_consistent(&events);
}

#[tokio::test]
async fn test_overview_drains_errors_once() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 4);
    store.fail_key("k2", "key not found");
    let manager = setup(config(10), store);

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let first = manager.get_overview(id).unwrap();
    let second = manager.get_overview(id).unwrap();

    assert_eq!(first.summary.errors.len(), 1);
    assert!(second.summary.errors.is_empty());
    assert_eq!(first.summary.processed, second.summary.processed);
    assert_eq!(first.summary.succeeded, second.summary.succeeded);
    assert_eq!(first.summary.failed, second.summary.failed);
    assert_eq!(first.summary.sample_keys, second.summary.sample_keys);

    // Waiting does not drain either
    let waited = manager.wait(id).await.unwrap();
    assert!(waited.summary.errors.is_empty());
    assert_eq!(waited.summary.failed, 1);
}

#[tokio::test]
async fn test_every_key_visited_once_across_cluster() {
    let store = Arc::new(MemoryStore::cluster(4));
    store.populate("user:", 250);
    store.populate("other:", 50);
    let manager = setup(config(9), store.clone());

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::pattern("user:*")),
    )
    .await;

    let mut seen: Vec<String> = page_keys(&events).into_iter().flatten().collect();
    assert_eq!(seen.len(), 250);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 250);
    assert!(seen.iter().all(|k| k.starts_with("user:")));

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.progress.total, 4);
    assert_eq!(overview.progress.done, 4);
    assert_eq!(store.len(), 50);
}

#[tokio::test]
async fn test_pooled_shards() {
    let store = Arc::new(MemoryStore::cluster(4));
    store.populate("k", 200);
    let manager = setup(
        BulkConfig {
            shard_concurrency: 4,
            ..config(7)
        },
        store.clone(),
    );

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.processed, 200);
    assert!(store.is_empty());
    assert_consistent(&events);

    // Snapshots never go backwards
    let processed: Vec<u64> = events
        .iter()
        .map(|e| e.overview().summary.processed)
        .collect();
    assert!(processed.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_abort_after_first_page_of_two_shards() {
    let store = Arc::new(MemoryStore::cluster(2));
    store.populate("k", 20);
    let first_shard = store.node_len(0);
    let second_shard = store.node_len(1);
    assert!(first_shard > 0 && second_shard > 0);

    // One page per shard; the second shard's scan waits at the gate
    store.limit_scans(1);
    let manager = setup(config(100), store.clone());
    let id = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::default()))
        .unwrap();
    let mut sub = manager.subscribe(id).unwrap();
    manager.start(id).unwrap();

    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let is_keys = matches!(event, ProgressEvent::ReportKeys { .. });
        events.push(event);
        if is_keys {
            break;
        }
    }

    manager.abort(id).unwrap();
    store.release_scans(10);
    events.extend(collect(sub).await);

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Aborted);
    assert_eq!(overview.summary.processed, first_shard as u64);
    assert_eq!(
        overview.summary.processed,
        overview.summary.succeeded + overview.summary.failed
    );
    assert_eq!(store.node_len(0), 0);
    assert_eq!(store.node_len(1), second_shard);
    assert_eq!(page_keys(&events).len(), 1);
    assert_consistent(&events);

    // Abort on a finished run is a no-op
    manager.abort(id).unwrap();
    assert_eq!(manager.status(id).unwrap(), ActionStatus::Aborted);
}

#[tokio::test]
async fn test_abort_before_start() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 3);
    let manager = setup(config(10), store.clone());
    let id = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::default()))
        .unwrap();

    manager.abort(id).unwrap();
    assert_eq!(manager.status(id).unwrap(), ActionStatus::Aborted);
    assert!(matches!(
        manager.start(id),
        Err(BulkError::InvalidState { .. })
    ));

    let events = collect(manager.subscribe(id).unwrap()).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].is_complete());
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn test_batch_failure_preserves_partial_summary() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 5);
    // Page 1 applies; page 2 fails twice
    store.fail_applies(2, 2, StoreError::Io("connection reset".into()));
    let manager = setup(config(2), store.clone());

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Failed);
    assert_eq!(overview.summary.processed, 2);
    assert!(overview.error.unwrap().contains("connection reset"));
    assert_eq!(store.len(), 3);
    assert!(events.last().unwrap().is_complete());
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 5);
    store.fail_applies(2, 1, StoreError::Timeout { millis: 5 });
    store.fail_scans(1, 1, StoreError::Io("reset".into()));
    let manager = setup(config(2), store.clone());

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.succeeded, 5);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_connection_loss_mid_run() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 5);
    store.fail_scans(
        2,
        100,
        StoreError::Disconnected("connection closed".into()),
    );
    let manager = setup(config(2), store);

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Disconnected);
    assert_eq!(overview.summary.processed, 2);
    assert_eq!(
        events.last().unwrap().overview().status,
        ActionStatus::Disconnected
    );
}

#[tokio::test]
async fn test_topology_failure() {
    let store = Arc::new(MemoryStore::cluster(3));
    store.fail_topology("node without role flags");
    let manager = setup(config(10), store);

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Failed);
    assert!(overview.error.unwrap().contains("Topology"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_topology_probe_fails_run() {
    let store = Arc::new(MemoryStore::cluster(3));
    store.set_topology_delay(Duration::from_secs(3600));
    let manager = setup(config(10), store);

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Failed);
    assert!(overview.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_abort_during_topology_probe() {
    let store = Arc::new(MemoryStore::cluster(3));
    store.populate("k", 10);
    store.set_topology_delay(Duration::from_secs(3600));
    let manager = setup(config(10), store.clone());

    let id = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::default()))
        .unwrap();
    let sub = manager.subscribe(id).unwrap();
    manager.start(id).unwrap();
    assert_eq!(manager.status(id).unwrap(), ActionStatus::Preparing);
    manager.abort(id).unwrap();

    collect(sub).await;
    assert_eq!(manager.status(id).unwrap(), ActionStatus::Aborted);
    assert_eq!(store.scan_calls(), 0);
    assert_eq!(store.len(), 10);
}

struct NoShards;

#[async_trait]
impl ShardedStoreClient for NoShards {
    async fn list_primary_nodes(&self) -> StoreResult<Vec<NodeHandle>> {
        Ok(Vec::new())
    }

    async fn scan_page(
        &self,
        _node: &NodeHandle,
        _cursor: &str,
        _pattern: &str,
        _key_type: Option<KeyType>,
        _count: usize,
    ) -> StoreResult<(Vec<String>, String)> {
        Err(StoreError::Command("no shards to scan".into()))
    }

    async fn pipeline_apply(
        &self,
        _node: &NodeHandle,
        _mutations: &[Mutation],
    ) -> StoreResult<Vec<KeyOutcome>> {
        Err(StoreError::Command("no shards to apply to".into()))
    }
}

#[tokio::test]
async fn test_zero_shards_completes_empty() {
    let manager = BulkActionManager::new(config(10)).unwrap();
    manager.register_connection(CONN, Arc::new(NoShards));

    let (id, events) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default()),
    )
    .await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.processed, 0);
    assert!(events.iter().all(|e| e.name() != "ready"));
}

#[tokio::test]
async fn test_type_filter() {
    let store = Arc::new(MemoryStore::single());
    store.insert_typed("h:1", "v", KeyType::Hash);
    store.insert_typed("h:2", "v", KeyType::Hash);
    store.insert("s:1", "v");
    let manager = setup(config(10), store.clone());

    let (id, _) = run_to_end(
        &manager,
        BulkActionRequest::delete(CONN, KeyFilter::default().with_type(KeyType::Hash)),
    )
    .await;

    assert_eq!(manager.get_overview(id).unwrap().summary.processed, 2);
    assert!(store.contains("s:1"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_upload_from_seed_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "# seed records").unwrap();
    for i in 0..20 {
        writeln!(file, r#"{{"key":"seed:{}","value":"v{}"}}"#, i, i).unwrap();
    }
    writeln!(file).unwrap();
    writeln!(file, r#"{{"key":"{{tag}}:a","value":"x","ttl_ms":60000}}"#).unwrap();

    let reader = BufReader::new(file.reopen().unwrap());
    let seed = SeedEntry::read_json_lines(reader).unwrap();
    assert_eq!(seed.len(), 21);
    assert_eq!(seed[20].ttl_ms, Some(60000));

    let store = Arc::new(MemoryStore::cluster(3));
    let manager = setup(config(4), store.clone());
    let (id, events) = run_to_end(&manager, BulkActionRequest::upload(CONN, seed)).await;

    let overview = manager.get_overview(id).unwrap();
    assert_eq!(overview.status, ActionStatus::Completed);
    assert_eq!(overview.summary.succeeded, 21);
    assert_eq!(store.len(), 21);
    assert_eq!(store.get("seed:7").as_deref(), Some("v7"));
    assert_eq!(store.get("{tag}:a").as_deref(), Some("x"));
    assert_eq!(store.scan_calls(), 0);
    assert_consistent(&events);
}

#[tokio::test]
async fn test_late_subscriber_gets_final_state() {
    let store = Arc::new(MemoryStore::single());
    store.populate("k", 3);
    let manager = setup(config(2), store);
    let id = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::default()))
        .unwrap();
    manager.start(id).unwrap();
    manager.wait(id).await.unwrap();

    let events = collect(manager.subscribe(id).unwrap()).await;
    assert_eq!(events.len(), 1);
    let last = &events[0];
    assert!(last.is_complete());
    assert_eq!(last.overview().summary.processed, 3);
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let store = Arc::new(MemoryStore::single());
    let manager = setup(config(10), store);

    let err = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::pattern("")))
        .unwrap_err();
    assert!(matches!(err, BulkError::Validation(RequestError::EmptyPattern)));

    let err = manager
        .create(BulkActionRequest::upload(CONN, Vec::new()))
        .unwrap_err();
    assert!(matches!(err, BulkError::Validation(RequestError::EmptySeed)));

    let err = manager
        .create(BulkActionRequest::delete(
            CONN,
            KeyFilter::default().with_count(0),
        ))
        .unwrap_err();
    assert!(matches!(err, BulkError::Validation(RequestError::ZeroCount)));

    assert!(manager.list().is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let store = Arc::new(MemoryStore::cluster(2));
    store.populate("a:", 40);
    store.populate("b:", 40);
    let manager = setup(config(5), store.clone());

    let a = manager
        .create(BulkActionRequest::delete(CONN, KeyFilter::pattern("a:*")))
        .unwrap();
    let b = manager
        .create(BulkActionRequest::unlink(CONN, KeyFilter::pattern("b:*")))
        .unwrap();
    manager.start(a).unwrap();
    manager.start(b).unwrap();

    let a = timeout(Duration::from_secs(10), manager.wait(a))
        .await
        .unwrap()
        .unwrap();
    let b = timeout(Duration::from_secs(10), manager.wait(b))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(a.summary.succeeded, 40);
    assert_eq!(b.summary.succeeded, 40);
    assert!(store.is_empty());
}
