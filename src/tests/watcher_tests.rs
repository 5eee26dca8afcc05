//! End-to-end watch manager tests on real directories with a short debounce

use super::support::{
    RecordingClient, broadcaster, canonical, drain, eventually, kinds, processor, text_of_len,
    wait_for,
};
use crate::events::{EventBroadcaster, EventType};
use crate::extract::ExtractorRegistry;
use crate::ingest::{Connectivity, HttpIngestionClient, IngestionClient};
use crate::store::{ChangeStore, DeliveryStatus};
use crate::watcher::{FileFilter, ProcessOutcome, WatchManager, WatchRoot};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const DEBOUNCE: Duration = Duration::from_millis(100);

struct Harness {
    manager: WatchManager,
    client: Arc<RecordingClient>,
    events: Arc<EventBroadcaster>,
    shutdown: CancellationToken,
}

fn harness(roots: Vec<WatchRoot>) -> Harness {
    harness_with(
        roots,
        Arc::new(ChangeStore::open_in_memory().unwrap()),
        DEBOUNCE,
    )
}

fn harness_with(roots: Vec<WatchRoot>, store: Arc<ChangeStore>, debounce: Duration) -> Harness {
    let client = Arc::new(RecordingClient::new());
    let events = broadcaster();
    let processor = processor(
        store,
        Some(client.clone() as Arc<dyn IngestionClient>),
        events.clone(),
    );
    let filter = FileFilter::from_registry(&ExtractorRegistry::with_plain_text());

    Harness {
        manager: WatchManager::new(roots, processor, filter, debounce),
        client,
        events,
        shutdown: CancellationToken::new(),
    }
}

/// Give the native watcher a moment to settle after registration
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_created_file_is_detected_chunked_and_recorded() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();

    h.manager.start(h.shutdown.clone()).await.unwrap();
    settle().await;

    let path = root.join("a.txt");
    let contents = text_of_len(2500);
    fs::write(&path, &contents).unwrap();

    let seen = wait_for(&mut subscription, EventType::FileComplete, &path).await;
    assert_eq!(
        kinds(&seen),
        vec![
            EventType::FileDetected,
            EventType::FileProcessing,
            EventType::FileComplete
        ]
    );
    assert_eq!(h.client.call_count(), 3);

    let record = h.manager.store().get(&path).unwrap().unwrap();
    assert_eq!(record.status, DeliveryStatus::Success);
    assert_eq!(record.hash, hex::encode(Sha256::digest(contents.as_bytes())));

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_skips_unchanged_files() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let path = root.join("a.txt");
    fs::write(&path, text_of_len(500)).unwrap();

    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();

    // Startup scan picks up the existing file
    h.manager.start(h.shutdown.clone()).await.unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &path).await;

    // Reload restarts the watch without closing the store
    h.manager.reload(vec![root.clone()], vec![]).await.unwrap();
    wait_for(&mut subscription, EventType::FileSkipped, &path).await;

    assert_eq!(h.client.call_count(), 1);
    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_of_writes_is_processed_once() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();

    h.manager.start(h.shutdown.clone()).await.unwrap();
    settle().await;

    let path = root.join("notes.md");
    for i in 1..=5 {
        fs::write(&path, text_of_len(100 * i)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = wait_for(&mut subscription, EventType::FileComplete, &path).await;
    assert_eq!(
        seen.iter()
            .filter(|e| e.kind == EventType::FileDetected)
            .count(),
        1
    );
    assert_eq!(h.client.call_count(), 1);
    assert_eq!(h.client.calls()[0].chunk_text.chars().count(), 500);

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_temporary_and_unsupported_files_are_ignored() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();

    h.manager.start(h.shutdown.clone()).await.unwrap();
    settle().await;

    fs::write(root.join("~$a.txt"), "lock file").unwrap();
    fs::write(root.join("draft.tmp"), "scratch").unwrap();
    fs::write(root.join("image.png"), "not text").unwrap();
    fs::write(root.join("._a.txt"), "resource fork").unwrap();

    // Well past the debounce window
    tokio::time::sleep(DEBOUNCE * 5).await;
    assert!(drain(&mut subscription).is_empty());
    assert_eq!(h.manager.store().count().unwrap(), 0);

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_subdirectory_is_watched() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();

    h.manager.start(h.shutdown.clone()).await.unwrap();
    settle().await;

    let sub = root.join("reports");
    fs::create_dir(&sub).unwrap();
    settle().await;

    let path = sub.join("q3.txt");
    fs::write(&path, text_of_len(200)).unwrap();

    wait_for(&mut subscription, EventType::FileComplete, &path).await;
    assert_eq!(
        h.manager.store().get(&path).unwrap().unwrap().status,
        DeliveryStatus::Success
    );

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_nested_files_are_scanned_on_start() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let nested = root.join("a/b/c");
    fs::create_dir_all(&nested).unwrap();
    let path = nested.join("deep.md");
    fs::write(&path, text_of_len(50)).unwrap();

    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();

    wait_for(&mut subscription, EventType::FileComplete, &path).await;
    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleted_file_is_untracked() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let path = root.join("a.txt");
    fs::write(&path, text_of_len(100)).unwrap();

    let h = harness(vec![WatchRoot::enabled(root.clone())]);
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &path).await;

    fs::remove_file(&path).unwrap();
    let store = h.manager.store().clone();
    assert!(eventually(|| matches!(store.get(&path), Ok(None))).await);

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_root_is_not_watched_until_enabled() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let path = root.join("a.txt");
    fs::write(&path, text_of_len(100)).unwrap();

    let h = harness(vec![WatchRoot::disabled(root.clone())]);
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();

    let status = h.manager.status().await;
    assert!(status.running);
    assert!(status.active_roots.is_empty());
    assert_eq!(status.roots, vec![WatchRoot::disabled(root.clone())]);

    tokio::time::sleep(DEBOUNCE * 3).await;
    assert_eq!(h.client.call_count(), 0);

    h.manager.toggle_path(&root, true).await.unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &path).await;
    assert_eq!(h.manager.status().await.active_roots, vec![root.clone()]);

    h.manager.toggle_path(&root, false).await.unwrap();
    let status = h.manager.status().await;
    assert!(status.active_roots.is_empty());
    assert_eq!(status.roots, vec![WatchRoot::disabled(root.clone())]);

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_toggle_unknown_root_is_an_error() {
    let dir = TempDir::new().unwrap();
    let h = harness(vec![]);
    h.manager.start(h.shutdown.clone()).await.unwrap();

    assert!(h.manager.toggle_path(dir.path(), true).await.is_err());
    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_and_remove_path_while_running() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let first_root = canonical(first.path());
    let second_root = canonical(second.path());

    let h = harness(vec![WatchRoot::enabled(first_root.clone())]);
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();

    h.manager.add_path(&second_root).await.unwrap();
    settle().await;
    let path = second_root.join("added.txt");
    fs::write(&path, text_of_len(100)).unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &path).await;

    let mut expected = vec![first_root.clone(), second_root.clone()];
    expected.sort();
    assert_eq!(h.manager.status().await.active_roots, expected);

    h.manager.remove_path(&second_root).await.unwrap();
    let status = h.manager.status().await;
    assert_eq!(status.active_roots, vec![first_root.clone()]);
    assert_eq!(status.roots, vec![WatchRoot::enabled(first_root)]);

    // Records for files under a removed root are kept
    assert!(h.manager.store().get(&path).unwrap().is_some());
    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_swaps_roots() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let first_root = canonical(first.path());
    let second_root = canonical(second.path());

    let h = harness(vec![WatchRoot::enabled(first_root.clone())]);
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();

    h.manager
        .reload(vec![second_root.clone()], vec![first_root.clone()])
        .await
        .unwrap();

    let status = h.manager.status().await;
    assert!(status.running);
    assert_eq!(status.active_roots, vec![second_root.clone()]);
    assert_eq!(
        status.roots,
        vec![
            WatchRoot::enabled(second_root.clone()),
            WatchRoot::disabled(first_root.clone())
        ]
    );

    settle().await;
    let old = first_root.join("old.txt");
    fs::write(&old, text_of_len(100)).unwrap();
    let path = second_root.join("new.txt");
    fs::write(&path, text_of_len(100)).unwrap();

    let seen = wait_for(&mut subscription, EventType::FileComplete, &path).await;
    let old = old.display().to_string();
    assert!(seen.iter().all(|e| e.payload["path"] != old.as_str()));
    assert!(!h.manager.store().is_closed());

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_closes_store_and_clears_status() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);

    h.manager.start(h.shutdown.clone()).await.unwrap();
    assert_eq!(h.manager.status().await.active_roots, vec![root.clone()]);

    h.manager.stop().await.unwrap();
    let status = h.manager.status().await;
    assert!(!status.running);
    assert!(status.active_roots.is_empty());
    assert!(h.manager.store().is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_in_flight_delivery() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let path = root.join("a.txt");
    fs::write(&path, text_of_len(100)).unwrap();

    let store = Arc::new(ChangeStore::open_in_memory().unwrap());
    let client = Arc::new(RecordingClient::slow(Duration::from_millis(500)));
    let events = broadcaster();
    let mut subscription = events.subscribe();
    let manager = WatchManager::new(
        vec![WatchRoot::enabled(root.clone())],
        processor(
            store.clone(),
            Some(client.clone() as Arc<dyn IngestionClient>),
            events,
        ),
        FileFilter::from_registry(&ExtractorRegistry::with_plain_text()),
        DEBOUNCE,
    );

    manager.start(CancellationToken::new()).await.unwrap();
    wait_for(&mut subscription, EventType::FileProcessing, &path).await;

    // Delivery is still sleeping inside the client
    manager.stop().await.unwrap();
    assert_eq!(client.call_count(), 1);
    let seen = drain(&mut subscription);
    assert_eq!(kinds(&seen), vec![EventType::FileComplete]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_shutdown_prevents_reload_restart() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let h = harness(vec![WatchRoot::enabled(root.clone())]);

    h.manager.start(h.shutdown.clone()).await.unwrap();
    h.shutdown.cancel();
    h.manager.reload(vec![root.clone()], vec![]).await.unwrap();

    assert!(!h.manager.status().await.running);
    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_relative_roots_are_resolved() {
    let h = harness(vec![WatchRoot::enabled(Path::new("docs").to_path_buf())]);
    let status = h.manager.status().await;
    assert!(status.roots[0].path.is_absolute());
    assert!(status.ingestion_enabled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_after_stop_reopens_store() {
    let dir = TempDir::new().unwrap();
    let state = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let first = root.join("a.txt");
    fs::write(&first, text_of_len(100)).unwrap();

    let store = Arc::new(ChangeStore::open(state.path().join("state.db")).unwrap());
    let h = harness_with(vec![WatchRoot::enabled(root.clone())], store, DEBOUNCE);
    let mut subscription = h.events.subscribe();

    h.manager.start(h.shutdown.clone()).await.unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &first).await;
    h.manager.stop().await.unwrap();
    assert!(h.manager.store().is_closed());

    h.manager.start(CancellationToken::new()).await.unwrap();
    assert!(!h.manager.store().is_closed());

    // The record written before the stop is still there
    wait_for(&mut subscription, EventType::FileSkipped, &first).await;

    settle().await;
    let second = root.join("b.txt");
    fs::write(&second, text_of_len(100)).unwrap();
    wait_for(&mut subscription, EventType::FileComplete, &second).await;

    assert_eq!(h.client.call_count(), 2);
    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_after_stop_fails_for_in_memory_store() {
    let dir = TempDir::new().unwrap();
    let h = harness(vec![WatchRoot::enabled(canonical(dir.path()))]);

    h.manager.start(h.shutdown.clone()).await.unwrap();
    h.manager.stop().await.unwrap();

    assert!(h.manager.start(CancellationToken::new()).await.is_err());
    assert!(!h.manager.status().await.running);
}

/// Write a file under an active root and wait until its timer is pending
async fn pending_file(h: &Harness, root: &Path) -> std::path::PathBuf {
    let mut subscription = h.events.subscribe();
    h.manager.start(h.shutdown.clone()).await.unwrap();
    settle().await;

    let path = root.join("a.txt");
    fs::write(&path, text_of_len(100)).unwrap();
    wait_for(&mut subscription, EventType::FileDetected, &path).await;
    path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabling_root_drops_pending_files() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let quiet = Duration::from_millis(800);
    let h = harness_with(
        vec![WatchRoot::enabled(root.clone())],
        Arc::new(ChangeStore::open_in_memory().unwrap()),
        quiet,
    );

    let path = pending_file(&h, &root).await;
    let mut subscription = h.events.subscribe();
    h.manager.toggle_path(&root, false).await.unwrap();

    tokio::time::sleep(quiet * 2).await;
    assert!(drain(&mut subscription).is_empty());
    assert_eq!(h.client.call_count(), 0);
    assert!(h.manager.store().get(&path).unwrap().is_none());

    h.manager.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removing_root_drops_pending_files() {
    let dir = TempDir::new().unwrap();
    let root = canonical(dir.path());
    let quiet = Duration::from_millis(800);
    let h = harness_with(
        vec![WatchRoot::enabled(root.clone())],
        Arc::new(ChangeStore::open_in_memory().unwrap()),
        quiet,
    );

    let path = pending_file(&h, &root).await;
    h.manager.remove_path(&root).await.unwrap();

    tokio::time::sleep(quiet * 2).await;
    assert_eq!(h.client.call_count(), 0);
    assert!(h.manager.store().get(&path).unwrap().is_none());

    h.manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_is_visible_through_manager() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.txt");
    fs::write(&path, text_of_len(100)).unwrap();

    // Bind then release a port so nothing is listening on it
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = HttpIngestionClient::new(format!("http://127.0.0.1:{}", port)).unwrap();
    let manager = WatchManager::new(
        vec![],
        processor(
            Arc::new(ChangeStore::open_in_memory().unwrap()),
            Some(Arc::new(client) as Arc<dyn IngestionClient>),
            broadcaster(),
        ),
        FileFilter::from_registry(&ExtractorRegistry::with_plain_text()),
        DEBOUNCE,
    );

    assert_eq!(manager.status().await.server, Some(Connectivity::Unknown));
    let mut changes = manager.server_status().unwrap().subscribe();

    let outcome = manager.processor().process(path).await;
    assert_eq!(outcome, ProcessOutcome::Recorded(DeliveryStatus::Failed));

    assert!(changes.has_changed().unwrap());
    assert_eq!(*changes.borrow_and_update(), Connectivity::Disconnected);
    assert_eq!(manager.status().await.server, Some(Connectivity::Disconnected));
    assert_eq!(manager.check_server().await, Some(false));
}

#[tokio::test]
async fn test_health_check_marks_server_connected() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });

    let client = HttpIngestionClient::new(format!("http://{}", addr)).unwrap();
    let manager = WatchManager::new(
        vec![],
        processor(
            Arc::new(ChangeStore::open_in_memory().unwrap()),
            Some(Arc::new(client) as Arc<dyn IngestionClient>),
            broadcaster(),
        ),
        FileFilter::from_registry(&ExtractorRegistry::with_plain_text()),
        DEBOUNCE,
    );

    assert_eq!(manager.check_server().await, Some(true));
    assert_eq!(manager.status().await.server, Some(Connectivity::Connected));
}

#[tokio::test]
async fn test_watch_only_mode_reports_no_server() {
    let manager = WatchManager::new(
        vec![],
        processor(Arc::new(ChangeStore::open_in_memory().unwrap()), None, broadcaster()),
        FileFilter::from_registry(&ExtractorRegistry::with_plain_text()),
        DEBOUNCE,
    );

    let status = manager.status().await;
    assert!(!status.ingestion_enabled);
    assert_eq!(status.server, None);
    assert!(manager.server_status().is_none());
    assert_eq!(manager.check_server().await, None);
}

#[tokio::test]
async fn test_recording_client_has_no_server_status() {
    let h = harness(vec![]);
    assert_eq!(h.manager.status().await.server, None);
    assert_eq!(h.manager.check_server().await, Some(true));
}
