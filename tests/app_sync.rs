use std::{sync::Arc, time::Duration};

use memosync::{
    Config, DocumentBackend, HttpDocumentBackend, KeyValueStore, MemoApp, MemoError,
    MemoryDocumentBackend, MemoryIndexedStore, NetworkEvent, NewAttachment, Note, NoteInput,
    RemoteConfig, RemoteStore, SyncActivity,
};

fn config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.storage.data_file = dir.join("store.json");
    config.backup.backup_dir = dir.join("backups");
    config
}

fn text_file(memo_id: &str, name: &str) -> NewAttachment {
    NewAttachment {
        memo_id: memo_id.into(),
        file_name: name.into(),
        file_type: "text/plain".into(),
        data: name.as_bytes().to_vec(),
        thumbnail_url: None,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached within 10s");
}

fn app_with_remote(dir: &std::path::Path) -> (Arc<MemoryDocumentBackend>, MemoApp) {
    let backend = Arc::new(MemoryDocumentBackend::new());
    let remote = Arc::new(RemoteStore::with_backend(backend.clone()));
    let app = MemoApp::with_stores(
        config(dir),
        Arc::new(KeyValueStore::in_memory("memo_app_")),
        Arc::new(MemoryIndexedStore::new()),
        Some(remote),
    );
    (backend, app)
}

#[tokio::test]
async fn placeholder_credentials_mean_local_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.remote.endpoint = "https://docs.internal.test".into();
    config.remote.api_key = "your-api-key".into();
    config.remote.project_id = "demo-project".into();

    let app = MemoApp::open(config).await.unwrap();
    assert!(app.remote().is_none());

    let note = app
        .notes()
        .create(NoteInput::new("local", "only"))
        .await
        .unwrap()
        .value;
    assert_eq!(app.sync().mount().await.unwrap()[0].id, note.id);
    assert!(matches!(
        app.sync().sync_now().await,
        Err(MemoError::RemoteNotConfigured { .. })
    ));
}

#[tokio::test]
async fn reopened_session_can_search_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let memo_id = {
        let app = MemoApp::open(config(dir.path())).await.unwrap();
        let memo = app
            .notes()
            .create(NoteInput::new("Release Notes", "v1 ships tomorrow").with_tags(["release"]))
            .await
            .unwrap()
            .value;
        app.attachments()
            .create(text_file(&memo.id, "a.txt"))
            .await
            .unwrap();
        memo.id
    };

    let app = MemoApp::open(config(dir.path())).await.unwrap();
    assert_eq!(app.sync().mount().await.unwrap().len(), 1);

    let outcome = app.notes().search("release", 10).await.unwrap();
    assert!(!outcome.is_degraded());
    assert_eq!(outcome.value.len(), 1);
    assert_eq!(outcome.value[0].note.id, memo_id);

    app.attachments()
        .create(text_file(&memo_id, "b.txt"))
        .await
        .unwrap();
    let names: Vec<_> = app
        .attachments()
        .list_by_memo(&memo_id)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.file_name)
        .collect();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
}

#[tokio::test]
async fn search_forgets_notes_dropped_by_a_pull() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, app) = app_with_remote(dir.path());

    backend.set_unreachable(true);
    for i in 0..3 {
        let outcome = app
            .notes()
            .create(NoteInput::new(&format!("alpha {i}"), "local only"))
            .await
            .unwrap();
        assert!(outcome.is_degraded());
    }
    backend.set_unreachable(false);

    let kept = Note::new("alpha keep", "from elsewhere", Vec::new());
    backend
        .create(memosync::note_to_document(&kept).unwrap())
        .await
        .unwrap();

    let synced = app.sync().sync_now().await.unwrap();
    assert_eq!(synced.value.len(), 1);

    let hits = app.notes().search("alpha", 10).await.unwrap().value;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id, kept.id);
}

#[tokio::test]
async fn http_poller_stops_after_last_subscription() {
    let remote_config = RemoteConfig {
        // nothing listens here; polls fail fast
        endpoint: "http://127.0.0.1:9".into(),
        api_key: "k-test".into(),
        project_id: "memo-test".into(),
        poll_interval_secs: 1,
        request_timeout_secs: 1,
        ..Default::default()
    };
    let backend = Arc::new(HttpDocumentBackend::new(&remote_config).unwrap());
    let remote = RemoteStore::connect(&remote_config, backend.clone()).unwrap();

    let first = remote.subscribe(|_| {}, |_| {});
    wait_until(|| backend.is_polling()).await;
    let second = remote.subscribe(|_| {}, |_| {});

    first.unsubscribe();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(backend.is_polling());

    remote.unsubscribe_all();
    wait_until(|| !backend.is_polling()).await;
    assert!(!second.is_active());
}

#[tokio::test]
async fn mirrored_writes_reach_remote_and_sync_pulls_back() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, app) = app_with_remote(dir.path());

    let note = app
        .notes()
        .create(NoteInput::new("mirrored", "body"))
        .await
        .unwrap()
        .value;
    assert_eq!(backend.document_count(), 1);
    assert_eq!(app.sync().snapshot().status.pending_uploads, 0);

    // another session edits the remote copy
    let mut edited = note.clone();
    edited.title = "edited elsewhere".into();
    backend
        .update(&note.id, memosync::note_to_document(&edited).unwrap())
        .await
        .unwrap();

    let synced = app.sync().sync_now().await.unwrap().value;
    assert_eq!(synced[0].title, "edited elsewhere");
    assert_eq!(app.notes().get(&note.id).unwrap().unwrap().title, "edited elsewhere");

    let snapshot = app.sync().snapshot();
    assert_eq!(snapshot.activity, SyncActivity::Idle);
    assert!(snapshot.status.last_sync_time.is_some());
    assert_eq!(snapshot.status.pending_uploads, 0);
}

#[tokio::test]
async fn offline_session_keeps_working_locally() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, app) = app_with_remote(dir.path());

    app.sync().handle_network_event(NetworkEvent::Offline);
    let outcome = app
        .notes()
        .create(NoteInput::new("offline", "draft"))
        .await
        .unwrap();
    assert!(!outcome.is_degraded());
    assert_eq!(backend.document_count(), 0);

    // mount falls back to local data without touching the remote
    assert_eq!(app.sync().mount().await.unwrap().len(), 1);
    assert!(matches!(app.sync().sync_now().await, Err(MemoError::Offline)));
    assert_eq!(app.sync().snapshot().status.pending_uploads, 0);
}

#[tokio::test]
async fn live_subscription_sees_remote_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, app) = app_with_remote(dir.path());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let subscription = app
        .sync()
        .subscribe_remote(move |notes| {
            let _ = tx.send(notes.len());
        })
        .unwrap();
    assert_eq!(rx.recv().await, Some(0));

    let note = memosync::Note::new("pushed", "from elsewhere", Vec::new());
    backend
        .create(memosync::note_to_document(&note).unwrap())
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(1));

    subscription.unsubscribe();
}

#[tokio::test]
async fn backup_restore_rebuilds_search() {
    let dir = tempfile::tempdir().unwrap();
    let app = MemoApp::open(config(dir.path())).await.unwrap();
    app.notes()
        .create(NoteInput::new("Release Notes", "v1 ships tomorrow").with_tags(["release"]))
        .await
        .unwrap();

    let backup = app.backups().create_backup().unwrap();
    app.clear_local_data().await.unwrap();
    assert!(app.notes().list(None).unwrap().is_empty());

    let restored = app.restore_backup(&backup, false).await.unwrap();
    assert!(restored.value.entries_restored >= 1);
    assert!(restored.value.failed_entries.is_empty());
    assert_eq!(app.notes().search("release", 10).await.unwrap().value.len(), 1);
}
