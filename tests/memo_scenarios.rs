use std::sync::Arc;

use memosync::{
    HighlightField, IndexedStore, KeyValueBackend, KeyValueStore, MemoError, MemoryBackend,
    MemoryDocumentBackend, MemoryIndexedStore, Note, NoteInput, NoteService, NoteStatus,
    NoteUpdate, Priority, RemoteStore, UnavailableIndexedStore, MEMOS_KEY,
};

fn notes_with(index: Arc<dyn IndexedStore>) -> NoteService {
    NoteService::new(Arc::new(KeyValueStore::in_memory("memo_app_")), index)
}

fn notes() -> NoteService {
    notes_with(Arc::new(MemoryIndexedStore::new()))
}

fn release_input() -> NoteInput {
    NoteInput::new("Release Notes", "v1 ships tomorrow").with_tags(["release"])
}

#[tokio::test]
async fn created_note_reads_back_equal() {
    let notes = notes();
    let mut input = release_input();
    input.priority = Some(Priority::High);
    input.project_id = Some("p1".into());

    let created = notes.create(input).await.unwrap().value;
    let fetched = notes.get(&created.id).unwrap().unwrap();

    assert_eq!(fetched, created);
    assert_eq!(fetched.title, "Release Notes");
    assert_eq!(fetched.body, "v1 ships tomorrow");
    assert_eq!(fetched.tags, vec!["release".to_string()]);
    assert_eq!(fetched.priority, Priority::High);
    assert!(fetched.updated_at >= fetched.created_at);
}

#[tokio::test]
async fn clone_is_a_fresh_draft_with_same_content() {
    let notes = notes();
    for status in [NoteStatus::Draft, NoteStatus::Published, NoteStatus::Archived] {
        let source = notes.create(release_input()).await.unwrap().value;
        if status != NoteStatus::Draft {
            notes
                .update(&source.id, NoteUpdate { status: Some(status), ..Default::default() })
                .await
                .unwrap();
        }

        let copy = notes.duplicate(&source.id).await.unwrap().value;
        assert_ne!(copy.id, source.id);
        assert_eq!(copy.status, NoteStatus::Draft);
        assert_eq!(copy.tags, source.tags);
        assert_eq!(copy.body, source.body);
        assert_eq!(copy.priority, source.priority);
        assert!(copy.title.starts_with("Release Notes"));
    }
}

#[tokio::test]
async fn delete_twice_is_fine() {
    let notes = notes();
    let note = notes.create(release_input()).await.unwrap().value;

    notes.delete(&note.id).await.unwrap();
    notes.delete(&note.id).await.unwrap();
    notes.delete("never-existed").await.unwrap();
    assert!(notes.get(&note.id).unwrap().is_none());
}

#[tokio::test]
async fn blank_queries_return_nothing() {
    let notes = notes();
    notes.create(release_input()).await.unwrap();
    notes
        .create(NoteInput::new("Other", "something else"))
        .await
        .unwrap();

    assert!(notes.search("", 20).await.unwrap().value.is_empty());
    assert!(notes.search("   ", 20).await.unwrap().value.is_empty());
}

#[tokio::test]
async fn release_search_highlights_the_tag() {
    let notes = notes();
    let created = notes.create(release_input()).await.unwrap().value;

    let hits = notes.search("release", 20).await.unwrap().value;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id, created.id);
    assert!(hits[0]
        .highlights
        .iter()
        .any(|h| h.field == HighlightField::Tag && h.text == "tag: release"));
    assert_eq!(hits[0].highlights[0].field, HighlightField::Title);
}

#[tokio::test]
async fn search_falls_back_when_index_is_down() {
    let notes = notes_with(Arc::new(UnavailableIndexedStore::new("blocked")));
    let created = notes.create(release_input()).await.unwrap();
    assert!(created.is_degraded());

    let outcome = notes.search("release", 20).await.unwrap();
    assert!(outcome.is_degraded());
    assert_eq!(outcome.value.len(), 1);
    // title 3 + tag 1
    assert_eq!(outcome.value[0].score, Some(4));
    assert!(outcome.value[0]
        .highlights
        .iter()
        .any(|h| h.text == "tag: release"));
}

#[tokio::test]
async fn duplicate_tag_is_rejected_without_change() {
    let notes = notes();
    let note = notes.create(release_input()).await.unwrap().value;

    let err = notes.add_tag(&note.id, "  release ").await.unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("Duplicate"));
    assert_eq!(notes.get(&note.id).unwrap().unwrap().tags, vec!["release".to_string()]);
}

#[tokio::test]
async fn twenty_first_tag_fails() {
    let notes = notes();
    let note = notes
        .create(NoteInput::new("Tags", "lots of tags"))
        .await
        .unwrap()
        .value;

    for i in 0..20 {
        notes.add_tag(&note.id, &format!("tag{i}")).await.unwrap();
    }
    let err = notes.add_tag(&note.id, "tag20").await.unwrap_err();
    assert!(err.to_string().contains("at most 20"));

    let stored = notes.get(&note.id).unwrap().unwrap();
    assert_eq!(stored.tags.len(), 20);
    assert_eq!(stored.tags[0], "tag0");
    assert_eq!(stored.tags[19], "tag19");
}

#[tokio::test]
async fn update_of_missing_note_writes_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let kv = Arc::new(KeyValueStore::new(backend.clone(), "memo_app_", 1 << 20));
    let notes = NoteService::new(kv, Arc::new(MemoryIndexedStore::new()));
    notes.create(release_input()).await.unwrap();
    let before = backend.get_item(&format!("memo_app_{}", MEMOS_KEY)).unwrap();

    let err = notes
        .update("missing", NoteUpdate { title: Some("x".into()), ..Default::default() })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    match err {
        MemoError::Storage { id, operation, .. } => {
            assert_eq!(id.as_deref(), Some("missing"));
            assert_eq!(operation, Some("updateMemo"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let after = backend.get_item(&format!("memo_app_{}", MEMOS_KEY)).unwrap();
    assert_eq!(before, after);
}

#[test]
fn json_round_trip_keeps_dates() {
    let mut note = Note::new("Release Notes", "v1 ships tomorrow", vec!["release".into()]);
    note.status = NoteStatus::Published;
    note.linked_cards = vec!["c1".into()];

    let restored = Note::from_json(&note.to_json().unwrap()).unwrap();
    assert_eq!(restored, note);
    assert_eq!(restored.created_at, note.created_at);
}

#[tokio::test]
async fn offline_remote_write_leaves_pending_unchanged() {
    let remote = Arc::new(RemoteStore::with_backend(Arc::new(MemoryDocumentBackend::new())));
    let notes = notes().with_remote(remote.clone(), true);
    let before = remote.status().pending_uploads;

    remote.set_online(false);
    let note = Note::new("t", "b", Vec::new());
    assert!(matches!(remote.create(&note).await, Err(MemoError::Offline)));
    assert!(matches!(remote.update(&note.id, &note).await, Err(MemoError::Offline)));
    assert!(matches!(remote.delete(&note.id).await, Err(MemoError::Offline)));
    assert_eq!(remote.status().pending_uploads, before);

    // local writes still succeed and are not mirrored
    let outcome = notes.create(release_input()).await.unwrap();
    assert!(!outcome.is_degraded());
    assert_eq!(remote.status().pending_uploads, before);
}
