//! End-to-end tests for documents backed by a real RocksDB store.
//!
//! Every test opens rooms under its own temp directory, closes them and
//! reopens them to check what actually reached storage.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessel_core::{
    CollectionKind, Document, DocumentConfig, Error, Observed, Schema, StoreEvent, SyncOutcome,
};
use tessel_store::{RoomKey, RoomStore, StoreConfig, WalEntry, WalEntryType};

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::builder()
            .sequence("notes")
            .sequence_prefix("messages.")
            .map("meta")
            .text("draft")
            .build()
            .unwrap(),
    )
}

async fn open(dir: &std::path::Path, room: &str) -> Document {
    Document::open_ready(room, schema(), DocumentConfig::for_testing(dir))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fresh_room() {
    let dir = tempfile::tempdir().unwrap();
    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.sync_outcome(), Some(SyncOutcome::Fresh));
    assert!(doc.sequence("notes").unwrap().is_empty().unwrap());
    doc.close();
}

#[tokio::test]
async fn test_reopen_reproduces_every_collection() {
    let dir = tempfile::tempdir().unwrap();
    let (notes, meta, draft) = {
        let doc = open(dir.path(), "inbox").await;
        let notes = doc.sequence("notes").unwrap();
        let meta = doc.map("meta").unwrap();
        let draft = doc.text("draft").unwrap();

        notes.push(json!({"id": "n1", "title": "New Note"})).unwrap();
        notes.insert(0, vec![json!({"id": "n0"})]).unwrap();
        meta.set("owner", json!("ana")).unwrap();
        meta.set("count", json!(2)).unwrap();
        draft.push_str("héllo wörld").unwrap();
        draft.delete(5, 6).unwrap();

        let snapshots = (
            notes.snapshot().unwrap(),
            meta.snapshot().unwrap(),
            draft.snapshot().unwrap(),
        );
        doc.close();
        snapshots
    };

    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.sync_outcome(), Some(SyncOutcome::Restored { commits: 6 }));
    assert_eq!(doc.version(), 6);
    assert_eq!(doc.sequence("notes").unwrap().snapshot().unwrap(), notes);
    assert_eq!(doc.map("meta").unwrap().snapshot().unwrap(), meta);
    assert_eq!(doc.text("draft").unwrap().snapshot().unwrap(), draft);
    assert_eq!(draft, "héllo");

    // Kinds are part of the persisted state
    assert!(matches!(doc.map("notes"), Err(Error::KindMismatch { .. })));
}

#[tokio::test]
async fn test_compaction_then_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let expected = {
        let doc = open(dir.path(), "inbox").await;
        let mut events = doc.take_event_rx().unwrap();
        let notes = doc.sequence("notes").unwrap();
        // Threshold is 8 in the testing config
        for i in 0..20 {
            notes.push(json!(i)).unwrap();
        }
        doc.flush();
        let mut compacted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::Compacted { version } = event {
                compacted.push(version);
            }
        }
        assert_eq!(compacted, vec![8, 16]);
        let snapshot = notes.snapshot().unwrap();
        doc.close();
        snapshot
    };

    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.version(), 20);
    assert_eq!(doc.sequence("notes").unwrap().snapshot().unwrap(), expected);

    // Versions keep counting after a restore
    doc.sequence("notes").unwrap().push(json!(20)).unwrap();
    assert_eq!(doc.version(), 21);
}

#[tokio::test]
async fn test_wipe_then_reopen_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let doc = open(dir.path(), "inbox").await;
        doc.sequence("notes").unwrap().push(json!(1)).unwrap();
        doc.sequence("messages.n1").unwrap().push(json!("hi")).unwrap();
        doc.map("meta").unwrap().set("k", json!(true)).unwrap();
        doc.close();
    }
    {
        let doc = open(dir.path(), "inbox").await;
        let mut events = doc.take_event_rx().unwrap();
        doc.wipe().unwrap();
        doc.flush();
        assert_eq!(events.try_recv().ok(), Some(StoreEvent::Wiped));
        doc.close();
    }

    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.sync_outcome(), Some(SyncOutcome::Fresh));
    assert!(doc.sequence("notes").unwrap().is_empty().unwrap());
    assert!(doc.sequence("messages.n1").unwrap().is_empty().unwrap());
    assert!(doc.map("meta").unwrap().snapshot().unwrap().is_empty());
}

#[tokio::test]
async fn test_rooms_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let a = open(dir.path(), "a").await;
    let b = open(dir.path(), "b").await;
    a.sequence("notes").unwrap().push(json!("from a")).unwrap();
    assert!(b.sequence("notes").unwrap().is_empty().unwrap());
    a.close();
    b.close();

    let b = open(dir.path(), "b").await;
    assert_eq!(b.sync_outcome(), Some(SyncOutcome::Fresh));
}

#[tokio::test]
async fn test_corrupted_log_recovers_empty() {
    let dir = tempfile::tempdir().unwrap();
    {
        let doc = open(dir.path(), "inbox").await;
        doc.sequence("notes").unwrap().push(json!(1)).unwrap();
        doc.close();
    }
    {
        // Append an entry whose payload is not a commit record
        let key = RoomKey::from_name("inbox");
        let store = RoomStore::open(StoreConfig::for_testing(dir.path()).for_room(key)).unwrap();
        let junk = WalEntry::new(2, WalEntryType::Delta, key, vec![0xFF; 5]);
        store.write_deltas(key, &[junk]).unwrap();
    }

    let doc = open(dir.path(), "inbox").await;
    let mut events = doc.take_event_rx().unwrap();
    match doc.sync_outcome() {
        Some(SyncOutcome::RecoveredEmpty { error }) => {
            assert!(!Error::from(error).is_programming_error())
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Reported by the writer once the load callback returned
    assert!(matches!(events.recv().await, Some(StoreEvent::DecodeFailed(_))));

    // Nothing partial: the valid first commit is not there either
    let notes = doc.sequence("notes").unwrap();
    assert!(notes.is_empty().unwrap());

    // Writes are held back until the room is wiped
    notes.push(json!("lost")).unwrap();
    doc.close();
    let doc = open(dir.path(), "inbox").await;
    assert!(matches!(
        doc.sync_outcome(),
        Some(SyncOutcome::RecoveredEmpty { .. })
    ));

    doc.wipe().unwrap();
    doc.sequence("notes").unwrap().push(json!("kept")).unwrap();
    doc.close();
    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.sync_outcome(), Some(SyncOutcome::Restored { commits: 1 }));
    assert_eq!(
        doc.sequence("notes").unwrap().snapshot().unwrap(),
        vec![json!("kept")]
    );
}

#[tokio::test]
async fn test_unavailable_medium_degrades_to_volatile() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("data");
    std::fs::write(&blocker, b"a file, not a directory").unwrap();

    let doc = Document::open_ready("inbox", schema(), DocumentConfig::for_testing(&blocker))
        .await
        .unwrap();
    let mut events = doc.take_event_rx().unwrap();
    assert!(matches!(doc.sync_outcome(), Some(SyncOutcome::Volatile { .. })));
    assert!(matches!(events.recv().await, Some(StoreEvent::Unavailable { .. })));

    // Still fully usable in memory
    let notes = doc.sequence("notes").unwrap();
    notes.push(json!(1)).unwrap();
    assert_eq!(notes.snapshot().unwrap(), vec![json!(1)]);
}

#[tokio::test]
async fn test_observe_never_reports_empty_while_loading() {
    let dir = tempfile::tempdir().unwrap();
    {
        let doc = open(dir.path(), "inbox").await;
        doc.sequence("notes").unwrap().push(json!("n1")).unwrap();
        doc.close();
    }

    let doc = Document::open("inbox", schema(), DocumentConfig::for_testing(dir.path()));
    let notes = doc.observe("notes", CollectionKind::Sequence).unwrap();
    let was_pending = match notes.current() {
        Observed::Pending => true,
        Observed::Ready(value) => {
            assert_eq!(value, json!(["n1"]));
            false
        }
    };

    doc.ready().await.unwrap();
    assert_eq!(notes.current(), Observed::Ready(json!(["n1"])));
    // The first snapshot is pushed only to observers that had to wait for it
    assert_eq!(notes.push_count(), u64::from(was_pending));
}

#[tokio::test]
async fn test_initial_sync_hook_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    let doc = Document::open("inbox", schema(), DocumentConfig::for_testing(dir.path()));
    doc.on_initial_sync(move |doc| {
        counter.fetch_add(1, Ordering::SeqCst);
        let notes = doc.sequence("notes").unwrap();
        if notes.is_empty().unwrap() {
            notes.push(json!({"id": "seed"})).unwrap();
        }
    });
    doc.ready().await.unwrap();
    doc.ready().await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(doc.sequence("notes").unwrap().len().unwrap(), 1);
}

#[tokio::test]
async fn test_note_and_message_in_one_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let doc = open(dir.path(), "inbox").await;
    let notes = doc.sequence("notes").unwrap();

    notes.insert(0, vec![json!({"id": "n1", "title": "New Note"})]).unwrap();
    let observed = doc.observe("notes", CollectionKind::Sequence).unwrap();
    assert_eq!(
        observed.current().into_value(),
        Some(json!([{"id": "n1", "title": "New Note"}]))
    );

    let messages_observed = doc.observe("messages.n1", CollectionKind::Sequence).unwrap();
    let messages = doc.sequence("messages.n1").unwrap();
    doc.transact(|tx| {
        tx.sequence(&messages)?.push(json!({"id": "m1", "data": "hi"}));
        let mut notes = tx.sequence(&notes)?;
        let mut note = notes.get(0).unwrap_or_default();
        note["title"] = json!("hi");
        notes.replace(0, note);
        Ok::<_, Error>(())
    })
    .unwrap();

    assert_eq!(
        observed.current().into_value(),
        Some(json!([{"id": "n1", "title": "hi"}]))
    );
    assert_eq!(
        messages_observed.current().into_value(),
        Some(json!([{"id": "m1", "data": "hi"}]))
    );
    assert_eq!(observed.push_count(), 1);
    assert_eq!(messages_observed.push_count(), 1);
}

#[tokio::test]
async fn test_close_while_writes_queued() {
    let dir = tempfile::tempdir().unwrap();
    {
        let doc = open(dir.path(), "inbox").await;
        let notes = doc.sequence("notes").unwrap();
        let obs = doc.observe("notes", CollectionKind::Sequence).unwrap();
        for i in 0..50 {
            notes.push(json!(i)).unwrap();
        }
        doc.close();
        assert!(!obs.is_attached());
        assert_eq!(obs.push_count(), 50);
    }
    let doc = open(dir.path(), "inbox").await;
    assert_eq!(doc.sequence("notes").unwrap().len().unwrap(), 50);
}
