//! Snapshot Store Tests

mod common;

use sqljournal::{
    Payload, SnapshotMetadata, SnapshotSelectionCriteria, StoredAs,
};

use common::{open_read_write, open_snapshot_store_with, text_payload};

fn text(payload: &Payload) -> String {
    payload.to_typed::<String>().unwrap()
}

#[tokio::test]
async fn saving_same_key_replaces_snapshot() {
    let (_dir, path, store) = open_snapshot_store_with("snapshot_upsert.db", |_| {}).await;

    store
        .save(SnapshotMetadata::new("p1", 5), text_payload("s-5"))
        .await
        .unwrap();
    store
        .save(SnapshotMetadata::new("p1", 5), text_payload("s-5-modified"))
        .await
        .unwrap();

    let loaded = store
        .load("p1", SnapshotSelectionCriteria::up_to(5))
        .await
        .unwrap()
        .expect("snapshot stored");
    assert_eq!(text(&loaded.snapshot), "s-5-modified");
    assert_eq!(loaded.metadata.sequence_nr, 5);
    assert!(loaded.metadata.timestamp > 0);

    let rows: i64 = open_read_write(&path)
        .query_row("SELECT COUNT(*) FROM snapshot_store", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn load_picks_latest_matching_criteria() {
    let (_dir, _path, store) = open_snapshot_store_with("snapshot_criteria.db", |_| {}).await;

    for (seq, ts) in [(10, 1_000), (20, 2_000), (30, 3_000)] {
        store
            .save(
                SnapshotMetadata::new("p", seq).with_timestamp(ts),
                text_payload(&format!("s-{seq}")),
            )
            .await
            .unwrap();
    }

    let latest = store.load("p", SnapshotSelectionCriteria::latest()).await.unwrap();
    assert_eq!(latest.unwrap().metadata.sequence_nr, 30);

    let up_to = store.load("p", SnapshotSelectionCriteria::up_to(25)).await.unwrap();
    assert_eq!(text(&up_to.unwrap().snapshot), "s-20");

    let by_time = SnapshotSelectionCriteria {
        max_timestamp: 1_500,
        ..SnapshotSelectionCriteria::latest()
    };
    let old = store.load("p", by_time).await.unwrap().unwrap();
    assert_eq!(old.metadata.sequence_nr, 10);
    assert_eq!(old.metadata.timestamp, 1_000);

    let window = SnapshotSelectionCriteria {
        min_sequence_nr: 15,
        max_sequence_nr: 25,
        ..SnapshotSelectionCriteria::latest()
    };
    assert_eq!(
        store.load("p", window).await.unwrap().unwrap().metadata.sequence_nr,
        20
    );

    let too_early = SnapshotSelectionCriteria::up_to(5);
    assert!(store.load("p", too_early).await.unwrap().is_none());
    assert!(store
        .load("p", SnapshotSelectionCriteria::none())
        .await
        .unwrap()
        .is_none());
    assert!(store
        .load("other", SnapshotSelectionCriteria::latest())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delete_one_honors_timestamp() {
    let (_dir, _path, store) = open_snapshot_store_with("snapshot_delete.db", |_| {}).await;
    store
        .save(SnapshotMetadata::new("p", 1).with_timestamp(500), text_payload("s-1"))
        .await
        .unwrap();

    // Wrong timestamp: nothing deleted.
    store
        .delete(&SnapshotMetadata::new("p", 1).with_timestamp(999))
        .await
        .unwrap();
    assert!(store
        .load("p", SnapshotSelectionCriteria::latest())
        .await
        .unwrap()
        .is_some());

    // Zero timestamp matches any.
    store.delete(&SnapshotMetadata::new("p", 1)).await.unwrap();
    assert!(store
        .load("p", SnapshotSelectionCriteria::latest())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delete_many_removes_matching_only() {
    let (_dir, _path, store) = open_snapshot_store_with("snapshot_delete_many.db", |_| {}).await;
    for seq in [1, 2, 3, 4] {
        store
            .save(SnapshotMetadata::new("p", seq), text_payload(&format!("s-{seq}")))
            .await
            .unwrap();
    }
    store
        .save(SnapshotMetadata::new("q", 1), text_payload("q-1"))
        .await
        .unwrap();

    store
        .delete_many("p", SnapshotSelectionCriteria::up_to(3))
        .await
        .unwrap();

    let remaining = store
        .load("p", SnapshotSelectionCriteria::latest())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(remaining.metadata.sequence_nr, 4);
    assert!(store
        .load("p", SnapshotSelectionCriteria::up_to(3))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .load("q", SnapshotSelectionCriteria::latest())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn snapshots_round_trip_in_every_format() {
    for stored_as in [StoredAs::ByteA, StoredAs::Json, StoredAs::JsonB] {
        let (_dir, _path, store) =
            open_snapshot_store_with("snapshot_formats.db", |c| c.stored_as = stored_as).await;

        let state = common::deposit("acc", 1_234);
        store
            .save(SnapshotMetadata::new("acc", 3), state.clone())
            .await
            .unwrap();

        let loaded = store
            .load("acc", SnapshotSelectionCriteria::latest())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.snapshot, state, "{stored_as}");
    }
}
