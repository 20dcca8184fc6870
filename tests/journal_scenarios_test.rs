//! Journal Scenario Tests
//!
//! End-to-end behavior of the public journal handle:
//! - Writes are replayed in order and the highest sequence number follows them
//! - Deleting events never lowers the highest sequence number
//! - Tag replay returns only tagged events
//! - Concurrent writers of one sequence number produce exactly one winner

mod common;

use sqljournal::{AtomicWrite, Error, TagStorage, MAX_SEQUENCE_NR};

use common::{event, open_journal, open_journal_with, payload_text, range_write, single};

#[tokio::test]
async fn write_then_replay_in_order() {
    let (_dir, _path, journal) = open_journal("scenario_a.db").await;

    for seq in 1..=5 {
        let result = journal.write(single("p1", seq, &format!("e{seq}"))).await.unwrap();
        assert_eq!(result.next_sequence_nr(), seq + 1);
    }

    assert_eq!(journal.read_highest_sequence_nr("p1").await.unwrap(), 5);

    let events = journal
        .replay_messages("p1", 0, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR)
        .await
        .unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.sequence_nr).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(payload_text(&events[2]), "e3");
    assert!(events.iter().all(|e| e.persistence_id == "p1" && e.timestamp > 0));

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_all_keeps_highest_sequence_nr() {
    let (_dir, _path, journal) = open_journal("scenario_b.db").await;

    journal.write(range_write("p1", 1, 5)).await.unwrap();
    journal.delete_messages_to("p1", MAX_SEQUENCE_NR).await.unwrap();

    let events = journal
        .replay_messages("p1", 0, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR)
        .await
        .unwrap();
    assert!(events.is_empty());
    assert_eq!(journal.read_highest_sequence_nr("p1").await.unwrap(), 5);

    // The stream resumes after the preserved high-water mark.
    let next = journal.write(single("p1", 6, "e6")).await.unwrap();
    assert_eq!(next.highest_sequence_nr, 6);
    assert_eq!(journal.read_highest_sequence_nr("p1").await.unwrap(), 6);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn partial_delete_keeps_tail() {
    let (_dir, _path, journal) = open_journal("partial_delete.db").await;

    journal.write(range_write("p1", 1, 5)).await.unwrap();
    journal.delete_messages_to("p1", 3).await.unwrap();

    let events = journal
        .replay_messages("p1", 1, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR)
        .await
        .unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.sequence_nr).collect();
    assert_eq!(seqs, vec![4, 5]);
    assert_eq!(journal.read_highest_sequence_nr("p1").await.unwrap(), 5);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn tag_replay_returns_only_tagged_events() {
    for storage in [TagStorage::Array, TagStorage::Delimited] {
        let (_dir, _path, journal) =
            open_journal_with("scenario_c.db", |c| c.tag_storage = storage).await;

        journal.write(single("p1", 1, "untagged")).await.unwrap();
        journal
            .write(AtomicWrite::single(event("p1", 2, "tagged").with_tags(["green"])).unwrap())
            .await
            .unwrap();

        let replay = journal.events_by_tag("green", 0, 10).await.unwrap();
        assert_eq!(replay.events.len(), 1, "{storage:?}");
        let tagged = &replay.events[0];
        assert_eq!(tagged.tag, "green");
        assert_eq!(tagged.event.sequence_nr, 2);
        assert_eq!(payload_text(&tagged.event), "tagged");
        assert_eq!(replay.max_ordering, tagged.ordering);

        journal.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn concurrent_writers_of_same_sequence_nr_conflict() {
    let (_dir, path, journal) = open_journal("scenario_d.db").await;

    let (first, second) = tokio::join!(
        journal.write(single("p2", 1, "writer-a")),
        journal.write(single("p2", 1, "writer-b")),
    );

    let outcomes = [first, second];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(
        matches!(loser, Error::Conflict { persistence_id, sequence_nr: 1 } if persistence_id == "p2"),
        "unexpected error: {loser:?}"
    );

    // Never overwritten: exactly one physical row for the pair.
    let conn = common::open_read_write(&path);
    let rows: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM event_journal WHERE persistence_id = 'p2' AND sequence_nr = 1",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(rows, 1);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn same_stream_writes_apply_in_submission_order() {
    let (_dir, _path, journal) =
        open_journal_with("ordering.db", |c| c.max_batch_size = 7).await;

    // Two streams interleaved, each submitted in sequence order.
    let writes: Vec<AtomicWrite> = (1..=40)
        .flat_map(|seq| [single("left", seq, "l"), single("right", seq, "r")])
        .collect();

    let results = journal.write_many(writes).await;
    assert_eq!(results.len(), 80);
    for (i, result) in results.iter().enumerate() {
        let written = result.as_ref().unwrap();
        assert_eq!(written.highest_sequence_nr, (i / 2) as i64 + 1);
    }

    for pid in ["left", "right"] {
        let events = journal
            .replay_messages(pid, 1, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR)
            .await
            .unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, (1..=40).collect::<Vec<_>>());
    }

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_reports_orderings_in_event_order() {
    let (_dir, _path, journal) = open_journal("orderings.db").await;

    let first = journal.write(range_write("a", 1, 3)).await.unwrap();
    let second = journal.write(range_write("b", 1, 2)).await.unwrap();

    assert_eq!(first.orderings.len(), 3);
    assert!(first.orderings.windows(2).all(|w| w[0] < w[1]));
    assert!(second.orderings[0] > first.orderings[2]);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn replay_respects_bounds_and_limit() {
    let (_dir, _path, journal) = open_journal("bounds.db").await;

    journal.write(range_write("p", 1, 10)).await.unwrap();

    let window = journal.replay_messages("p", 3, 7, MAX_SEQUENCE_NR).await.unwrap();
    assert_eq!(window.first().unwrap().sequence_nr, 3);
    assert_eq!(window.last().unwrap().sequence_nr, 7);

    let limited = journal.replay_messages("p", 1, MAX_SEQUENCE_NR, 4).await.unwrap();
    assert_eq!(limited.len(), 4);

    assert!(journal.replay_messages("p", 1, 10, 0).await.unwrap().is_empty());
    assert!(journal.replay_messages("p", 8, 2, 10).await.unwrap().is_empty());
    assert!(journal.replay_messages("missing", 1, 10, 10).await.unwrap().is_empty());
    assert_eq!(journal.read_highest_sequence_nr("missing").await.unwrap(), 0);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn persistence_ids_include_fully_deleted_streams() {
    let (_dir, _path, journal) = open_journal("persistence_ids.db").await;

    journal.write(single("b", 1, "x")).await.unwrap();
    journal.write(single("a", 1, "x")).await.unwrap();
    journal.write(range_write("gone", 1, 2)).await.unwrap();
    journal.delete_messages_to("gone", MAX_SEQUENCE_NR).await.unwrap();

    let ids = journal.persistence_ids().await.unwrap();
    assert_eq!(ids, vec!["a".to_string(), "b".to_string(), "gone".to_string()]);

    journal.shutdown().await.unwrap();
}

#[tokio::test]
async fn reopened_journal_sees_committed_events() {
    let (_dir, path, journal) = open_journal("reopen.db").await;
    journal.write(range_write("p", 1, 3)).await.unwrap();
    journal.delete_messages_to("p", 3).await.unwrap();
    journal.shutdown().await.unwrap();
    drop(journal);

    let settings = common::journal_config(&path).build().unwrap();
    let reopened = sqljournal::Journal::open(
        settings,
        std::sync::Arc::new(sqljournal::SerializerRegistry::new()),
    )
    .await
    .unwrap();

    assert_eq!(reopened.read_highest_sequence_nr("p").await.unwrap(), 3);
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn written_events_are_never_stored_as_deleted() {
    let (_dir, _path, journal) = open_journal("stored_not_deleted.db").await;

    let mut marked = event("p", 1, "kept");
    marked.is_deleted = true;
    journal.write(AtomicWrite::single(marked).unwrap()).await.unwrap();

    let events = journal
        .replay_messages("p", 1, MAX_SEQUENCE_NR, MAX_SEQUENCE_NR)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(!events[0].is_deleted);
    assert_eq!(payload_text(&events[0]), "kept");

    journal.shutdown().await.unwrap();
}
