//! Behavior every `QueueStore` backend must share. Each case is a generic
//! function; `conformance_suite!` instantiates the full list per backend.

use std::sync::Barrier;
use std::thread;

use super::*;
use crate::error::{DeleteError, InsertError, InvalidFilter, SelectError, StorageError};
use crate::filter::RangeFilter;
use crate::partition::{Fence, Partition, PartitionMeta, QueueRow, TaskId};

const RANGE_HASH: u32 = 42;
const ENCODING: &str = "random encoding";
const TASK_DATA: &[u8] = b"random matching task data";

fn rocksdb_store() -> (RocksDbStorage, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let storage = RocksDbStorage::open(dir.path()).unwrap();
    (storage, dir)
}

fn memory_store() -> (MemoryStore, ()) {
    (MemoryStore::new(), ())
}

fn partition(queue: &str) -> Partition {
    Partition::new(RANGE_HASH, queue.as_bytes().to_vec())
}

fn row(p: &Partition, task_id: TaskId) -> QueueRow {
    QueueRow::new(p, task_id, TASK_DATA.to_vec(), ENCODING)
}

fn owned<S: QueueStore>(store: &S, p: &Partition, token: u64) -> Fence {
    let meta = PartitionMeta {
        fence_token: token,
        task_id_ceiling: 0,
    };
    let expected = store.get_partition_meta(p).unwrap().map(|m| m.fence_token);
    assert!(store
        .compare_and_set_partition_meta(p, expected, &meta)
        .unwrap());
    Fence::new(p.clone(), token)
}

// --- Insert ---

fn insert_single_success<S: QueueStore>(store: &S) {
    let p = partition("insert-single");
    assert_eq!(store.insert_rows(&[row(&p, 1)], None).unwrap(), 1);
}

fn insert_multiple_success<S: QueueStore>(store: &S) {
    let p = partition("insert-multiple");
    assert_eq!(
        store.insert_rows(&[row(&p, 1), row(&p, 2)], None).unwrap(),
        2
    );
}

fn insert_duplicate_rejected_and_original_kept<S: QueueStore>(store: &S) {
    let p = partition("insert-dup");
    store.insert_rows(&[row(&p, 1)], None).unwrap();

    let replacement = QueueRow::new(&p, 1, b"other payload".to_vec(), "other");
    let err = store.insert_rows(&[replacement], None).unwrap_err();
    match err {
        InsertError::DuplicateKey {
            partition: dup,
            task_id,
        } => {
            assert_eq!(dup, p);
            assert_eq!(task_id, 1);
        }
        other => panic!("expected DuplicateKey, got {other:?}"),
    }

    let rows = store.select_rows(&RangeFilter::point(p.clone(), 1)).unwrap();
    assert_eq!(rows, vec![row(&p, 1)]);
}

fn insert_batch_with_existing_key_is_atomic<S: QueueStore>(store: &S) {
    let p = partition("insert-batch-dup");
    store.insert_rows(&[row(&p, 1), row(&p, 2)], None).unwrap();

    let err = store
        .insert_rows(&[row(&p, 3), row(&p, 2), row(&p, 4)], None)
        .unwrap_err();
    assert!(matches!(err, InsertError::DuplicateKey { task_id: 2, .. }));

    let rows = store.select_rows(&RangeFilter::all(p.clone())).unwrap();
    let ids: Vec<TaskId> = rows.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, vec![1, 2], "no row of the rejected batch may be visible");
}

fn insert_batch_repeating_key_is_rejected<S: QueueStore>(store: &S) {
    let p = partition("insert-self-dup");
    let err = store
        .insert_rows(&[row(&p, 5), row(&p, 5)], None)
        .unwrap_err();
    assert!(matches!(err, InsertError::DuplicateKey { task_id: 5, .. }));
    assert!(store.select_rows(&RangeFilter::all(p)).unwrap().is_empty());
}

fn same_task_id_in_other_partition_is_not_duplicate<S: QueueStore>(store: &S) {
    let a = partition("collide-a");
    let b = partition("collide-b");
    store.insert_rows(&[row(&a, 1)], None).unwrap();
    assert_eq!(store.insert_rows(&[row(&b, 1)], None).unwrap(), 1);
}

fn empty_batch_inserts_nothing<S: QueueStore>(store: &S) {
    assert_eq!(store.insert_rows(&[], None).unwrap(), 0);
}

// --- Select ---

fn insert_select_single<S: QueueStore>(store: &S) {
    let p = partition("select-single");
    let task = row(&p, 100);
    store.insert_rows(&[task.clone()], None).unwrap();

    let rows = store
        .select_rows(&RangeFilter::range(p.clone(), 99, 100).with_page_size(1))
        .unwrap();
    assert_eq!(rows, vec![task.clone()]);

    let exact = store
        .select_rows(&RangeFilter::range(p.clone(), 100, 100))
        .unwrap();
    assert_eq!(exact, vec![task.clone()]);

    let half_open = store
        .select_rows(&RangeFilter::range(p, 100, 101))
        .unwrap();
    assert_eq!(half_open, vec![task]);
}

fn insert_select_multiple<S: QueueStore>(store: &S) {
    let p = partition("select-multiple");
    let task1 = row(&p, 100);
    let task2 = row(&p, 101);
    assert_eq!(
        store
            .insert_rows(&[task1.clone(), task2.clone()], None)
            .unwrap(),
        2
    );

    let rows = store
        .select_rows(&RangeFilter::range(p, 99, 101).with_page_size(2))
        .unwrap();
    assert_eq!(rows, vec![task1, task2]);
}

fn select_truncates_to_page_size<S: QueueStore>(store: &S) {
    let p = partition("select-page");
    let rows: Vec<QueueRow> = (1..=10).map(|id| row(&p, id)).collect();
    store.insert_rows(&rows, None).unwrap();

    let page = store
        .select_rows(&RangeFilter::range(p, 3, 100).with_page_size(4))
        .unwrap();
    let ids: Vec<TaskId> = page.iter().map(|r| r.task_id).collect();
    assert_eq!(ids, vec![3, 4, 5, 6]);
}

fn select_missing_is_empty<S: QueueStore>(store: &S) {
    let p = partition("select-missing");
    assert!(store
        .select_rows(&RangeFilter::point(p.clone(), 7))
        .unwrap()
        .is_empty());
    assert!(store
        .select_rows(&RangeFilter::range(p.clone(), 1, 1000))
        .unwrap()
        .is_empty());
    assert!(store
        .select_rows(&RangeFilter::range(p, 10, 1))
        .unwrap()
        .is_empty());
}

fn select_is_scoped_to_partition<S: QueueStore>(store: &S) {
    let a = partition("scope-a");
    let b = Partition::new(RANGE_HASH + 1, b"scope-a".to_vec());
    store.insert_rows(&[row(&a, 1), row(&b, 2)], None).unwrap();

    let rows = store.select_rows(&RangeFilter::all(a.clone())).unwrap();
    assert_eq!(rows, vec![row(&a, 1)]);
}

fn select_orders_by_task_id_regardless_of_insert_order<S: QueueStore>(store: &S) {
    let p = partition("select-order");
    for id in [50, -3, 7, 1000, 0, 8] {
        store.insert_rows(&[row(&p, id)], None).unwrap();
    }
    let ids: Vec<TaskId> = store
        .select_rows(&RangeFilter::all(p))
        .unwrap()
        .iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(ids, vec![-3, 0, 7, 8, 50, 1000]);
}

fn select_rejects_mixed_filter<S: QueueStore>(store: &S) {
    let mut filter = RangeFilter::point(partition("select-mixed"), 1);
    filter.max_task_id = Some(5);
    assert!(matches!(
        store.select_rows(&filter),
        Err(SelectError::InvalidFilter(InvalidFilter::PointWithRange))
    ));
}

// --- Delete ---

fn insert_delete_select_single<S: QueueStore>(store: &S) {
    let p = partition("delete-single");
    let task = row(&p, 100);
    store.insert_rows(&[task], None).unwrap();

    assert_eq!(
        store
            .delete_rows(&RangeFilter::point(p.clone(), 100), None)
            .unwrap(),
        1
    );
    assert!(store
        .select_rows(&RangeFilter::range(p, 99, 100).with_page_size(1))
        .unwrap()
        .is_empty());
}

fn insert_delete_select_multiple<S: QueueStore>(store: &S) {
    let p = partition("delete-multiple");
    store
        .insert_rows(&[row(&p, 100), row(&p, 101)], None)
        .unwrap();

    assert_eq!(
        store
            .delete_rows(&RangeFilter::up_to(p.clone(), 101, Some(2)), None)
            .unwrap(),
        2
    );
    assert!(store
        .select_rows(&RangeFilter::range(p, 99, 101).with_page_size(2))
        .unwrap()
        .is_empty());
}

fn delete_is_idempotent<S: QueueStore>(store: &S) {
    let p = partition("delete-idempotent");
    store.insert_rows(&[row(&p, 1)], None).unwrap();

    let point = RangeFilter::point(p.clone(), 1);
    assert_eq!(store.delete_rows(&point, None).unwrap(), 1);
    assert_eq!(store.delete_rows(&point, None).unwrap(), 0);

    let threshold = RangeFilter::up_to(p, 1_000, Some(10));
    assert_eq!(store.delete_rows(&threshold, None).unwrap(), 0);
    assert_eq!(store.delete_rows(&threshold, None).unwrap(), 0);
}

fn threshold_delete_removes_oldest_first<S: QueueStore>(store: &S) {
    let p = partition("delete-threshold");
    let rows: Vec<QueueRow> = (1..=10).map(|id| row(&p, id)).collect();
    store.insert_rows(&rows, None).unwrap();

    assert_eq!(
        store
            .delete_rows(&RangeFilter::up_to(p.clone(), 6, Some(4)), None)
            .unwrap(),
        4
    );
    let ids: Vec<TaskId> = store
        .select_rows(&RangeFilter::all(p))
        .unwrap()
        .iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);
}

fn range_delete_respects_bounds<S: QueueStore>(store: &S) {
    let p = partition("delete-range");
    let rows: Vec<QueueRow> = (1..=6).map(|id| row(&p, id)).collect();
    store.insert_rows(&rows, None).unwrap();

    assert_eq!(
        store
            .delete_rows(&RangeFilter::range(p.clone(), 2, 4), None)
            .unwrap(),
        3
    );
    let ids: Vec<TaskId> = store
        .select_rows(&RangeFilter::all(p))
        .unwrap()
        .iter()
        .map(|r| r.task_id)
        .collect();
    assert_eq!(ids, vec![1, 5, 6]);
}

fn unbounded_delete_is_rejected<S: QueueStore>(store: &S) {
    let p = partition("delete-unbounded");
    store.insert_rows(&[row(&p, 1)], None).unwrap();
    assert!(matches!(
        store.delete_rows(&RangeFilter::all(p.clone()), None),
        Err(DeleteError::InvalidFilter(InvalidFilter::Unbounded))
    ));
    assert_eq!(store.select_rows(&RangeFilter::all(p)).unwrap().len(), 1);
}

// --- Fencing ---

fn fenced_insert_requires_current_token<S: QueueStore>(store: &S) {
    let p = partition("fence-insert");

    // Never acquired: nothing can match.
    let err = store
        .insert_rows(&[row(&p, 1)], Some(&Fence::new(p.clone(), 1)))
        .unwrap_err();
    assert!(matches!(err, InsertError::FencedOut(_)));

    let first = owned(store, &p, 1);
    assert_eq!(store.insert_rows(&[row(&p, 1)], Some(&first)).unwrap(), 1);

    let second = owned(store, &p, 2);
    let err = store
        .insert_rows(&[row(&p, 2)], Some(&first))
        .unwrap_err();
    match err {
        InsertError::FencedOut(fenced) => {
            assert_eq!(fenced.presented, 1);
            assert_eq!(fenced.current, 2);
        }
        other => panic!("expected FencedOut, got {other:?}"),
    }
    assert_eq!(store.insert_rows(&[row(&p, 2)], Some(&second)).unwrap(), 1);
}

fn fenced_insert_rejects_foreign_rows<S: QueueStore>(store: &S) {
    let p = partition("fence-foreign");
    let other = partition("fence-foreign-other");
    let fence = owned(store, &p, 1);
    let err = store
        .insert_rows(&[row(&p, 1), row(&other, 2)], Some(&fence))
        .unwrap_err();
    assert!(matches!(err, InsertError::PartitionMismatch { .. }));
    assert!(store.select_rows(&RangeFilter::all(p)).unwrap().is_empty());
}

fn fenced_delete_requires_current_token<S: QueueStore>(store: &S) {
    let p = partition("fence-delete");
    let stale = owned(store, &p, 1);
    store.insert_rows(&[row(&p, 1)], Some(&stale)).unwrap();
    let current = owned(store, &p, 2);

    let trim = RangeFilter::up_to(p.clone(), 10, None);
    assert!(matches!(
        store.delete_rows(&trim, Some(&stale)),
        Err(DeleteError::FencedOut(_))
    ));
    assert_eq!(
        store.select_rows(&RangeFilter::all(p.clone())).unwrap().len(),
        1
    );
    assert_eq!(store.delete_rows(&trim, Some(&current)).unwrap(), 1);
}

fn oversized_queue_id_is_rejected<S: QueueStore>(store: &S) {
    let largest = Partition::new(RANGE_HASH, vec![b'q'; 65_535]);
    assert_eq!(store.insert_rows(&[row(&largest, 1)], None).unwrap(), 1);
    assert_eq!(
        store.select_rows(&RangeFilter::all(largest)).unwrap().len(),
        1
    );

    let p = Partition::new(RANGE_HASH, vec![b'q'; 65_536]);
    assert!(matches!(
        store.insert_rows(&[row(&p, 1)], None),
        Err(InsertError::Storage(StorageError::KeyTooLong(65_536)))
    ));
    assert!(matches!(
        store.select_rows(&RangeFilter::all(p.clone())),
        Err(SelectError::Storage(StorageError::KeyTooLong(_)))
    ));
    assert!(matches!(
        store.delete_rows(&RangeFilter::point(p.clone(), 1), None),
        Err(DeleteError::Storage(StorageError::KeyTooLong(_)))
    ));
    assert!(matches!(
        store.get_partition_meta(&p),
        Err(StorageError::KeyTooLong(_))
    ));
    let meta = PartitionMeta {
        fence_token: 1,
        task_id_ceiling: 0,
    };
    assert!(matches!(
        store.compare_and_set_partition_meta(&p, None, &meta),
        Err(StorageError::KeyTooLong(_))
    ));
}

// --- Partition metadata ---

fn partition_meta_compare_and_set<S: QueueStore>(store: &S) {
    let p = partition("meta-cas");
    assert_eq!(store.get_partition_meta(&p).unwrap(), None);

    let first = PartitionMeta {
        fence_token: 1,
        task_id_ceiling: 100,
    };
    assert!(store
        .compare_and_set_partition_meta(&p, None, &first)
        .unwrap());
    assert!(!store
        .compare_and_set_partition_meta(&p, None, &first)
        .unwrap());

    let second = PartitionMeta {
        fence_token: 2,
        task_id_ceiling: 200,
    };
    assert!(!store
        .compare_and_set_partition_meta(&p, Some(5), &second)
        .unwrap());
    assert!(store
        .compare_and_set_partition_meta(&p, Some(1), &second)
        .unwrap());
    assert_eq!(store.get_partition_meta(&p).unwrap(), Some(second));

    let listed = store.list_partitions().unwrap();
    assert!(listed.contains(&(p, second)));
}

// --- Concurrency ---

fn task_ids<S: QueueStore>(store: &S, p: &Partition) -> Vec<TaskId> {
    store
        .select_rows(&RangeFilter::all(p.clone()))
        .unwrap()
        .iter()
        .map(|r| r.task_id)
        .collect()
}

fn racing_inserts_of_one_key_admit_exactly_one<S: QueueStore>(store: &S) {
    let p = partition("race-duplicate");
    for task_id in 1..=20 {
        let barrier = Barrier::new(2);
        let attempt = || {
            barrier.wait();
            store.insert_rows(&[row(&p, task_id)], None)
        };
        let (a, b) = thread::scope(|s| {
            let a = s.spawn(attempt);
            let b = s.spawn(attempt);
            (a.join().unwrap(), b.join().unwrap())
        });

        let results = [a, b];
        let accepted = results.iter().filter(|r| matches!(r, Ok(1))).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(InsertError::DuplicateKey { .. })))
            .count();
        assert_eq!((accepted, rejected), (1, 1), "task {task_id}: {results:?}");
    }
    assert_eq!(task_ids(store, &p), (1..=20).collect::<Vec<TaskId>>());
}

fn stale_writer_cannot_land_after_token_bump<S: QueueStore>(store: &S) {
    let p = partition("race-fence");
    let stale = owned(store, &p, 1);
    let barrier = Barrier::new(2);

    let (accepted, visible_at_bump) = thread::scope(|s| {
        let writer = s.spawn(|| {
            barrier.wait();
            let mut accepted = Vec::new();
            for task_id in 1.. {
                match store.insert_rows(&[row(&p, task_id)], Some(&stale)) {
                    Ok(_) => accepted.push(task_id),
                    Err(InsertError::FencedOut(fenced)) => {
                        assert_eq!(fenced.current, 2);
                        break;
                    }
                    Err(other) => panic!("unexpected insert error: {other:?}"),
                }
            }
            accepted
        });

        barrier.wait();
        owned(store, &p, 2);
        let visible = task_ids(store, &p);
        (writer.join().unwrap(), visible)
    });

    // Every write accepted under the old token committed before the bump.
    assert_eq!(accepted, visible_at_bump);
    assert_eq!(task_ids(store, &p), visible_at_bump);
    assert!(matches!(
        store.insert_rows(&[row(&p, 0)], Some(&stale)),
        Err(InsertError::FencedOut(_))
    ));
}

macro_rules! conformance_suite {
    ($backend:ident, $setup:expr) => {
        mod $backend {
            use super::*;

            conformance_suite!(@cases $setup;
                insert_single_success,
                insert_multiple_success,
                insert_duplicate_rejected_and_original_kept,
                insert_batch_with_existing_key_is_atomic,
                insert_batch_repeating_key_is_rejected,
                same_task_id_in_other_partition_is_not_duplicate,
                empty_batch_inserts_nothing,
                insert_select_single,
                insert_select_multiple,
                select_truncates_to_page_size,
                select_missing_is_empty,
                select_is_scoped_to_partition,
                select_orders_by_task_id_regardless_of_insert_order,
                select_rejects_mixed_filter,
                insert_delete_select_single,
                insert_delete_select_multiple,
                delete_is_idempotent,
                threshold_delete_removes_oldest_first,
                range_delete_respects_bounds,
                unbounded_delete_is_rejected,
                fenced_insert_requires_current_token,
                fenced_insert_rejects_foreign_rows,
                fenced_delete_requires_current_token,
                oversized_queue_id_is_rejected,
                partition_meta_compare_and_set,
                racing_inserts_of_one_key_admit_exactly_one,
                stale_writer_cannot_land_after_token_bump,
            );
        }
    };
    (@cases $setup:expr; $($case:ident),* $(,)?) => {
        $(
            #[test]
            fn $case() {
                let (store, _guard) = $setup;
                super::$case(&store);
            }
        )*
    };
}

conformance_suite!(rocksdb, rocksdb_store());
conformance_suite!(memory, memory_store());

mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn check_ordering<S: QueueStore>(
        store: &S,
        ids: &BTreeSet<TaskId>,
        shuffled: &[TaskId],
    ) {
        let p = partition("prop-order");
        for chunk in shuffled.chunks(3) {
            let rows: Vec<QueueRow> = chunk.iter().map(|id| row(&p, *id)).collect();
            store.insert_rows(&rows, None).unwrap();
        }
        let selected: Vec<TaskId> = store
            .select_rows(&RangeFilter::all(p))
            .unwrap()
            .iter()
            .map(|r| r.task_id)
            .collect();
        let expected: Vec<TaskId> = ids.iter().copied().collect();
        assert_eq!(selected, expected);
    }

    fn check_threshold<S: QueueStore>(
        store: &S,
        ids: &BTreeSet<TaskId>,
        k: TaskId,
        limit: usize,
    ) {
        let p = partition("prop-threshold");
        let rows: Vec<QueueRow> = ids.iter().map(|id| row(&p, *id)).collect();
        store.insert_rows(&rows, None).unwrap();

        let eligible: Vec<TaskId> = ids.iter().copied().filter(|id| *id <= k).collect();
        let expected_removed = eligible.len().min(limit);

        let removed = store
            .delete_rows(&RangeFilter::up_to(p.clone(), k, Some(limit)), None)
            .unwrap();
        assert_eq!(removed as usize, expected_removed);

        let remaining: BTreeSet<TaskId> = store
            .select_rows(&RangeFilter::all(p))
            .unwrap()
            .iter()
            .map(|r| r.task_id)
            .collect();
        // The lowest eligible ids are the ones removed.
        for id in &eligible[..expected_removed] {
            assert!(!remaining.contains(id));
        }
        assert_eq!(remaining.len(), ids.len() - expected_removed);
    }

    fn id_set() -> impl Strategy<Value = (BTreeSet<TaskId>, Vec<TaskId>)> {
        proptest::collection::btree_set(-1_000i64..1_000, 0..40).prop_flat_map(|ids| {
            let v: Vec<TaskId> = ids.iter().copied().collect();
            (Just(ids), Just(v).prop_shuffle())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn memory_select_is_sorted((ids, shuffled) in id_set()) {
            check_ordering(&MemoryStore::new(), &ids, &shuffled);
        }

        #[test]
        fn memory_threshold_delete_bounds_backlog(
            ids in proptest::collection::btree_set(-500i64..500, 0..60),
            k in -600i64..600,
            limit in 1usize..80,
        ) {
            check_threshold(&MemoryStore::new(), &ids, k, limit);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn rocksdb_select_is_sorted((ids, shuffled) in id_set()) {
            let (store, _dir) = rocksdb_store();
            check_ordering(&store, &ids, &shuffled);
        }

        #[test]
        fn rocksdb_threshold_delete_bounds_backlog(
            ids in proptest::collection::btree_set(-500i64..500, 0..60),
            k in -600i64..600,
            limit in 1usize..80,
        ) {
            let (store, _dir) = rocksdb_store();
            check_threshold(&store, &ids, k, limit);
        }
    }
}
