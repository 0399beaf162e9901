mod common;

use std::collections::BTreeSet;

use common::{numbered_keys, seeded_store};
use multiomics_runner::{
    BatchDispatcher, DispatchConfig, MemoryStore, ObjectStore, StoreOperation, TransferError,
};
use proptest::prelude::*;

fn small_pool() -> DispatchConfig {
    DispatchConfig::default().with_workers(4).with_chunk_size(3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn every_item_is_copied_exactly_once(count in 1usize..150, chunk_size in 1usize..80) {
        let store = seeded_store("src", "in/", count);
        let src_keys = numbered_keys("in/", count);
        let dst_keys = numbered_keys("out/", count);
        let config = DispatchConfig::default().with_chunk_size(chunk_size);

        let summary = BatchDispatcher::with_config(&store, config)
            .copy_files(&src_keys, &dst_keys, "src", "dst", false)
            .expect("copy succeeds");

        prop_assert_eq!(summary.submitted, count);
        prop_assert_eq!(summary.skipped, 0);
        prop_assert_eq!(store.calls().copies(), count);
        prop_assert_eq!(store.len("dst"), count);
    }

    #[test]
    fn existing_destinations_are_skipped_unless_forced(
        count in 2usize..60,
        existing in proptest::collection::btree_set(0usize..60, 0..59),
        force in any::<bool>(),
    ) {
        let existing: BTreeSet<usize> = existing.into_iter().filter(|idx| *idx < count).collect();
        prop_assume!(force || existing.len() < count);

        let store = seeded_store("src", "in/", count);
        let src_keys = numbered_keys("in/", count);
        let dst_keys = numbered_keys("out/", count);
        for idx in &existing {
            store.put("dst", &dst_keys[*idx], "stale");
        }

        let summary = BatchDispatcher::with_config(&store, small_pool())
            .copy_files(&src_keys, &dst_keys, "src", "dst", force)
            .expect("copy succeeds");

        let expected = if force { count } else { count - existing.len() };
        prop_assert_eq!(summary.submitted, expected);
        prop_assert_eq!(store.calls().copies(), expected);
        for (idx, key) in dst_keys.iter().enumerate() {
            let data = store.get("dst", key).expect("destination exists");
            let overwritten = force || !existing.contains(&idx);
            prop_assert_eq!(data == b"stale", !overwritten);
        }
    }
}

#[test]
fn remove_without_confirmation_issues_no_deletes() {
    let store = MemoryStore::new();
    store.put("bucket", "a", "1");
    store.put("bucket", "b", "2");

    let err = BatchDispatcher::new(&store)
        .remove_files(&["a", "b"], "bucket", false)
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::MissingConfirmation {
            operation: "remove",
            count: 2
        }
    ));
    assert_eq!(store.calls().removes(), 0);
    assert_eq!(store.len("bucket"), 2);
}

#[test]
fn confirmed_remove_deletes_every_key() {
    let store = seeded_store("bucket", "tmp/", 100);
    let keys = numbered_keys("tmp/", 100);

    let summary = BatchDispatcher::with_config(&store, small_pool())
        .remove_files(&keys, "bucket", true)
        .expect("remove succeeds");

    assert_eq!(summary.submitted, 100);
    assert_eq!(store.calls().removes(), 100);
    assert!(store.is_empty("bucket"));
}

#[test]
fn failures_do_not_stop_sibling_items() {
    let store = seeded_store("src", "in/", 20);
    let src_keys = numbered_keys("in/", 20);
    let dst_keys = numbered_keys("out/", 20);
    store.fail_on("src", &src_keys[12]);
    store.fail_on("src", &src_keys[5]);

    let err = BatchDispatcher::with_config(&store, small_pool())
        .copy_files(&src_keys, &dst_keys, "src", "dst", true)
        .unwrap_err();

    match err {
        TransferError::Item(store_err) => {
            assert_eq!(store_err.operation, StoreOperation::Copy);
            assert_eq!(store_err.key, src_keys[5]);
        }
        other => panic!("expected item failure, got {other:?}"),
    }
    assert_eq!(store.calls().copies(), 20);
    assert_eq!(store.len("dst"), 18);
}

#[test]
fn mismatched_lists_are_rejected_before_dispatch() {
    let store = seeded_store("src", "in/", 3);
    let err = BatchDispatcher::new(&store)
        .copy_files(&["in/0000", "in/0001"], &["out/0000"], "src", "dst", true)
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::LengthMismatch {
            sources: 2,
            destinations: 1
        }
    ));
    assert_eq!(store.calls().copies(), 0);
}

#[test]
fn fully_copied_batch_is_an_empty_batch_error() {
    let store = seeded_store("src", "in/", 5);
    let src_keys = numbered_keys("in/", 5);
    let dst_keys = numbered_keys("out/", 5);
    let dispatcher = BatchDispatcher::new(&store);

    dispatcher
        .copy_files(&src_keys, &dst_keys, "src", "dst", false)
        .expect("first copy succeeds");
    let err = dispatcher
        .copy_files(&src_keys, &dst_keys, "src", "dst", false)
        .unwrap_err();

    assert!(matches!(
        err,
        TransferError::EmptyBatch {
            operation: "copy",
            skipped: 5
        }
    ));
    assert_eq!(store.calls().copies(), 5);
}

#[test]
fn download_skips_existing_local_files() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let store = seeded_store("bucket", "reads/", 4);
    let keys = numbered_keys("reads/", 4);
    let destinations: Vec<_> = keys
        .iter()
        .map(|key| scratch.path().join("nested").join(key))
        .collect();
    std::fs::create_dir_all(destinations[1].parent().expect("parent")).expect("mkdir");
    std::fs::write(&destinations[1], "local").expect("seed local file");

    let summary = BatchDispatcher::new(&store)
        .download_files(&keys, &destinations, "bucket", false)
        .expect("download succeeds");

    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(
        std::fs::read_to_string(&destinations[1]).expect("read"),
        "local"
    );
    assert_eq!(
        std::fs::read_to_string(&destinations[3]).expect("read"),
        keys[3]
    );
}

#[test]
fn listing_pages_through_large_prefixes() {
    let store = seeded_store("bucket", "runs/", 50);
    let keys: Vec<String> = store
        .list("bucket", "runs/")
        .collect::<Result<_, _>>()
        .expect("listing succeeds");

    assert_eq!(keys, numbered_keys("runs/", 50));
    // 50 keys at 7 per page
    assert_eq!(store.calls().list_pages(), 8);
}

#[test]
fn download_with_every_file_present_is_an_empty_batch() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let store = seeded_store("bucket", "reads/", 3);
    let keys = numbered_keys("reads/", 3);
    let destinations: Vec<_> = keys.iter().map(|key| scratch.path().join(key)).collect();
    for dest in &destinations {
        std::fs::create_dir_all(dest.parent().expect("parent")).expect("mkdir");
        std::fs::write(dest, "local").expect("seed local file");
    }
    let dispatcher = BatchDispatcher::new(&store);

    let err = dispatcher
        .download_files(&keys, &destinations, "bucket", false)
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::EmptyBatch {
            operation: "download",
            skipped: 3
        }
    ));
    assert_eq!(store.calls().downloads(), 0);

    let summary = dispatcher
        .download_files(&keys, &destinations, "bucket", true)
        .expect("forced download succeeds");
    assert_eq!(summary.submitted, 3);
    assert_eq!(summary.skipped, 0);
    assert_eq!(store.calls().downloads(), 3);
    for (key, dest) in keys.iter().zip(&destinations) {
        assert_eq!(&std::fs::read_to_string(dest).expect("read"), key);
    }
}
