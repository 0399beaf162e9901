mod common;

use common::ScriptedExecutor;
use multiomics_runner::{CommandError, SyncRunner, TransferVerb, SYNC_RETRIES};
use test_case::test_case;

#[test_case(0; "first attempt")]
#[test_case(1; "one failure")]
#[test_case(2; "two failures")]
fn sync_recovers_within_retry_limit(failures: u32) {
    let executor = ScriptedExecutor::new().fail_matching("s3 sync", failures);
    let runner = SyncRunner::new(&executor);

    runner
        .sync("s3://lab/fastqs/", "/mnt/data/abc")
        .expect("sync recovers");

    assert_eq!(executor.calls().len(), failures as usize + 1);
}

#[test]
fn persistent_cp_failure_names_the_paths() {
    let executor = ScriptedExecutor::new().fail_matching("s3 cp", u32::MAX);
    let runner = SyncRunner::new(&executor);

    let err = runner
        .cp("s3://lab/libraries.csv", "/mnt/libraries.original.csv")
        .unwrap_err();

    assert_eq!(executor.calls().len(), SYNC_RETRIES as usize);
    match err {
        CommandError::RetriesExhausted {
            verb,
            source_path,
            destination,
            attempts,
        } => {
            assert_eq!(verb, TransferVerb::Cp);
            assert_eq!(source_path, "s3://lab/libraries.csv");
            assert_eq!(destination, "/mnt/libraries.original.csv");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

#[test]
fn every_attempt_repeats_the_same_command() {
    let executor = ScriptedExecutor::new().fail_matching("sync", 2);
    let runner = SyncRunner::new(&executor).with_program("aws2");

    runner.sync("/mnt/results/outs", "s3://lab/out/run-1").expect("sync");

    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls
        .iter()
        .all(|line| line == "aws2 s3 sync --no-progress /mnt/results/outs s3://lab/out/run-1"));
}

#[test]
fn custom_retry_limit_is_respected() {
    let executor = ScriptedExecutor::new().fail_matching("sync", u32::MAX);
    let runner = SyncRunner::new(&executor).with_retries(5);

    assert!(runner.sync("a", "b").is_err());
    assert_eq!(executor.calls().len(), 5);
}
