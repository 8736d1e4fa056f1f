// Unit tests for logger initialization.
// The global logger can only ever be installed once per process, so a
// single test exercises both the first call and the repeat-call guard.

use crate::logging::initialize;

/// **VALUE**: Verifies that repeated initialization is safe and that the
/// log file is created in the requested directory.
///
/// **WHY THIS MATTERS**: Host processes may call initialize from several
/// startup paths (app setup, tests, tooling). If it panics or errors on
/// the second call, startup crashes for a non-problem.
///
/// **BUG THIS CATCHES**: Would catch removal of the Once/AtomicBool
/// guards, which makes fern panic when a global logger is set twice.
#[test]
fn given_logger_initialized_when_called_again_then_both_calls_succeed() {
    // GIVEN: A scratch directory for the log file
    let temp_dir = tempfile::tempdir().expect("temp dir");

    // WHEN: Initializing twice
    let first = initialize(temp_dir.path());
    let second = initialize(temp_dir.path());

    // THEN: Both calls succeed and the file exists after the first
    assert!(first.is_ok(), "first initialization should succeed");
    assert!(second.is_ok(), "second initialization should be a guarded no-op");
    assert!(
        temp_dir.path().join("transport.log").exists(),
        "log file should be created"
    );
}
