#[cfg(test)]
mod tests {
    use std::panic::AssertUnwindSafe;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::persist::tests::helpers::{
        persistent_error, scheduler_with_dirty_db, transient_error, ScriptedIo,
    };
    use crate::persist::PersistError;

    #[test]
    fn test_clean_checkpoint_succeeds() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::clean());
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        assert!(scheduler.perform_persist_to_disk().unwrap());
        assert_eq!(io.attempts(), 1);
        assert_eq!(scheduler.get_error_metrics().total_errors, 0);

        // Nothing dirty remains, so the next checkpoint writes nothing.
        assert!(scheduler.perform_persist_to_disk().unwrap());
        assert_eq!(io.attempts(), 1);
    }

    #[test]
    fn test_transient_failure_retries_and_succeeds() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![transient_error()]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        assert!(scheduler.perform_persist_to_disk().unwrap());

        let metrics = scheduler.get_error_metrics();
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.transient_errors, 1);
        assert_eq!(metrics.persistent_errors, 0);
        assert_eq!(io.attempts(), 2);
        assert!(scheduler.is_healthy());
    }

    #[test]
    fn test_persistent_failure_does_not_retry() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![persistent_error()]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        assert!(!scheduler.perform_persist_to_disk().unwrap());

        let metrics = scheduler.get_error_metrics();
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.persistent_errors, 1);
        assert_eq!(metrics.transient_errors, 0);
        assert_eq!(io.attempts(), 1);
        assert!(scheduler.is_healthy());
    }

    #[test]
    fn test_transient_exhaustion_fails_after_four_attempts() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![
            transient_error(),
            transient_error(),
            transient_error(),
            transient_error(),
        ]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        assert!(!scheduler.perform_persist_to_disk().unwrap());

        // Initial attempt plus three retries.
        assert_eq!(io.attempts(), 4);
        assert_eq!(scheduler.get_error_metrics().transient_errors, 4);
    }

    #[test]
    fn test_critical_failure_latches_unhealthy() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![std::io::Error::new(
            std::io::ErrorKind::OutOfMemory,
            "out of memory",
        )]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        let err = scheduler.perform_persist_to_disk().unwrap_err();
        assert!(matches!(err, PersistError::Critical(_)));
        assert!(!scheduler.is_healthy());

        // Health never self-recovers, even after a clean checkpoint.
        assert!(scheduler.perform_persist_to_disk().unwrap());
        assert!(!scheduler.is_healthy());
    }

    #[test]
    fn test_running_flag_clears_after_every_outcome() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![persistent_error()]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        // Failure path.
        assert!(!scheduler.perform_persist_to_disk().unwrap());
        // The flag must be free again: this run proceeds (and succeeds).
        assert!(scheduler.perform_persist_to_disk().unwrap());
    }

    #[test]
    fn test_running_flag_clears_after_panic() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::clean());
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));
        io.panic_times(1);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = scheduler.perform_persist_to_disk();
        }));
        assert!(result.is_err());

        // The panicking run must not leave the flag set.
        assert!(scheduler.perform_persist_to_disk().unwrap());
    }

    #[test]
    fn test_at_most_one_concurrent_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::slow(Duration::from_millis(500)));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let mut handles = Vec::new();
        for _ in 0..threads {
            let scheduler = Arc::clone(&scheduler);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                scheduler.perform_persist_to_disk().unwrap()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1, "exactly one checkpoint may win");
        // The losers skipped without writing anything.
        assert_eq!(io.attempts(), 1);
    }

    #[test]
    fn test_metrics_reset() {
        let tmp = TempDir::new().unwrap();
        let io = Arc::new(ScriptedIo::failing_first(vec![persistent_error()]));
        let scheduler = scheduler_with_dirty_db(&tmp, Arc::clone(&io));

        let _ = scheduler.perform_persist_to_disk().unwrap();
        assert_eq!(scheduler.get_error_metrics().total_errors, 1);
        assert_eq!(
            scheduler
                .get_error_metrics()
                .by_kind
                .get("PermissionDenied"),
            Some(&1)
        );

        scheduler.reset_error_metrics();
        let metrics = scheduler.get_error_metrics();
        assert_eq!(metrics.total_errors, 0);
        assert!(metrics.by_kind.is_empty());
    }
}
