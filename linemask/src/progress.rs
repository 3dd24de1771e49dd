/// Observer injected into the long-running stage loops.
///
/// Reporting is decoupled from computation so multiple reduction groups can
/// run concurrently without interleaving console writes. Cancellation is
/// cooperative: the loops poll `is_cancelled` between rows / attempts and
/// wind down with whatever has been computed so far.
pub trait ProgressObserver: Sync {
    fn report(&self, _stage: &str, _done: usize, _total: usize) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Default no-op observer.
pub struct NullProgress;

impl ProgressObserver for NullProgress {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl ProgressObserver for Counting {
        fn report(&self, _stage: &str, _done: usize, _total: usize) {
            self.calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_null_progress_never_cancels() {
        let p = NullProgress;
        p.report("detect", 1, 10);
        assert!(!p.is_cancelled());
    }

    #[test]
    fn test_custom_observer_receives_reports() {
        let p = Counting {
            calls: AtomicUsize::new(0),
        };
        p.report("detect", 1, 2);
        p.report("detect", 2, 2);
        assert_eq!(p.calls.load(Ordering::Relaxed), 2);
    }
}
