use crate::coverage::{CoverageError, CoverageOutcome, CoverageSample};
use log::{error, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts failed work items for the invocation being evaluated. Once the
/// count reaches the threshold every further item is refused.
#[derive(Debug)]
pub struct FailureBreaker {
    failures: AtomicUsize,
    threshold: usize,
}

impl FailureBreaker {
    pub fn new(threshold: usize) -> Self {
        Self {
            failures: AtomicUsize::new(0),
            threshold,
        }
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.failures() >= self.threshold
    }

    /// Records one failure. Returns true when the breaker is tripped afterwards.
    pub fn record_failure(&self) -> bool {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1 >= self.threshold
    }
}

/// Fixed-size pool of OS threads for per-bucket work.
pub struct WorkerPool {
    pool: ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("argprobe-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `job` on every item and returns the results in item order. Returns
    /// only after every item finished.
    pub fn map<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.pool.install(|| items.into_par_iter().map(job).collect())
    }
}

/// Worker pool plus the failure breaker shared by its items.
pub struct ExecutionController {
    pool: WorkerPool,
    breaker: FailureBreaker,
}

impl ExecutionController {
    pub fn new(threads: usize, failure_threshold: usize) -> Result<Self, ThreadPoolBuildError> {
        Ok(Self {
            pool: WorkerPool::new(threads)?,
            breaker: FailureBreaker::new(failure_threshold),
        })
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn breaker(&self) -> &FailureBreaker {
        &self.breaker
    }

    /// Starts a fresh failure count for the next invocation.
    pub fn begin_invocation(&self) {
        self.breaker.reset();
    }

    /// Runs one measurement unless the breaker is tripped, folding errors
    /// into outcomes. `context` names the binary and invocation in logs.
    pub fn guarded<F>(&self, context: &str, measure: F) -> CoverageOutcome
    where
        F: FnOnce() -> Result<CoverageSample, CoverageError>,
    {
        if self.breaker.is_tripped() {
            return CoverageOutcome::Unavailable;
        }
        match measure() {
            Ok(sample) => sample.into(),
            Err(e) => {
                warn!("{context}: {e}");
                if self.breaker.record_failure() {
                    error!(
                        "Could not infer coverage for {context}. Try to increase the time threshold?"
                    );
                    return CoverageOutcome::Unavailable;
                }
                match e {
                    CoverageError::Timeout { .. } => CoverageOutcome::Timeout,
                    _ => CoverageOutcome::Failed,
                }
            }
        }
    }

    /// Fans `items` out over the pool and pairs each with its outcome.
    pub fn run_all<T, F>(&self, context: &str, items: Vec<T>, measure: F) -> Vec<(T, CoverageOutcome)>
    where
        T: Send,
        F: Fn(&T) -> Result<CoverageSample, CoverageError> + Sync + Send,
    {
        self.pool.map(items, |item| {
            let outcome = self.guarded(context, || measure(&item));
            (item, outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn failing() -> Result<CoverageSample, CoverageError> {
        Err(CoverageError::Spawn {
            tool: "stub".into(),
            reason: "always fails".into(),
        })
    }

    #[test]
    fn breaker_trips_exactly_at_threshold() {
        let breaker = FailureBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.is_tripped());
        assert!(breaker.record_failure());
        assert!(breaker.is_tripped());
        breaker.reset();
        assert_eq!(breaker.failures(), 0);
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn pool_preserves_item_order() {
        let pool = WorkerPool::new(4).unwrap();
        assert_eq!(pool.threads(), 4);
        let doubled = pool.map((0..50).collect(), |x: u32| x * 2);
        assert_eq!(doubled, (0..50).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn zero_threads_still_gets_one_worker() {
        assert_eq!(WorkerPool::new(0).unwrap().threads(), 1);
    }

    #[test]
    fn failures_below_threshold_become_failed_then_unavailable() {
        let controller = ExecutionController::new(1, 2).unwrap();
        assert_eq!(controller.guarded("t", failing), CoverageOutcome::Failed);
        assert_eq!(controller.guarded("t", failing), CoverageOutcome::Unavailable);
        assert!(controller.breaker().is_tripped());
    }

    #[test]
    fn tripped_breaker_skips_the_tool() {
        let controller = ExecutionController::new(2, 2).unwrap();
        let attempts = AtomicUsize::new(0);
        let results = controller.run_all("t", (0..8).collect::<Vec<u32>>(), |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            failing()
        });
        assert_eq!(results.len(), 8);
        // Two workers may both pass the check before either records a failure.
        let attempted = attempts.load(Ordering::SeqCst);
        assert!((2..=3).contains(&attempted), "attempted {attempted}");
        let failed = results
            .iter()
            .filter(|(_, o)| *o == CoverageOutcome::Failed)
            .count();
        assert_eq!(failed, 1);
        let unavailable = results
            .iter()
            .filter(|(_, o)| *o == CoverageOutcome::Unavailable)
            .count();
        assert_eq!(unavailable, 7);
    }

    #[test]
    fn timeouts_and_crashes_keep_their_meaning() {
        let controller = ExecutionController::new(1, 10).unwrap();
        let timeout = controller.guarded("t", || {
            Err(CoverageError::Timeout { tool: "stub".into() })
        });
        assert_eq!(timeout, CoverageOutcome::Timeout);
        let crash = controller.guarded("t", || {
            Ok(CoverageSample::Crash(crate::oracle::CrashReport {
                reproducer_dir: PathBuf::from("/results/crashes1"),
                description: "crash confirmed".into(),
                input_hash: None,
            }))
        });
        assert_eq!(crash, CoverageOutcome::Crash(PathBuf::from("/results/crashes1")));
        assert_eq!(controller.breaker().failures(), 1);
    }

    #[test]
    fn begin_invocation_resets_failures() {
        let controller = ExecutionController::new(1, 1).unwrap();
        assert_eq!(controller.guarded("t", failing), CoverageOutcome::Unavailable);
        controller.begin_invocation();
        assert_eq!(
            controller.guarded("t", || Ok(CoverageSample::Tuples(5))),
            CoverageOutcome::Clean(5)
        );
    }
}
