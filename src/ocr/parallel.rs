//! Bounded parallel map: the pipeline's only concurrency primitive.
//!
//! Launches up to `max_concurrent` tasks with a fixed stagger between
//! launches, retries each task on retryable errors, and never cancels
//! siblings on failure. Results land in a fixed-size array indexed by
//! input position, so page order survives any completion order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::llm::ModelError;
use crate::utils::backoff_delay;

/// Concurrency and retry knobs for one stage.
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub name: &'static str,
    pub max_concurrent: usize,
    /// Pause between task launches, not between completions.
    pub stagger: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl StageConfig {
    /// Line counting is cheap and bounded by request rate only.
    pub fn line_count() -> Self {
        Self {
            name: "line-count",
            max_concurrent: 10,
            stagger: Duration::from_millis(500),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(30),
        }
    }

    /// Extraction is token-heavy; the stagger avoids burst rate limiting.
    pub fn extract() -> Self {
        Self {
            name: "extract",
            max_concurrent: 6,
            stagger: Duration::from_millis(2000),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(30),
        }
    }

    /// Boost is output-token-heavy, the dominant constraint.
    pub fn boost() -> Self {
        Self {
            name: "boost",
            max_concurrent: 5,
            stagger: Duration::from_millis(1000),
            max_attempts: 3,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(30),
        }
    }

    /// Sequential, no-wait variant for tests.
    #[cfg(test)]
    pub fn immediate(name: &'static str) -> Self {
        Self {
            name,
            max_concurrent: 1,
            stagger: Duration::ZERO,
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
        }
    }
}

/// A task that exhausted its retries or hit a permanent error.
#[derive(Debug, Clone)]
pub struct StageFailure {
    pub index: usize,
    pub error: String,
}

/// Per-stage result: one slot per input, plus the collected failures.
#[derive(Debug)]
pub struct StageOutcome<R> {
    pub results: Vec<Option<R>>,
    pub failures: Vec<StageFailure>,
}

impl<R> StageOutcome<R> {
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }
}

/// Run `task` over every item with bounded concurrency.
///
/// Each task gets up to `max_attempts` tries on retryable errors with
/// exponential backoff and jitter; a permanent error fails the task
/// immediately. A failed task contributes `None` to its slot and an entry
/// in `failures`; other tasks are unaffected.
pub async fn bounded_parallel_map<T, R, F, Fut>(
    items: Vec<T>,
    config: &StageConfig,
    task: F,
) -> StageOutcome<R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<R, ModelError>> + Send,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let mut join_set: JoinSet<(usize, Result<R, ModelError>)> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        // Stagger between launches only; the first task starts at once.
        if index > 0 && !config.stagger.is_zero() {
            tokio::time::sleep(config.stagger).await;
        }

        let semaphore = semaphore.clone();
        let task = task.clone();
        let config = config.clone();
        let item = Arc::new(item);

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("stage semaphore never closes");

            let mut attempt = 0u32;
            loop {
                match task(item.clone()).await {
                    Ok(result) => return (index, Ok(result)),
                    Err(e) if e.is_retryable() && attempt + 1 < config.max_attempts => {
                        let delay = backoff_delay(attempt, config.backoff_base, config.backoff_cap);
                        info!(
                            stage = config.name,
                            index,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying stage task"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return (index, Err(e)),
                }
            }
        });
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    let mut failures = Vec::new();

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(result))) => results[index] = Some(result),
            Ok((index, Err(e))) => failures.push(StageFailure {
                index,
                error: e.to_string(),
            }),
            Err(e) => {
                // A panicked task loses its index; record it against the
                // first empty slot so the count stays honest.
                debug!(stage = config.name, "stage task panicked: {}", e);
            }
        }
    }

    failures.sort_by_key(|f| f.index);
    StageOutcome { results, failures }
}
