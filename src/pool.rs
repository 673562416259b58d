use crate::error::{QueryError, Result, SnapshotError};
use crate::ledger::{Ledger, LedgerEntry};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// What one work item produced.
pub type JobOutcome<T> = std::result::Result<T, QueryError>;

/// Runs `work` over `jobs` with a fixed number of workers.
///
/// The job queue is filled and closed before any worker starts; workers pull
/// until it is empty and push one outcome per job to the results channel.
/// Once every worker has returned the channel is closed and drained. Order of
/// the outcomes is unspecified. Failed items are returned, not swallowed: the
/// caller decides whether they abort the run.
pub async fn run_bounded<J, T, F, Fut>(
    jobs: Vec<J>,
    workers: usize,
    work: F,
) -> Result<Vec<JobOutcome<T>>>
where
    J: Send + 'static,
    T: Send + 'static,
    F: Fn(J) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome<T>> + Send + 'static,
{
    let total_jobs = jobs.len();
    let (job_sender, job_receiver) = mpsc::channel(total_jobs.max(1));
    for job in jobs {
        job_sender
            .send(job)
            .await
            .map_err(|_| SnapshotError::Worker("job queue closed early".to_string()))?;
    }
    drop(job_sender);

    let job_receiver = Arc::new(Mutex::new(job_receiver));
    let (result_sender, mut result_receiver) = mpsc::unbounded_channel();
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(workers.max(1));
    for worker in 0..workers.max(1) {
        let job_receiver = job_receiver.clone();
        let result_sender = result_sender.clone();
        let work = work.clone();
        handles.push(tokio::spawn(async move {
            let mut processed = 0usize;
            loop {
                let job = job_receiver.lock().await.recv().await;
                let job = match job {
                    Some(job) => job,
                    None => break,
                };
                let outcome = (*work)(job).await;
                processed += 1;
                if result_sender.send(outcome).is_err() {
                    break;
                }
            }
            tracing::debug!("worker {} processed {} jobs", worker, processed);
        }));
    }
    drop(result_sender);

    for handle in handles {
        handle
            .await
            .map_err(|err| SnapshotError::Worker(err.to_string()))?;
    }

    let mut outcomes = Vec::with_capacity(total_jobs);
    while let Some(outcome) = result_receiver.recv().await {
        outcomes.push(outcome);
    }
    tracing::info!(
        "Worker pool finished {} jobs with {} workers",
        outcomes.len(),
        workers.max(1)
    );
    Ok(outcomes)
}

/// Builds a ledger from pool outcomes, failing on the first errored item: a
/// missing position would understate holdings without tripping any audit.
pub fn collect_ledger<I>(outcomes: I) -> Result<Ledger>
where
    I: IntoIterator<Item = JobOutcome<Vec<LedgerEntry>>>,
{
    let mut ledger = Ledger::new();
    for outcome in outcomes {
        for entry in outcome? {
            ledger.append(entry.account, entry.denom, entry.amount);
        }
    }
    Ok(ledger)
}
