//! Bounded-concurrency job dispatcher.
//!
//! Jobs are accepted without blocking and executed by a [`Launcher`], which in
//! production starts one worker OS process per job (see
//! [`crate::transport::ProcessLauncher`]). Two background loops cooperate:
//!
//! - the dispatch loop takes queued jobs in submission order, waits for a free
//!   slot whenever `running == max_concurrency`, claims the slot and hands the
//!   job to the launcher;
//! - the collector loop drains finished jobs, fires exactly one of the job's
//!   callbacks, forgets the job, releases its slot and wakes the dispatcher.
//!
//! The running counter and the job table share one mutex; the "slot freed"
//! and "became idle" signals are [`Notify`]s.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::error::JobError;

/// Unique, strictly increasing job identifier.
pub type JobId = u64;

/// Executes a single job in isolation and reports its value.
///
/// Implementations must return (rather than panic) for every failure mode so
/// that the slot held by the job can be released.
#[async_trait]
pub trait Launcher<J, T>: Send + Sync + 'static
where
    J: Send + 'static,
    T: Send + 'static,
{
    async fn launch(&self, job_id: JobId, job: J) -> Result<T, JobError>;
}

type SuccessCallback<T> = Box<dyn FnOnce(T) + Send>;
type ErrorCallback = Box<dyn FnOnce(JobError) + Send>;

struct JobRecord<T> {
    on_success: SuccessCallback<T>,
    on_error: ErrorCallback,
}

struct State<T> {
    running: usize,
    jobs: HashMap<JobId, JobRecord<T>>,
}

struct Shared<T> {
    max_concurrency: usize,
    state: Mutex<State<T>>,
    slot_freed: Notify,
    became_idle: Notify,
}

impl<T> State<T> {
    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.running == 0
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // Callbacks never run under this lock, so a poisoned guard still
        // holds consistent counters.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Wait until a slot is free, then claim it.
    async fn acquire_slot(&self) {
        loop {
            let freed = self.slot_freed.notified();
            {
                let mut state = self.lock();
                if state.running < self.max_concurrency {
                    state.running += 1;
                    return;
                }
            }
            freed.await;
        }
    }

    fn release_slot(&self) {
        let idle = {
            let mut state = self.lock();
            state.running = state.running.saturating_sub(1);
            state.is_idle()
        };
        self.slot_freed.notify_one();
        if idle {
            self.became_idle.notify_waiters();
        }
    }

    fn forget(&self, job_id: JobId) -> Option<JobRecord<T>> {
        let (record, idle) = {
            let mut state = self.lock();
            let record = state.jobs.remove(&job_id);
            (record, state.is_idle())
        };
        if idle {
            self.became_idle.notify_waiters();
        }
        record
    }
}

/// Default concurrency: the host's available parallelism, or 4 if unknown.
pub fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

/// Handle to a running job queue.
///
/// Cloning is cheap; all clones feed the same dispatcher. The queue has no
/// shutdown primitive: its loops live as long as the tokio runtime.
pub struct JobQueue<J, T> {
    shared: Arc<Shared<T>>,
    next_id: Arc<AtomicU64>,
    intake: mpsc::UnboundedSender<(JobId, J)>,
}

impl<J, T> Clone for JobQueue<J, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            next_id: Arc::clone(&self.next_id),
            intake: self.intake.clone(),
        }
    }
}

impl<J, T> JobQueue<J, T>
where
    J: Send + 'static,
    T: Send + 'static,
{
    /// Start a queue that runs at most `max_concurrency` jobs at once.
    ///
    /// Must be called from within a tokio runtime; the dispatch and collector
    /// loops are spawned onto it. A `max_concurrency` of zero is raised to 1.
    pub fn new(max_concurrency: usize, launcher: Arc<dyn Launcher<J, T>>) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let shared = Arc::new(Shared {
            max_concurrency,
            state: Mutex::new(State {
                running: 0,
                jobs: HashMap::new(),
            }),
            slot_freed: Notify::new(),
            became_idle: Notify::new(),
        });

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            intake_rx,
            launcher,
            done_tx,
        ));
        tokio::spawn(collect_loop(Arc::clone(&shared), done_rx));

        info!(max_concurrency, "Job queue started");

        Self {
            shared,
            next_id: Arc::new(AtomicU64::new(0)),
            intake: intake_tx,
        }
    }

    /// Queue a job. Never blocks.
    ///
    /// Exactly one of `on_success` / `on_error` is called, from the collector
    /// loop, after the job's worker has finished.
    pub fn submit<S, E>(&self, job: J, on_success: S, on_error: E) -> JobId
    where
        S: FnOnce(T) + Send + 'static,
        E: FnOnce(JobError) + Send + 'static,
    {
        let job_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.lock().jobs.insert(
            job_id,
            JobRecord {
                on_success: Box::new(on_success),
                on_error: Box::new(on_error),
            },
        );

        if let Err(mpsc::error::SendError((job_id, _))) = self.intake.send((job_id, job)) {
            // Only possible once the runtime is tearing down.
            if let Some(record) = self.shared.forget(job_id) {
                (record.on_error)(JobError::Spawn("job queue is not running".into()));
            }
        } else {
            debug!(job_id, "Job queued");
        }

        job_id
    }
}

impl<J, T> JobQueue<J, T> {
    /// Configured concurrency bound.
    pub fn max_concurrency(&self) -> usize {
        self.shared.max_concurrency
    }

    /// Number of jobs currently holding a slot.
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Number of submitted jobs still waiting for a slot.
    pub fn queued(&self) -> usize {
        let state = self.shared.lock();
        state.jobs.len().saturating_sub(state.running)
    }

    /// Number of submitted jobs whose callback has not fired yet.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// True when every submitted job has completed and its callback has
    /// returned.
    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Wait until the queue is idle.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.became_idle.notified();
            if self.is_idle() {
                return;
            }
            idle.await;
        }
    }
}

async fn dispatch_loop<J, T>(
    shared: Arc<Shared<T>>,
    mut intake: mpsc::UnboundedReceiver<(JobId, J)>,
    launcher: Arc<dyn Launcher<J, T>>,
    done: mpsc::UnboundedSender<(JobId, Result<T, JobError>)>,
) where
    J: Send + 'static,
    T: Send + 'static,
{
    debug!("Dispatch loop started");
    while let Some((job_id, job)) = intake.recv().await {
        shared.acquire_slot().await;

        let launcher = Arc::clone(&launcher);
        let done = done.clone();
        tokio::spawn(async move {
            let run = tokio::spawn(async move { launcher.launch(job_id, job).await });
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) => Err(JobError::Crashed(format!("launcher aborted: {e}"))),
            };
            // The collector outlives every sender it could receive from.
            let _ = done.send((job_id, outcome));
        });
    }
}

async fn collect_loop<T>(
    shared: Arc<Shared<T>>,
    mut done: mpsc::UnboundedReceiver<(JobId, Result<T, JobError>)>,
) {
    debug!("Collector loop started");
    while let Some((job_id, outcome)) = done.recv().await {
        let record = shared.lock().jobs.remove(&job_id);
        match record {
            Some(record) => fire(job_id, record, outcome),
            None => warn!(job_id, "Finished job has no registered callbacks"),
        }
        shared.release_slot();
    }
}

#[instrument(skip(record, outcome))]
fn fire<T>(job_id: JobId, record: JobRecord<T>, outcome: Result<T, JobError>) {
    let JobRecord {
        on_success,
        on_error,
    } = record;
    let fired = match outcome {
        Ok(value) => {
            debug!("Job succeeded");
            catch_unwind(AssertUnwindSafe(move || on_success(value)))
        }
        Err(err) => {
            debug!(error = %err, "Job failed");
            catch_unwind(AssertUnwindSafe(move || on_error(err)))
        }
    };
    if fired.is_err() {
        error!("Job callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;
    use tokio_test::assert_ok;

    /// In-process launcher: sleeps for the requested milliseconds and tracks
    /// how many jobs overlap.
    struct SleepLauncher {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SleepLauncher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    enum TestJob {
        Sleep(u64),
        Fail(&'static str),
        Unspawnable,
        Panic,
    }

    #[async_trait]
    impl Launcher<TestJob, u64> for SleepLauncher {
        async fn launch(&self, _job_id: JobId, job: TestJob) -> Result<u64, JobError> {
            match job {
                TestJob::Sleep(ms) => {
                    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    Ok(ms)
                }
                TestJob::Fail(message) => Err(JobError::Failed(message.to_string())),
                TestJob::Unspawnable => Err(JobError::Spawn("no such program".into())),
                TestJob::Panic => panic!("launcher bug"),
            }
        }
    }

    fn collect() -> (
        mpsc::UnboundedSender<Result<u64, JobError>>,
        mpsc::UnboundedReceiver<Result<u64, JobError>>,
    ) {
        mpsc::unbounded_channel()
    }

    fn submit(
        queue: &JobQueue<TestJob, u64>,
        job: TestJob,
        tx: &mpsc::UnboundedSender<Result<u64, JobError>>,
    ) -> JobId {
        let ok_tx = tx.clone();
        let err_tx = tx.clone();
        queue.submit(
            job,
            move |v| {
                let _ = ok_tx.send(Ok(v));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Result<u64, JobError>>) -> Result<u64, JobError> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("callback did not fire in time")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrency() {
        let launcher = SleepLauncher::new();
        let queue = JobQueue::new(3, launcher.clone() as Arc<dyn Launcher<TestJob, u64>>);
        let (tx, mut rx) = collect();

        for _ in 0..10 {
            submit(&queue, TestJob::Sleep(50), &tx);
        }
        for _ in 0..10 {
            assert_eq!(next(&mut rx).await, Ok(50));
        }

        assert_eq!(launcher.peak.load(Ordering::SeqCst), 3);
        assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn error_reaches_only_the_error_callback_once() {
        let queue = JobQueue::new(2, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        let successes = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ok_count = Arc::clone(&successes);
        queue.submit(
            TestJob::Fail("boom"),
            move |_| {
                ok_count.fetch_add(1, Ordering::SeqCst);
            },
            move |e| {
                let _ = tx.send(e);
            },
        );

        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(err, JobError::Failed("boom".into()));
        // The sender was moved into the fired callback and dropped with it.
        assert!(rx.recv().await.is_none());
        assert_eq!(successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spawn_failures_release_their_slots() {
        let queue = JobQueue::new(1, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        let (tx, mut rx) = collect();

        for _ in 0..3 {
            submit(&queue, TestJob::Unspawnable, &tx);
        }
        submit(&queue, TestJob::Sleep(1), &tx);

        for _ in 0..3 {
            assert!(matches!(next(&mut rx).await, Err(JobError::Spawn(_))));
        }
        assert_eq!(next(&mut rx).await, Ok(1));
    }

    #[tokio::test]
    async fn launcher_panic_is_reported_as_crash() {
        let queue = JobQueue::new(1, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        let (tx, mut rx) = collect();

        submit(&queue, TestJob::Panic, &tx);
        submit(&queue, TestJob::Sleep(1), &tx);

        assert!(matches!(next(&mut rx).await, Err(JobError::Crashed(_))));
        assert_eq!(next(&mut rx).await, Ok(1));
    }

    #[tokio::test]
    async fn panicking_callback_does_not_stop_the_collector() {
        let queue = JobQueue::new(1, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        let (tx, mut rx) = collect();

        queue.submit(TestJob::Sleep(1), |_| panic!("callback bug"), |_| {});
        submit(&queue, TestJob::Sleep(2), &tx);

        assert_eq!(next(&mut rx).await, Ok(2));
    }

    #[tokio::test]
    async fn job_ids_increase_and_submit_does_not_block() {
        let queue = JobQueue::new(1, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        let (tx, mut rx) = collect();

        let ids: Vec<JobId> = (0..5)
            .map(|_| submit(&queue, TestJob::Sleep(20), &tx))
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(queue.in_flight(), 5);

        for _ in 0..5 {
            assert_ok!(next(&mut rx).await);
        }
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test]
    async fn wait_idle_returns_after_the_last_callback() {
        let queue = JobQueue::new(2, SleepLauncher::new() as Arc<dyn Launcher<TestJob, u64>>);
        assert_ok!(tokio::time::timeout(Duration::from_secs(1), queue.wait_idle()).await);

        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        queue.submit(TestJob::Sleep(10), |_| {}, |_| {});
        queue.submit(
            TestJob::Sleep(50),
            move |_| {
                std::thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::SeqCst);
            },
            |_| {},
        );
        assert!(!queue.is_idle());

        assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await);
        assert!(finished.load(Ordering::SeqCst));
        assert!(queue.is_idle());
    }
}
