use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autopilot_run::JobHandle;
use futures_util::future::BoxFuture;
use sea_orm::prelude::Uuid;
use tokio::sync::{Mutex, Semaphore, mpsc};

/// One enqueued bot run. The handle is what callers keep for cancellation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub handle: JobHandle,
    pub bot_id: Uuid,
}

/// The job body the queue invokes for each dispatched run.
pub type JobFn = Arc<dyn Fn(RunRequest) -> BoxFuture<'static, ()> + Send + Sync>;

enum JobState {
    Queued,
    Running(tokio::task::JoinHandle<()>),
}

/// In-process work queue with a bounded worker pool.
///
/// Explicitly constructed and injected wherever runs are enqueued or aborted;
/// its lifecycle (start/shutdown) is tied to worker startup and shutdown.
/// Handles are opaque strings, so swapping in an external queue later only
/// touches this type.
pub struct QueueClient {
    tx: mpsc::UnboundedSender<RunRequest>,
    rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<RunRequest>>>,
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    concurrency: usize,
    dispatcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl QueueClient {
    pub fn new(concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            concurrency: concurrency.max(1),
            dispatcher: std::sync::Mutex::new(None),
        }
    }

    /// Start the dispatcher. Runs each request through `job` on the worker
    /// pool; a request whose handle was aborted while still queued is
    /// dropped without running.
    pub fn start(&self, job: JobFn) {
        let mut rx = self
            .rx
            .lock()
            .expect("queue rx lock")
            .take()
            .expect("queue already started");
        let jobs = self.jobs.clone();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let dispatcher = tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let mut registry = jobs.lock().await;
                if !matches!(registry.get(&req.handle.0), Some(JobState::Queued)) {
                    // Aborted before dispatch.
                    continue;
                }

                let task = tokio::spawn({
                    let jobs = jobs.clone();
                    let job = job.clone();
                    let req = req.clone();
                    async move {
                        let _permit = permit;
                        job(req.clone()).await;
                        jobs.lock().await.remove(&req.handle.0);
                    }
                });
                registry.insert(req.handle.0.clone(), JobState::Running(task));
            }
        });

        *self.dispatcher.lock().expect("queue dispatcher lock") = Some(dispatcher);
    }

    /// Submit a new run request. Returns the opaque job handle the caller
    /// persists onto the bot record.
    pub async fn enqueue(&self, bot_id: Uuid) -> anyhow::Result<JobHandle> {
        let handle = JobHandle::new();
        self.jobs
            .lock()
            .await
            .insert(handle.0.clone(), JobState::Queued);

        self.tx
            .send(RunRequest {
                handle: handle.clone(),
                bot_id,
            })
            .map_err(|_| anyhow::anyhow!("queue is shut down"))?;
        Ok(handle)
    }

    /// Request cancellation of a queued-or-running job and poll briefly for
    /// it to go away. Errors (unknown handle, slow teardown) are for the
    /// caller to log; stop/delete treat them as no-op successes.
    pub async fn abort(
        &self,
        handle: &str,
        timeout: Duration,
        poll_delay: Duration,
    ) -> anyhow::Result<()> {
        let state = self
            .jobs
            .lock()
            .await
            .remove(handle)
            .ok_or_else(|| anyhow::anyhow!("job {handle} is not queued or running"))?;

        match state {
            JobState::Queued => Ok(()),
            JobState::Running(task) => {
                // The job future owns the child with kill_on_drop, so
                // aborting the task tears the process down with it.
                task.abort();
                let deadline = tokio::time::Instant::now() + timeout;
                while !task.is_finished() {
                    if tokio::time::Instant::now() >= deadline {
                        anyhow::bail!("job {handle} did not stop within {}ms", timeout.as_millis());
                    }
                    tokio::time::sleep(poll_delay).await;
                }
                Ok(())
            }
        }
    }

    /// Stop dispatching and tear down anything still running.
    pub async fn shutdown(&self) {
        if let Some(dispatcher) = self.dispatcher.lock().expect("queue dispatcher lock").take() {
            dispatcher.abort();
        }
        let mut registry = self.jobs.lock().await;
        for (_, state) in registry.drain() {
            if let JobState::Running(task) = state {
                task.abort();
            }
        }
    }
}

/// Best-effort abort: stop and delete must succeed from the user's point of
/// view even when the job already finished or the handle is stale.
pub async fn abort_job(queue: &QueueClient, job_id: &str) {
    if let Err(e) = queue
        .abort(job_id, Duration::from_millis(500), Duration::from_millis(10))
        .await
    {
        tracing::warn!(job = %job_id, error = %e, "failed to abort job");
    }
}
