//! Bounded worker pool.
//!
//! A fixed number of tokio tasks pull job ids from one bounded channel, so the
//! number of jobs in flight never exceeds `max_workers` and the backlog never
//! exceeds `queue_max_size`.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, Result};
use crate::job::{Job, JobRequest};
use crate::pipeline::Pipeline;

/// What happened to each request of a batch
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub job_ids: Vec<String>,
    /// Position in the batch and the reason it was refused
    pub rejected: Vec<(usize, String)>,
}

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    sender: Option<mpsc::Sender<String>>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn `max_workers` workers sharing a queue of `queue_max_size`
    pub fn start(pipeline: Arc<Pipeline>) -> Self {
        let workers = pipeline.config().max_workers.max(1);
        let capacity = pipeline.config().queue_max_size.max(1);
        let (sender, receiver) = mpsc::channel::<String>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|n| {
                let pipeline = Arc::clone(&pipeline);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(worker_loop(n, pipeline, receiver))
            })
            .collect::<Vec<_>>();

        info!("Worker pool started: {} workers, queue capacity {}", workers.len(), capacity);
        WorkerPool {
            pipeline,
            sender: Some(sender),
            workers,
            capacity,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Validate, register and enqueue a request; returns the new job id.
    ///
    /// A full queue leaves no trace in the registry.
    pub fn submit(&self, request: JobRequest) -> Result<String> {
        request.validate()?;
        if !self.pipeline.avatars().exists(&request.avatar_id) {
            return Err(PipelineError::avatar_not_found(&request.avatar_id));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| PipelineError::Validation("worker pool is shut down".to_string()))?;

        let registry = self.pipeline.registry();
        let id = registry.submit(Job::new(request))?;
        match sender.try_send(id.clone()) {
            Ok(()) => {
                info!("Job {}: queued", id);
                Ok(id)
            }
            Err(TrySendError::Full(_)) => {
                self.unregister(&id);
                warn!("Queue full ({}), rejected job {}", self.capacity, id);
                Err(PipelineError::QueueFull(self.capacity))
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(&id);
                Err(PipelineError::Validation("worker pool is shut down".to_string()))
            }
        }
    }

    /// Queue slots still free right now
    pub fn free_slots(&self) -> usize {
        self.sender.as_ref().map_or(0, |s| s.capacity())
    }

    /// Submit several requests together.
    ///
    /// The batch is refused as a whole when the queue cannot take all of it;
    /// otherwise a bad entry is recorded and the rest still go in.
    pub fn submit_batch(&self, requests: Vec<JobRequest>) -> Result<BatchSubmission> {
        if requests.is_empty() {
            return Err(PipelineError::Validation("batch contains no requests".to_string()));
        }
        if requests.len() > self.capacity {
            return Err(PipelineError::Validation(format!(
                "batch of {} exceeds queue capacity {}",
                requests.len(),
                self.capacity
            )));
        }
        if requests.len() > self.free_slots() {
            return Err(PipelineError::QueueFull(self.capacity));
        }

        let mut outcome = BatchSubmission::default();
        for (position, request) in requests.into_iter().enumerate() {
            match self.submit(request) {
                Ok(id) => outcome.job_ids.push(id),
                Err(e) => {
                    warn!("Batch entry {} rejected: {}", position, e);
                    outcome.rejected.push((position, e.to_string()));
                }
            }
        }
        info!(
            "Batch: {} queued, {} rejected",
            outcome.job_ids.len(),
            outcome.rejected.len()
        );
        Ok(outcome)
    }

    fn unregister(&self, id: &str) {
        if let Err(e) = self.pipeline.registry().delete(id) {
            warn!("Job {}: could not drop unqueued record: {}", id, e);
        }
    }

    /// Stop accepting work, let queued jobs drain and wait for every worker
    pub async fn shutdown(mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    pipeline: Arc<Pipeline>,
    receiver: Arc<Mutex<mpsc::Receiver<String>>>,
) {
    loop {
        // Hold the lock only while waiting, never while running a job
        let next = receiver.lock().await.recv().await;
        let Some(id) = next else {
            break;
        };
        debug!("Worker {} picked up job {}", worker, id);

        // A panicking job must not take the worker down with it
        let runner = Arc::clone(&pipeline);
        let job_id = id.clone();
        let outcome = tokio::spawn(async move { runner.run_job(&job_id).await }).await;
        match outcome {
            Ok(Ok(job)) => debug!("Worker {} finished job {} ({})", worker, id, job.status),
            Ok(Err(e)) => warn!("Worker {}: job {} could not run: {}", worker, id, e),
            Err(e) => {
                error!("Worker {}: job {} panicked: {}", worker, id, e);
                if let Err(e) = pipeline.registry().fail(&id, "internal error while processing") {
                    warn!("Worker {}: could not mark job {} failed: {}", worker, id, e);
                }
            }
        }
    }
    debug!("Worker {} exiting", worker);
}
