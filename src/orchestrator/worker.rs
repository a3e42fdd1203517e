//! Background workers draining the run queue.

use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::execution::{EngineError, RunOutcome};

use super::Shared;

/// A unit of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Run a `pending` pipeline from its first step.
    Start(Uuid),
    /// Continue a pipeline interrupted while `running`.
    Resume(Uuid),
}

impl Job {
    pub fn pipeline_id(&self) -> Uuid {
        match self {
            Job::Start(id) | Job::Resume(id) => *id,
        }
    }
}

pub(crate) struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker that takes jobs from `queue` until it is closed.
    pub(crate) fn spawn(
        id: usize,
        queue: Arc<Mutex<Receiver<Job>>>,
        shared: Arc<Shared>,
    ) -> io::Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("circrunner-worker-{}", id))
            .spawn(move || loop {
                // The lock is released before the job runs.
                let next = queue.lock().recv();
                match next {
                    Ok(job) => {
                        run_job(&shared, id, job);
                        shared.job_done();
                    }
                    Err(_) => {
                        debug!("Worker {} stopping: queue closed", id);
                        break;
                    }
                }
            })?;

        Ok(Self {
            id,
            handle: Some(handle),
        })
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Worker {} panicked", self.id);
            }
        }
    }
}

fn run_job(shared: &Shared, worker: usize, job: Job) {
    let id = job.pipeline_id();

    if !shared.acquire_lease(id) {
        warn!("Pipeline {} is already being run; dropping {:?}", id, job);
        return;
    }

    let token = shared.token(id);
    info!("Worker {} picked up {:?}", worker, job);

    let result = match job {
        Job::Start(id) => shared.engine.start(id, &token),
        Job::Resume(id) => shared.engine.resume(id, &token),
    };

    match result {
        Ok(RunOutcome::Completed) => info!("Pipeline {} completed", id),
        Ok(RunOutcome::Failed { kind, reason, .. }) => {
            warn!("Pipeline {} failed [{}]: {}", id, kind, reason)
        }
        Err(EngineError::InvalidState { status, .. }) => {
            info!("Skipping pipeline {}: already {}", id, status)
        }
        Err(e) => error!("Pipeline {} stopped: {}", id, e),
    }

    shared.release_lease(id);
}
