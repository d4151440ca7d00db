//! Single-worker mailbox that runs a blocking [`Driver`] under the async engine.
//!
//! Every call becomes a job on one FIFO queue drained by one dedicated OS
//! thread that owns the driver. Callers await a oneshot reply. Because there is
//! exactly one consumer, two calls submitted back to back reach the driver in
//! submission order and never overlap. Session start and stop go through the
//! same queue.

use std::thread;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::types::{ExecResult, PageSnapshot, PageState, Plan, Verification};
use crate::io::actuator::{Actuator, Driver};

/// The worker thread has exited, so no further driver calls are possible.
#[derive(Debug, Error)]
#[error("driver worker is gone")]
pub struct WorkerGone;

type Job<D> = Box<dyn FnOnce(&mut D) + Send>;

pub struct ActuatorBridge<D: Driver> {
    jobs: mpsc::UnboundedSender<Job<D>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<D: Driver> ActuatorBridge<D> {
    /// Move `driver` onto a new worker thread.
    pub fn spawn(driver: D, name: &str) -> Result<Self> {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<D>>();
        let worker = thread::Builder::new()
            .name(format!("driver-{name}"))
            .spawn(move || {
                let mut driver = driver;
                while let Some(job) = queue.blocking_recv() {
                    job(&mut driver);
                }
                if driver.has_session() {
                    debug!("queue closed with open session, stopping it");
                    if let Err(err) = driver.stop_session() {
                        warn!(err = %err, "failed to stop session on worker exit");
                    }
                }
            })
            .context("spawn driver worker thread")?;
        Ok(Self {
            jobs,
            worker: Some(worker),
        })
    }

    /// Run `f` on the worker after every previously submitted job.
    pub async fn dispatch<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut D) -> Result<R> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job<D> = Box::new(move |driver| {
            // The caller may have stopped waiting.
            let _ = reply.send(f(driver));
        });
        self.jobs.send(job).map_err(|_| WorkerGone)?;
        response.await.map_err(|_| WorkerGone)?
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        // Replacing the sender drops the only handle feeding the worker.
        let (closed, _) = mpsc::unbounded_channel();
        self.jobs = closed;
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .context("join driver worker")?
            .map_err(|_| anyhow::anyhow!("driver worker panicked"))
    }
}

#[async_trait]
impl<D: Driver> Actuator for ActuatorBridge<D> {
    async fn start_session(&self) -> Result<()> {
        self.dispatch(|d| d.start_session()).await
    }

    async fn stop_session(&self) -> Result<()> {
        self.dispatch(|d| d.stop_session()).await
    }

    async fn navigate(&self, url: &str) -> Result<ExecResult> {
        let url = url.to_string();
        self.dispatch(move |d| d.navigate(&url)).await
    }

    async fn execute(&self, plan: &Plan) -> Result<ExecResult> {
        let plan = plan.clone();
        self.dispatch(move |d| d.execute(&plan)).await
    }

    async fn snapshot(&self) -> Result<PageSnapshot> {
        self.dispatch(|d| d.snapshot()).await
    }

    async fn page_state(&self) -> Result<PageState> {
        self.dispatch(|d| d.page_state()).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.dispatch(|d| d.screenshot()).await
    }

    async fn check(&self, verification: &Verification) -> Result<bool> {
        let verification = verification.clone();
        self.dispatch(move |d| d.check(&verification)).await
    }
}

/// True when `err` means the worker can no longer serve calls.
pub fn is_worker_gone(err: &anyhow::Error) -> bool {
    err.downcast_ref::<WorkerGone>().is_some()
}
