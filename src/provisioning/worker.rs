//! Provision Worker
//!
//! Background executor that claims queued provision jobs and runs each one
//! through [`ProvisioningOrchestrator::run`] in its own task, bounded by a
//! semaphore. Shutdown cancels the shared token, which kills any toolchain
//! process still running.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ProvisioningError, RepositoryError};
use crate::models::provision_job::Model as ProvisionJobModel;
use crate::provisioning::orchestrator::ProvisioningOrchestrator;
use crate::repositories::provision_job::ProvisionJobRepository;

/// Slack added to the toolchain timeout before a running job counts as abandoned.
pub const STALE_JOB_GRACE: Duration = Duration::from_secs(60);

/// Configuration for the provision worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Milliseconds between polls of the job table
    pub tick_ms: u64,
    /// Maximum number of jobs running at once
    pub concurrency: usize,
    /// A `running` job started longer ago than this is treated as abandoned
    /// by a dead worker and put back in the queue. Must exceed the toolchain
    /// timeout, or live attempts get run twice.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 2000,
            concurrency: 2,
            stale_after: Duration::from_secs(1800) + STALE_JOB_GRACE,
        }
    }
}

/// Worker pool draining `provision_jobs`
#[derive(Clone)]
pub struct ProvisionWorker {
    jobs: ProvisionJobRepository,
    orchestrator: Arc<ProvisioningOrchestrator>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl ProvisionWorker {
    pub fn new(
        jobs: ProvisionJobRepository,
        orchestrator: Arc<ProvisioningOrchestrator>,
        config: WorkerConfig,
    ) -> Self {
        let permits = config.concurrency.max(1);
        Self {
            jobs,
            orchestrator,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RepositoryError> {
        info!(config = ?self.config, "Starting provision worker");

        let tick = Duration::from_millis(self.config.tick_ms);
        let mut in_flight = JoinSet::new();

        loop {
            if let Err(err) = self.requeue_stale().await {
                error!(error = %err, "Failed to requeue stale provision jobs");
            }

            match self.claim_and_spawn(&mut in_flight, &shutdown).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Spawned provision jobs"),
                Err(err) => error!(error = %err, "Failed to claim provision jobs"),
            }

            while let Some(joined) = in_flight.try_join_next() {
                log_join_error(joined);
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Provision worker shutdown requested");
                    break;
                }
                _ = sleep(tick) => {}
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }
        info!("Provision worker stopped");
        Ok(())
    }

    /// Put back `running` jobs started longer ago than `stale_after`.
    async fn requeue_stale(&self) -> Result<u64, RepositoryError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC)
            .fixed_offset();

        let requeued = self.jobs.requeue_interrupted(cutoff).await?;
        if requeued > 0 {
            warn!(requeued, "Requeued provision jobs abandoned by a previous worker");
        }
        Ok(requeued)
    }

    /// Claim as many due jobs as there are free permits and spawn one task per job.
    async fn claim_and_spawn(
        &self,
        in_flight: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<usize, RepositoryError> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let claimed = self.jobs.claim_due(available as u64).await?;
        let count = claimed.len();
        if count == 0 {
            return Ok(0);
        }

        counter!("provision_jobs_claimed_total").increment(count as u64);
        info!("Claimed {} provision jobs", count);

        for job in claimed {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let cancel = shutdown.child_token();

            in_flight.spawn(async move {
                let _permit = permit;
                // Failures are already durable on the tenant and the job row.
                let _ = worker.handle(job, &cancel).await;
            });
        }

        Ok(count)
    }

    /// Claim due jobs and run them to completion. Returns the number handled.
    #[instrument(skip(self, cancel))]
    pub async fn claim_and_run_jobs(&self, cancel: &CancellationToken) -> Result<usize, RepositoryError> {
        let mut in_flight = JoinSet::new();
        let count = self.claim_and_spawn(&mut in_flight, cancel).await?;
        if count == 0 {
            debug!("No due provision jobs");
        }

        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }

        Ok(count)
    }

    /// Execute one claimed job and record its outcome on the job row.
    ///
    /// The attempt runs in its own task so a panic is contained: the tenant
    /// is forced to `Failed` and the panic becomes [`ProvisioningError::Unexpected`].
    #[instrument(skip(self, job, cancel), fields(job_id = %job.id, tenant_id = %job.tenant_id, attempt = job.attempts))]
    pub async fn handle(
        &self,
        job: ProvisionJobModel,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisioningError> {
        let started = Instant::now();
        info!("Starting provision job");

        let orchestrator = Arc::clone(&self.orchestrator);
        let tenant_id = job.tenant_id;
        let attempt_cancel = cancel.clone();
        let attempt =
            tokio::spawn(async move { orchestrator.run(tenant_id, &attempt_cancel).await });

        let result = match attempt.await {
            Ok(result) => result,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!("attempt panicked: {}", panic_message(join_err.into_panic()))
                } else {
                    "attempt was aborted".to_string()
                };
                error!(message = %message, "Provision attempt died unexpectedly");
                Err(self.orchestrator.fail_unexpected(tenant_id, message).await)
            }
        };

        match result {
            Ok(outcome) => {
                if let Err(err) = self.jobs.mark_succeeded(job.id).await {
                    error!(error = %err, "Failed to mark provision job succeeded");
                }
                info!(
                    site_url = %outcome.site_url,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Provision job succeeded"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Provision job failed"
                );
                if let Err(mark_err) = self.jobs.mark_failed(job.id, &err.to_string()).await {
                    error!(error = %mark_err, "Failed to mark provision job failed");
                }
                Err(err)
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "Provision job task failed");
    }
}
