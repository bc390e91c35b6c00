//! Background tasks that decide when due polls get finalized.
//!
//! Exactly one trigger runs per process, chosen at startup. Both stop when
//! their cancellation token fires; a finalization already in flight is allowed
//! to finish.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lineup_db::DbError;
use lineup_db::jobs::{Job, JobState, RescueReport};
use lineup_types::jobs::FinishPollArgs;

use crate::finalizer::FinalizeOutcome;
use crate::gateway::MessagingGateway;
use crate::results::Shuffler;
use crate::service::PollService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Sweep,
    Job,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sweep => "sweep",
            Self::Job => "job",
        })
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sweep" => Ok(Self::Sweep),
            "job" | "jobs" => Ok(Self::Job),
            other => Err(format!("unknown trigger '{}', expected 'sweep' or 'job'", other)),
        }
    }
}

/// Periodically finalizes every due poll.
pub struct SweepTrigger<G, S> {
    service: PollService<G, S>,
    interval: Duration,
}

impl<G: MessagingGateway, S: Shuffler> SweepTrigger<G, S> {
    pub fn new(service: PollService<G, S>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!("Sweep trigger started (every {:?})", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self
                .service
                .run_due_finalizations_until(Utc::now(), &shutdown)
                .await
            {
                Ok(report) => {
                    if report.finalized > 0 || report.failed > 0 {
                        info!(
                            finalized = report.finalized,
                            failed = report.failed,
                            "Sweep: processed due polls"
                        );
                    }
                    if report.deferred > 0 {
                        debug!("Sweep: {} due polls left for next start", report.deferred);
                    }
                }
                Err(e) => warn!("Sweep error: {}", e),
            }
        }
        info!("Sweep trigger stopped");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobWorkerConfig {
    /// How often the queue is polled for due jobs.
    pub poll_interval: Duration,
    /// Upper bound on jobs run concurrently.
    pub max_workers: usize,
    /// Wait before a failed attempt becomes available again.
    pub retry_delay: TimeDelta,
    /// Attempts still `running` this long after being claimed are returned
    /// to the queue.
    pub stale_after: TimeDelta,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_workers: 16,
            retry_delay: TimeDelta::seconds(30),
            stale_after: TimeDelta::minutes(5),
        }
    }
}

/// Runs `finish_poll` jobs from the durable queue when they come due.
pub struct JobTrigger<G, S> {
    service: PollService<G, S>,
    config: JobWorkerConfig,
}

impl<G: MessagingGateway, S: Shuffler> JobTrigger<G, S> {
    pub fn new(service: PollService<G, S>, config: JobWorkerConfig) -> Self {
        Self { service, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Job trigger started (poll every {:?}, {} workers)",
            self.config.poll_interval, self.config.max_workers
        );

        // Nothing is in flight yet, so every running job is left over.
        self.rescue(Utc::now(), "Rescued jobs interrupted by a previous shutdown")
            .await;

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            self.rescue(
                Utc::now() - self.config.stale_after,
                "Rescued stale job attempts",
            )
            .await;

            // Keep draining while full batches come back.
            loop {
                match self.work_due(Utc::now()).await {
                    Ok(claimed) if claimed >= self.config.max_workers && !shutdown.is_cancelled() => {}
                    Ok(_) => break,
                    Err(e) => {
                        warn!("Job poll error: {}", e);
                        break;
                    }
                }
            }
        }
        info!("Job trigger stopped");
    }

    /// Return attempts still `running` that were claimed at or before
    /// `claimed_before` to the queue.
    pub async fn rescue_claimed_before(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<RescueReport, DbError> {
        self.service
            .db()
            .call(move |db| db.rescue_stuck_jobs(Utc::now(), claimed_before))
            .await
    }

    async fn rescue(&self, claimed_before: DateTime<Utc>, message: &str) {
        match self.rescue_claimed_before(claimed_before).await {
            Ok(r) if r.requeued > 0 || r.discarded > 0 => {
                warn!(requeued = r.requeued, discarded = r.discarded, "{}", message);
            }
            Ok(_) => {}
            Err(e) => warn!("Job rescue failed: {}", e),
        }
    }

    /// Claim one batch of due jobs claimable at `now`, run them concurrently
    /// and record each outcome.
    ///
    /// The whole batch is always drained. If recording an outcome fails, the
    /// first such error is returned once every attempt has finished; those
    /// jobs stay `running` until the stale-claim rescue picks them up.
    /// Returns how many jobs were claimed.
    pub async fn work_due(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let limit = self.config.max_workers.max(1);
        let jobs = self
            .service
            .db()
            .call(move |db| db.claim_due_jobs(FinishPollArgs::KIND, now, limit))
            .await?;
        let claimed = jobs.len();
        if claimed == 0 {
            return Ok(0);
        }
        debug!("Claimed {} finish_poll jobs", claimed);

        let mut pending: HashMap<i64, Job> = jobs.iter().map(|j| (j.id, j.clone())).collect();
        let mut set = JoinSet::new();
        for job in jobs {
            let service = self.service.clone();
            set.spawn(async move {
                let outcome = run_job(&service, &job).await;
                (job.id, outcome)
            });
        }

        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, outcome)) => {
                    if let Some(job) = pending.remove(&id) {
                        self.record_logged(job, outcome, &mut first_err).await;
                    }
                }
                Err(e) => error!("Job task panicked: {}", e),
            }
        }

        // Tasks that panicked never reported back.
        for (_, job) in pending {
            self.record_logged(job, Err("job task panicked".to_string()), &mut first_err)
                .await;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(claimed),
        }
    }

    async fn record_logged(
        &self,
        job: Job,
        outcome: Result<(), String>,
        first_err: &mut Option<DbError>,
    ) {
        let id = job.id;
        if let Err(e) = self.record_outcome(job, outcome).await {
            error!(job_id = id, "Failed to record job outcome: {}", e);
            first_err.get_or_insert(e);
        }
    }

    async fn record_outcome(&self, job: Job, outcome: Result<(), String>) -> Result<(), DbError> {
        let db = self.service.db().clone();
        let id = job.id;
        // Stamped when the attempt ends, not when the batch was claimed.
        let now = Utc::now();
        match outcome {
            Ok(()) => db.call(move |db| db.complete_job(id, now)).await,
            Err(reason) => {
                let retry_delay = self.config.retry_delay;
                let message = reason.clone();
                let state = db
                    .call(move |db| db.fail_job(id, &message, now, retry_delay))
                    .await?;
                match state {
                    Some(JobState::Discarded) => error!(
                        job_id = id,
                        attempts = job.attempt,
                        "finish_poll job discarded after final attempt, needs an operator: {}",
                        reason
                    ),
                    Some(_) => warn!(
                        job_id = id,
                        attempt = job.attempt,
                        max_attempts = job.max_attempts,
                        "finish_poll job failed, will retry: {}",
                        reason
                    ),
                    None => debug!(job_id = id, "Job was no longer running"),
                }
                Ok(())
            }
        }
    }
}

async fn run_job<G: MessagingGateway, S: Shuffler>(
    service: &PollService<G, S>,
    job: &Job,
) -> Result<(), String> {
    let args: FinishPollArgs = job
        .decode_args()
        .map_err(|e| format!("bad job args: {}", e))?;
    match service.run_finalization_job(&args).await {
        Ok(FinalizeOutcome::Finalized { .. }) | Ok(FinalizeOutcome::AlreadyProcessed) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// The trigger selected at startup.
pub enum Trigger<G, S> {
    Sweep(SweepTrigger<G, S>),
    Job(JobTrigger<G, S>),
}

impl<G: MessagingGateway, S: Shuffler> Trigger<G, S> {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::Sweep(_) => TriggerKind::Sweep,
            Self::Job(_) => TriggerKind::Job,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        match self {
            Self::Sweep(t) => t.run(shutdown).await,
            Self::Job(t) => t.run(shutdown).await,
        }
    }
}
