use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use lineup_db::jobs::NewJob;
use lineup_db::{Database, DbError};
use lineup_types::jobs::FinishPollArgs;
use lineup_types::models::{Identity, Poll};

use crate::command::{self, ParseError};
use crate::finalizer::{FinalizeError, FinalizeOutcome, Finalizer};
use crate::gateway::{GatewayError, MessagingGateway, NewPoll};
use crate::results::Shuffler;

#[derive(Debug, Error)]
pub enum CreatePollError {
    #[error("bad format: {0}")]
    BadFormat(#[from] ParseError),
    #[error("gateway failure: {0}")]
    Gateway(#[source] GatewayError),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// How finalization gets scheduled for new polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// Nothing is scheduled; a periodic sweep finds due polls.
    Sweep,
    /// A `finish_poll` job is enqueued to run at the poll's end time.
    Job { max_attempts: u32 },
}

/// Tally of one pass over the due polls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub finalized: usize,
    pub already_processed: usize,
    pub failed: usize,
    /// Left for the next pass because shutdown was requested.
    pub deferred: usize,
}

/// Entry points into the poll lifecycle for the update handlers and triggers.
pub struct PollService<G, S> {
    db: Arc<Database>,
    gateway: Arc<G>,
    finalizer: Finalizer<G, S>,
    scheduling: Scheduling,
}

impl<G, S> Clone for PollService<G, S> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            gateway: Arc::clone(&self.gateway),
            finalizer: self.finalizer.clone(),
            scheduling: self.scheduling,
        }
    }
}

impl<G: MessagingGateway, S: Shuffler> PollService<G, S> {
    pub fn new(db: Arc<Database>, gateway: Arc<G>, shuffler: Arc<S>, scheduling: Scheduling) -> Self {
        let finalizer = Finalizer::new(db.clone(), gateway.clone(), shuffler);
        Self {
            db,
            gateway,
            finalizer,
            scheduling,
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Parse `request`, post the poll to the chat and register it.
    ///
    /// Nothing is stored if the request is malformed or the gateway refuses
    /// the poll. With job scheduling the finalization job is enqueued in the
    /// same transaction as the registry insert.
    pub async fn create_poll(
        &self,
        chat_id: i64,
        request: &str,
        creator: Identity,
    ) -> Result<Poll, CreatePollError> {
        let parsed = command::parse_request(request)?;

        let created = self
            .gateway
            .create_poll(NewPoll::attendance(chat_id, &parsed.topic))
            .await
            .map_err(CreatePollError::Gateway)?;

        let poll = Poll::new_active(
            created.poll_id,
            chat_id,
            created.message_id,
            parsed.topic,
            creator,
            Utc::now(),
            parsed.duration,
        );

        let record = poll.clone();
        let registered = match self.scheduling {
            Scheduling::Sweep => self.db.call(move |db| db.register_poll(&record)).await,
            Scheduling::Job { max_attempts } => {
                let job = NewJob::finish_poll(&FinishPollArgs::from(&poll), poll.ends_at, max_attempts)?;
                self.db
                    .call(move |db| db.register_poll_scheduled(&record, &job))
                    .await
            }
        };

        match registered {
            Ok(true) => {}
            Ok(false) => warn!(poll_id = %poll.poll_id, "Poll id already registered"),
            Err(e) => {
                error!(poll_id = %poll.poll_id, "Poll posted but not registered: {}", e);
                return Err(e.into());
            }
        }

        info!(
            poll_id = %poll.poll_id,
            chat_id,
            topic = %poll.topic,
            ends_at = %poll.ends_at,
            "Poll created"
        );
        Ok(poll)
    }

    /// Store a voter's current choice. An empty `option_ids` is a retraction.
    pub async fn record_vote(
        &self,
        poll_id: &str,
        voter: Identity,
        option_ids: Vec<i64>,
    ) -> Result<(), DbError> {
        let poll_id = poll_id.to_string();
        self.db
            .call(move |db| db.upsert_vote(&poll_id, &voter, &option_ids, Utc::now()))
            .await
    }

    /// Finalize every poll due at `now`.
    pub async fn run_due_finalizations(&self, now: DateTime<Utc>) -> Result<SweepReport, DbError> {
        self.run_due_finalizations_until(now, &CancellationToken::new())
            .await
    }

    /// Finalize due polls one after another, stopping between polls once
    /// `shutdown` is cancelled. A poll that fails stays due for the next pass.
    pub async fn run_due_finalizations_until(
        &self,
        now: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) -> Result<SweepReport, DbError> {
        let due = self.db.call(move |db| db.find_due(now)).await?;
        let mut report = SweepReport::default();

        for (i, poll) in due.iter().enumerate() {
            if shutdown.is_cancelled() {
                report.deferred = due.len() - i;
                break;
            }
            match self.finalizer.finalize(&FinishPollArgs::from(poll)).await {
                Ok(FinalizeOutcome::Finalized { .. }) => report.finalized += 1,
                Ok(FinalizeOutcome::AlreadyProcessed) => report.already_processed += 1,
                Err(e) => {
                    warn!(poll_id = %poll.poll_id, "Finalization failed, retrying next sweep: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Job worker entry point.
    pub async fn run_finalization_job(
        &self,
        args: &FinishPollArgs,
    ) -> Result<FinalizeOutcome, FinalizeError> {
        self.finalizer.finalize(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use lineup_db::jobs::JobState;
    use lineup_types::models::PollStatus;

    use crate::results::NO_ONE_COMING;
    use crate::testing::{Call, RecordingGateway, StableOrder, active_poll, temp_db};

    fn service(
        db: &Arc<Database>,
        gateway: &Arc<RecordingGateway>,
        scheduling: Scheduling,
    ) -> PollService<RecordingGateway, StableOrder> {
        PollService::new(db.clone(), gateway.clone(), Arc::new(StableOrder), scheduling)
    }

    fn creator() -> Identity {
        Identity::new(9, Some("coach".into()), Some("Coach".into()))
    }

    fn ann() -> Identity {
        Identity::new(1, Some("ann".into()), Some("Ann".into()))
    }

    fn bob() -> Identity {
        Identity::new(2, None, Some("Bob".into()))
    }

    #[tokio::test]
    async fn test_create_poll_registers_active_poll() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);

        let poll = svc.create_poll(-42, "Practice | 30m", creator()).await.unwrap();
        assert_eq!(poll.ends_at, poll.started_at + TimeDelta::minutes(30));
        assert_eq!(poll.status, PollStatus::Active);
        assert_eq!(poll.topic, "Practice");

        let stored = db.get_poll(&poll.poll_id).unwrap().unwrap();
        assert_eq!(stored, poll);
        assert_eq!(
            gateway.calls(),
            vec![Call::CreatePoll { chat_id: -42, question: "Practice".into() }]
        );
    }

    #[tokio::test]
    async fn test_malformed_request_touches_nothing() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);

        let err = svc
            .create_poll(-42, "just text no duration", creator())
            .await
            .unwrap_err();
        assert!(matches!(err, CreatePollError::BadFormat(_)));
        assert!(gateway.calls().is_empty());

        let polls: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM polls", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(polls, 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_persists_nothing() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        gateway.fail_creates(true);
        let svc = service(&db, &gateway, Scheduling::Job { max_attempts: 3 });

        let err = svc.create_poll(-42, "Practice | 30m", creator()).await.unwrap_err();
        assert!(matches!(err, CreatePollError::Gateway(_)));

        let (polls, jobs): (i64, i64) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM polls), (SELECT COUNT(*) FROM jobs)",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!((polls, jobs), (0, 0));
    }

    #[tokio::test]
    async fn test_job_scheduling_enqueues_at_end_time() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Job { max_attempts: 2 });

        let poll = svc.create_poll(-42, "Practice | 30m", creator()).await.unwrap();

        assert!(
            db.claim_due_jobs(FinishPollArgs::KIND, poll.ends_at - TimeDelta::seconds(1), 10)
                .unwrap()
                .is_empty()
        );
        let jobs = db.claim_due_jobs(FinishPollArgs::KIND, poll.ends_at, 10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[0].max_attempts, 2);
        assert_eq!(jobs[0].scheduled_at, poll.ends_at);
        assert_eq!(
            jobs[0].decode_args::<FinishPollArgs>().unwrap(),
            FinishPollArgs::from(&poll)
        );
    }

    #[tokio::test]
    async fn test_scenario_one_attendee() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);

        let poll = svc.create_poll(-42, "Practice | 30m", creator()).await.unwrap();
        svc.record_vote(&poll.poll_id, ann(), vec![0]).await.unwrap();
        svc.record_vote(&poll.poll_id, bob(), vec![1]).await.unwrap();

        // Not due yet.
        let early = svc.run_due_finalizations(poll.started_at).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let report = svc.run_due_finalizations(poll.ends_at).await.unwrap();
        assert_eq!(report.finalized, 1);

        let texts = gateway.sent_texts();
        assert_eq!(texts.len(), 1);
        let text = &texts[0];
        assert!(text.starts_with("Results for: Practice\n"));
        let numbered: Vec<&str> = text.lines().filter(|l| l.starts_with(char::is_numeric)).collect();
        assert_eq!(numbered, vec!["1. @ann (Ann)"]);
    }

    #[tokio::test]
    async fn test_scenario_changed_vote_means_no_one() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);

        let poll = svc.create_poll(-42, "Practice | 30m", creator()).await.unwrap();
        svc.record_vote(&poll.poll_id, ann(), vec![0]).await.unwrap();
        svc.record_vote(&poll.poll_id, ann(), vec![1]).await.unwrap();

        svc.run_due_finalizations(poll.ends_at).await.unwrap();
        assert_eq!(
            gateway.sent_texts(),
            vec![format!("Results for: Practice\n{}", NO_ONE_COMING)]
        );
    }

    #[tokio::test]
    async fn test_failed_poll_is_retried_on_next_sweep() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);
        active_poll(&db, "a", "First");
        active_poll(&db, "b", "Second");
        gateway.fail_next_sends(1);

        let first = svc.run_due_finalizations(Utc::now()).await.unwrap();
        assert_eq!((first.finalized, first.failed), (1, 1));

        let second = svc.run_due_finalizations(Utc::now()).await.unwrap();
        assert_eq!((second.finalized, second.failed), (1, 0));
        assert!(db.find_due(Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_stops_between_polls_on_shutdown() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Sweep);
        active_poll(&db, "a", "First");
        active_poll(&db, "b", "Second");

        let token = CancellationToken::new();
        token.cancel();
        let report = svc
            .run_due_finalizations_until(Utc::now(), &token)
            .await
            .unwrap();
        assert_eq!(report.deferred, 2);
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_job_entry_point_is_idempotent() {
        let db = temp_db();
        let gateway = Arc::new(RecordingGateway::default());
        let svc = service(&db, &gateway, Scheduling::Job { max_attempts: 1 });
        let poll = active_poll(&db, "p1", "Practice");
        let args = FinishPollArgs::from(&poll);

        assert!(matches!(
            svc.run_finalization_job(&args).await.unwrap(),
            FinalizeOutcome::Finalized { .. }
        ));
        assert_eq!(
            svc.run_finalization_job(&args).await.unwrap(),
            FinalizeOutcome::AlreadyProcessed
        );
        assert_eq!(gateway.sent_texts().len(), 1);
    }
}
