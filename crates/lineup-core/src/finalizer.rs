use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use lineup_db::{Database, DbError};
use lineup_types::jobs::FinishPollArgs;

use crate::gateway::{GatewayError, MessagingGateway};
use crate::results::{Shuffler, render_results};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("poll {0} is not registered")]
    PollNotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
    #[error("could not post results: {0}")]
    SendResults(#[source] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This run closed the poll and posted its results.
    Finalized {
        results_message_id: i64,
        attendees: usize,
    },
    /// The poll was already closed; nothing was sent or written.
    AlreadyProcessed,
}

/// Drives a poll through `active -> processed`.
///
/// Safe to call any number of times, sequentially or concurrently, for the
/// same poll. A processed poll is detected before any side effect. Every run
/// reads poll and vote state fresh from the database.
pub struct Finalizer<G, S> {
    db: Arc<Database>,
    gateway: Arc<G>,
    shuffler: Arc<S>,
}

impl<G, S> Clone for Finalizer<G, S> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            gateway: Arc::clone(&self.gateway),
            shuffler: Arc::clone(&self.shuffler),
        }
    }
}

impl<G: MessagingGateway, S: Shuffler> Finalizer<G, S> {
    pub fn new(db: Arc<Database>, gateway: Arc<G>, shuffler: Arc<S>) -> Self {
        Self {
            db,
            gateway,
            shuffler,
        }
    }

    /// Close the poll named in `args`.
    ///
    /// Gateway calls use the chat and message carried in `args`; attendees
    /// always come from the vote ledger. On error the poll stays active and
    /// the caller's trigger retries later.
    pub async fn finalize(&self, args: &FinishPollArgs) -> Result<FinalizeOutcome, FinalizeError> {
        let poll_id = args.poll_id.clone();
        let poll = self
            .db
            .call(move |db| db.get_poll(&poll_id))
            .await?
            .ok_or_else(|| FinalizeError::PollNotFound(args.poll_id.clone()))?;

        if poll.is_processed() {
            debug!(poll_id = %args.poll_id, "Poll already processed, skipping");
            return Ok(FinalizeOutcome::AlreadyProcessed);
        }

        // The widget may already be closed by an earlier partial run or by the
        // platform itself.
        if let Err(e) = self.gateway.stop_poll(args.chat_id, args.message_id).await {
            warn!(poll_id = %args.poll_id, "Stop poll failed (continuing): {}", e);
        }

        let poll_id = args.poll_id.clone();
        let attendees = self.db.call(move |db| db.get_attendees(&poll_id)).await?;
        let attendee_count = attendees.len();

        let text = render_results(&args.topic, attendees, self.shuffler.as_ref());

        let results_message_id = self
            .gateway
            .send_message(args.chat_id, &text, None)
            .await
            .map_err(FinalizeError::SendResults)?;

        let poll_id = args.poll_id.clone();
        let marked = self
            .db
            .call(move |db| db.mark_processed(&poll_id, &text, results_message_id, Utc::now()))
            .await?;

        if !marked {
            warn!(
                poll_id = %args.poll_id,
                results_message_id,
                "Poll was closed by a concurrent run; results were posted twice"
            );
            return Ok(FinalizeOutcome::AlreadyProcessed);
        }

        info!(
            poll_id = %args.poll_id,
            chat_id = args.chat_id,
            attendees = attendee_count,
            "Poll finalized"
        );
        Ok(FinalizeOutcome::Finalized {
            results_message_id,
            attendees: attendee_count,
        })
    }
}
