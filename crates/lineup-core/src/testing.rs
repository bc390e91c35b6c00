//! Test doubles shared by the lifecycle tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use lineup_db::Database;
use lineup_types::models::{Attendee, Identity, Poll};

use crate::gateway::{CreatedPoll, GatewayError, MessagingGateway, NewPoll};
use crate::results::Shuffler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreatePoll { chat_id: i64, question: String },
    StopPoll { chat_id: i64, message_id: i64 },
    SendMessage { chat_id: i64, text: String },
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    next_id: i64,
    fail_creates: bool,
    fail_stops: bool,
    panic_stops: bool,
    slow_stops: HashMap<i64, Duration>,
    failing_sends: usize,
}

/// In-memory gateway that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingGateway {
    state: Mutex<State>,
}

impl RecordingGateway {
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SendMessage { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().unwrap().fail_creates = fail;
    }

    pub fn fail_stops(&self, fail: bool) {
        self.state.lock().unwrap().fail_stops = fail;
    }

    pub fn panic_on_stops(&self, panic: bool) {
        self.state.lock().unwrap().panic_stops = panic;
    }

    /// Make `stop_poll` for `message_id` take `delay` before answering.
    pub fn delay_stops_for(&self, message_id: i64, delay: Duration) {
        self.state.lock().unwrap().slow_stops.insert(message_id, delay);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().unwrap().failing_sends = count;
    }

    /// Record a call and hand out the next platform id.
    fn record(&self, call: Call) -> (i64, std::sync::MutexGuard<'_, State>) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state.next_id += 1;
        (1000 + state.next_id, state)
    }
}

fn unavailable() -> GatewayError {
    GatewayError::Api {
        code: 502,
        description: "Bad Gateway".into(),
    }
}

impl MessagingGateway for RecordingGateway {
    async fn create_poll(&self, poll: NewPoll) -> Result<CreatedPoll, GatewayError> {
        let (id, state) = self.record(Call::CreatePoll {
            chat_id: poll.chat_id,
            question: poll.question,
        });
        if state.fail_creates {
            return Err(unavailable());
        }
        Ok(CreatedPoll {
            poll_id: format!("poll-{}", id),
            message_id: id,
        })
    }

    async fn stop_poll(&self, chat_id: i64, message_id: i64) -> Result<(), GatewayError> {
        let (fail, panic, delay) = {
            let (_, state) = self.record(Call::StopPoll { chat_id, message_id });
            (
                state.fail_stops,
                state.panic_stops,
                state.slow_stops.get(&message_id).copied(),
            )
        };
        // Guard released above so a panic does not poison it.
        if panic {
            panic!("stop_poll exploded");
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(unavailable());
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _reply_to: Option<i64>,
    ) -> Result<i64, GatewayError> {
        let (id, mut state) = self.record(Call::SendMessage {
            chat_id,
            text: text.to_string(),
        });
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(unavailable());
        }
        Ok(id)
    }
}

/// Orders attendees by user id so rendered output is predictable.
pub struct StableOrder;

impl Shuffler for StableOrder {
    fn shuffle(&self, attendees: &mut [Attendee]) {
        attendees.sort_by_key(|a| a.id);
    }
}

pub fn temp_db() -> Arc<Database> {
    let path = std::env::temp_dir().join(format!("lineup-core-test-{}.db", uuid::Uuid::new_v4()));
    Arc::new(Database::open(&path).unwrap())
}

/// Register an active poll that ended ten minutes ago.
pub fn active_poll(db: &Database, poll_id: &str, topic: &str) -> Poll {
    let poll = Poll::new_active(
        poll_id.to_string(),
        -1001,
        77,
        topic.to_string(),
        Identity::new(9, Some("coach".into()), Some("Coach".into())),
        Utc::now() - TimeDelta::minutes(40),
        TimeDelta::minutes(30),
    );
    db.register_poll(&poll).unwrap();
    poll
}
