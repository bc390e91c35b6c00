use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Option index that means "coming". Membership of this index in a vote's
/// option set is the only attendance predicate.
pub const ATTENDING_OPTION: i64 = 0;

/// The two fixed answers every attendance poll offers, in index order.
pub const POLL_OPTIONS: [&str; 2] = ["coming", "not coming"];

/// A chat member as seen by the platform: numeric id plus optional handle and
/// display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub username: Option<String>,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(id: i64, username: Option<String>, name: Option<String>) -> Self {
        // Empty strings from the platform are the same as "not set".
        Self {
            id,
            username: username.filter(|s| !s.is_empty()),
            name: name.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Processed,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Processed => "processed",
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown poll status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for PollStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "processed" => Ok(Self::Processed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A registered attendance poll.
///
/// `ends_at` is always `started_at + duration_seconds`. `results_message_id`
/// and `processed_at` are only set once the poll is `Processed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub poll_id: String,
    pub chat_id: i64,
    pub message_id: i64,
    pub topic: String,
    pub creator: Identity,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub ends_at: DateTime<Utc>,
    pub status: PollStatus,
    pub results_message_id: Option<i64>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Poll {
    /// Build a freshly created, still active poll.
    pub fn new_active(
        poll_id: String,
        chat_id: i64,
        message_id: i64,
        topic: String,
        creator: Identity,
        started_at: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Self {
        Self {
            poll_id,
            chat_id,
            message_id,
            topic,
            creator,
            started_at,
            duration_seconds: duration.num_seconds(),
            ends_at: started_at + TimeDelta::seconds(duration.num_seconds()),
            status: PollStatus::Active,
            results_message_id: None,
            processed_at: None,
        }
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.duration_seconds)
    }

    pub fn is_processed(&self) -> bool {
        self.status == PollStatus::Processed
    }
}

/// A voter whose latest vote includes the "coming" option.
pub type Attendee = Identity;

/// The current vote of one voter in one poll. Later votes replace earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub poll_id: String,
    pub voter: Identity,
    pub option_ids: Vec<i64>,
    pub updated_at: DateTime<Utc>,
}

impl Vote {
    pub fn is_attending(&self) -> bool {
        self.option_ids.contains(&ATTENDING_OPTION)
    }
}

/// Rendered outcome of a finalized poll. Written once per poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResult {
    pub poll_id: String,
    pub results_text: String,
    pub created_at: DateTime<Utc>,
}
