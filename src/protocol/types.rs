//! Value types carried inside protocol frames
//!
//! Addresses, work items, statistics snapshots and work failures. All of them
//! travel as bincode blobs inside frame parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identity of a work manager node
///
/// The endpoint is part of the identity: a node restarted on another port is
/// a different peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Cluster-wide node identifier
    pub id: String,
    /// `host:port` the node accepts calls on
    pub endpoint: String,
}

impl Address {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Address with a freshly generated id
    pub fn generate(endpoint: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), endpoint)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid address '{0}', expected <id>@<host:port>")]
pub struct ParseAddressError(String);

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((id, endpoint)) if !id.is_empty() && endpoint.contains(':') => {
                Ok(Self::new(id, endpoint))
            }
            _ => Err(ParseAddressError(s.to_string())),
        }
    }
}

/// Capacity pool a work item runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pool {
    ShortRunning,
    LongRunning,
}

impl Pool {
    pub fn of(work: &WorkItem) -> Self {
        if work.long_running {
            Pool::LongRunning
        } else {
            Pool::ShortRunning
        }
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::ShortRunning => f.write_str("short-running"),
            Pool::LongRunning => f.write_str("long-running"),
        }
    }
}

/// Opaque unit of work submitted for distributed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    /// Human-readable label, used in logs only
    pub name: String,
    /// Runs in the long-running pool when set
    pub long_running: bool,
    pub payload: Vec<u8>,
}

impl WorkItem {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            long_running: false,
            payload,
        }
    }

    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// How a work item is handed to the target engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitMode {
    /// Fire and forget
    Do,
    /// Block until execution starts
    Start,
    /// Enqueue without waiting
    Schedule,
}

impl SubmitMode {
    pub fn accepted(self) -> Outcome {
        match self {
            SubmitMode::Do => Outcome::DoWorkAccepted,
            SubmitMode::Start => Outcome::StartWorkAccepted,
            SubmitMode::Schedule => Outcome::ScheduleWorkAccepted,
        }
    }

    pub fn rejected(self) -> Outcome {
        match self {
            SubmitMode::Do => Outcome::DoWorkRejected,
            SubmitMode::Start => Outcome::StartWorkRejected,
            SubmitMode::Schedule => Outcome::ScheduleWorkRejected,
        }
    }
}

/// Named outcome counters kept per node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    DoWorkAccepted,
    DoWorkRejected,
    StartWorkAccepted,
    StartWorkRejected,
    ScheduleWorkAccepted,
    ScheduleWorkRejected,
    WorkSuccessful,
    WorkFailed,
}

impl Outcome {
    pub const ALL: [Outcome; 8] = [
        Outcome::DoWorkAccepted,
        Outcome::DoWorkRejected,
        Outcome::StartWorkAccepted,
        Outcome::StartWorkRejected,
        Outcome::ScheduleWorkAccepted,
        Outcome::ScheduleWorkRejected,
        Outcome::WorkSuccessful,
        Outcome::WorkFailed,
    ];

    /// Slot of this counter in a per-node counter array
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Execution statistics of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub short_running_free: u64,
    pub long_running_free: u64,
    pub do_work_accepted: u64,
    pub do_work_rejected: u64,
    pub start_work_accepted: u64,
    pub start_work_rejected: u64,
    pub schedule_work_accepted: u64,
    pub schedule_work_rejected: u64,
    pub work_successful: u64,
    pub work_failed: u64,
}

impl Statistics {
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        match outcome {
            Outcome::DoWorkAccepted => self.do_work_accepted,
            Outcome::DoWorkRejected => self.do_work_rejected,
            Outcome::StartWorkAccepted => self.start_work_accepted,
            Outcome::StartWorkRejected => self.start_work_rejected,
            Outcome::ScheduleWorkAccepted => self.schedule_work_accepted,
            Outcome::ScheduleWorkRejected => self.schedule_work_rejected,
            Outcome::WorkSuccessful => self.work_successful,
            Outcome::WorkFailed => self.work_failed,
        }
    }

    pub fn set_outcome(&mut self, outcome: Outcome, value: u64) {
        let slot = match outcome {
            Outcome::DoWorkAccepted => &mut self.do_work_accepted,
            Outcome::DoWorkRejected => &mut self.do_work_rejected,
            Outcome::StartWorkAccepted => &mut self.start_work_accepted,
            Outcome::StartWorkRejected => &mut self.start_work_rejected,
            Outcome::ScheduleWorkAccepted => &mut self.schedule_work_accepted,
            Outcome::ScheduleWorkRejected => &mut self.schedule_work_rejected,
            Outcome::WorkSuccessful => &mut self.work_successful,
            Outcome::WorkFailed => &mut self.work_failed,
        };
        *slot = value;
    }
}

/// Domain-level failure of a work submission
///
/// Always reported to the caller as a WORK_FAILURE response so it can route
/// the work somewhere else.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkFailure {
    #[error("Work rejected: {0}")]
    Rejected(String),

    #[error("Work did not start within {0} ms")]
    StartTimedOut(u64),

    #[error("Work failed: {0}")]
    Failed(String),
}
