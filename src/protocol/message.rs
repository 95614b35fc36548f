//! Protocol message definitions
//!
//! Defines the command set a node serves, the typed requests built from it,
//! and the four response kinds.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::{Address, CodecError, Frame, Outcome, Pool, Statistics, SubmitMode, WorkFailure, WorkItem};

/// Every command a node serves. The discriminant is the wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Join = 0,
    Leave = 1,
    GetPeers = 2,
    Ping = 3,
    DoWork = 4,
    StartWork = 5,
    ScheduleWork = 6,
    GetShortRunningFree = 7,
    GetLongRunningFree = 8,
    UpdateShortRunningFree = 9,
    UpdateLongRunningFree = 10,
    GetStatistics = 11,
    DeltaDoWorkAccepted = 12,
    DeltaDoWorkRejected = 13,
    DeltaStartWorkAccepted = 14,
    DeltaStartWorkRejected = 15,
    DeltaScheduleWorkAccepted = 16,
    DeltaScheduleWorkRejected = 17,
    DeltaWorkSuccessful = 18,
    DeltaWorkFailed = 19,
}

impl Command {
    pub const ALL: [Command; 20] = [
        Command::Join,
        Command::Leave,
        Command::GetPeers,
        Command::Ping,
        Command::DoWork,
        Command::StartWork,
        Command::ScheduleWork,
        Command::GetShortRunningFree,
        Command::GetLongRunningFree,
        Command::UpdateShortRunningFree,
        Command::UpdateLongRunningFree,
        Command::GetStatistics,
        Command::DeltaDoWorkAccepted,
        Command::DeltaDoWorkRejected,
        Command::DeltaStartWorkAccepted,
        Command::DeltaStartWorkRejected,
        Command::DeltaScheduleWorkAccepted,
        Command::DeltaScheduleWorkRejected,
        Command::DeltaWorkSuccessful,
        Command::DeltaWorkFailed,
    ];

    pub fn ordinal(self) -> u32 {
        self as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// Number of parameters the command carries
    pub fn arity(self) -> usize {
        match self {
            Command::GetPeers | Command::Ping => 0,
            Command::DoWork
            | Command::StartWork
            | Command::ScheduleWork
            | Command::UpdateShortRunningFree
            | Command::UpdateLongRunningFree => 2,
            _ => 1,
        }
    }

    /// Wire name, as used in logs
    pub fn name(self) -> &'static str {
        match self {
            Command::Join => "JOIN",
            Command::Leave => "LEAVE",
            Command::GetPeers => "GET_PEERS",
            Command::Ping => "PING",
            Command::DoWork => "DO_WORK",
            Command::StartWork => "START_WORK",
            Command::ScheduleWork => "SCHEDULE_WORK",
            Command::GetShortRunningFree => "GET_SHORTRUNNING_FREE",
            Command::GetLongRunningFree => "GET_LONGRUNNING_FREE",
            Command::UpdateShortRunningFree => "UPDATE_SHORTRUNNING_FREE",
            Command::UpdateLongRunningFree => "UPDATE_LONGRUNNING_FREE",
            Command::GetStatistics => "GET_STATISTICS",
            Command::DeltaDoWorkAccepted => "DELTA_DOWORK_ACCEPTED",
            Command::DeltaDoWorkRejected => "DELTA_DOWORK_REJECTED",
            Command::DeltaStartWorkAccepted => "DELTA_STARTWORK_ACCEPTED",
            Command::DeltaStartWorkRejected => "DELTA_STARTWORK_REJECTED",
            Command::DeltaScheduleWorkAccepted => "DELTA_SCHEDULEWORK_ACCEPTED",
            Command::DeltaScheduleWorkRejected => "DELTA_SCHEDULEWORK_REJECTED",
            Command::DeltaWorkSuccessful => "DELTA_WORK_SUCCESSFUL",
            Command::DeltaWorkFailed => "DELTA_WORK_FAILED",
        }
    }

    /// DELTA_* command that bumps the given counter
    pub fn delta(outcome: Outcome) -> Self {
        match outcome {
            Outcome::DoWorkAccepted => Command::DeltaDoWorkAccepted,
            Outcome::DoWorkRejected => Command::DeltaDoWorkRejected,
            Outcome::StartWorkAccepted => Command::DeltaStartWorkAccepted,
            Outcome::StartWorkRejected => Command::DeltaStartWorkRejected,
            Outcome::ScheduleWorkAccepted => Command::DeltaScheduleWorkAccepted,
            Outcome::ScheduleWorkRejected => Command::DeltaScheduleWorkRejected,
            Outcome::WorkSuccessful => Command::DeltaWorkSuccessful,
            Outcome::WorkFailed => Command::DeltaWorkFailed,
        }
    }

    /// Counter bumped by a DELTA_* command
    pub fn outcome(self) -> Option<Outcome> {
        Outcome::ALL.into_iter().find(|o| Command::delta(*o) == self)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// A node announces itself; the receiver pulls its peer set
    Join { address: Address },
    /// A node leaves the cluster
    Leave { address: Address },
    GetPeers,
    Ping,
    /// Submit work on the node hosting `id`
    Submit {
        mode: SubmitMode,
        id: Address,
        work: WorkItem,
    },
    GetFree { pool: Pool, id: Address },
    UpdateFree { pool: Pool, id: Address, free: u64 },
    GetStatistics { id: Address },
    Delta { outcome: Outcome, id: Address },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Join { .. } => Command::Join,
            Request::Leave { .. } => Command::Leave,
            Request::GetPeers => Command::GetPeers,
            Request::Ping => Command::Ping,
            Request::Submit { mode, .. } => match mode {
                SubmitMode::Do => Command::DoWork,
                SubmitMode::Start => Command::StartWork,
                SubmitMode::Schedule => Command::ScheduleWork,
            },
            Request::GetFree { pool, .. } => match pool {
                Pool::ShortRunning => Command::GetShortRunningFree,
                Pool::LongRunning => Command::GetLongRunningFree,
            },
            Request::UpdateFree { pool, .. } => match pool {
                Pool::ShortRunning => Command::UpdateShortRunningFree,
                Pool::LongRunning => Command::UpdateLongRunningFree,
            },
            Request::GetStatistics { .. } => Command::GetStatistics,
            Request::Delta { outcome, .. } => Command::delta(*outcome),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        let params = match self {
            Request::Join { address } | Request::Leave { address } => vec![Frame::blob(address)?],
            Request::GetPeers | Request::Ping => Vec::new(),
            Request::Submit { id, work, .. } => vec![Frame::blob(id)?, Frame::blob(work)?],
            Request::GetFree { id, .. }
            | Request::GetStatistics { id }
            | Request::Delta { id, .. } => vec![Frame::blob(id)?],
            Request::UpdateFree { id, free, .. } => vec![Frame::blob(id)?, Frame::blob(free)?],
        };
        Ok(Frame::new(self.command().ordinal(), params))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let command =
            Command::from_ordinal(frame.ordinal).ok_or(CodecError::UnknownCommand(frame.ordinal))?;

        if frame.params.len() != command.arity() {
            return Err(CodecError::Arity {
                name: command.name(),
                expected: command.arity(),
                actual: frame.params.len(),
            });
        }

        let request = match command {
            Command::Join => Request::Join { address: frame.param(0)? },
            Command::Leave => Request::Leave { address: frame.param(0)? },
            Command::GetPeers => Request::GetPeers,
            Command::Ping => Request::Ping,
            Command::DoWork | Command::StartWork | Command::ScheduleWork => {
                let mode = match command {
                    Command::DoWork => SubmitMode::Do,
                    Command::StartWork => SubmitMode::Start,
                    _ => SubmitMode::Schedule,
                };
                Request::Submit {
                    mode,
                    id: frame.param(0)?,
                    work: frame.param(1)?,
                }
            }
            Command::GetShortRunningFree => Request::GetFree {
                pool: Pool::ShortRunning,
                id: frame.param(0)?,
            },
            Command::GetLongRunningFree => Request::GetFree {
                pool: Pool::LongRunning,
                id: frame.param(0)?,
            },
            Command::UpdateShortRunningFree => Request::UpdateFree {
                pool: Pool::ShortRunning,
                id: frame.param(0)?,
                free: frame.param(1)?,
            },
            Command::UpdateLongRunningFree => Request::UpdateFree {
                pool: Pool::LongRunning,
                id: frame.param(0)?,
                free: frame.param(1)?,
            },
            Command::GetStatistics => Request::GetStatistics { id: frame.param(0)? },
            delta => match delta.outcome() {
                Some(outcome) => Request::Delta {
                    outcome,
                    id: frame.param(0)?,
                },
                None => return Err(CodecError::UnknownCommand(frame.ordinal)),
            },
        };

        Ok(request)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = self.command();
        match self {
            Request::Join { address } | Request::Leave { address } => {
                write!(f, "{}({})", command, address)
            }
            Request::GetPeers | Request::Ping => write!(f, "{}()", command),
            Request::Submit { id, work, .. } => write!(f, "{}({}, {})", command, id, work),
            Request::UpdateFree { id, free, .. } => write!(f, "{}({}, {})", command, id, free),
            Request::GetFree { id, .. }
            | Request::GetStatistics { id }
            | Request::Delta { id, .. } => write!(f, "{}({})", command, id),
        }
    }
}

/// Payload of an OK_VALUE response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Peers(HashSet<Address>),
    Free(u64),
    /// Milliseconds between submission and start
    StartDelay(u64),
    Statistics(Statistics),
}

/// Response kinds. The discriminant is the wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResponseKind {
    OkVoid = 0,
    OkValue = 1,
    WorkFailure = 2,
    GenericFailure = 3,
}

impl ResponseKind {
    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        match ordinal {
            0 => Some(ResponseKind::OkVoid),
            1 => Some(ResponseKind::OkValue),
            2 => Some(ResponseKind::WorkFailure),
            3 => Some(ResponseKind::GenericFailure),
            _ => None,
        }
    }

    /// Number of payload blobs the response carries
    pub fn arity(self) -> usize {
        match self {
            ResponseKind::OkVoid => 0,
            _ => 1,
        }
    }
}

/// The single response sent back for a request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    OkVoid,
    OkValue(Value),
    WorkFailure(WorkFailure),
    GenericFailure(String),
}

impl Response {
    pub fn kind(&self) -> ResponseKind {
        match self {
            Response::OkVoid => ResponseKind::OkVoid,
            Response::OkValue(_) => ResponseKind::OkValue,
            Response::WorkFailure(_) => ResponseKind::WorkFailure,
            Response::GenericFailure(_) => ResponseKind::GenericFailure,
        }
    }

    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        let params = match self {
            Response::OkVoid => Vec::new(),
            Response::OkValue(value) => vec![Frame::blob(value)?],
            Response::WorkFailure(failure) => vec![Frame::blob(failure)?],
            Response::GenericFailure(message) => vec![Frame::blob(message)?],
        };
        Ok(Frame::new(self.kind() as u32, params))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, CodecError> {
        let kind = ResponseKind::from_ordinal(frame.ordinal)
            .ok_or(CodecError::UnknownResponse(frame.ordinal))?;

        if frame.params.len() != kind.arity() {
            return Err(CodecError::Arity {
                name: "response",
                expected: kind.arity(),
                actual: frame.params.len(),
            });
        }

        Ok(match kind {
            ResponseKind::OkVoid => Response::OkVoid,
            ResponseKind::OkValue => Response::OkValue(frame.param(0)?),
            ResponseKind::WorkFailure => Response::WorkFailure(frame.param(0)?),
            ResponseKind::GenericFailure => Response::GenericFailure(frame.param(0)?),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{Decoder, Encoder};
    use bytes::BytesMut;

    /// A well-formed request of each kind
    pub(crate) fn sample(command: Command) -> Request {
        let id = Address::new("node-b", "127.0.0.1:24901");
        let work = WorkItem::new("resize", b"img-17".to_vec());
        match command {
            Command::Join => Request::Join { address: id },
            Command::Leave => Request::Leave { address: id },
            Command::GetPeers => Request::GetPeers,
            Command::Ping => Request::Ping,
            Command::DoWork => Request::Submit { mode: SubmitMode::Do, id, work },
            Command::StartWork => Request::Submit { mode: SubmitMode::Start, id, work },
            Command::ScheduleWork => Request::Submit {
                mode: SubmitMode::Schedule,
                id,
                work: work.long_running(),
            },
            Command::GetShortRunningFree => Request::GetFree { pool: Pool::ShortRunning, id },
            Command::GetLongRunningFree => Request::GetFree { pool: Pool::LongRunning, id },
            Command::UpdateShortRunningFree => Request::UpdateFree {
                pool: Pool::ShortRunning,
                id,
                free: 3,
            },
            Command::UpdateLongRunningFree => Request::UpdateFree {
                pool: Pool::LongRunning,
                id,
                free: 0,
            },
            Command::GetStatistics => Request::GetStatistics { id },
            delta => Request::Delta {
                outcome: delta.outcome().unwrap(),
                id,
            },
        }
    }

    fn through_wire(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        Encoder::new().encode(frame, &mut buf).unwrap();
        Decoder::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_every_command_survives_the_wire() {
        for command in Command::ALL {
            let request = sample(command);
            assert_eq!(request.command(), command);

            let frame = through_wire(&request.to_frame().unwrap());
            assert_eq!(frame.ordinal, command.ordinal());
            assert_eq!(frame.params.len(), command.arity());
            assert_eq!(Request::from_frame(&frame).unwrap(), request);
        }
    }

    #[test]
    fn test_ordinals_are_stable() {
        for (i, command) in Command::ALL.iter().enumerate() {
            assert_eq!(command.ordinal(), i as u32);
            assert_eq!(Command::from_ordinal(i as u32), Some(*command));
        }
        assert_eq!(Command::DeltaWorkFailed.ordinal(), 19);
        assert_eq!(Command::from_ordinal(20), None);
    }

    #[test]
    fn test_only_delta_commands_have_outcomes() {
        let deltas: Vec<_> = Command::ALL.iter().filter_map(|c| c.outcome()).collect();
        assert_eq!(deltas, Outcome::ALL.to_vec());
        assert_eq!(Command::Ping.outcome(), None);
    }

    #[test]
    fn test_unknown_command() {
        let frame = Frame::bare(42);
        assert!(matches!(
            Request::from_frame(&frame),
            Err(CodecError::UnknownCommand(42))
        ));
    }

    #[test]
    fn test_wrong_arity() {
        let frame = Frame::bare(Command::DoWork.ordinal());
        assert!(matches!(
            Request::from_frame(&frame),
            Err(CodecError::Arity { name: "DO_WORK", expected: 2, actual: 0 })
        ));
    }

    #[test]
    fn test_garbage_parameter() {
        let frame = Frame::new(
            Command::Leave.ordinal(),
            vec![bytes::Bytes::from_static(&[0xff, 0xff, 0xff, 0xff])],
        );
        assert!(matches!(
            Request::from_frame(&frame),
            Err(CodecError::Serialization(_))
        ));
    }

    #[test]
    fn test_responses_survive_the_wire() {
        let mut peers = HashSet::new();
        peers.insert(Address::new("a", "h:1"));
        peers.insert(Address::new("b", "h:2"));

        let responses = vec![
            Response::OkVoid,
            Response::OkValue(Value::Peers(peers)),
            Response::OkValue(Value::StartDelay(12)),
            Response::WorkFailure(WorkFailure::Rejected("no free slot".into())),
            Response::GenericFailure("Unknown command ordinal: 99".into()),
        ];

        for response in responses {
            let frame = through_wire(&response.to_frame().unwrap());
            assert_eq!(frame.ordinal, response.kind() as u32);
            assert_eq!(Response::from_frame(&frame).unwrap(), response);
        }
    }

    #[test]
    fn test_unknown_response() {
        assert!(matches!(
            Response::from_frame(&Frame::bare(4)),
            Err(CodecError::UnknownResponse(4))
        ));
    }

    #[test]
    fn test_request_display() {
        let request = Request::UpdateFree {
            pool: Pool::LongRunning,
            id: Address::new("n1", "h:1"),
            free: 4,
        };
        assert_eq!(request.to_string(), "UPDATE_LONGRUNNING_FREE(n1@h:1, 4)");
    }
}
