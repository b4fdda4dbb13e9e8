use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::{self, Measurement};
use crate::config::DispatchConfig;
use crate::errors::{Result, TelloError};

/// Reason given when an emergency command is replaced by a newer one.
pub const NACK_SUPERSEDED: &str = "superseded";
/// Reason given to every pending command when the link goes down.
pub const NACK_DISCONNECTED: &str = "disconnected";
/// Reason given to every pending command when the controller is shut down.
pub const NACK_SHUTDOWN: &str = "shutdown";
/// Reason given to commands other than SDK entry before the drone is connected.
pub const NACK_NOT_CONNECTED: &str = "not connected";

/// Priority class. Lower sorts first, so the derived `Ord` puts
/// `Emergency` ahead of `Safety` ahead of `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Emergency,
    Safety,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Back,
}

/// Read-only queries answered with a bare value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Battery,
    Speed,
    Height,
    FlightTime,
    Temperature,
    WifiSnr,
}

/// Everything the drone can be told to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelloCommand {
    /// Puts the drone into SDK mode; must be the first command sent.
    EnterSdkMode,
    TakeOff,
    Land,
    StopAndHover,
    /// Cuts the motors immediately.
    EmergencyStop,
    Move { direction: Direction, distance_cm: u16 },
    Rotate { rotation: Rotation, degrees: u16 },
    Flip(FlipDirection),
    /// Cruise speed in cm/s.
    SetSpeed(u8),
    /// Joystick-style velocities, each in -100..=100. The drone never replies.
    RemoteControl { left_right: i8, forwards_backwards: i8, up_down: i8, yaw: i8 },
    StartVideo,
    StopVideo,
    Query(Query),
}

impl TelloCommand {
    pub fn default_priority(&self) -> Priority {
        match self {
            TelloCommand::EmergencyStop => Priority::Emergency,
            TelloCommand::Land | TelloCommand::StopAndHover => Priority::Safety,
            _ => Priority::Normal,
        }
    }

    /// Commands that only make sense in the air.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            TelloCommand::Move { .. }
                | TelloCommand::Rotate { .. }
                | TelloCommand::Flip(_)
                | TelloCommand::RemoteControl { .. }
        )
    }

    /// Commands that put or keep the drone in the air, refused on a critical battery.
    pub fn is_flight(&self) -> bool {
        matches!(self, TelloCommand::TakeOff) || self.is_motion()
    }

    /// Commands answered with a value rather than `ok`.
    pub fn is_query(&self) -> bool {
        matches!(self, TelloCommand::Query(_))
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, TelloCommand::RemoteControl { .. })
    }

    /// Commands the drone acknowledges only once the manoeuvre completes.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            TelloCommand::TakeOff
                | TelloCommand::Land
                | TelloCommand::Move { .. }
                | TelloCommand::Rotate { .. }
                | TelloCommand::Flip(_)
        )
    }

    /// Checks argument ranges.
    pub fn validate(&self) -> Result<()> {
        match *self {
            TelloCommand::Move { distance_cm, .. } if !(20..=500).contains(&distance_cm) => {
                invalid(format!("distance must be between 20 and 500 cm, got {distance_cm}"))
            }
            TelloCommand::Rotate { degrees, .. } if !(1..=360).contains(&degrees) => {
                invalid(format!("rotation must be between 1 and 360 degrees, got {degrees}"))
            }
            TelloCommand::SetSpeed(speed) if !(1..=100).contains(&speed) => {
                invalid(format!("speed must be between 1 and 100 cm/s, got {speed}"))
            }
            TelloCommand::RemoteControl { left_right, forwards_backwards, up_down, yaw } => {
                for v in [left_right, forwards_backwards, up_down, yaw] {
                    if !(-100..=100).contains(&v) {
                        return invalid(format!("remote control values must be between -100 and 100, got {v}"));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn invalid(msg: String) -> Result<()> {
    Err(TelloError::Validation { msg })
}

impl fmt::Display for TelloCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::command_text(self))
    }
}

/// A command as submitted by a caller, before it is stamped and queued.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub kind: TelloCommand,
    pub priority: Option<Priority>,
    pub deadline: Option<Duration>,
    pub retries: Option<u32>,
}

impl CommandRequest {
    pub fn new(kind: TelloCommand) -> Self {
        Self { kind, priority: None, deadline: None, retries: None }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Validates the arguments and fills unset fields from `config`.
    pub(crate) fn into_command(self, sequence: u64, config: &DispatchConfig) -> Result<Command> {
        self.kind.validate()?;

        let priority = self.priority.unwrap_or_else(|| self.kind.default_priority());
        let deadline = self.deadline.unwrap_or(if self.kind.is_long_running() {
            config.motion_deadline
        } else {
            config.command_deadline
        });
        let retries_remaining = self.retries.unwrap_or(config.retries);

        Ok(Command {
            text: codec::command_text(&self.kind),
            kind: self.kind,
            priority,
            submitted_at: Instant::now(),
            sequence,
            deadline,
            retries_remaining,
        })
    }
}

impl From<TelloCommand> for CommandRequest {
    fn from(kind: TelloCommand) -> Self {
        CommandRequest::new(kind)
    }
}

/// A queued command. Only `retries_remaining` changes after it is built.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: TelloCommand,
    /// Wire text, e.g. `"forward 50"`.
    pub text: String,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub sequence: u64,
    pub deadline: Duration,
    pub retries_remaining: u32,
}

/// The successful half of an [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Value(Measurement),
    /// Sent, but the command has no reply (`rc`).
    Unacknowledged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ack(Reply),
    Nack(String),
    Timeout,
    /// Refused by a local interlock before reaching the wire.
    Rejected(String),
}

/// The terminal result of one command, produced exactly once.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: Command,
    pub outcome: Outcome,
    /// From the first send to the terminal outcome; zero if never sent.
    pub latency: Duration,
    /// Times the command was put on the wire.
    pub attempts: u32,
}

impl CommandResult {
    pub fn is_ack(&self) -> bool {
        matches!(self.outcome, Outcome::Ack(_))
    }

    /// Maps the outcome onto the error taxonomy.
    pub fn into_result(self) -> Result<Reply> {
        match self.outcome {
            Outcome::Ack(reply) => Ok(reply),
            Outcome::Nack(reason) if reason == NACK_DISCONNECTED => Err(TelloError::ConnectionLost),
            Outcome::Nack(reason) if reason == NACK_SHUTDOWN => Err(TelloError::Shutdown),
            Outcome::Nack(reason) if reason == NACK_NOT_CONNECTED => Err(TelloError::NotConnected),
            Outcome::Nack(reason) => Err(TelloError::Protocol { reason }),
            Outcome::Rejected(msg) => Err(TelloError::Validation { msg }),
            Outcome::Timeout => Err(TelloError::Timeout {
                command: self.command.text,
                attempts: self.attempts,
            }),
        }
    }
}
