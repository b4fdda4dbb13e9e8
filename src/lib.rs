//! Control-protocol engine for the Tello EDU drone.
//!
//! Commands are queued by priority and sent one at a time over the command
//! socket, while status and video are ingested on their own loops. See
//! [`Tello`] for the entry point.

mod codec;
mod command;
mod config;
mod connection;
mod dispatcher;
mod errors;
mod queue;
mod telemetry;
mod tello;
mod video;

pub mod transport;

pub use codec::{command_text, decode, decode_telemetry, encode, DecodedResponse, Measurement};
pub use command::{
    Command, CommandRequest, CommandResult, Direction, FlipDirection, Outcome, Priority, Query, Reply, Rotation,
    TelloCommand, NACK_DISCONNECTED, NACK_NOT_CONNECTED, NACK_SHUTDOWN, NACK_SUPERSEDED,
};
pub use config::{
    Backoff, DispatchConfig, TelemetryConfig, TelloConfig, VideoConfig, CONTROL_UDP_PORT, DEFAULT_DRONE_HOST,
    STATE_UDP_PORT, VIDEO_UDP_PORT,
};
pub use connection::{ConnectionState, Phase};
pub use dispatcher::{DispatchPhase, DispatcherHandle, PendingResult};
pub use errors::{Result, TelloError};
pub use queue::{Entry, PriorityCommandQueue};
pub use telemetry::{Attitude, LinkEvent, TelemetryReceiver, TelemetrySnapshot, TelemetryStats, Temperature, Vector3};
pub use tello::{Connected, Disconnected, Tello};
pub use video::{
    FrameAssembler, FrameStream, VideoFrame, VideoStats, VideoStreamState, MAX_CHUNK_SIZE, VIDEO_HEIGHT, VIDEO_WIDTH,
};
