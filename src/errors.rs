use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelloError {
    /// Rejected locally, never sent. Resubmitting the same command will not help.
    #[error("invalid command: {msg}")]
    Validation { msg: String },

    /// The drone answered with an error after every attempt.
    #[error("drone refused command: {reason}")]
    Protocol { reason: String },

    #[error("no reply to \"{command}\" after {attempts} attempt(s)")]
    Timeout { command: String, attempts: u32 },

    /// The status channel went quiet for longer than the liveness window, or
    /// the link was never established. Pending commands have all been failed.
    #[error("connection to drone lost")]
    ConnectionLost,

    #[error("failed to decode: {msg}")]
    Decode { msg: String },

    #[error("not connected")]
    NotConnected,

    #[error("video frames have already been subscribed to")]
    AlreadySubscribed,

    #[error("video stream did not stabilise")]
    VideoNotStreaming,

    #[error("controller has been shut down")]
    Shutdown,

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TelloError {
    /// True when the failure concerns the link as a whole rather than one
    /// command.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, TelloError::ConnectionLost | TelloError::NotConnected | TelloError::Shutdown)
    }
}

pub type Result<T, E = TelloError> = std::result::Result<T, E>;
