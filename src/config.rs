use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::Result;

pub const DEFAULT_DRONE_HOST: &str = "192.168.10.1";

pub const CONTROL_UDP_PORT: u16 = 8889;
pub const STATE_UDP_PORT: u16 = 8890;
pub const VIDEO_UDP_PORT: u16 = 11111;

/// Tello drone connection and protocol options.
///
/// Every field has a default, so a TOML file only needs to name what it
/// changes. Durations are given in milliseconds:
///
/// ```toml
/// drone_host = "192.168.10.1"
///
/// [dispatch]
/// command_deadline = 5000
/// retries = 3
/// backoff = { kind = "exponential", initial = 250, max = 2000 }
///
/// [telemetry]
/// liveness_window = 2000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelloConfig {
    pub drone_host: String,
    pub bind_host: String,
    pub command_port: u16,
    pub state_port: u16,
    pub video_port: u16,
    pub dispatch: DispatchConfig,
    pub telemetry: TelemetryConfig,
    pub video: VideoConfig,
}

impl Default for TelloConfig {
    fn default() -> Self {
        Self {
            drone_host: DEFAULT_DRONE_HOST.to_string(),
            bind_host: "0.0.0.0".to_string(),
            command_port: CONTROL_UDP_PORT,
            state_port: STATE_UDP_PORT,
            video_port: VIDEO_UDP_PORT,
            dispatch: DispatchConfig::default(),
            telemetry: TelemetryConfig::default(),
            video: VideoConfig::default(),
        }
    }
}

impl TelloConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn drone_command_address(&self) -> String {
        format!("{}:{}", self.drone_host, self.command_port)
    }

    pub(crate) fn local_address(&self, port: u16) -> String {
        format!("{}:{port}", self.bind_host)
    }
}

/// Command deadlines, retry policy and safety thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Reply deadline for quick commands (mode switches, queries, settings).
    #[serde(with = "millis")]
    pub command_deadline: Duration,

    /// Reply deadline for takeoff, landing and movement. The drone only
    /// answers these once the manoeuvre has finished.
    #[serde(with = "millis")]
    pub motion_deadline: Duration,

    /// Resends after the first attempt.
    pub retries: u32,

    pub backoff: Backoff,

    /// Normal-priority flight commands are refused below this charge.
    pub battery_threshold_pct: u8,

    /// Height above which telemetry says the drone is airborne.
    pub flying_height_cm: i16,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command_deadline: Duration::from_secs(7),
            motion_deadline: Duration::from_secs(20),
            retries: 2,
            backoff: Backoff::default(),
            battery_threshold_pct: 10,
            flying_height_cm: 10,
        }
    }
}

/// Delay between a failed attempt and the resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    Exponential {
        #[serde(with = "millis")]
        initial: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay: Duration::from_secs(1) }
    }
}

impl Backoff {
    /// Delay before resend number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Longest silence on the status channel before the link is declared lost.
    #[serde(with = "millis")]
    pub liveness_window: Duration,

    /// Battery level at which a flying drone is sent a safety landing. `None`
    /// disables the guard.
    pub auto_land_battery_pct: Option<u8>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(3),
            auto_land_battery_pct: Some(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Completed frames held for a slow subscriber before the oldest is dropped.
    pub frame_buffer: usize,
    pub max_frame_bytes: usize,
    /// Consecutive good frames before the stream counts as stable.
    pub stable_after_frames: u32,
    #[serde(with = "millis")]
    pub stall_timeout: Duration,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            frame_buffer: 8,
            max_frame_bytes: 1024 * 1024,
            stable_after_frames: 30,
            stall_timeout: Duration::from_secs(5),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
