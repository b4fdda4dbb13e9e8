//! Wire format of the Tello SDK.
//!
//! Commands are newline-free ASCII sent as one datagram each; replies are a
//! single short ASCII word or value. The status port carries one
//! `key:value;` line per datagram. Nothing outside this module knows how
//! either looks on the wire.

use std::time::Duration;

use tokio::time::Instant;

use crate::command::{Command, Direction, FlipDirection, Query, Rotation, TelloCommand};
use crate::errors::{Result, TelloError};
use crate::telemetry::{Attitude, TelemetrySnapshot, Temperature, Vector3};

pub fn command_text(command: &TelloCommand) -> String {
    match command {
        TelloCommand::EnterSdkMode => "command".to_string(),
        TelloCommand::TakeOff => "takeoff".to_string(),
        TelloCommand::Land => "land".to_string(),
        TelloCommand::StopAndHover => "stop".to_string(),
        TelloCommand::EmergencyStop => "emergency".to_string(),
        TelloCommand::Move { direction, distance_cm } => {
            let verb = match direction {
                Direction::Up => "up",
                Direction::Down => "down",
                Direction::Left => "left",
                Direction::Right => "right",
                Direction::Forward => "forward",
                Direction::Back => "back",
            };
            format!("{verb} {distance_cm}")
        }
        TelloCommand::Rotate { rotation, degrees } => {
            let verb = match rotation {
                Rotation::Clockwise => "cw",
                Rotation::CounterClockwise => "ccw",
            };
            format!("{verb} {degrees}")
        }
        TelloCommand::Flip(direction) => {
            let d = match direction {
                FlipDirection::Left => "l",
                FlipDirection::Right => "r",
                FlipDirection::Forward => "f",
                FlipDirection::Back => "b",
            };
            format!("flip {d}")
        }
        TelloCommand::SetSpeed(speed) => format!("speed {speed}"),
        TelloCommand::RemoteControl { left_right, forwards_backwards, up_down, yaw } => {
            format!("rc {left_right} {forwards_backwards} {up_down} {yaw}")
        }
        TelloCommand::StartVideo => "streamon".to_string(),
        TelloCommand::StopVideo => "streamoff".to_string(),
        TelloCommand::Query(q) => match q {
            Query::Battery => "battery?",
            Query::Speed => "speed?",
            Query::Height => "height?",
            Query::FlightTime => "time?",
            Query::Temperature => "temp?",
            Query::WifiSnr => "wifi?",
        }
        .to_string(),
    }
}

/// Bytes to put on the wire. Identical on every call for the same command,
/// so a resend is byte-for-byte the first send.
pub fn encode(command: &Command) -> Vec<u8> {
    command.text.as_bytes().to_vec()
}

/// A reply on the command port, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedResponse {
    Ack,
    Nack(String),
    Value(Measurement),
    /// Not text the drone would send. Never matches a pending command.
    Malformed,
}

pub fn decode(bytes: &[u8]) -> DecodedResponse {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return DecodedResponse::Malformed;
    };
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

    if text.is_empty() || text.chars().any(|c| c.is_control() || !c.is_ascii()) {
        return DecodedResponse::Malformed;
    }

    if text.eq_ignore_ascii_case("ok") {
        return DecodedResponse::Ack;
    }

    if let Some(rest) = text.strip_prefix("error") {
        let reason = rest.trim();
        return DecodedResponse::Nack(if reason.is_empty() { "error".to_string() } else { reason.to_string() });
    }

    match Measurement::parse(text) {
        Some(m) => DecodedResponse::Value(m),
        // "out of range", "unknown command: ..." and friends
        None => DecodedResponse::Nack(text.to_string()),
    }
}

/// A numeric query reply such as `87`, `8dm`, `12s` or `63~65C`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub value: f64,
    /// Upper bound when the drone reports a range.
    pub upper: Option<f64>,
    pub unit: String,
}

impl Measurement {
    pub fn parse(s: &str) -> Option<Measurement> {
        let split = s
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (numbers, unit) = s.split_at(split);

        if !unit.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }

        let mut parts = numbers.split('~');
        let value = parts.next()?.trim().parse::<f64>().ok()?;
        let upper = match parts.next() {
            Some(u) => Some(u.trim().parse::<f64>().ok()?),
            None => None,
        };
        if parts.next().is_some() {
            return None;
        }

        Some(Measurement { value, upper, unit: unit.to_string() })
    }

    /// Distance in centimetres, for height and distance replies.
    pub fn centimetres(&self) -> Option<f64> {
        match self.unit.as_str() {
            "" | "cm" => Some(self.value),
            "dm" => Some(self.value * 10.0),
            "mm" => Some(self.value / 10.0),
            "m" => Some(self.value * 100.0),
            _ => None,
        }
    }
}

/// Parses a status line received from the drone.
///
/// Example message (one line on the wire):
/// ```text
/// mid:-1;x:-100;y:-100;z:-100;mpry:-1,-1,-1;pitch:0;roll:0;yaw:-3;vgx:0;vgy:0;vgz:1;
/// templ:58;temph:60;tof:71;h:50;bat:82;baro:-57.14;time:14;agx:17.00;agy:-4.00;agz:-956.00;
/// ```
///
pub fn decode_telemetry(bytes: &[u8]) -> Result<TelemetrySnapshot> {
    let s = std::str::from_utf8(bytes).map_err(|e| TelloError::Decode { msg: e.to_string() })?;
    let s = s.trim();

    let mut pitch = None;
    let mut roll = None;
    let mut yaw = None;
    let mut height = None;
    let mut battery = None;
    let mut state = TelemetrySnapshot {
        battery_pct: 0,
        height_cm: 0,
        attitude: Attitude::default(),
        temperature: Temperature::default(),
        flight_time: Duration::ZERO,
        tof_cm: 0,
        barometer: 0.0,
        velocity: Vector3::default(),
        acceleration: Vector3::default(),
        timestamp: Instant::now(),
    };

    for f in s.split(';') {
        if f.is_empty() {
            continue;
        }

        let (k, v) = split_key_value(f)?;

        match k {
            "pitch" => pitch = Some(value_as(v)?),
            "roll" => roll = Some(value_as(v)?),
            "yaw" => yaw = Some(value_as(v)?),
            "h" => height = Some(value_as(v)?),
            "bat" => battery = Some(value_as(v)?),
            "baro" => state.barometer = value_as(v)?,
            "tof" => state.tof_cm = value_as(v)?,
            "time" => state.flight_time = Duration::from_secs(value_as(v)?),
            "templ" => state.temperature.low = value_as(v)?,
            "temph" => state.temperature.high = value_as(v)?,
            "vgx" => state.velocity.x = value_as(v)?,
            "vgy" => state.velocity.y = value_as(v)?,
            "vgz" => state.velocity.z = value_as(v)?,
            "agx" => state.acceleration.x = value_as(v)?,
            "agy" => state.acceleration.y = value_as(v)?,
            "agz" => state.acceleration.z = value_as(v)?,
            _ => {}
        }
    }

    state.attitude = Attitude {
        pitch: required(pitch, "pitch")?,
        roll: required(roll, "roll")?,
        yaw: required(yaw, "yaw")?,
    };
    state.height_cm = required(height, "h")?;
    state.battery_pct = required(battery, "bat")?;

    Ok(state)
}

fn split_key_value(kv: &str) -> Result<(&str, &str)> {
    kv.split_once(':').ok_or_else(|| TelloError::Decode { msg: kv.to_string() })
}

fn value_as<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.trim().parse::<T>().map_err(|_| TelloError::Decode { msg: s.to_string() })
}

fn required<T>(v: Option<T>, key: &str) -> Result<T> {
    v.ok_or_else(|| TelloError::Decode { msg: format!("status line has no \"{key}\"") })
}
