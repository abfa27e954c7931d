//! Role lifecycle state reported after every command.

use crate::error::{AppResult, DaqError};
use crate::serialize::{Deserializer, Serializer};
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

/// Tag carrying a role's own listen address in a `SERVER` reply.
pub const TAG_SERVER: &str = "_SERVER";
/// Tag carrying a role's run number in a `GETRUN` reply.
pub const TAG_RUN: &str = "_RUN";

/// Lifecycle state of one role.
///
/// ```text
/// UNINIT --INIT--> UNCONF --CONFIG--> CONF --START--> RUNNING
///    ^                                  ^                |
///    |                                  +------STOP------+
///    +-----------------RESET (from any)------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum State {
    /// Connected, not yet initialised.
    Uninit = 0,
    /// Initialised, awaiting configuration.
    Unconf = 1,
    /// Configured and ready to start.
    Conf = 2,
    /// Taking data.
    Running = 3,
    /// A command failed.
    Error = 4,
}

impl State {
    /// Decodes a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(State::Uninit),
            1 => Some(State::Unconf),
            2 => Some(State::Conf),
            3 => Some(State::Running),
            4 => Some(State::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Uninit => write!(f, "UNINIT"),
            State::Unconf => write!(f, "UNCONF"),
            State::Conf => write!(f, "CONF"),
            State::Running => write!(f, "RUNNING"),
            State::Error => write!(f, "ERROR"),
        }
    }
}

/// Severity attached to a status or log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u32)]
pub enum Level {
    /// No message.
    None = 0,
    /// Debug detail.
    Debug = 1,
    /// Extra detail.
    Extra = 2,
    /// Normal information.
    Info = 3,
    /// Something unexpected but recoverable.
    Warn = 4,
    /// A failure.
    Error = 5,
    /// Addressed to the operator.
    User = 6,
    /// Temporarily busy.
    Busy = 7,
}

impl Level {
    /// Decodes a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Level::None),
            1 => Some(Level::Debug),
            2 => Some(Level::Extra),
            3 => Some(Level::Info),
            4 => Some(Level::Warn),
            5 => Some(Level::Error),
            6 => Some(Level::User),
            7 => Some(Level::Busy),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::None => "NONE",
            Level::Debug => "DEBUG",
            Level::Extra => "EXTRA",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::User => "USER",
            Level::Busy => "BUSY",
        };
        f.write_str(s)
    }
}

/// A role's state, message and free-form tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    /// Lifecycle state.
    pub state: State,
    /// Message severity.
    pub level: Level,
    /// Human readable reason for the last change.
    pub message: String,
    /// Extra key/value data (`_SERVER`, `EVENT`, ...).
    pub tags: BTreeMap<String, String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            state: State::Uninit,
            level: Level::None,
            message: String::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl ConnectionState {
    /// Sets state and reason; the level follows the state.
    pub fn set(&mut self, state: State, message: impl Into<String>) {
        self.state = state;
        self.level = if state == State::Error {
            Level::Error
        } else {
            Level::Info
        };
        self.message = message.into();
    }

    /// Sets only the message, keeping the state.
    pub fn note(&mut self, level: Level, message: impl Into<String>) {
        self.level = level;
        self.message = message.into();
    }

    /// Sets one tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl ToString) {
        self.tags.insert(key.into(), value.to_string());
    }

    /// Looks up one tag.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Whether the role reported itself busy.
    pub fn is_busy(&self) -> bool {
        self.level == Level::Busy
    }

    /// Encodes as `u32 state, u32 level, message, tags`.
    pub fn encode(&self) -> Bytes {
        let mut ser = Serializer::new();
        ser.put_u32(self.state as u32);
        ser.put_u32(self.level as u32);
        ser.put_str(&self.message);
        ser.put_map(&self.tags);
        ser.finish()
    }

    /// Decodes a status reply.
    pub fn decode(packet: impl Into<Bytes>) -> AppResult<Self> {
        let mut de = Deserializer::new(packet);
        let raw_state = de.get_u32()?;
        let state = State::from_u32(raw_state)
            .ok_or_else(|| DaqError::Protocol(format!("invalid state value {raw_state} in status")))?;
        let raw_level = de.get_u32()?;
        let level = Level::from_u32(raw_level)
            .ok_or_else(|| DaqError::Protocol(format!("invalid level value {raw_level} in status")))?;
        let message = de.get_string()?;
        let tags = de.get_map()?;
        Ok(Self {
            state,
            level,
            message,
            tags,
        })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{} ({}: {})", self.state, self.level, self.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode_preserves_fields() {
        let mut status = ConnectionState::default();
        status.set(State::Conf, "Configured (default)");
        status.set_tag(TAG_SERVER, "tcp://0.0.0.0:44001");
        status.set_tag("EVENT", 12);

        let decoded = ConnectionState::decode(status.encode()).unwrap();
        assert_eq!(decoded, status);
        assert_eq!(decoded.tag("EVENT"), Some("12"));
    }

    #[test]
    fn test_error_state_sets_error_level() {
        let mut status = ConnectionState::default();
        status.set(State::Error, "boom");
        assert_eq!(status.level, Level::Error);
        assert_eq!(status.to_string(), "ERROR (ERROR: boom)");
    }

    #[test]
    fn test_invalid_state_value_is_protocol_error() {
        let mut ser = Serializer::new();
        ser.put_u32(99);
        let err = ConnectionState::decode(ser.finish()).unwrap_err();
        assert!(matches!(err, DaqError::Protocol(_)));
    }

    #[test]
    fn test_command_text_is_not_a_status() {
        assert!(ConnectionState::decode(Bytes::from_static(b"OK EUDAQ CMD")).is_err());
    }
}
