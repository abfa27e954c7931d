//! Custom error types for the control plane.
//!
//! This module defines the primary error type, `DaqError`, shared by every role.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle failures ranging from socket and configuration issues to protocol
//! violations raised by misbehaving peers.
//!
//! ## Error Hierarchy
//!
//! - **`Protocol`**: Malformed or unexpected handshake/command text. Logged and local
//!   to one connection; never fatal to the process.
//! - **`Connection`**: Transport-level failure (refused, reset, oversized frame). The
//!   owning layer reacts with disconnect handling.
//! - **`UnknownType`**: An event type id with no registered constructor. The packet
//!   carrying it is dropped.
//! - **`State`**: A command arrived while the role is in a state that does not accept
//!   it. Rejected and reported through the role's status.
//! - **`Bind`**: The listening socket could not be created. Process-fatal for the role
//!   that owns the server.
//! - **`Config`** / **`Configuration`**: Parse failures from `figment` and semantic
//!   validation failures respectively.
//!
//! Queue overflow is deliberately absent: it is reported as an
//! [`OverflowWarning`](crate::queue::OverflowWarning) value, not an error.
//!
//! By using `#[from]`, `DaqError` can be created from underlying error types,
//! so the `?` operator works across module boundaries.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the control and data planes.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Malformed or unexpected handshake or command text.
    ///
    /// The message includes the offending packet where one exists so the
    /// operator can see exactly what the peer sent.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure on an established or attempted connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No constructor is registered for this event type id.
    #[error("Unknown event type id {type_id:#010x}")]
    UnknownType {
        /// Wire type id that failed lookup.
        type_id: u32,
    },

    /// A command was received in a state that does not accept it.
    #[error("Command {command} rejected in state {state}")]
    State {
        /// Command keyword that was rejected.
        command: String,
        /// Role state at the time of rejection.
        state: String,
    },

    /// The listening socket could not be bound.
    #[error("Cannot bind {address}: {source}")]
    Bind {
        /// Requested listen address.
        address: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A bounded wait elapsed.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Binary payload could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration failed to parse.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but contains invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Run configuration text is not valid TOML.
    #[error("Run configuration error: {0}")]
    RunConfiguration(#[from] toml::de::Error),

    /// I/O failure outside the transport layer (files, stdio).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The FileWriter collaborator failed.
    #[error("File writer error: {0}")]
    Writer(String),

    /// A command handler panicked.
    #[error("Handler for {0} panicked")]
    HandlerPanic(String),

    /// The component is shutting down and refuses new work.
    #[error("Shutdown in progress")]
    Shutdown,
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Builds a [`DaqError::State`] from a keyword and a displayable state.
    pub fn state(command: impl Into<String>, state: impl std::fmt::Display) -> Self {
        DaqError::State {
            command: command.into(),
            state: state.to_string(),
        }
    }

    /// Whether this error is local to one connection and the caller may carry on.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            DaqError::Protocol(_)
                | DaqError::Connection(_)
                | DaqError::UnknownType { .. }
                | DaqError::Serialization(_)
                | DaqError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_message() {
        let err = DaqError::state("START", "UNCONF");
        assert_eq!(err.to_string(), "Command START rejected in state UNCONF");
        assert!(!err.is_connection_local());
    }

    #[test]
    fn test_unknown_type_formats_hex() {
        let err = DaqError::UnknownType { type_id: 0xdead };
        assert_eq!(err.to_string(), "Unknown event type id 0x0000dead");
        assert!(err.is_connection_local());
    }
}
