//! Error Conditions
//!
//! This module provides the condition carrier used throughout the IO
//! integration core. A condition is a *(name, description)* pair attached to
//! either the transport of a connection (I/O errors) or to a protocol entity
//! (connection, session, link, listener) when the peer or the local protocol
//! state machine closes it with an error.
//!
//! Handlers distinguish transport errors from protocol errors by which
//! accessor yields a set condition: the transport condition lives on the
//! engine, the remote condition on the protocol object.

use serde::{Deserialize, Serialize};

/// Well-known condition names used by the core
pub mod names {
    /// An I/O error reported by the transport adapter
    pub const IO: &str = "amqp:connection:io";
    /// Outstanding I/O was cancelled because the endpoint was closed
    pub const ABORTED: &str = "amqp:connection:aborted";
    /// The connection was torn down by the container (stop)
    pub const FORCED: &str = "amqp:connection:forced";
    /// Received bytes that do not form a valid frame or protocol header
    pub const FRAMING_ERROR: &str = "amqp:connection:framing-error";
    /// Malformed performative payload
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    /// A frame referenced a channel or handle that is not attached
    pub const NOT_FOUND: &str = "amqp:not-found";
    /// An unexpected internal failure
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
}

/// An error condition: a name and a human-readable description
///
/// A default condition is unset. Setting it records the cause of a failure;
/// the engine attaches the transport condition to the `TransportClosed` event
/// when `disconnected` is called.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    name: Option<String>,
    description: Option<String>,
}

impl Condition {
    /// Create an unset condition
    pub fn new() -> Self {
        Condition::default()
    }

    /// Create a set condition from a name and description
    pub fn of(name: impl Into<String>, description: impl Into<String>) -> Self {
        Condition {
            name: Some(name.into()),
            description: Some(description.into()),
        }
    }

    /// True if a condition has been set
    pub fn is_set(&self) -> bool {
        self.name.is_some()
    }

    /// Set the condition name and description, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, description: impl Into<String>) {
        self.name = Some(name.into());
        self.description = Some(description.into());
    }

    /// Clear the condition back to unset
    pub fn clear(&mut self) {
        self.name = None;
        self.description = None;
    }

    /// Get the condition name, if set
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get the condition description, if set
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.description) {
            (Some(name), Some(desc)) if !desc.is_empty() => write!(f, "{}: {}", name, desc),
            (Some(name), _) => write!(f, "{}", name),
            _ => write!(f, "(no condition)"),
        }
    }
}

impl From<(&str, &str)> for Condition {
    fn from((name, description): (&str, &str)) -> Self {
        Condition::of(name, description)
    }
}
