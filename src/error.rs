//! Error Handling
//!
//! This module provides the error types for the IO integration core. It covers
//! failures in the engine, the protocol state machine, the transport adapter
//! and the container.
//!
//! # Overview
//!
//! Most of the core follows the error policy of the engine contract: I/O and
//! protocol failures are not raised out-of-band but are converted into a
//! transport [`Condition`](crate::condition::Condition) and surfaced through
//! the event stream as a `TransportClosed` event. `AmqpError` is used where an
//! operation can fail synchronously: bad addresses, operations on closed
//! connections, sending without credit, malformed wire data.
//!
//! # Examples
//!
//! ```rust
//! use dumq_amqp_io::error::{AmqpError, AmqpResult};
//!
//! fn check_credit(credit: u32) -> AmqpResult<()> {
//!     if credit == 0 {
//!         return Err(AmqpError::link("no credit available"));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Error types for the IO integration core
#[derive(Error, Debug)]
pub enum AmqpError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Address error: {0}")]
    Address(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The container was stopped and accepts no further work
    #[error("Container stopped")]
    Stopped,
}

/// Result type for operations in the IO integration core
pub type AmqpResult<T> = Result<T, AmqpError>;

impl AmqpError {
    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        AmqpError::Connection(msg.into())
    }

    /// Create a session error
    pub fn session(msg: impl Into<String>) -> Self {
        AmqpError::Session(msg.into())
    }

    /// Create a link error
    pub fn link(msg: impl Into<String>) -> Self {
        AmqpError::Link(msg.into())
    }

    /// Create a decoding error
    pub fn decoding(msg: impl Into<String>) -> Self {
        AmqpError::Decoding(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        AmqpError::Protocol(msg.into())
    }

    /// Create an address error
    pub fn address(msg: impl Into<String>) -> Self {
        AmqpError::Address(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        AmqpError::InvalidState(msg.into())
    }

    /// Get the error code as a string
    pub fn error_code(&self) -> &str {
        match self {
            AmqpError::Connection(_) => "connection-error",
            AmqpError::Session(_) => "session-error",
            AmqpError::Link(_) => "link-error",
            AmqpError::Decoding(_) => "decoding-error",
            AmqpError::Protocol(_) => "protocol-error",
            AmqpError::Address(_) => "address-error",
            AmqpError::InvalidState(_) => "invalid-state-error",
            AmqpError::Stopped => "stopped",
        }
    }
}
