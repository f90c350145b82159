//! IO Integration Core for AMQP 1.0
//!
//! This library provides the IO integration layer of the dumq AMQP 1.0
//! stack: a non-blocking, bytes-in/bytes-out connection engine that couples
//! the AMQP protocol state of one connection to any byte stream, and a
//! container that multiplexes many engines over Tokio and dispatches protocol
//! events to application handlers.
//!
//! # Features
//!
//! - **Bytes-in/bytes-out engine**: drive AMQP from any I/O mechanism through
//!   a read/write buffer handoff, with no I/O or locking inside the engine
//! - **Container runtime**: outbound connects, inbound listeners, scheduled
//!   timers, cross-thread wakeups and injection, graceful stop
//! - **Per-connection serialization**: events of one connection are totally
//!   ordered and never handled concurrently, even with many worker tasks
//! - **Typed events**: a single event stream covering connection, session,
//!   link, delivery, listener and container transitions
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dumq_amqp_io::prelude::*;
//! use tokio::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = Container::new("my-app");
//!
//!     container.connect("amqp://localhost:5672", |batch: &mut Batch| {
//!         while let Some(event) = batch.next() {
//!             match event.kind() {
//!                 EventKind::ConnectionRemoteOpen => {
//!                     println!("open exchanged with the peer");
//!                 }
//!                 EventKind::TransportClosed => {
//!                     if let Some(condition) = event.condition() {
//!                         eprintln!("connection failed: {}", condition);
//!                     }
//!                 }
//!                 _ => {}
//!             }
//!         }
//!     })?;
//!
//!     // Dispatch events until the container is stopped elsewhere, or drive
//!     // it manually with wait()/done().
//!     container.schedule(Duration::from_secs(5), "give-up");
//!     container.run().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **`engine`**: the connection engine owning one connection's protocol
//!   state; the unit a transport adapter drives
//! - **`connection`**, **`session`**, **`link`**: the protocol object (AMQP
//!   state machine, frame handling, credit and delivery bookkeeping)
//! - **`frame`**, **`codec`**: framing and the binary encoding of
//!   performatives
//! - **`driver`**: the transport adapter binding an engine to a socket
//! - **`container`**: the multi-connection runtime and batch dispatcher
//! - **`listener`**: accepting endpoints producing inbound connections
//! - **`event`**, **`condition`**, **`error`**, **`address`**: the event
//!   taxonomy, error-condition carriers and address parsing

pub mod address;
pub mod codec;
pub mod condition;
pub mod connection;
pub mod container;
pub mod driver;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
pub mod link;
mod listener;
pub mod session;

pub use address::AmqpAddress;
pub use condition::Condition;
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use container::{Batch, Container, ContainerBuilder, Handler};
pub use engine::ConnectionEngine;
pub use error::{AmqpError, AmqpResult};
pub use event::{ConnectionId, Delivery, DeliveryState, Event, EventKind, LinkId, ListenerId};
pub use frame::Role;

/// Re-export of the commonly used types
pub mod prelude {
    pub use crate::{
        AmqpAddress, AmqpError, AmqpResult, Batch, Condition, Connection, ConnectionConfig,
        ConnectionEngine, ConnectionId, ConnectionState, Container, ContainerBuilder, Delivery,
        DeliveryState, Event, EventKind, Handler, LinkId, ListenerId, Role,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_creation() {
        let condition = Condition::of("amqp:connection:io", "refused");
        assert!(condition.is_set());
        assert_eq!(condition.name(), Some("amqp:connection:io"));
    }

    #[test]
    fn test_engine_creation() {
        let mut engine = ConnectionEngine::new(ConnectionConfig::default());
        assert!(!engine.finished());
        assert!(engine.read_capacity() > 0);
    }

    #[test]
    fn test_address_parsing() {
        let address: AmqpAddress = "amqp://localhost/examples".parse().unwrap();
        assert_eq!(address.port, 5672);
        assert_eq!(address.address.as_deref(), Some("examples"));
    }

    #[tokio::test]
    async fn test_container_creation() {
        let container = Container::new("lib-test");
        assert_eq!(container.id(), "lib-test");
    }
}
