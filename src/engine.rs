//! Connection Engine
//!
//! This module provides the bytes-in/bytes-out unit that bridges one AMQP
//! connection to any byte stream. The engine bundles the protocol object with
//! a read buffer, a write buffer, the transport close flags and the transport
//! error condition, and exposes the non-blocking contract that transport
//! adapters drive:
//!
//! - while the engine is not finished:
//!   - read data from the I/O source into [`ConnectionEngine::read_buffer`],
//!     then call [`ConnectionEngine::read_done`]
//!   - call [`ConnectionEngine::dispatch`] until it returns `None`
//!   - write the bytes of [`ConnectionEngine::write_buffer`] to the I/O
//!     destination, then call [`ConnectionEngine::write_done`]
//!
//! Engines are not thread safe, but separate instances are independent; a
//! multi-threaded application can process connections in parallel provided
//! work on each connection is serialized.
//!
//! # Error handling
//!
//! Engine operations do not return errors. An I/O failure is reported by
//! setting [`ConnectionEngine::condition`] and calling
//! [`ConnectionEngine::disconnected`]; the handler then observes a single
//! `TransportClosed` event carrying the condition, and
//! [`ConnectionEngine::finished`] becomes true once all residual events have
//! been dispatched.

use crate::condition::{names, Condition};
use crate::connection::{Connection, ConnectionConfig};
use crate::error::AmqpError;
use crate::event::{ConnectionId, Event};
use bytes::{Buf, BytesMut};

/// Size of the read landing buffer handed to the I/O source
const READ_CHUNK: usize = 16 * 1024;

/// A non-blocking bytes-in/bytes-out engine owning one connection's protocol state
#[derive(Debug)]
pub struct ConnectionEngine {
    connection: Connection,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_closed: bool,
    write_closed: bool,
    condition: Condition,
    transport_closed: bool,
    finished: bool,
}

impl ConnectionEngine {
    /// Create an engine with a new protocol object
    pub fn new(config: ConnectionConfig) -> Self {
        Self::from_connection(Connection::new(config))
    }

    pub(crate) fn with_id(config: ConnectionConfig, id: ConnectionId) -> Self {
        Self::from_connection(Connection::with_id(config, id))
    }

    fn from_connection(connection: Connection) -> Self {
        ConnectionEngine {
            connection,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            read_closed: false,
            write_closed: false,
            condition: Condition::new(),
            transport_closed: false,
            finished: false,
        }
    }

    /// The identity of the connection this engine owns
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Access the protocol object
    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    /// Read-only access to the protocol object
    pub fn connection_ref(&self) -> &Connection {
        &self.connection
    }

    /// Bytes the engine can currently accept; 0 when input is refused
    pub fn read_capacity(&self) -> usize {
        if self.read_closed || self.finished {
            0
        } else {
            READ_CHUNK
        }
    }

    /// The region to fill with input; empty when the engine refuses input
    ///
    /// Fill a prefix of the returned slice, then call [`Self::read_done`] with
    /// the number of bytes written.
    pub fn read_buffer(&mut self) -> &mut [u8] {
        if self.read_closed || self.finished {
            self.read_buf.clear();
        } else {
            self.read_buf.resize(READ_CHUNK, 0);
        }
        &mut self.read_buf[..]
    }

    /// Consume the first `n` bytes of the read buffer; `n == 0` is legal
    pub fn read_done(&mut self, n: usize) {
        if self.read_closed || n == 0 {
            return;
        }
        let n = n.min(self.read_buf.len());
        if let Err(error) = self.connection.consume(&self.read_buf[..n]) {
            self.fail(&error);
        }
    }

    /// Signal EOF on input; idempotent
    ///
    /// EOF before Close has been received is an abort: the write side is
    /// closed too and the transport condition records the cause.
    pub fn read_close(&mut self) {
        if self.read_closed {
            return;
        }
        self.read_closed = true;
        if !self.connection.fully_closed() {
            if !self.condition.is_set() {
                self.condition
                    .set(names::ABORTED, "connection aborted by peer");
            }
            self.close_write_side();
        }
        self.maybe_emit_transport_closed();
    }

    /// The bytes waiting to be written; empty when there is nothing to write
    ///
    /// Write a prefix of the returned slice to the I/O destination, then call
    /// [`Self::write_done`] with the number of bytes written. The returned
    /// region is stable until then.
    pub fn write_buffer(&mut self) -> &[u8] {
        if !self.write_closed {
            self.connection.take_output(&mut self.write_buf);
        }
        &self.write_buf[..]
    }

    /// Consume the first `n` written bytes of the write buffer
    pub fn write_done(&mut self, n: usize) {
        if self.write_closed {
            return;
        }
        let n = n.min(self.write_buf.len());
        self.write_buf.advance(n);
        self.maybe_autoclose();
    }

    /// Signal that no more output can be written; idempotent
    pub fn write_close(&mut self) {
        if self.write_closed {
            return;
        }
        self.close_write_side();
        self.maybe_emit_transport_closed();
    }

    /// Close both transport directions; idempotent
    ///
    /// Set the transport [`Self::condition`] *before* calling this to attach
    /// the error cause to the resulting `TransportClosed` event. Residual
    /// events remain dispatchable afterwards.
    pub fn disconnected(&mut self) {
        self.read_closed = true;
        self.close_write_side();
        self.maybe_emit_transport_closed();
    }

    /// Get the next available event, or `None` when none is pending
    ///
    /// Call in a loop until it returns `None`; this may mutate the read and
    /// write buffers.
    pub fn dispatch(&mut self) -> Option<Event> {
        self.maybe_autoclose();
        let event = self.connection.pop_event();
        if event.is_none() {
            self.update_finished();
        }
        event
    }

    /// True once the transport is closed in both directions and every event
    /// has been dispatched; monotonic
    pub fn finished(&mut self) -> bool {
        self.maybe_autoclose();
        self.update_finished();
        self.finished
    }

    /// The transport error condition
    ///
    /// I/O errors belong here, not on the protocol object: the connection's
    /// remote condition reports errors received over AMQP, the transport
    /// condition reports errors in the I/O layer itself.
    pub fn condition(&mut self) -> &mut Condition {
        &mut self.condition
    }

    fn fail(&mut self, error: &AmqpError) {
        if !self.condition.is_set() {
            let name = match error {
                AmqpError::Decoding(_) => names::FRAMING_ERROR,
                _ => names::INTERNAL_ERROR,
            };
            self.condition.set(name, error.to_string());
        }
        self.disconnected();
    }

    fn close_write_side(&mut self) {
        self.write_closed = true;
        self.write_buf.clear();
        self.connection.clear_output();
    }

    /// Close the transport once Close has been exchanged and all output flushed
    fn maybe_autoclose(&mut self) {
        if !self.write_closed
            && self.connection.fully_closed()
            && self.write_buf.is_empty()
            && !self.connection.has_output()
        {
            self.read_closed = true;
            self.write_closed = true;
            self.maybe_emit_transport_closed();
        }
    }

    fn maybe_emit_transport_closed(&mut self) {
        if self.read_closed && self.write_closed && !self.transport_closed {
            self.transport_closed = true;
            let condition = self.condition.is_set().then(|| self.condition.clone());
            self.connection.emit_transport_closed(condition);
        }
    }

    fn update_finished(&mut self) {
        if !self.finished
            && self.transport_closed
            && !self.connection.has_events()
            && self.write_buf.is_empty()
        {
            self.finished = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn engine(container_id: &str) -> ConnectionEngine {
        ConnectionEngine::new(ConnectionConfig {
            container_id: container_id.to_string(),
            ..Default::default()
        })
    }

    fn feed(engine: &mut ConnectionEngine, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let buf = engine.read_buffer();
            if buf.is_empty() {
                break;
            }
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            engine.read_done(n);
            bytes = &bytes[n..];
        }
    }

    /// Shuttle bytes and events between two engines until neither makes progress.
    fn pump(
        a: &mut ConnectionEngine,
        b: &mut ConnectionEngine,
        events_a: &mut Vec<Event>,
        events_b: &mut Vec<Event>,
    ) {
        loop {
            let mut progress = false;
            while let Some(event) = a.dispatch() {
                events_a.push(event);
                progress = true;
            }
            while let Some(event) = b.dispatch() {
                events_b.push(event);
                progress = true;
            }
            let out = a.write_buffer().to_vec();
            if !out.is_empty() {
                a.write_done(out.len());
                feed(b, &out);
                progress = true;
            }
            let out = b.write_buffer().to_vec();
            if !out.is_empty() {
                b.write_done(out.len());
                feed(a, &out);
                progress = true;
            }
            if !progress {
                break;
            }
        }
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(Event::kind).collect()
    }

    #[test]
    fn test_open_close_to_finished() {
        let mut client = engine("client");
        let mut server = engine("server");
        client.connection().bound();
        server.connection().bound();
        client.connection().open();

        let mut client_events = Vec::new();
        let mut server_events = Vec::new();
        pump(&mut client, &mut server, &mut client_events, &mut server_events);
        server.connection().open();
        pump(&mut client, &mut server, &mut client_events, &mut server_events);

        assert!(kinds(&client_events).contains(&EventKind::ConnectionRemoteOpen));
        assert!(kinds(&server_events).contains(&EventKind::ConnectionRemoteOpen));

        client.connection().close(None);
        pump(&mut client, &mut server, &mut client_events, &mut server_events);

        // Both ends observe the remote close then the transport close, and
        // both engines reach the finished state without any socket EOF.
        for events in [&client_events, &server_events] {
            let kinds = kinds(events);
            let close_at = kinds
                .iter()
                .position(|kind| *kind == EventKind::ConnectionRemoteClose)
                .expect("remote close");
            let transport_at = kinds
                .iter()
                .position(|kind| *kind == EventKind::TransportClosed)
                .expect("transport closed");
            assert!(close_at < transport_at);
        }
        assert!(client.finished());
        assert!(server.finished());
    }

    #[test]
    fn test_finished_implies_empty_buffers() {
        let mut engine = engine("p2");
        engine.condition().set(names::IO, "connection refused");
        engine.disconnected();
        while engine.dispatch().is_some() {}
        assert!(engine.finished());
        assert_eq!(engine.read_buffer().len(), 0);
        assert_eq!(engine.read_capacity(), 0);
        assert!(engine.write_buffer().is_empty());
        assert!(engine.dispatch().is_none());
        // Monotonic: still finished on re-query.
        assert!(engine.finished());
    }

    #[test]
    fn test_close_operations_are_idempotent() {
        let mut engine = engine("r1");
        engine.read_close();
        engine.read_close();
        engine.write_close();
        engine.write_close();
        engine.disconnected();
        engine.disconnected();

        let mut transport_closed = 0;
        while let Some(event) = engine.dispatch() {
            if event.kind() == EventKind::TransportClosed {
                transport_closed += 1;
            }
        }
        assert_eq!(transport_closed, 1);
        assert!(engine.finished());
    }

    #[test]
    fn test_io_error_condition_reaches_handler() {
        let mut engine = engine("io-error");
        engine.connection().bound();
        engine.condition().set(names::IO, "connection reset");
        engine.disconnected();

        let mut condition = None;
        while let Some(event) = engine.dispatch() {
            if let Event::TransportClosed { condition: c, .. } = event {
                condition = c;
            }
        }
        let condition = condition.expect("transport condition");
        assert_eq!(condition.name(), Some(names::IO));
        assert_eq!(condition.description(), Some("connection reset"));
    }

    #[test]
    fn test_eof_without_close_is_an_abort() {
        let mut client = engine("client");
        let mut server = engine("server");
        client.connection().bound();
        server.connection().bound();
        client.connection().open();
        let mut client_events = Vec::new();
        let mut server_events = Vec::new();
        pump(&mut client, &mut server, &mut client_events, &mut server_events);

        // The peer vanishes without a Close frame.
        server.read_close();
        let mut condition = None;
        while let Some(event) = server.dispatch() {
            if let Event::TransportClosed { condition: c, .. } = event {
                condition = c;
            }
        }
        assert_eq!(
            condition.and_then(|c| c.name().map(str::to_string)),
            Some(names::ABORTED.to_string())
        );
        assert!(server.finished());
    }

    #[test]
    fn test_garbage_input_closes_with_framing_condition() {
        let mut engine = engine("garbage");
        engine.connection().bound();
        feed(&mut engine, b"not an amqp header");

        let mut condition = None;
        while let Some(event) = engine.dispatch() {
            if let Event::TransportClosed { condition: c, .. } = event {
                condition = c;
            }
        }
        assert_eq!(
            condition.and_then(|c| c.name().map(str::to_string)),
            Some(names::FRAMING_ERROR.to_string())
        );
        assert!(engine.finished());
    }

    #[test]
    fn test_read_done_zero_is_legal() {
        let mut engine = engine("zero");
        engine.connection().bound();
        let _ = engine.read_buffer();
        engine.read_done(0);
        assert!(!engine.finished());
    }

    #[test]
    fn test_no_input_accepted_after_disconnect() {
        let mut engine = engine("closed");
        engine.disconnected();
        assert_eq!(engine.read_capacity(), 0);
        assert!(engine.read_buffer().is_empty());
    }
}
