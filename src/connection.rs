//! Connection Protocol State
//!
//! This module provides the protocol object of the IO integration core: the
//! AMQP state of one connection end. It consumes decoded frames, updates
//! connection, session, link and delivery state, collects protocol events for
//! dispatch, and stages the frames the local endpoint wants to send.
//!
//! # Overview
//!
//! The protocol object is entirely synchronous and does no I/O. It is bundled
//! with a pair of byte buffers into a [`ConnectionEngine`](crate::engine::ConnectionEngine),
//! which is what transport adapters drive.
//!
//! # Lifecycle
//!
//! 1. **Created**: emits `ConnectionInit`; frames may be staged but nothing is
//!    written until the transport is bound
//! 2. **Bound**: the protocol header is emitted ahead of any staged frames
//! 3. **Open exchanged**: sessions and links can be attached and used
//! 4. **Close exchanged**: the engine closes the transport once the Close
//!    frame has been flushed

use crate::condition::Condition;
use crate::error::{AmqpError, AmqpResult};
use crate::event::{ConnectionId, Delivery, DeliveryState, Event, LinkId};
use crate::frame::{constants, Frame, Performative, Role};
use crate::link::Link;
use crate::session::{Session, SessionState, DEFAULT_WINDOW};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Container ID announced in Open
    pub container_id: String,
    /// Hostname announced in Open
    pub hostname: Option<String>,
    /// Maximum frame size accepted on input and announced in Open
    pub max_frame_size: u32,
    /// Channel maximum announced in Open
    pub channel_max: u16,
    /// Idle timeout announced in Open
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            container_id: format!("dumq-io-{}", &Uuid::new_v4().to_string()[..8]),
            hostname: None,
            max_frame_size: 65536,
            channel_max: 1000,
            idle_timeout: None,
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No Open sent or received yet
    Start,
    /// Local Open sent, waiting for the peer
    Opening,
    /// Open exchanged in both directions
    Opened,
    /// Local or remote Close seen, waiting for the other
    Closing,
    /// Close exchanged or transport gone
    Closed,
}

/// The AMQP protocol state of one connection end
#[derive(Debug)]
pub struct Connection {
    config: ConnectionConfig,
    id: ConnectionId,

    bound: bool,
    header_written: bool,
    header_received: bool,
    open_sent: bool,
    open_received: bool,
    close_sent: bool,
    close_received: bool,

    remote_container_id: Option<String>,
    remote_max_frame_size: u32,
    remote_condition: Option<Condition>,
    local_condition: Option<Condition>,

    /// Frame assembly buffer for incoming bytes
    inbuf: BytesMut,
    /// Staged outgoing frames
    outbuf: BytesMut,
    /// Auto-replies produced before the local Open was staged
    deferred: Vec<Frame>,
    /// Collected events awaiting dispatch
    events: VecDeque<Event>,

    sessions: HashMap<u16, Session>,
    channels_by_remote: HashMap<u16, u16>,
    next_channel: u16,
}

impl Connection {
    /// Create a new connection end; collects a `ConnectionInit` event
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_id(config, ConnectionId(0))
    }

    pub(crate) fn with_id(config: ConnectionConfig, id: ConnectionId) -> Self {
        let mut events = VecDeque::new();
        events.push_back(Event::ConnectionInit { connection: id });
        Connection {
            config,
            id,
            bound: false,
            header_written: false,
            header_received: false,
            open_sent: false,
            open_received: false,
            close_sent: false,
            close_received: false,
            remote_container_id: None,
            remote_max_frame_size: u32::MAX,
            remote_condition: None,
            local_condition: None,
            inbuf: BytesMut::new(),
            outbuf: BytesMut::new(),
            deferred: Vec::new(),
            events,
            sessions: HashMap::new(),
            channels_by_remote: HashMap::new(),
            next_channel: 0,
        }
    }

    /// The identity of this connection within its container
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        if self.close_sent && self.close_received {
            ConnectionState::Closed
        } else if self.close_sent || self.close_received {
            ConnectionState::Closing
        } else if self.open_sent && self.open_received {
            ConnectionState::Opened
        } else if self.open_sent {
            ConnectionState::Opening
        } else {
            ConnectionState::Start
        }
    }

    /// The container id announced by the peer, once Open has been received
    pub fn remote_container_id(&self) -> Option<&str> {
        self.remote_container_id.as_deref()
    }

    /// The error condition carried by the peer's Close, if any
    pub fn remote_condition(&self) -> Option<&Condition> {
        self.remote_condition.as_ref()
    }

    /// True once the local Open has been requested
    pub fn open_sent(&self) -> bool {
        self.open_sent
    }

    /// True once the local Close has been requested
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// True once Close has been exchanged in both directions
    pub fn fully_closed(&self) -> bool {
        self.close_sent && self.close_received
    }

    /// Attach the connection to a transport
    ///
    /// Collects `ConnectionBound`; staged output becomes writable, preceded
    /// by the protocol header.
    pub fn bound(&mut self) {
        if self.bound {
            return;
        }
        self.bound = true;
        self.events.push_back(Event::ConnectionBound { connection: self.id });
    }

    /// Send Open to the peer; idempotent
    pub fn open(&mut self) {
        if self.open_sent || self.close_sent {
            return;
        }
        self.open_sent = true;
        log::debug!("{}: staging Open", self.id);
        let open = Frame::new(
            0,
            Performative::Open {
                container_id: self.config.container_id.clone(),
                hostname: self.config.hostname.clone(),
                max_frame_size: self.config.max_frame_size,
                channel_max: self.config.channel_max,
                idle_timeout: self
                    .config
                    .idle_timeout
                    .map(|timeout| timeout.as_millis() as u32),
            },
        );
        Self::stage(&mut self.outbuf, &open);
        for frame in std::mem::take(&mut self.deferred) {
            Self::stage(&mut self.outbuf, &frame);
        }
    }

    /// Send Close to the peer, optionally with an error condition; idempotent
    ///
    /// Open is staged first if it has not been already, so a connection can be
    /// rejected before it ever opened.
    pub fn close(&mut self, error: Option<Condition>) {
        if self.close_sent {
            return;
        }
        self.open();
        self.close_sent = true;
        self.local_condition = error.clone();
        log::debug!("{}: staging Close", self.id);
        self.stage_frame(Frame::new(0, Performative::Close { error }));
    }

    /// Collect a `ConnectionWake` event
    pub fn wake(&mut self) {
        self.events.push_back(Event::ConnectionWake { connection: self.id });
    }

    /// Begin a new session and return its channel
    pub fn begin_session(&mut self) -> AmqpResult<u16> {
        if !self.open_sent {
            return Err(AmqpError::invalid_state("connection is not open"));
        }
        if self.close_sent {
            return Err(AmqpError::invalid_state("connection is closing"));
        }
        let channel = self.alloc_channel()?;
        let mut session = Session::new(channel);
        session.begin_sent();
        self.stage_frame(Frame::new(
            channel,
            Performative::Begin {
                remote_channel: None,
                next_outgoing_id: 0,
                incoming_window: DEFAULT_WINDOW,
                outgoing_window: DEFAULT_WINDOW,
            },
        ));
        self.sessions.insert(channel, session);
        Ok(channel)
    }

    /// End a session
    pub fn end_session(&mut self, channel: u16) -> AmqpResult<()> {
        let session = self.session_mut(channel)?;
        if session.state() != &SessionState::Active {
            return Err(AmqpError::invalid_state("session is not active"));
        }
        session.end_sent();
        self.stage_frame(Frame::new(channel, Performative::End { error: None }));
        Ok(())
    }

    /// Attach a sender link on a session
    pub fn attach_sender(
        &mut self,
        channel: u16,
        name: impl Into<String>,
        target: impl Into<String>,
    ) -> AmqpResult<LinkId> {
        self.attach(channel, name.into(), Role::Sender, None, Some(target.into()))
    }

    /// Attach a receiver link on a session
    pub fn attach_receiver(
        &mut self,
        channel: u16,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> AmqpResult<LinkId> {
        self.attach(channel, name.into(), Role::Receiver, Some(source.into()), None)
    }

    fn attach(
        &mut self,
        channel: u16,
        name: String,
        role: Role,
        source: Option<String>,
        target: Option<String>,
    ) -> AmqpResult<LinkId> {
        let session = self.session_mut(channel)?;
        if session.handle_by_name(&name).is_some() {
            return Err(AmqpError::link(format!("link name {:?} is in use", name)));
        }
        let handle = session.alloc_handle();
        let mut link = Link::new(name.clone(), handle, role, source.clone(), target.clone());
        link.attach_sent();
        session.add_link(link);
        self.stage_frame(Frame::new(
            channel,
            Performative::Attach {
                name,
                handle,
                role,
                source,
                target,
            },
        ));
        Ok(LinkId { channel, handle })
    }

    /// Detach a link, closing it
    pub fn detach(&mut self, link: LinkId, error: Option<Condition>) -> AmqpResult<()> {
        let session = self.session_mut(link.channel)?;
        session.link_mut(link.handle)?.detach_sent();
        self.stage_frame(Frame::new(
            link.channel,
            Performative::Detach {
                handle: link.handle,
                closed: true,
                error,
            },
        ));
        Ok(())
    }

    /// Receiver operation: grant credit to the peer's sender
    pub fn flow(&mut self, link: LinkId, credit: u32) -> AmqpResult<()> {
        let session = self.session_mut(link.channel)?;
        let next_outgoing_id = session.next_outgoing_id();
        let incoming_window = session.incoming_window();
        let outgoing_window = session.outgoing_window();
        let endpoint = session.link_mut(link.handle)?;
        if endpoint.role() != Role::Receiver {
            return Err(AmqpError::link("credit can only be granted on a receiver link"));
        }
        endpoint.add_credit(credit);
        let delivery_count = endpoint.delivery_count();
        let link_credit = endpoint.credit();
        self.stage_frame(Frame::new(
            link.channel,
            Performative::Flow {
                next_incoming_id: Some(0),
                incoming_window,
                next_outgoing_id,
                outgoing_window,
                handle: Some(link.handle),
                delivery_count: Some(delivery_count),
                link_credit: Some(link_credit),
            },
        ));
        Ok(())
    }

    /// Sender operation: send one delivery, consuming one unit of credit
    ///
    /// Returns the delivery id assigned to the transfer.
    pub fn send(
        &mut self,
        link: LinkId,
        tag: impl Into<Bytes>,
        payload: impl Into<Bytes>,
    ) -> AmqpResult<u32> {
        if self.state() != ConnectionState::Opened {
            return Err(AmqpError::invalid_state("connection is not open"));
        }
        let tag = tag.into();
        let payload = payload.into();
        let session = self.session_mut(link.channel)?;
        session.link_mut(link.handle)?.on_transfer_sent()?;
        let delivery_id = session.alloc_delivery_id();
        session.track_outgoing(delivery_id, link.handle, tag.clone());
        log::debug!("{}: sending delivery {}", self.id, delivery_id);
        self.stage_frame(Frame::with_payload(
            link.channel,
            Performative::Transfer {
                handle: link.handle,
                delivery_id: Some(delivery_id),
                delivery_tag: tag,
                settled: false,
            },
            payload,
        ));
        Ok(delivery_id)
    }

    /// Receiver operation: accept and settle an incoming delivery
    pub fn accept(&mut self, link: LinkId, delivery_id: u32) -> AmqpResult<()> {
        let session = self.session_mut(link.channel)?;
        if session.settle_incoming(delivery_id).is_none() {
            return Err(AmqpError::link(format!(
                "delivery {} is not unsettled",
                delivery_id
            )));
        }
        self.stage_frame(Frame::new(
            link.channel,
            Performative::Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled: true,
                accepted: true,
            },
        ));
        Ok(())
    }

    /// Consume raw bytes from the transport
    ///
    /// Partial frames are buffered and never desynchronize the decoder. An
    /// error reports a protocol failure; the engine converts it into a
    /// transport condition and disconnects.
    pub fn consume(&mut self, data: &[u8]) -> AmqpResult<()> {
        self.inbuf.extend_from_slice(data);

        if !self.header_received {
            if self.inbuf.len() < constants::HEADER_SIZE {
                return Ok(());
            }
            let header = self.inbuf.split_to(constants::HEADER_SIZE);
            if &header[..] != constants::AMQP_HEADER {
                return Err(AmqpError::decoding("unsupported protocol header"));
            }
            self.header_received = true;
        }

        while let Some(frame) = Frame::split(&mut self.inbuf, self.config.max_frame_size)? {
            self.handle_frame(frame)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) -> AmqpResult<()> {
        if self.close_received {
            // Nothing is expected after Close; drop quietly.
            return Ok(());
        }
        let body = match frame.body {
            Some(body) => body,
            None => return Ok(()), // heartbeat
        };
        if !self.open_received && !matches!(body, Performative::Open { .. }) {
            return Err(AmqpError::protocol("performative before Open"));
        }

        match body {
            Performative::Open {
                container_id,
                max_frame_size,
                ..
            } => {
                if self.open_received {
                    return Err(AmqpError::protocol("duplicate Open"));
                }
                self.open_received = true;
                self.remote_container_id = Some(container_id);
                self.remote_max_frame_size = max_frame_size;
                self.events
                    .push_back(Event::ConnectionRemoteOpen { connection: self.id });
            }
            Performative::Begin { remote_channel, .. } => {
                self.handle_begin(frame.channel, remote_channel)?;
            }
            Performative::Attach {
                name,
                handle,
                role,
                source,
                target,
            } => {
                self.handle_attach(frame.channel, name, handle, role, source, target)?;
            }
            Performative::Flow {
                handle,
                delivery_count,
                link_credit,
                ..
            } => {
                if let Some(remote_handle) = handle {
                    self.handle_link_flow(frame.channel, remote_handle, delivery_count, link_credit)?;
                }
            }
            Performative::Transfer {
                handle,
                delivery_id,
                delivery_tag,
                settled,
            } => {
                self.handle_transfer(
                    frame.channel,
                    handle,
                    delivery_id,
                    delivery_tag,
                    settled,
                    frame.payload,
                )?;
            }
            Performative::Disposition {
                role,
                first,
                last,
                settled,
                accepted,
            } => {
                if role == Role::Receiver {
                    self.handle_disposition(first, last.unwrap_or(first), settled, accepted);
                }
            }
            Performative::Detach {
                handle,
                closed,
                error,
            } => {
                self.handle_detach(frame.channel, handle, closed, error)?;
            }
            Performative::End { error } => {
                self.handle_end(frame.channel, error)?;
            }
            Performative::Close { error } => {
                self.close_received = true;
                self.remote_condition = error.clone();
                self.events.push_back(Event::ConnectionRemoteClose {
                    connection: self.id,
                    condition: error,
                });
                // A Close must be answered with a Close.
                self.close(None);
            }
        }
        Ok(())
    }

    fn handle_begin(&mut self, frame_channel: u16, remote_channel: Option<u16>) -> AmqpResult<()> {
        match remote_channel {
            Some(local) => {
                // Reply to a Begin we initiated.
                let session = self
                    .sessions
                    .get_mut(&local)
                    .ok_or_else(|| AmqpError::protocol(format!("begin for unknown channel {}", local)))?;
                session.on_remote_begin(frame_channel);
                self.channels_by_remote.insert(frame_channel, local);
                self.events.push_back(Event::SessionRemoteOpen {
                    connection: self.id,
                    channel: local,
                });
            }
            None => {
                // Peer-initiated session: create ours and answer.
                let local = self.alloc_channel()?;
                let mut session = Session::new(local);
                session.begin_sent();
                session.on_remote_begin(frame_channel);
                self.sessions.insert(local, session);
                self.channels_by_remote.insert(frame_channel, local);
                self.stage_frame(Frame::new(
                    local,
                    Performative::Begin {
                        remote_channel: Some(frame_channel),
                        next_outgoing_id: 0,
                        incoming_window: DEFAULT_WINDOW,
                        outgoing_window: DEFAULT_WINDOW,
                    },
                ));
                self.events.push_back(Event::SessionRemoteOpen {
                    connection: self.id,
                    channel: local,
                });
            }
        }
        Ok(())
    }

    fn handle_attach(
        &mut self,
        frame_channel: u16,
        name: String,
        remote_handle: u32,
        remote_role: Role,
        source: Option<String>,
        target: Option<String>,
    ) -> AmqpResult<()> {
        let local_channel = self.local_channel(frame_channel)?;
        let session = self
            .sessions
            .get_mut(&local_channel)
            .ok_or_else(|| AmqpError::protocol("attach on unknown session"))?;

        if let Some(local_handle) = session.handle_by_name(&name) {
            // Reply to an Attach we initiated.
            session.map_remote_handle(remote_handle, local_handle);
            let link = session.link_mut(local_handle)?;
            link.on_remote_attach(remote_handle);
            let role = link.role();
            self.events.push_back(Event::LinkRemoteOpen {
                connection: self.id,
                link: LinkId {
                    channel: local_channel,
                    handle: local_handle,
                },
                name,
                role,
            });
        } else {
            // Peer-initiated link: attach the complementary endpoint.
            let role = remote_role.peer();
            let local_handle = session.alloc_handle();
            let mut link = Link::new(name.clone(), local_handle, role, source.clone(), target.clone());
            link.attach_sent();
            link.on_remote_attach(remote_handle);
            session.add_link(link);
            session.map_remote_handle(remote_handle, local_handle);
            self.stage_frame(Frame::new(
                local_channel,
                Performative::Attach {
                    name: name.clone(),
                    handle: local_handle,
                    role,
                    source,
                    target,
                },
            ));
            self.events.push_back(Event::LinkRemoteOpen {
                connection: self.id,
                link: LinkId {
                    channel: local_channel,
                    handle: local_handle,
                },
                name,
                role,
            });
        }
        Ok(())
    }

    fn handle_link_flow(
        &mut self,
        frame_channel: u16,
        remote_handle: u32,
        delivery_count: Option<u32>,
        link_credit: Option<u32>,
    ) -> AmqpResult<()> {
        let local_channel = self.local_channel(frame_channel)?;
        let session = self
            .sessions
            .get_mut(&local_channel)
            .ok_or_else(|| AmqpError::protocol("flow on unknown session"))?;
        let local_handle = session
            .handle_by_remote(remote_handle)
            .ok_or_else(|| AmqpError::protocol("flow for unknown link"))?;
        let link = session.link_mut(local_handle)?;
        if link.role() == Role::Sender {
            let credit = link.on_remote_flow(delivery_count, link_credit);
            self.events.push_back(Event::LinkFlow {
                connection: self.id,
                link: LinkId {
                    channel: local_channel,
                    handle: local_handle,
                },
                credit,
            });
        }
        Ok(())
    }

    fn handle_transfer(
        &mut self,
        frame_channel: u16,
        remote_handle: u32,
        delivery_id: Option<u32>,
        tag: Bytes,
        settled: bool,
        payload: Bytes,
    ) -> AmqpResult<()> {
        let delivery_id =
            delivery_id.ok_or_else(|| AmqpError::protocol("transfer without delivery-id"))?;
        let local_channel = self.local_channel(frame_channel)?;
        let session = self
            .sessions
            .get_mut(&local_channel)
            .ok_or_else(|| AmqpError::protocol("transfer on unknown session"))?;
        let local_handle = session
            .handle_by_remote(remote_handle)
            .ok_or_else(|| AmqpError::protocol("transfer for unknown link"))?;
        session.link_mut(local_handle)?.on_transfer_received();
        if !settled {
            session.track_incoming(delivery_id, local_handle);
        }
        self.events.push_back(Event::Delivery {
            connection: self.id,
            link: LinkId {
                channel: local_channel,
                handle: local_handle,
            },
            delivery: Delivery {
                id: delivery_id,
                tag,
                payload: Some(payload),
                remote_state: None,
                settled,
            },
        });
        Ok(())
    }

    fn handle_disposition(&mut self, first: u32, last: u32, settled: bool, accepted: bool) {
        // Delivery ids are session scoped; scan the sessions that know them.
        for delivery_id in first..=last {
            for session in self.sessions.values_mut() {
                let record = if settled {
                    session.settle_outgoing(delivery_id)
                } else {
                    session.outgoing(delivery_id).cloned()
                };
                if let Some(record) = record {
                    self.events.push_back(Event::Delivery {
                        connection: self.id,
                        link: LinkId {
                            channel: session.local_channel(),
                            handle: record.handle,
                        },
                        delivery: Delivery {
                            id: delivery_id,
                            tag: record.tag,
                            payload: None,
                            remote_state: accepted.then_some(DeliveryState::Accepted),
                            settled,
                        },
                    });
                    break;
                }
            }
        }
    }

    fn handle_detach(
        &mut self,
        frame_channel: u16,
        remote_handle: u32,
        closed: bool,
        error: Option<Condition>,
    ) -> AmqpResult<()> {
        let local_channel = self.local_channel(frame_channel)?;
        let session = self
            .sessions
            .get_mut(&local_channel)
            .ok_or_else(|| AmqpError::protocol("detach on unknown session"))?;
        let local_handle = session
            .handle_by_remote(remote_handle)
            .ok_or_else(|| AmqpError::protocol("detach for unknown link"))?;
        let link = session.link_mut(local_handle)?;
        let we_initiated = matches!(link.state(), crate::link::LinkState::Detaching);
        link.on_remote_detach();
        let link_id = LinkId {
            channel: local_channel,
            handle: local_handle,
        };
        if !we_initiated {
            self.stage_frame(Frame::new(
                local_channel,
                Performative::Detach {
                    handle: local_handle,
                    closed,
                    error: None,
                },
            ));
        }
        if closed {
            if let Some(session) = self.sessions.get_mut(&local_channel) {
                session.remove_link(local_handle);
            }
            self.events.push_back(Event::LinkRemoteClose {
                connection: self.id,
                link: link_id,
                condition: error,
            });
        } else {
            self.events.push_back(Event::LinkRemoteDetach {
                connection: self.id,
                link: link_id,
            });
        }
        Ok(())
    }

    fn handle_end(&mut self, frame_channel: u16, error: Option<Condition>) -> AmqpResult<()> {
        let local_channel = self.local_channel(frame_channel)?;
        let session = self
            .sessions
            .get_mut(&local_channel)
            .ok_or_else(|| AmqpError::protocol("end on unknown session"))?;
        let we_initiated = matches!(session.state(), SessionState::Ending);
        session.on_remote_end();
        if !we_initiated {
            self.stage_frame(Frame::new(local_channel, Performative::End { error: None }));
        }
        self.sessions.remove(&local_channel);
        self.channels_by_remote.remove(&frame_channel);
        self.events.push_back(Event::SessionRemoteClose {
            connection: self.id,
            channel: local_channel,
            condition: error,
        });
        Ok(())
    }

    /// Move staged output into `out`
    ///
    /// Produces nothing until the connection is bound; the protocol header is
    /// emitted ahead of the first frame.
    pub fn take_output(&mut self, out: &mut BytesMut) {
        if !self.bound {
            return;
        }
        if !self.header_written {
            self.header_written = true;
            out.extend_from_slice(constants::AMQP_HEADER);
        }
        if !self.outbuf.is_empty() {
            let staged = self.outbuf.split();
            out.extend_from_slice(&staged);
        }
    }

    /// True if output is staged or the protocol header is still owed
    pub fn has_output(&self) -> bool {
        self.bound && (!self.outbuf.is_empty() || !self.header_written)
    }

    /// Discard all staged output; used when the transport is gone
    pub fn clear_output(&mut self) {
        self.outbuf.clear();
        self.deferred.clear();
    }

    /// Pop the next collected event
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// True if events are waiting for dispatch
    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Collect the final `TransportClosed` event
    pub(crate) fn emit_transport_closed(&mut self, condition: Option<Condition>) {
        self.events.push_back(Event::TransportClosed {
            connection: self.id,
            condition,
        });
    }

    fn stage_frame(&mut self, frame: Frame) {
        if !self.open_sent && !matches!(frame.body, Some(Performative::Open { .. })) {
            // Replies triggered before the local Open is staged must follow it
            // on the wire.
            self.deferred.push(frame);
            return;
        }
        Self::stage(&mut self.outbuf, &frame);
    }

    fn stage(outbuf: &mut BytesMut, frame: &Frame) {
        // Staged frames are built locally and always encode.
        if let Err(error) = frame.encode(outbuf) {
            log::warn!("dropping unencodable frame: {}", error);
        }
    }

    fn session_mut(&mut self, channel: u16) -> AmqpResult<&mut Session> {
        self.sessions
            .get_mut(&channel)
            .ok_or_else(|| AmqpError::session(format!("no session on channel {}", channel)))
    }

    fn local_channel(&self, remote_channel: u16) -> AmqpResult<u16> {
        self.channels_by_remote
            .get(&remote_channel)
            .copied()
            .ok_or_else(|| AmqpError::protocol(format!("unknown remote channel {}", remote_channel)))
    }

    fn alloc_channel(&mut self) -> AmqpResult<u16> {
        if self.next_channel >= self.config.channel_max {
            return Err(AmqpError::session("channel-max exhausted"));
        }
        let channel = self.next_channel;
        self.next_channel += 1;
        Ok(channel)
    }
}
