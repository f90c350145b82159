//! Protocol Events
//!
//! This module defines the typed event stream delivered from a connection
//! engine (and from the container itself) to application handlers. Events
//! identify a protocol transition and carry typed accessors for the subject
//! they pertain to: connection, session, link, delivery or listener.
//!
//! Events belonging to one connection are totally ordered and never delivered
//! concurrently; the container enforces this with its batch discipline.

use crate::condition::Condition;
use crate::frame::Role;
use bytes::Bytes;
use std::any::Any;
use std::net::SocketAddr;

/// Opaque identity of a connection within a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque identity of a listener within a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Identity of a link endpoint: local session channel plus local handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId {
    pub channel: u16,
    pub handle: u32,
}

/// Terminal state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Accepted,
}

/// A delivery surfaced through a `Delivery` event
///
/// For an incoming message the payload is set; for an acknowledgement the
/// remote state is set instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Session-scoped delivery id
    pub id: u32,
    /// Sender-assigned delivery tag
    pub tag: Bytes,
    /// Message payload, for incoming transfers
    pub payload: Option<Bytes>,
    /// Remote terminal state, for acknowledgements
    pub remote_state: Option<DeliveryState>,
    /// True once the delivery is settled on both ends
    pub settled: bool,
}

/// An application-supplied context riding on a container event
pub struct EventContext(Option<Box<dyn Any + Send>>);

impl EventContext {
    /// Wrap a context value
    pub fn new<T: Any + Send>(value: T) -> Self {
        EventContext(Some(Box::new(value)))
    }

    /// An absent context
    pub fn none() -> Self {
        EventContext(None)
    }

    /// Downcast the context to a concrete type
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|ctx| ctx.downcast_ref::<T>())
    }

    /// True if a context value is present
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_some() {
            write!(f, "EventContext(set)")
        } else {
            write!(f, "EventContext(unset)")
        }
    }
}

/// Discriminant of an [`Event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionInit,
    ConnectionBound,
    ConnectionRemoteOpen,
    ConnectionRemoteClose,
    ConnectionWake,
    SessionRemoteOpen,
    SessionRemoteClose,
    LinkRemoteOpen,
    LinkRemoteClose,
    LinkRemoteDetach,
    LinkFlow,
    Delivery,
    TransportClosed,
    ListenerOpen,
    ListenerAccept,
    ListenerClose,
    ContainerTimer,
    ContainerInterrupt,
    ContainerInject,
    ContainerInactive,
    ContainerStopped,
    ContainerTimeout,
}

/// A protocol transition delivered to a handler
#[derive(Debug)]
pub enum Event {
    /// A connection exists but is not yet opened; configure it here
    ConnectionInit { connection: ConnectionId },
    /// The connection is bound to a transport
    ConnectionBound { connection: ConnectionId },
    /// The peer sent Open
    ConnectionRemoteOpen { connection: ConnectionId },
    /// The peer sent Close
    ConnectionRemoteClose {
        connection: ConnectionId,
        condition: Option<Condition>,
    },
    /// `wake` was called on the connection
    ConnectionWake { connection: ConnectionId },
    /// The peer opened a session
    SessionRemoteOpen {
        connection: ConnectionId,
        channel: u16,
    },
    /// The peer ended a session
    SessionRemoteClose {
        connection: ConnectionId,
        channel: u16,
        condition: Option<Condition>,
    },
    /// The peer attached a link
    LinkRemoteOpen {
        connection: ConnectionId,
        link: LinkId,
        name: String,
        /// The role of the *local* endpoint of this link
        role: Role,
    },
    /// The peer closed a link
    LinkRemoteClose {
        connection: ConnectionId,
        link: LinkId,
        condition: Option<Condition>,
    },
    /// The peer detached a link without closing it
    LinkRemoteDetach {
        connection: ConnectionId,
        link: LinkId,
    },
    /// Sender credit changed
    LinkFlow {
        connection: ConnectionId,
        link: LinkId,
        credit: u32,
    },
    /// An incoming message or an acknowledgement
    Delivery {
        connection: ConnectionId,
        link: LinkId,
        delivery: Delivery,
    },
    /// The transport closed in both directions; the connection is unusable
    TransportClosed {
        connection: ConnectionId,
        condition: Option<Condition>,
    },
    /// A listener is bound and accepting
    ListenerOpen {
        listener: ListenerId,
        addr: SocketAddr,
    },
    /// A listener accepted an inbound connection
    ListenerAccept {
        listener: ListenerId,
        connection: ConnectionId,
    },
    /// A listener closed, possibly with an error condition
    ListenerClose {
        listener: ListenerId,
        condition: Option<Condition>,
    },
    /// A scheduled timer fired
    ContainerTimer { context: EventContext },
    /// `interrupt` was called; delivered to exactly one waiter
    ContainerInterrupt { context: EventContext },
    /// `inject` was called for this connection
    ContainerInject {
        connection: ConnectionId,
        context: EventContext,
    },
    /// The last connection finalized and the last listener closed
    ContainerInactive,
    /// The container was stopped
    ContainerStopped,
    /// A `wait` call expired without work
    ContainerTimeout,
}

impl Event {
    /// The discriminant of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionInit { .. } => EventKind::ConnectionInit,
            Event::ConnectionBound { .. } => EventKind::ConnectionBound,
            Event::ConnectionRemoteOpen { .. } => EventKind::ConnectionRemoteOpen,
            Event::ConnectionRemoteClose { .. } => EventKind::ConnectionRemoteClose,
            Event::ConnectionWake { .. } => EventKind::ConnectionWake,
            Event::SessionRemoteOpen { .. } => EventKind::SessionRemoteOpen,
            Event::SessionRemoteClose { .. } => EventKind::SessionRemoteClose,
            Event::LinkRemoteOpen { .. } => EventKind::LinkRemoteOpen,
            Event::LinkRemoteClose { .. } => EventKind::LinkRemoteClose,
            Event::LinkRemoteDetach { .. } => EventKind::LinkRemoteDetach,
            Event::LinkFlow { .. } => EventKind::LinkFlow,
            Event::Delivery { .. } => EventKind::Delivery,
            Event::TransportClosed { .. } => EventKind::TransportClosed,
            Event::ListenerOpen { .. } => EventKind::ListenerOpen,
            Event::ListenerAccept { .. } => EventKind::ListenerAccept,
            Event::ListenerClose { .. } => EventKind::ListenerClose,
            Event::ContainerTimer { .. } => EventKind::ContainerTimer,
            Event::ContainerInterrupt { .. } => EventKind::ContainerInterrupt,
            Event::ContainerInject { .. } => EventKind::ContainerInject,
            Event::ContainerInactive => EventKind::ContainerInactive,
            Event::ContainerStopped => EventKind::ContainerStopped,
            Event::ContainerTimeout => EventKind::ContainerTimeout,
        }
    }

    /// The connection this event pertains to, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Event::ConnectionInit { connection }
            | Event::ConnectionBound { connection }
            | Event::ConnectionRemoteOpen { connection }
            | Event::ConnectionRemoteClose { connection, .. }
            | Event::ConnectionWake { connection }
            | Event::SessionRemoteOpen { connection, .. }
            | Event::SessionRemoteClose { connection, .. }
            | Event::LinkRemoteOpen { connection, .. }
            | Event::LinkRemoteClose { connection, .. }
            | Event::LinkRemoteDetach { connection, .. }
            | Event::LinkFlow { connection, .. }
            | Event::Delivery { connection, .. }
            | Event::TransportClosed { connection, .. }
            | Event::ContainerInject { connection, .. }
            | Event::ListenerAccept { connection, .. } => Some(*connection),
            _ => None,
        }
    }

    /// The listener this event pertains to, if any
    pub fn listener(&self) -> Option<ListenerId> {
        match self {
            Event::ListenerOpen { listener, .. }
            | Event::ListenerAccept { listener, .. }
            | Event::ListenerClose { listener, .. } => Some(*listener),
            _ => None,
        }
    }

    /// The link this event pertains to, if any
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Event::LinkRemoteOpen { link, .. }
            | Event::LinkRemoteClose { link, .. }
            | Event::LinkRemoteDetach { link, .. }
            | Event::LinkFlow { link, .. }
            | Event::Delivery { link, .. } => Some(*link),
            _ => None,
        }
    }

    /// The delivery carried by this event, if any
    pub fn delivery(&self) -> Option<&Delivery> {
        match self {
            Event::Delivery { delivery, .. } => Some(delivery),
            _ => None,
        }
    }

    /// The error condition carried by this event, if one is set
    pub fn condition(&self) -> Option<&Condition> {
        match self {
            Event::ConnectionRemoteClose { condition, .. }
            | Event::SessionRemoteClose { condition, .. }
            | Event::LinkRemoteClose { condition, .. }
            | Event::TransportClosed { condition, .. }
            | Event::ListenerClose { condition, .. } => condition.as_ref(),
            _ => None,
        }
    }

    /// Downcast the application context carried by this event
    pub fn context<T: Any>(&self) -> Option<&T> {
        match self {
            Event::ContainerTimer { context }
            | Event::ContainerInterrupt { context }
            | Event::ContainerInject { context, .. } => context.get::<T>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        let event = Event::ConnectionInit {
            connection: ConnectionId(1),
        };
        assert_eq!(event.kind(), EventKind::ConnectionInit);
        assert_eq!(event.connection(), Some(ConnectionId(1)));
        assert_eq!(event.listener(), None);
    }

    #[test]
    fn test_context_downcast() {
        let event = Event::ContainerInterrupt {
            context: EventContext::new("wake-up"),
        };
        assert_eq!(event.context::<&str>(), Some(&"wake-up"));
        assert_eq!(event.context::<i32>(), None);
    }

    #[test]
    fn test_unset_context() {
        let context = EventContext::none();
        assert!(!context.is_set());
        assert_eq!(context.get::<u32>(), None);
    }

    #[test]
    fn test_condition_accessor() {
        let event = Event::TransportClosed {
            connection: ConnectionId(3),
            condition: Some(Condition::of("amqp:connection:io", "broken pipe")),
        };
        assert_eq!(
            event.condition().and_then(Condition::name),
            Some("amqp:connection:io")
        );
    }

    #[test]
    fn test_delivery_accessor() {
        let delivery = Delivery {
            id: 5,
            tag: Bytes::from_static(b"tag-5"),
            payload: Some(Bytes::from_static(b"hello")),
            remote_state: None,
            settled: false,
        };
        let event = Event::Delivery {
            connection: ConnectionId(1),
            link: LinkId { channel: 0, handle: 0 },
            delivery,
        };
        assert_eq!(event.delivery().map(|d| d.id), Some(5));
        assert_eq!(event.link(), Some(LinkId { channel: 0, handle: 0 }));
    }
}
