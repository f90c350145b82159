//! Session State
//!
//! This module provides the per-session bookkeeping of the protocol object:
//! channel correlation with the peer, transfer windows, the link table and
//! delivery-id allocation.
//!
//! Sessions are owned by the connection; all operations on them run inside
//! the connection's serialization domain.

use crate::error::{AmqpError, AmqpResult};
use crate::link::Link;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

/// Default transfer window advertised in Begin
pub const DEFAULT_WINDOW: u32 = 2048;

/// Session lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Begin sent, waiting for the peer's begin
    Beginning,
    /// Begin exchanged in both directions
    Active,
    /// End sent, waiting for the peer's end
    Ending,
    /// End exchanged or never begun
    Ended,
}

/// An unsettled outgoing delivery awaiting the peer's disposition
#[derive(Debug, Clone)]
pub struct UnsettledDelivery {
    pub handle: u32,
    pub tag: Bytes,
}

/// One endpoint of an AMQP session
#[derive(Debug)]
pub struct Session {
    local_channel: u16,
    remote_channel: Option<u16>,
    state: SessionState,
    next_outgoing_id: u32,
    incoming_window: u32,
    outgoing_window: u32,
    next_handle: u32,
    next_delivery_id: u32,
    links: HashMap<u32, Link>,
    handles_by_remote: HashMap<u32, u32>,
    /// Outgoing deliveries not yet settled, keyed by delivery id
    unsettled_out: BTreeMap<u32, UnsettledDelivery>,
    /// Incoming deliveries not yet settled, keyed by delivery id
    unsettled_in: BTreeMap<u32, u32>,
}

impl Session {
    /// Create a session on the given local channel
    pub fn new(local_channel: u16) -> Self {
        Session {
            local_channel,
            remote_channel: None,
            state: SessionState::Ended,
            next_outgoing_id: 0,
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            next_handle: 0,
            next_delivery_id: 0,
            links: HashMap::new(),
            handles_by_remote: HashMap::new(),
            unsettled_out: BTreeMap::new(),
            unsettled_in: BTreeMap::new(),
        }
    }

    /// Get the local channel number
    pub fn local_channel(&self) -> u16 {
        self.local_channel
    }

    /// Get the peer's channel number, once correlated
    pub fn remote_channel(&self) -> Option<u16> {
        self.remote_channel
    }

    /// Get the session state
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Incoming window advertised to the peer
    pub fn incoming_window(&self) -> u32 {
        self.incoming_window
    }

    /// Outgoing window advertised to the peer
    pub fn outgoing_window(&self) -> u32 {
        self.outgoing_window
    }

    /// Next outgoing transfer id
    pub fn next_outgoing_id(&self) -> u32 {
        self.next_outgoing_id
    }

    /// Mark the local begin as sent
    pub fn begin_sent(&mut self) {
        self.state = SessionState::Beginning;
    }

    /// Record the peer's begin, correlating channels
    pub fn on_remote_begin(&mut self, remote_channel: u16) {
        self.remote_channel = Some(remote_channel);
        self.state = SessionState::Active;
    }

    /// Mark the local end as sent
    pub fn end_sent(&mut self) {
        self.state = SessionState::Ending;
    }

    /// Record the peer's end
    pub fn on_remote_end(&mut self) {
        self.state = SessionState::Ended;
    }

    /// Allocate the next link handle
    pub fn alloc_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    /// Allocate the next delivery id
    pub fn alloc_delivery_id(&mut self) -> u32 {
        let id = self.next_delivery_id;
        self.next_delivery_id = self.next_delivery_id.wrapping_add(1);
        self.next_outgoing_id = self.next_outgoing_id.wrapping_add(1);
        id
    }

    /// Insert a link under its local handle
    pub fn add_link(&mut self, link: Link) {
        self.links.insert(link.handle(), link);
    }

    /// Look up a link by local handle
    pub fn link(&self, handle: u32) -> Option<&Link> {
        self.links.get(&handle)
    }

    /// Look up a link mutably by local handle
    pub fn link_mut(&mut self, handle: u32) -> AmqpResult<&mut Link> {
        self.links
            .get_mut(&handle)
            .ok_or_else(|| AmqpError::link(format!("no link with handle {}", handle)))
    }

    /// Look up a local handle by the peer's handle
    pub fn handle_by_remote(&self, remote_handle: u32) -> Option<u32> {
        self.handles_by_remote.get(&remote_handle).copied()
    }

    /// Look up a local handle by link name
    pub fn handle_by_name(&self, name: &str) -> Option<u32> {
        self.links
            .values()
            .find(|link| link.name() == name)
            .map(Link::handle)
    }

    /// Record the peer's handle for an attached link
    pub fn map_remote_handle(&mut self, remote_handle: u32, local_handle: u32) {
        self.handles_by_remote.insert(remote_handle, local_handle);
    }

    /// Remove a link and its remote-handle mapping
    pub fn remove_link(&mut self, handle: u32) {
        if let Some(link) = self.links.remove(&handle) {
            if let Some(remote) = link.remote_handle() {
                self.handles_by_remote.remove(&remote);
            }
        }
    }

    /// Track an unsettled outgoing delivery
    pub fn track_outgoing(&mut self, delivery_id: u32, handle: u32, tag: Bytes) {
        self.unsettled_out
            .insert(delivery_id, UnsettledDelivery { handle, tag });
    }

    /// Look up an unsettled outgoing delivery
    pub fn outgoing(&self, delivery_id: u32) -> Option<&UnsettledDelivery> {
        self.unsettled_out.get(&delivery_id)
    }

    /// Settle an outgoing delivery, returning its record
    pub fn settle_outgoing(&mut self, delivery_id: u32) -> Option<UnsettledDelivery> {
        self.unsettled_out.remove(&delivery_id)
    }

    /// Track an unsettled incoming delivery
    pub fn track_incoming(&mut self, delivery_id: u32, handle: u32) {
        self.unsettled_in.insert(delivery_id, handle);
    }

    /// Settle an incoming delivery
    pub fn settle_incoming(&mut self, delivery_id: u32) -> Option<u32> {
        self.unsettled_in.remove(&delivery_id)
    }

    /// Iterate the local handles of all links
    pub fn handles(&self) -> Vec<u32> {
        self.links.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Role;

    #[test]
    fn test_channel_correlation() {
        let mut session = Session::new(3);
        assert_eq!(session.local_channel(), 3);
        assert_eq!(session.remote_channel(), None);

        session.begin_sent();
        assert_eq!(session.state(), &SessionState::Beginning);
        session.on_remote_begin(7);
        assert_eq!(session.remote_channel(), Some(7));
        assert_eq!(session.state(), &SessionState::Active);
    }

    #[test]
    fn test_handle_allocation() {
        let mut session = Session::new(0);
        assert_eq!(session.alloc_handle(), 0);
        assert_eq!(session.alloc_handle(), 1);
    }

    #[test]
    fn test_link_lookup() {
        let mut session = Session::new(0);
        let handle = session.alloc_handle();
        session.add_link(Link::new("out", handle, Role::Sender, None, Some("q".to_string())));
        session.map_remote_handle(5, handle);

        assert_eq!(session.handle_by_name("out"), Some(handle));
        assert_eq!(session.handle_by_remote(5), Some(handle));
        assert!(session.link_mut(handle).is_ok());
        assert!(session.link_mut(99).is_err());

        session.remove_link(handle);
        assert_eq!(session.handle_by_name("out"), None);
    }

    #[test]
    fn test_delivery_tracking() {
        let mut session = Session::new(0);
        let id = session.alloc_delivery_id();
        session.track_outgoing(id, 0, Bytes::from_static(b"t0"));
        assert!(session.outgoing(id).is_some());

        let record = session.settle_outgoing(id).unwrap();
        assert_eq!(record.tag, Bytes::from_static(b"t0"));
        assert!(session.settle_outgoing(id).is_none());
    }

    #[test]
    fn test_delivery_ids_are_sequential() {
        let mut session = Session::new(0);
        assert_eq!(session.alloc_delivery_id(), 0);
        assert_eq!(session.alloc_delivery_id(), 1);
        assert_eq!(session.next_outgoing_id(), 2);
    }
}
