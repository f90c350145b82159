//! Link State
//!
//! This module provides the per-link bookkeeping of the protocol object:
//! name, handle, role, attach lifecycle and the sender credit accounting
//! driven by Flow performatives.
//!
//! The core surfaces credit changes as `LinkFlow` events and leaves
//! flow-control *policy* to the application: a receiver decides how much
//! credit to grant, a sender decides what to do when credit arrives.

use crate::error::{AmqpError, AmqpResult};
use crate::frame::Role;

/// Link lifecycle state
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Attach sent, waiting for the peer's attach
    Attaching,
    /// Attach exchanged in both directions
    Attached,
    /// Detach sent, waiting for the peer's detach
    Detaching,
    /// Detach exchanged or never attached
    Detached,
}

/// One endpoint of an AMQP link
#[derive(Debug)]
pub struct Link {
    name: String,
    handle: u32,
    remote_handle: Option<u32>,
    role: Role,
    state: LinkState,
    /// Source address (meaningful on receiver links)
    source: Option<String>,
    /// Target address (meaningful on sender links)
    target: Option<String>,
    /// Transfers sent (sender) or received (receiver) on this link
    delivery_count: u32,
    /// Sender: credit granted by the peer. Receiver: credit issued to the peer
    credit: u32,
}

impl Link {
    /// Create a new local link endpoint in the `Detached` state
    pub fn new(
        name: impl Into<String>,
        handle: u32,
        role: Role,
        source: Option<String>,
        target: Option<String>,
    ) -> Self {
        Link {
            name: name.into(),
            handle,
            remote_handle: None,
            role,
            state: LinkState::Detached,
            source,
            target,
            delivery_count: 0,
            credit: 0,
        }
    }

    /// Get the link name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the local handle
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Get the peer's handle, once the link is attached
    pub fn remote_handle(&self) -> Option<u32> {
        self.remote_handle
    }

    /// Get the local role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the link state
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Get the source address
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Get the target address
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Current link credit
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Transfers seen on this link so far
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Mark the local attach as sent
    pub fn attach_sent(&mut self) {
        self.state = LinkState::Attaching;
    }

    /// Record the peer's attach
    pub fn on_remote_attach(&mut self, remote_handle: u32) {
        self.remote_handle = Some(remote_handle);
        self.state = LinkState::Attached;
    }

    /// Mark the local detach as sent
    pub fn detach_sent(&mut self) {
        self.state = LinkState::Detaching;
    }

    /// Record the peer's detach
    pub fn on_remote_detach(&mut self) {
        self.state = LinkState::Detached;
    }

    /// Apply a Flow from the peer and return the resulting sender credit
    ///
    /// Uses the AMQP credit formula: the credit available to the sender is
    /// the peer's view of the delivery count plus the credit it granted,
    /// minus the transfers already sent locally.
    pub fn on_remote_flow(&mut self, delivery_count: Option<u32>, link_credit: Option<u32>) -> u32 {
        let remote_count = delivery_count.unwrap_or(0);
        let granted = link_credit.unwrap_or(0);
        self.credit = remote_count
            .wrapping_add(granted)
            .wrapping_sub(self.delivery_count);
        self.credit
    }

    /// Receiver operation: add credit to issue to the peer
    pub fn add_credit(&mut self, credit: u32) {
        self.credit = self.credit.saturating_add(credit);
    }

    /// Sender accounting for one outgoing transfer
    ///
    /// Fails when no credit is available or the link is not attached.
    pub fn on_transfer_sent(&mut self) -> AmqpResult<()> {
        if self.role != Role::Sender {
            return Err(AmqpError::link("transfers can only be sent on a sender link"));
        }
        if self.state != LinkState::Attached {
            return Err(AmqpError::invalid_state("link is not attached"));
        }
        if self.credit == 0 {
            return Err(AmqpError::link("no credit available"));
        }
        self.credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        Ok(())
    }

    /// Receiver accounting for one incoming transfer
    pub fn on_transfer_received(&mut self) {
        self.delivery_count = self.delivery_count.wrapping_add(1);
        self.credit = self.credit.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Link {
        let mut link = Link::new("s", 0, Role::Sender, None, Some("q".to_string()));
        link.attach_sent();
        link.on_remote_attach(0);
        link
    }

    #[test]
    fn test_attach_lifecycle() {
        let mut link = Link::new("l", 3, Role::Receiver, Some("q".to_string()), None);
        assert_eq!(link.state(), &LinkState::Detached);
        link.attach_sent();
        assert_eq!(link.state(), &LinkState::Attaching);
        link.on_remote_attach(9);
        assert_eq!(link.state(), &LinkState::Attached);
        assert_eq!(link.remote_handle(), Some(9));
    }

    #[test]
    fn test_flow_credit_formula() {
        let mut link = sender();
        assert_eq!(link.on_remote_flow(Some(0), Some(10)), 10);

        // Send three transfers, then the peer re-announces the same grant.
        for _ in 0..3 {
            link.on_transfer_sent().unwrap();
        }
        assert_eq!(link.credit(), 7);
        assert_eq!(link.on_remote_flow(Some(0), Some(10)), 7);

        // The peer tops up after seeing the transfers.
        assert_eq!(link.on_remote_flow(Some(3), Some(10)), 10);
    }

    #[test]
    fn test_send_without_credit_fails() {
        let mut link = sender();
        let result = link.on_transfer_sent();
        assert!(matches!(result, Err(AmqpError::Link(_))));
    }

    #[test]
    fn test_send_exhausts_credit() {
        let mut link = sender();
        link.on_remote_flow(None, Some(2));
        assert!(link.on_transfer_sent().is_ok());
        assert!(link.on_transfer_sent().is_ok());
        assert!(link.on_transfer_sent().is_err());
        assert_eq!(link.delivery_count(), 2);
    }

    #[test]
    fn test_send_on_receiver_fails() {
        let mut link = Link::new("r", 0, Role::Receiver, Some("q".to_string()), None);
        link.attach_sent();
        link.on_remote_attach(0);
        link.add_credit(5);
        assert!(matches!(
            link.on_transfer_sent(),
            Err(AmqpError::Link(_))
        ));
    }

    #[test]
    fn test_receiver_accounting() {
        let mut link = Link::new("r", 0, Role::Receiver, Some("q".to_string()), None);
        link.attach_sent();
        link.on_remote_attach(0);
        link.add_credit(2);
        link.on_transfer_received();
        assert_eq!(link.credit(), 1);
        assert_eq!(link.delivery_count(), 1);
    }
}
