//! Listener
//!
//! This module provides the accepting endpoint of the container. A listener
//! task binds a TCP socket, reports `ListenerOpen` with the bound address
//! (so an ephemeral port can be discovered), registers an engine per inbound
//! connection, and reports `ListenerClose` when it ends, carrying an error
//! condition when it ended because of one.

use crate::address::AmqpAddress;
use crate::condition::{names, Condition};
use crate::container::ContainerInner;
use crate::event::ListenerId;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

/// Accept loop for one listener
pub(crate) async fn run_listener(
    inner: Arc<ContainerInner>,
    id: ListenerId,
    address: AmqpAddress,
    mut shutdown: UnboundedReceiver<()>,
) {
    let listener = match TcpListener::bind(address.host_port()).await {
        Ok(listener) => listener,
        Err(error) => {
            inner.listener_closed(
                id,
                Some(Condition::of(
                    names::IO,
                    format!("bind to {} failed: {}", address, error),
                )),
            );
            return;
        }
    };

    match listener.local_addr() {
        Ok(addr) => inner.listener_open(id, addr),
        Err(error) => {
            inner.listener_closed(
                id,
                Some(Condition::of(
                    names::IO,
                    format!("local address unavailable: {}", error),
                )),
            );
            return;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                inner.listener_closed(id, None);
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::debug!("{}: accepted {}", id, peer);
                    inner.accept_connection(id, stream);
                }
                Err(error) => {
                    inner.listener_closed(
                        id,
                        Some(Condition::of(names::IO, format!("accept failed: {}", error))),
                    );
                    return;
                }
            },
        }
    }
}
