//! Transport Adapter
//!
//! This module binds a [`ConnectionEngine`] to a byte stream and runs the
//! canonical driver loop:
//!
//! ```text
//! while not engine.finished:
//!     dispatch events until none remain, deliver them to the container
//!     if the engine has data to write and the socket is writable: write
//!     if the engine accepts input and the socket is readable: read
//!     I/O errors set the transport condition and disconnect the engine
//! after the loop: the engine is finished, release the connection
//! ```
//!
//! One driver task runs per connection. The engine travels through an
//! [`EngineSlot`]: the driver takes it out for each non-blocking step and puts
//! it back before awaiting, so a handler holding the connection's batch gets
//! exclusive access without a per-event lock. At most one read and one write
//! are in flight at any time.

use crate::condition::{names, Condition};
use crate::container::ContainerInner;
use crate::engine::ConnectionEngine;
use crate::event::ConnectionId;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

/// Commands posted to a driver task by the container
#[derive(Debug)]
pub(crate) enum DriverCommand {
    /// The handler released the batch; staged output may be pending
    Flush,
    /// Close the connection abruptly with the given condition
    Abort(Condition),
}

/// The byte-stream capability a transport adapter drives an engine from
///
/// Readiness is edge-like: a `try_read`/`try_write` that returns
/// `WouldBlock` must clear the readiness reported by `readable`/`writable`,
/// the way `tokio::net::TcpStream` behaves.
#[async_trait]
pub trait Socket: Send + Sync + 'static {
    /// Wait until the stream is likely readable
    async fn readable(&self) -> io::Result<()>;

    /// Non-blocking read into `buf`; `Ok(0)` means EOF
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait until the stream is likely writable
    async fn writable(&self) -> io::Result<()>;

    /// Non-blocking write of a prefix of `buf`
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl Socket for TcpStream {
    async fn readable(&self) -> io::Result<()> {
        TcpStream::readable(self).await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    async fn writable(&self) -> io::Result<()> {
        TcpStream::writable(self).await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

/// Hands one engine back and forth between its driver task and batch holders
#[derive(Debug)]
pub(crate) struct EngineSlot {
    cell: std::sync::Mutex<Option<ConnectionEngine>>,
    returned: Notify,
}

impl EngineSlot {
    pub(crate) fn new(engine: ConnectionEngine) -> Self {
        EngineSlot {
            cell: std::sync::Mutex::new(Some(engine)),
            returned: Notify::new(),
        }
    }

    /// Take the engine out, waiting until the current holder returns it
    pub(crate) async fn take(&self) -> ConnectionEngine {
        loop {
            // Register interest before checking the cell so a concurrent put
            // cannot slip between the check and the await.
            let mut notified = std::pin::pin!(self.returned.notified());
            notified.as_mut().enable();
            if let Some(engine) = self.cell.lock().unwrap().take() {
                return engine;
            }
            notified.await;
        }
    }

    /// Return the engine and wake anyone waiting to take it
    pub(crate) fn put(&self, engine: ConnectionEngine) {
        *self.cell.lock().unwrap() = Some(engine);
        self.returned.notify_waiters();
    }
}

/// Driver task for an outbound connection
pub(crate) async fn run_connector(
    inner: Arc<ContainerInner>,
    id: ConnectionId,
    slot: Arc<EngineSlot>,
    host_port: String,
    mut ctrl: UnboundedReceiver<DriverCommand>,
) {
    // Deliver ConnectionInit before the socket exists so the handler can
    // configure the un-opened connection.
    pump(&inner, id, &slot).await;

    let connect = TcpStream::connect(host_port.clone());
    tokio::pin!(connect);
    let stream = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(stream) => break Some(stream),
                Err(error) => {
                    log::debug!("{}: connect to {} failed: {}", id, host_port, error);
                    abort_engine(
                        &slot,
                        Condition::of(names::IO, format!("connect to {} failed: {}", host_port, error)),
                    )
                    .await;
                    break None;
                }
            },
            cmd = ctrl.recv() => match cmd {
                Some(DriverCommand::Flush) => continue,
                Some(DriverCommand::Abort(condition)) => {
                    abort_engine(&slot, condition).await;
                    break None;
                }
                None => {
                    abort_engine(&slot, Condition::of(names::FORCED, "container released")).await;
                    break None;
                }
            },
        }
    };

    if let Some(stream) = stream {
        let mut engine = slot.take().await;
        engine.connection().bound();
        // The handler had its chance during ConnectionInit; the container
        // drives the open from here. open() is idempotent.
        engine.connection().open();
        slot.put(engine);
        drive(&inner, id, &slot, stream, &mut ctrl).await;
    } else {
        pump(&inner, id, &slot).await;
    }

    inner.connection_finished(id);
}

/// Driver task for a connection accepted by a listener
pub(crate) async fn run_acceptor(
    inner: Arc<ContainerInner>,
    id: ConnectionId,
    slot: Arc<EngineSlot>,
    stream: TcpStream,
    mut ctrl: UnboundedReceiver<DriverCommand>,
) {
    {
        let mut engine = slot.take().await;
        engine.connection().bound();
        slot.put(engine);
    }
    drive(&inner, id, &slot, stream, &mut ctrl).await;
    inner.connection_finished(id);
}

/// The driver loop proper; returns once the engine is finished
async fn drive<S: Socket>(
    inner: &Arc<ContainerInner>,
    id: ConnectionId,
    slot: &EngineSlot,
    socket: S,
    ctrl: &mut UnboundedReceiver<DriverCommand>,
) {
    loop {
        let (finished, want_read, want_write) = pump(inner, id, slot).await;
        if finished {
            log::debug!("{}: engine finished", id);
            break;
        }

        tokio::select! {
            ready = socket.readable(), if want_read => {
                let mut engine = slot.take().await;
                match ready {
                    Ok(()) => {
                        let buf = engine.read_buffer();
                        if !buf.is_empty() {
                            match socket.try_read(buf) {
                                Ok(0) => engine.read_close(),
                                Ok(n) => engine.read_done(n),
                                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                                    engine.read_done(0);
                                }
                                Err(error) => {
                                    engine.condition().set(names::IO, format!("read failed: {}", error));
                                    engine.disconnected();
                                }
                            }
                        }
                    }
                    Err(error) => {
                        engine.condition().set(names::IO, format!("poll failed: {}", error));
                        engine.disconnected();
                    }
                }
                slot.put(engine);
            }
            ready = socket.writable(), if want_write => {
                let mut engine = slot.take().await;
                match ready {
                    Ok(()) => {
                        match socket.try_write(engine.write_buffer()) {
                            Ok(n) => engine.write_done(n),
                            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {}
                            Err(error) => {
                                engine.condition().set(names::IO, format!("write failed: {}", error));
                                engine.disconnected();
                            }
                        }
                    }
                    Err(error) => {
                        engine.condition().set(names::IO, format!("poll failed: {}", error));
                        engine.disconnected();
                    }
                }
                slot.put(engine);
            }
            cmd = ctrl.recv() => match cmd {
                Some(DriverCommand::Flush) => {}
                Some(DriverCommand::Abort(condition)) => abort_engine(slot, condition).await,
                None => abort_engine(slot, Condition::of(names::FORCED, "container released")).await,
            },
        }
    }
}

/// Dispatch all pending events and report the engine's I/O interest
async fn pump(
    inner: &Arc<ContainerInner>,
    id: ConnectionId,
    slot: &EngineSlot,
) -> (bool, bool, bool) {
    let mut engine = slot.take().await;
    let mut events = Vec::new();
    while let Some(event) = engine.dispatch() {
        events.push(event);
    }
    let finished = engine.finished();
    let want_read = engine.read_capacity() > 0;
    let want_write = !engine.write_buffer().is_empty();
    slot.put(engine);
    if !events.is_empty() {
        inner.deliver(id, events);
    }
    (finished, want_read, want_write)
}

async fn abort_engine(slot: &EngineSlot, condition: Condition) {
    let mut engine = slot.take().await;
    if !engine.condition().is_set() {
        if let Some(name) = condition.name() {
            engine
                .condition()
                .set(name, condition.description().unwrap_or_default());
        }
    }
    engine.disconnected();
    slot.put(engine);
}
