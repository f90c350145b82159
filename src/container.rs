//! Container
//!
//! This module provides the multi-connection runtime: a container owns a set
//! of connection engines and listeners, attaches each engine to a transport,
//! and dispatches protocol events to application handlers with per-connection
//! serialization.
//!
//! # Overview
//!
//! Events are consumed in *batches*. A batch belongs to exactly one
//! connection, or to the container itself for global events. While a batch is
//! out, no second batch is handed out for the same connection and the batch
//! holder has exclusive access to the connection's engine; calling
//! [`Container::done`] (or dropping the batch) releases the connection again.
//! This gives single-writer semantics without per-event locks, even when many
//! worker tasks call [`Container::wait`] concurrently.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dumq_amqp_io::container::{Batch, Container};
//! use dumq_amqp_io::event::EventKind;
//!
//! #[tokio::main]
//! async fn main() {
//!     let container = Container::new("example");
//!     container
//!         .connect("amqp://localhost:5672", |batch: &mut Batch| {
//!             while let Some(event) = batch.next() {
//!                 if event.kind() == EventKind::ConnectionRemoteOpen {
//!                     println!("connected");
//!                 }
//!             }
//!         })
//!         .unwrap();
//!     container.run().await;
//! }
//! ```

use crate::address::AmqpAddress;
use crate::condition::{names, Condition};
use crate::connection::ConnectionConfig;
use crate::driver::{run_acceptor, run_connector, DriverCommand, EngineSlot};
use crate::engine::ConnectionEngine;
use crate::error::{AmqpError, AmqpResult};
use crate::event::{ConnectionId, Event, EventContext, EventKind, ListenerId};
use crate::listener::run_listener;
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Application code consuming the events of a batch
///
/// A handler runs single-threaded per connection: invocations for one
/// connection never overlap. It must not block indefinitely; to await
/// external work, return and resume via [`Container::inject`].
pub trait Handler: Send {
    fn handle(&mut self, batch: &mut Batch);
}

impl<F> Handler for F
where
    F: FnMut(&mut Batch) + Send,
{
    fn handle(&mut self, batch: &mut Batch) {
        self(batch)
    }
}

type HandlerRef = Arc<StdMutex<Box<dyn Handler>>>;

/// The events dispensed for one connection (or for the container), held
/// exclusively until released with [`Container::done`]
pub struct Batch {
    inner: Arc<ContainerInner>,
    connection: Option<ConnectionId>,
    events: VecDeque<Event>,
    engine: Option<ConnectionEngine>,
    pub(crate) handler: Option<HandlerRef>,
    released: bool,
}

impl Batch {
    fn for_connection(
        inner: Arc<ContainerInner>,
        connection: ConnectionId,
        events: VecDeque<Event>,
        engine: ConnectionEngine,
        handler: Option<HandlerRef>,
    ) -> Self {
        Batch {
            inner,
            connection: Some(connection),
            events,
            engine: Some(engine),
            handler,
            released: false,
        }
    }

    fn for_container(inner: Arc<ContainerInner>, event: Event, handler: Option<HandlerRef>) -> Self {
        let mut events = VecDeque::new();
        events.push_back(event);
        Batch {
            inner,
            connection: None,
            events,
            engine: None,
            handler,
            released: false,
        }
    }

    /// Consume the next event of the batch
    pub fn next(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Events left in the batch
    pub fn remaining(&self) -> usize {
        self.events.len()
    }

    /// True if an event of the given kind is still in the batch
    pub fn contains(&self, kind: EventKind) -> bool {
        self.events.iter().any(|event| event.kind() == kind)
    }

    /// The connection this batch belongs to, or `None` for container batches
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Exclusive access to the connection's engine while the batch is held
    pub fn engine(&mut self) -> Option<&mut ConnectionEngine> {
        self.engine.as_mut()
    }

    /// The container this batch came from
    pub fn container(&self) -> Container {
        Container {
            inner: self.inner.clone(),
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let (Some(connection), Some(engine)) = (self.connection, self.engine.take()) {
            self.inner.return_engine(connection, engine);
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("connection", &self.connection)
            .field("events", &self.events)
            .finish()
    }
}

/// A batch (or a single container event) ready for dispatch
enum ReadyItem {
    Connection(ConnectionId),
    Container {
        event: Event,
        handler: Option<HandlerRef>,
    },
}

struct ConnectionEntry {
    slot: Arc<EngineSlot>,
    ctrl: UnboundedSender<DriverCommand>,
    handler: HandlerRef,
    pending: VecDeque<Event>,
    busy: bool,
    queued: bool,
    finished: bool,
}

struct ListenerEntry {
    shutdown: UnboundedSender<()>,
    handler: HandlerRef,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    context: EventContext,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

struct Core {
    next_connection: u64,
    next_listener: u64,
    next_timer: u64,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    listeners: HashMap<ListenerId, ListenerEntry>,
    ready: VecDeque<ReadyItem>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    stopping: bool,
}

impl Core {
    fn new() -> Self {
        Core {
            next_connection: 0,
            next_listener: 0,
            next_timer: 0,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            stopping: false,
        }
    }

    /// Pop the next dispatchable item, discarding stale connection entries
    fn pop_runnable(&mut self) -> Option<ReadyItem> {
        while let Some(item) = self.ready.pop_front() {
            match item {
                ReadyItem::Connection(id) => {
                    if let Some(entry) = self.connections.get_mut(&id) {
                        entry.queued = false;
                        if !entry.busy && !entry.pending.is_empty() {
                            return Some(ReadyItem::Connection(id));
                        }
                    }
                }
                item => return Some(item),
            }
        }
        None
    }

    fn enqueue_connection(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            if !entry.busy && !entry.queued && !entry.pending.is_empty() {
                entry.queued = true;
                self.ready.push_back(ReadyItem::Connection(id));
            }
        }
    }

    fn drained(&self) -> bool {
        self.stopping
            && self.connections.is_empty()
            && self.listeners.is_empty()
            && self.ready.is_empty()
    }
}

pub(crate) struct ContainerInner {
    id: String,
    core: StdMutex<Core>,
    ready_notify: Notify,
    timer_notify: Notify,
    container_handler: Option<HandlerRef>,
}

impl ContainerInner {
    /// Queue events produced by a connection's engine
    pub(crate) fn deliver(&self, id: ConnectionId, events: Vec<Event>) {
        let mut core = self.core.lock().unwrap();
        if let Some(entry) = core.connections.get_mut(&id) {
            entry.pending.extend(events);
            core.enqueue_connection(id);
            drop(core);
            self.ready_notify.notify_one();
        }
    }

    /// A driver task completed; remove the connection once its events drain
    pub(crate) fn connection_finished(&self, id: ConnectionId) {
        let mut core = self.core.lock().unwrap();
        if let Some(entry) = core.connections.get_mut(&id) {
            entry.finished = true;
            if !entry.busy && entry.pending.is_empty() {
                self.remove_connection(&mut core, id);
            }
        }
        drop(core);
        self.ready_notify.notify_waiters();
    }

    fn return_engine(&self, id: ConnectionId, engine: ConnectionEngine) {
        let mut core = self.core.lock().unwrap();
        if let Some(entry) = core.connections.get_mut(&id) {
            entry.slot.put(engine);
            entry.busy = false;
            // The handler may have staged output; let the driver flush it.
            let _ = entry.ctrl.send(DriverCommand::Flush);
            if !entry.pending.is_empty() {
                core.enqueue_connection(id);
            } else if entry.finished {
                self.remove_connection(&mut core, id);
            }
        }
        drop(core);
        self.ready_notify.notify_waiters();
    }

    fn remove_connection(&self, core: &mut Core, id: ConnectionId) {
        core.connections.remove(&id);
        log::debug!("container {}: {} removed", self.id, id);
        self.note_maybe_inactive(core);
    }

    /// On the transition to zero live connections and listeners, deliver a
    /// single `ContainerInactive`
    fn note_maybe_inactive(&self, core: &mut Core) {
        if core.connections.is_empty() && core.listeners.is_empty() {
            core.ready.push_back(ReadyItem::Container {
                event: Event::ContainerInactive,
                handler: self.container_handler.clone(),
            });
        }
    }

    /// The listener task bound its socket
    pub(crate) fn listener_open(&self, id: ListenerId, addr: SocketAddr) {
        let mut core = self.core.lock().unwrap();
        let handler = core.listeners.get(&id).map(|entry| entry.handler.clone());
        core.ready.push_back(ReadyItem::Container {
            event: Event::ListenerOpen { listener: id, addr },
            handler,
        });
        drop(core);
        self.ready_notify.notify_one();
    }

    /// The listener task ended, cleanly or with an error condition
    pub(crate) fn listener_closed(&self, id: ListenerId, condition: Option<Condition>) {
        let mut core = self.core.lock().unwrap();
        if let Some(entry) = core.listeners.remove(&id) {
            core.ready.push_back(ReadyItem::Container {
                event: Event::ListenerClose {
                    listener: id,
                    condition,
                },
                handler: Some(entry.handler),
            });
            self.note_maybe_inactive(&mut core);
        }
        drop(core);
        self.ready_notify.notify_waiters();
    }

    /// Register an accepted inbound connection and spawn its driver
    pub(crate) fn accept_connection(
        self: &Arc<Self>,
        listener: ListenerId,
        stream: TcpStream,
    ) -> Option<ConnectionId> {
        let mut core = self.core.lock().unwrap();
        if core.stopping {
            return None;
        }
        let handler = core.listeners.get(&listener)?.handler.clone();
        let id = ConnectionId(core.next_connection);
        core.next_connection += 1;

        let config = ConnectionConfig {
            container_id: self.id.clone(),
            ..Default::default()
        };
        let engine = ConnectionEngine::with_id(config, id);
        let slot = Arc::new(EngineSlot::new(engine));
        let (ctrl_tx, ctrl_rx) = unbounded_channel();
        core.connections.insert(
            id,
            ConnectionEntry {
                slot: slot.clone(),
                ctrl: ctrl_tx,
                handler: handler.clone(),
                pending: VecDeque::new(),
                busy: false,
                queued: false,
                finished: false,
            },
        );
        core.ready.push_back(ReadyItem::Container {
            event: Event::ListenerAccept {
                listener,
                connection: id,
            },
            handler: Some(handler),
        });
        drop(core);
        self.ready_notify.notify_one();
        tokio::spawn(run_acceptor(self.clone(), id, slot, stream, ctrl_rx));
        Some(id)
    }

    fn fire_due_timers(&self) {
        let mut fired = false;
        let mut core = self.core.lock().unwrap();
        let now = Instant::now();
        while let Some(Reverse(entry)) = core.timers.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = core.timers.pop().unwrap();
            core.ready.push_back(ReadyItem::Container {
                event: Event::ContainerTimer {
                    context: entry.context,
                },
                handler: self.container_handler.clone(),
            });
            fired = true;
        }
        drop(core);
        if fired {
            self.ready_notify.notify_one();
        }
    }
}

/// Advance scheduled timers to runnable as their deadlines pass
async fn run_timekeeper(inner: Arc<ContainerInner>) {
    loop {
        // Register interest before inspecting the heap so a concurrent
        // schedule cannot slip between the check and the await.
        let mut notified = std::pin::pin!(inner.timer_notify.notified());
        notified.as_mut().enable();
        let next = {
            let core = inner.core.lock().unwrap();
            if core.stopping && core.timers.is_empty() {
                return;
            }
            core.timers.peek().map(|Reverse(entry)| entry.deadline)
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => inner.fire_due_timers(),
                    _ = notified.as_mut() => {}
                }
            }
            None => notified.await,
        }
    }
}

/// Builder for a [`Container`]
pub struct ContainerBuilder {
    id: String,
    handler: Option<Box<dyn Handler>>,
}

impl ContainerBuilder {
    /// Create a new container builder
    pub fn new() -> Self {
        ContainerBuilder {
            id: format!("container-{}", &uuid::Uuid::new_v4().to_string()[..8]),
            handler: None,
        }
    }

    /// Set the container id announced on its connections
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the handler for container-level events (timers, interrupts,
    /// inactivity) dispatched by [`Container::run`]
    pub fn container_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    /// Build the container; must be called within a Tokio runtime
    pub fn build(self) -> Container {
        let inner = Arc::new(ContainerInner {
            id: self.id,
            core: StdMutex::new(Core::new()),
            ready_notify: Notify::new(),
            timer_notify: Notify::new(),
            container_handler: self.handler.map(|h| Arc::new(StdMutex::new(h))),
        });
        tokio::spawn(run_timekeeper(inner.clone()));
        Container { inner }
    }
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        ContainerBuilder::new()
    }
}

/// A runtime owning many connection engines and listeners
///
/// Containers are independent; multiple may coexist in one process. Clones
/// share the same runtime.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// Create a container with the given id; must be called within a Tokio
    /// runtime
    pub fn new(id: impl Into<String>) -> Self {
        ContainerBuilder::new().id(id).build()
    }

    /// Start building a container
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    /// The container id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Begin an outbound connection to `url`
    ///
    /// The handler first receives `ConnectionInit` with the un-opened
    /// connection; unless it closes the connection there, the container
    /// drives the open once the transport is bound. Connection failures
    /// surface as a `TransportClosed` event with the transport condition set.
    pub fn connect(&self, url: &str, handler: impl Handler + 'static) -> AmqpResult<ConnectionId> {
        let address: AmqpAddress = url.parse()?;
        let handler: Box<dyn Handler> = Box::new(handler);
        let mut core = self.inner.core.lock().unwrap();
        if core.stopping {
            return Err(AmqpError::Stopped);
        }
        let id = ConnectionId(core.next_connection);
        core.next_connection += 1;

        let config = ConnectionConfig {
            container_id: self.inner.id.clone(),
            hostname: Some(address.host.clone()),
            ..Default::default()
        };
        let engine = ConnectionEngine::with_id(config, id);
        let slot = Arc::new(EngineSlot::new(engine));
        let (ctrl_tx, ctrl_rx) = unbounded_channel();
        core.connections.insert(
            id,
            ConnectionEntry {
                slot: slot.clone(),
                ctrl: ctrl_tx,
                handler: Arc::new(StdMutex::new(handler)),
                pending: VecDeque::new(),
                busy: false,
                queued: false,
                finished: false,
            },
        );
        drop(core);
        log::debug!("container {}: connecting {} to {}", self.inner.id, id, address);
        tokio::spawn(run_connector(
            self.inner.clone(),
            id,
            slot,
            address.host_port(),
            ctrl_rx,
        ));
        Ok(id)
    }

    /// Listen on `url` for inbound connections
    ///
    /// The handler receives `ListenerOpen` (with the bound address, so an
    /// ephemeral port can be discovered), `ListenerAccept` per inbound
    /// connection, and `ListenerClose` on teardown or error. Accepted
    /// connections are driven with the same handler.
    pub fn listen(&self, url: &str, handler: impl Handler + 'static) -> AmqpResult<ListenerId> {
        let address: AmqpAddress = url.parse()?;
        let handler: Box<dyn Handler> = Box::new(handler);
        let mut core = self.inner.core.lock().unwrap();
        if core.stopping {
            return Err(AmqpError::Stopped);
        }
        let id = ListenerId(core.next_listener);
        core.next_listener += 1;
        let (shutdown_tx, shutdown_rx) = unbounded_channel();
        core.listeners.insert(
            id,
            ListenerEntry {
                shutdown: shutdown_tx,
                handler: Arc::new(StdMutex::new(handler)),
            },
        );
        drop(core);
        log::debug!("container {}: {} listening on {}", self.inner.id, id, address);
        tokio::spawn(run_listener(self.inner.clone(), id, address, shutdown_rx));
        Ok(id)
    }

    /// Close a listener; its handler receives `ListenerClose`
    pub fn close_listener(&self, listener: ListenerId) {
        let core = self.inner.core.lock().unwrap();
        if let Some(entry) = core.listeners.get(&listener) {
            let _ = entry.shutdown.send(());
        }
    }

    /// Block until a batch of events is ready, or until `timeout` expires
    ///
    /// `None` waits indefinitely. On expiry the batch carries a single
    /// `ContainerTimeout` event. After [`Container::stop`] every waiter
    /// eventually receives `ContainerStopped`, and subsequent calls return it
    /// immediately.
    pub async fn wait(&self, timeout: Option<Duration>) -> Batch {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Register interest before checking so a concurrent enqueue
            // cannot slip between the check and the await.
            let mut notified = std::pin::pin!(self.inner.ready_notify.notified());
            notified.as_mut().enable();
            enum Next {
                Connection(ConnectionId, VecDeque<Event>, Arc<EngineSlot>, HandlerRef),
                Container(Event, Option<HandlerRef>),
                Stopped,
                Empty,
            }
            let next = {
                let mut core = self.inner.core.lock().unwrap();
                match core.pop_runnable() {
                    Some(ReadyItem::Connection(id)) => {
                        let entry = core.connections.get_mut(&id).expect("runnable entry");
                        entry.busy = true;
                        let events = std::mem::take(&mut entry.pending);
                        Next::Connection(id, events, entry.slot.clone(), entry.handler.clone())
                    }
                    Some(ReadyItem::Container { event, handler }) => Next::Container(event, handler),
                    None if core.drained() => Next::Stopped,
                    None => Next::Empty,
                }
            };
            match next {
                Next::Connection(id, events, slot, handler) => {
                    let engine = slot.take().await;
                    return Batch::for_connection(
                        self.inner.clone(),
                        id,
                        events,
                        engine,
                        Some(handler),
                    );
                }
                Next::Container(event, handler) => {
                    return Batch::for_container(self.inner.clone(), event, handler);
                }
                Next::Stopped => {
                    return Batch::for_container(
                        self.inner.clone(),
                        Event::ContainerStopped,
                        self.inner.container_handler.clone(),
                    );
                }
                Next::Empty => match deadline {
                    None => notified.await,
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            return Batch::for_container(
                                self.inner.clone(),
                                Event::ContainerTimeout,
                                self.inner.container_handler.clone(),
                            );
                        }
                    }
                },
            }
        }
    }

    /// Mark a batch fully consumed, releasing its connection for the next
    /// batch and flushing any output the handler staged
    pub fn done(&self, batch: Batch) {
        drop(batch);
    }

    /// Cause exactly one waiter (or the next `wait` call) to receive a
    /// `ContainerInterrupt` event carrying `context`
    pub fn interrupt(&self, context: impl Any + Send) {
        let mut core = self.inner.core.lock().unwrap();
        core.ready.push_back(ReadyItem::Container {
            event: Event::ContainerInterrupt {
                context: EventContext::new(context),
            },
            handler: self.inner.container_handler.clone(),
        });
        drop(core);
        self.inner.ready_notify.notify_one();
    }

    /// After `delay`, deliver a `ContainerTimer` event carrying `context`
    ///
    /// The event is delivered no earlier than `delay` after this call
    /// returns. Thread-safe.
    pub fn schedule(&self, delay: Duration, context: impl Any + Send) {
        let mut core = self.inner.core.lock().unwrap();
        if core.stopping {
            return;
        }
        let seq = core.next_timer;
        core.next_timer += 1;
        core.timers.push(Reverse(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            context: EventContext::new(context),
        }));
        drop(core);
        self.inner.timer_notify.notify_one();
    }

    /// Deliver a `ContainerInject` event to `connection`, serialized with its
    /// other events; per-connection FIFO in call order. Thread-safe.
    pub fn inject(&self, connection: ConnectionId, context: impl Any + Send) -> AmqpResult<()> {
        self.push_connection_event(
            connection,
            Event::ContainerInject {
                connection,
                context: EventContext::new(context),
            },
        )
    }

    /// Equivalent to [`Container::inject`] on every currently known connection
    pub fn inject_all(&self, context: impl Any + Send + Clone) {
        let ids: Vec<ConnectionId> = {
            let core = self.inner.core.lock().unwrap();
            core.connections.keys().copied().collect()
        };
        for id in ids {
            let _ = self.inject(id, context.clone());
        }
    }

    /// Deliver a `ConnectionWake` event to `connection`
    pub fn wake(&self, connection: ConnectionId) -> AmqpResult<()> {
        self.push_connection_event(connection, Event::ConnectionWake { connection })
    }

    fn push_connection_event(&self, connection: ConnectionId, event: Event) -> AmqpResult<()> {
        let mut core = self.inner.core.lock().unwrap();
        let entry = core
            .connections
            .get_mut(&connection)
            .ok_or_else(|| AmqpError::connection(format!("unknown connection {}", connection)))?;
        entry.pending.push_back(event);
        core.enqueue_connection(connection);
        drop(core);
        self.inner.ready_notify.notify_one();
        Ok(())
    }

    /// Stop the container: abort all connections, close all listeners
    ///
    /// Final events are still delivered so handlers observe `TransportClosed`
    /// on every connection; once everything has drained, waiters receive
    /// `ContainerStopped`. Idempotent.
    pub fn stop(&self) {
        let mut core = self.inner.core.lock().unwrap();
        if core.stopping {
            return;
        }
        core.stopping = true;
        core.timers.clear();
        log::debug!("container {}: stopping", self.inner.id);
        for entry in core.connections.values() {
            let _ = entry.ctrl.send(DriverCommand::Abort(Condition::of(
                names::FORCED,
                "container stopped",
            )));
        }
        for entry in core.listeners.values() {
            let _ = entry.shutdown.send(());
        }
        drop(core);
        self.inner.ready_notify.notify_waiters();
        self.inner.timer_notify.notify_waiters();
    }

    /// Dispatch batches to their handlers until the container is stopped
    ///
    /// Connection batches go to the handler given to `connect` or `listen`;
    /// container batches go to the builder's container handler, if any.
    /// Multiple tasks may call `run` concurrently to process connections in
    /// parallel.
    pub async fn run(&self) {
        loop {
            let mut batch = self.wait(None).await;
            let stopped = batch.contains(EventKind::ContainerStopped);
            if let Some(handler) = batch.handler.clone() {
                handler.lock().unwrap().handle(&mut batch);
            }
            self.done(batch);
            if stopped {
                break;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeliveryState;
    use crate::frame::Role;
    use bytes::Bytes;

    const LONG: Option<Duration> = Some(Duration::from_secs(10));
    const SHORT: Option<Duration> = Some(Duration::from_millis(200));

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn noop(_: &mut Batch) {}

    /// Minimal server behavior: answer the peer's Open.
    fn server_act(event: &Event, batch: &mut Batch) {
        if event.kind() == EventKind::ConnectionRemoteOpen {
            batch.engine().unwrap().connection().open();
        }
    }

    /// Process batches, applying `act` to every event, until an event of
    /// `until` has been handled. Returns every event kind seen.
    async fn collect_until(
        container: &Container,
        until: EventKind,
        mut act: impl FnMut(&Event, &mut Batch),
    ) -> Vec<EventKind> {
        let mut seen = Vec::new();
        loop {
            let mut batch = container.wait(LONG).await;
            let mut hit = false;
            while let Some(event) = batch.next() {
                let kind = event.kind();
                assert_ne!(
                    kind,
                    EventKind::ContainerTimeout,
                    "timed out waiting for {:?}, saw {:?}",
                    until,
                    seen
                );
                act(&event, &mut batch);
                seen.push(kind);
                if kind == until {
                    hit = true;
                }
            }
            container.done(batch);
            if hit {
                return seen;
            }
        }
    }

    /// Drain batches until `ContainerStopped` arrives.
    async fn drain_until_stopped(container: &Container) -> Vec<EventKind> {
        let mut seen = Vec::new();
        loop {
            let mut batch = container.wait(LONG).await;
            let mut stopped = false;
            while let Some(event) = batch.next() {
                let kind = event.kind();
                assert_ne!(kind, EventKind::ContainerTimeout, "stop did not drain: {:?}", seen);
                stopped |= kind == EventKind::ContainerStopped;
                seen.push(kind);
            }
            container.done(batch);
            if stopped {
                return seen;
            }
        }
    }

    /// Assert that `expected` appears as a subsequence of `seen`.
    fn assert_ordered(seen: &[EventKind], expected: &[EventKind]) {
        let mut index = 0;
        for kind in expected {
            match seen[index..].iter().position(|k| k == kind) {
                Some(offset) => index += offset + 1,
                None => panic!("{:?} not found in order in {:?}", kind, seen),
            }
        }
    }

    /// A listening server container plus a client container connected to it.
    async fn listen_connect_pair() -> (Container, Container, ListenerId, ConnectionId) {
        init_logging();
        let server = Container::new("server");
        let listener = server.listen("amqp://127.0.0.1:0", noop).unwrap();
        let mut batch = server.wait(LONG).await;
        let addr = match batch.next().expect("listener event") {
            Event::ListenerOpen { addr, .. } => addr,
            other => panic!("expected ListenerOpen, got {:?}", other),
        };
        server.done(batch);

        let client = Container::new("client");
        let id = client
            .connect(&format!("127.0.0.1:{}", addr.port()), noop)
            .unwrap();
        (server, client, listener, id)
    }

    #[tokio::test]
    async fn test_interrupt_then_timer() {
        let container = Container::new("interrupt-timer");
        container.interrupt("a");
        let mut batch = container.wait(LONG).await;
        let event = batch.next().expect("interrupt event");
        assert_eq!(event.kind(), EventKind::ContainerInterrupt);
        assert_eq!(event.context::<&str>(), Some(&"a"));
        container.done(batch);

        container.schedule(Duration::from_millis(1), "b");
        let mut batch = container.wait(LONG).await;
        let event = batch.next().expect("timer event");
        assert_eq!(event.kind(), EventKind::ContainerTimer);
        assert_eq!(event.context::<&str>(), Some(&"b"));
        container.done(batch);
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let container = Container::new("timeout");
        let mut batch = container.wait(Some(Duration::from_millis(20))).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerTimeout));
        container.done(batch);
    }

    #[tokio::test]
    async fn test_schedule_fires_no_earlier_than_delay() {
        let container = Container::new("schedule");
        let delay = Duration::from_millis(80);
        let start = std::time::Instant::now();
        container.schedule(delay, 7u32);
        let mut batch = container.wait(LONG).await;
        let event = batch.next().expect("timer event");
        assert_eq!(event.kind(), EventKind::ContainerTimer);
        assert_eq!(event.context::<u32>(), Some(&7));
        assert!(start.elapsed() >= delay);
        container.done(batch);
    }

    #[tokio::test]
    async fn test_timers_fire_in_deadline_order() {
        let container = Container::new("timer-order");
        container.schedule(Duration::from_millis(60), "late");
        container.schedule(Duration::from_millis(10), "early");
        let mut contexts = Vec::new();
        while contexts.len() < 2 {
            let mut batch = container.wait(LONG).await;
            while let Some(event) = batch.next() {
                assert_eq!(event.kind(), EventKind::ContainerTimer);
                contexts.push(*event.context::<&str>().unwrap());
            }
            container.done(batch);
        }
        assert_eq!(contexts, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn test_connect_bad_address() {
        let container = Container::new("bad-address");
        let id = container.connect("127.0.0.1:1", noop).unwrap();

        let mut condition_set = false;
        let seen = collect_until(&container, EventKind::TransportClosed, |event, _| {
            assert_eq!(event.connection(), Some(id));
            if let Event::TransportClosed { condition, .. } = event {
                condition_set = condition.as_ref().is_some_and(|c| c.is_set());
            }
        })
        .await;
        assert_eq!(
            seen,
            vec![EventKind::ConnectionInit, EventKind::TransportClosed]
        );
        assert!(condition_set, "transport condition must be set");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_listen_connect_open_close() {
        let (server, client, _listener, _id) = listen_connect_pair().await;

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };

        let client_seen = collect_until(&client, EventKind::TransportClosed, |event, batch| {
            if event.kind() == EventKind::ConnectionRemoteOpen {
                batch.engine().unwrap().connection().close(None);
            }
        })
        .await;
        let server_seen = server_task.await.unwrap();

        for seen in [&client_seen, &server_seen] {
            assert_ordered(
                seen,
                &[
                    EventKind::ConnectionRemoteOpen,
                    EventKind::ConnectionRemoteClose,
                    EventKind::TransportClosed,
                ],
            );
        }
        assert_ordered(
            &server_seen,
            &[EventKind::ListenerAccept, EventKind::ConnectionInit],
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_wake() {
        let (server, client, _listener, id) = listen_connect_pair().await;
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };
        collect_until(&client, EventKind::ConnectionRemoteOpen, |_, _| {}).await;

        client.wake(id).unwrap();
        let mut batch = client.wait(LONG).await;
        assert_eq!(batch.connection_id(), Some(id));
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ConnectionWake));
        assert_eq!(batch.next().map(|e| e.kind()), None);
        client.done(batch);

        // Nothing else arrives until there is protocol activity again.
        let mut batch = client.wait(SHORT).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerTimeout));
        client.done(batch);

        client.stop();
        drain_until_stopped(&client).await;
        server_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_container_inactive_fires_once() {
        let (server, client, listener, _id) = listen_connect_pair().await;
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };
        collect_until(&client, EventKind::TransportClosed, |event, batch| {
            if event.kind() == EventKind::ConnectionRemoteOpen {
                batch.engine().unwrap().connection().close(None);
            }
        })
        .await;
        server_task.await.unwrap();

        // Client: last connection finalized, no listeners.
        let seen = collect_until(&client, EventKind::ContainerInactive, |_, _| {}).await;
        assert_eq!(seen, vec![EventKind::ContainerInactive]);
        let mut batch = client.wait(SHORT).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerTimeout));
        client.done(batch);

        // Server: inactive only once its listener closes too.
        server.close_listener(listener);
        let seen = collect_until(&server, EventKind::ContainerInactive, |_, _| {}).await;
        assert_ordered(
            &seen,
            &[EventKind::ListenerClose, EventKind::ContainerInactive],
        );
        let mut batch = server.wait(SHORT).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerTimeout));
        server.done(batch);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_and_ack_one_hundred() {
        let (server, client, _listener, _id) = listen_connect_pair().await;

        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, |event, batch| match event {
                    Event::ConnectionRemoteOpen { .. } => {
                        batch.engine().unwrap().connection().open();
                    }
                    Event::LinkRemoteOpen { link, role, .. } => {
                        assert_eq!(*role, Role::Receiver);
                        batch.engine().unwrap().connection().flow(*link, 100).unwrap();
                    }
                    Event::Delivery { link, delivery, .. } => {
                        assert!(delivery.payload.is_some());
                        batch
                            .engine()
                            .unwrap()
                            .connection()
                            .accept(*link, delivery.id)
                            .unwrap();
                    }
                    _ => {}
                })
                .await
            })
        };

        let mut sent = false;
        let mut acks = Vec::new();
        let mut tags = Vec::new();
        collect_until(&client, EventKind::TransportClosed, |event, batch| match event {
            Event::ConnectionRemoteOpen { .. } => {
                let connection = batch.engine().unwrap().connection();
                let channel = connection.begin_session().unwrap();
                connection.attach_sender(channel, "sender-1", "examples").unwrap();
            }
            Event::LinkFlow { link, credit, .. } => {
                if !sent {
                    assert_eq!(*credit, 100);
                    let connection = batch.engine().unwrap().connection();
                    for i in 1..=100u32 {
                        connection
                            .send(
                                *link,
                                format!("tag-{:03}", i).into_bytes(),
                                Bytes::from(format!("message {}", i)),
                            )
                            .unwrap();
                    }
                    sent = true;
                }
            }
            Event::Delivery { delivery, .. } => {
                assert_eq!(delivery.remote_state, Some(DeliveryState::Accepted));
                assert!(delivery.settled);
                acks.push(delivery.id);
                tags.push(delivery.tag.clone());
                if acks.len() == 100 {
                    batch.engine().unwrap().connection().close(None);
                }
            }
            _ => {}
        })
        .await;
        server_task.await.unwrap();

        assert_eq!(acks, (0..100).collect::<Vec<_>>());
        let expected: Vec<Bytes> = (1..=100u32)
            .map(|i| Bytes::from(format!("tag-{:03}", i)))
            .collect();
        assert_eq!(tags, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inject_order_per_connection() {
        let (server, client, _listener, id) = listen_connect_pair().await;
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };

        for i in 0..10u32 {
            client.inject(id, i).unwrap();
        }
        client.inject(id, "close").unwrap();

        let mut injected = Vec::new();
        collect_until(&client, EventKind::TransportClosed, |event, batch| {
            if let Some(value) = event.context::<u32>() {
                injected.push(*value);
            }
            if event.context::<&str>() == Some(&"close") {
                batch.engine().unwrap().connection().close(None);
            }
        })
        .await;
        assert_eq!(injected, (0..10).collect::<Vec<_>>());
        server_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_batches_serialize_per_connection() {
        let (server, client, _listener, id) = listen_connect_pair().await;
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };
        collect_until(&client, EventKind::ConnectionRemoteOpen, |_, _| {}).await;

        client.wake(id).unwrap();
        let mut first = client.wait(LONG).await;
        assert_eq!(first.connection_id(), Some(id));
        assert_eq!(first.next().map(|e| e.kind()), Some(EventKind::ConnectionWake));

        // While the first batch is out, further events for the connection
        // accumulate but are not dispatched.
        client.wake(id).unwrap();
        let mut blocked = client.wait(SHORT).await;
        assert_eq!(blocked.next().map(|e| e.kind()), Some(EventKind::ContainerTimeout));
        client.done(blocked);

        client.done(first);
        let mut second = client.wait(LONG).await;
        assert_eq!(second.next().map(|e| e.kind()), Some(EventKind::ConnectionWake));
        client.done(second);

        client.stop();
        drain_until_stopped(&client).await;
        server_task.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_aborts_and_reports_stopped() {
        let (server, client, _listener, _id) = listen_connect_pair().await;
        let server_task = {
            let server = server.clone();
            tokio::spawn(async move {
                collect_until(&server, EventKind::TransportClosed, server_act).await
            })
        };
        collect_until(&client, EventKind::ConnectionRemoteOpen, |_, _| {}).await;

        client.stop();
        let seen = drain_until_stopped(&client).await;
        assert_ordered(
            &seen,
            &[
                EventKind::TransportClosed,
                EventKind::ContainerInactive,
                EventKind::ContainerStopped,
            ],
        );

        // Subsequent waits return stopped immediately; new work is refused.
        let mut batch = client.wait(LONG).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerStopped));
        client.done(batch);
        assert!(matches!(
            client.connect("127.0.0.1:1", noop),
            Err(AmqpError::Stopped)
        ));

        server_task.await.unwrap();
        server.stop();
        let seen = drain_until_stopped(&server).await;
        assert_ordered(
            &seen,
            &[
                EventKind::ListenerClose,
                EventKind::ContainerInactive,
                EventKind::ContainerStopped,
            ],
        );
    }

    #[tokio::test]
    async fn test_fresh_container_stops_immediately() {
        let container = Container::new("fresh-stop");
        container.stop();
        let mut batch = container.wait(LONG).await;
        assert_eq!(batch.next().map(|e| e.kind()), Some(EventKind::ContainerStopped));
        container.done(batch);
        assert!(matches!(
            container.listen("amqp://127.0.0.1:0", noop),
            Err(AmqpError::Stopped)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_dispatches_to_handlers() {
        let server = Container::new("run-server");
        let bound: Arc<StdMutex<Option<SocketAddr>>> = Arc::new(StdMutex::new(None));
        let bound_in_handler = bound.clone();
        server
            .listen("amqp://127.0.0.1:0", move |batch: &mut Batch| {
                while let Some(event) = batch.next() {
                    match &event {
                        Event::ListenerOpen { addr, .. } => {
                            *bound_in_handler.lock().unwrap() = Some(*addr);
                        }
                        Event::ConnectionRemoteOpen { .. } => {
                            batch.engine().unwrap().connection().open();
                        }
                        _ => {}
                    }
                }
            })
            .unwrap();
        let server_run = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let addr = loop {
            if let Some(addr) = *bound.lock().unwrap() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        let client = Container::new("run-client");
        let kinds: Arc<StdMutex<Vec<EventKind>>> = Arc::new(StdMutex::new(Vec::new()));
        let kinds_in_handler = kinds.clone();
        client
            .connect(&format!("127.0.0.1:{}", addr.port()), move |batch: &mut Batch| {
                while let Some(event) = batch.next() {
                    kinds_in_handler.lock().unwrap().push(event.kind());
                    match event.kind() {
                        EventKind::ConnectionRemoteOpen => {
                            batch.engine().unwrap().connection().close(None);
                        }
                        EventKind::TransportClosed => batch.container().stop(),
                        _ => {}
                    }
                }
            })
            .unwrap();
        client.run().await;

        let seen = kinds.lock().unwrap().clone();
        assert_ordered(
            &seen,
            &[
                EventKind::ConnectionInit,
                EventKind::ConnectionBound,
                EventKind::ConnectionRemoteOpen,
                EventKind::ConnectionRemoteClose,
                EventKind::TransportClosed,
            ],
        );

        server.stop();
        server_run.await.unwrap();
    }
}
