//! Client implementation.
//!
//! The client maintains:
//! - A rendezvous socket to the domain's shared endpoint (handshake,
//!   discovery, relay envelopes)
//! - A unique socket for 1-to-1 traffic once the handshake completes
//! - Two send queues, one per socket, that buffer while offline
//! - Correlators for `deliver` replies and `discover` responses
//! - A fixed-delay reconnect loop
//!
//! All state lives on one owner task. Public methods enqueue work eagerly
//! (before their returned future is first polled) and hand back a future that
//! resolves when the corresponding signal fires, so calls made while offline
//! still land in the queues in call order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use fabric_shared::codec::StreamDecoder;
use fabric_shared::config::{fresh_channel_id, unique_path, ClientOptions};
use fabric_shared::frame::Frame;
use fabric_shared::queue::SendQueue;
use fabric_shared::registry::{HandlerContext, HandlerRegistry, HandlerSet};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Constructed, `connect()` not yet called.
    Idle,
    /// Rendezvous socket connecting.
    ConnectingBcast,
    /// Handshake sent, waiting for the server's reply.
    AwaitingHandshake,
    /// Unique socket connecting.
    ConnectingUnique,
    /// Unique socket open; queues drain.
    Connected,
    /// Sockets torn down; reconnect timer pending.
    Offline,
}

/// Which send queue a frame belongs to.
enum QueueKind {
    Unique,
    Rendezvous,
}

/// Work posted onto the owner task by public methods.
enum Command {
    Connect {
        done: oneshot::Sender<anyhow::Result<()>>,
    },
    Send {
        frame: Frame,
        ack: oneshot::Sender<()>,
    },
    Relay {
        frame: Frame,
        ack: oneshot::Sender<()>,
    },
    Deliver {
        id: String,
        queue: QueueKind,
        frame: Frame,
        sink: oneshot::Sender<Value>,
    },
    Discover {
        sink: oneshot::Sender<Value>,
    },
}

/// Socket-side happenings, tagged with the connection generation so events
/// from a torn-down socket are ignored.
enum Event {
    BcastConnected(UnixStream),
    BcastFrame(Frame),
    BcastClosed,
    UniqueConnected(UnixStream),
    UniqueFrame(Frame),
    UniqueClosed,
    ConnectFailed,
    ReconnectTick,
}

struct Flags {
    is_connecting: AtomicBool,
    is_connected: AtomicBool,
}

/// Messaging-fabric client for one domain.
pub struct Client {
    opts: ClientOptions,
    cmd_tx: mpsc::UnboundedSender<Command>,
    flags: Arc<Flags>,
    handlers: Arc<RwLock<HandlerRegistry>>,
}

impl Client {
    /// Builds the client and spawns its owner task. No sockets are opened
    /// until [`Client::connect`].
    pub fn new(opts: ClientOptions) -> Self {
        let flags = Arc::new(Flags {
            is_connecting: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
        });
        let handlers = Arc::new(RwLock::new(HandlerRegistry::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            opts: opts.clone(),
            flags: flags.clone(),
            handlers: handlers.clone(),
            cmd_rx,
            event_tx,
            event_rx,
            generation: 0,
            state: ConnState::Idle,
            channel_id: None,
            bcast_write: None,
            unique_write: None,
            unique_queue: SendQueue::new(),
            bcast_queue: SendQueue::new(),
            pending_deliveries: HashMap::new(),
            pending_discovery: Vec::new(),
            connect_waiters: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self {
            opts,
            cmd_tx,
            flags,
            handlers,
        }
    }

    pub fn name(&self) -> &str {
        &self.opts.name
    }

    pub fn is_connected(&self) -> bool {
        self.flags.is_connected.load(Ordering::SeqCst)
    }

    /// True once `connect()` has been called and the client is either
    /// connected or trying to be.
    pub fn is_started(&self) -> bool {
        self.flags.is_connecting.load(Ordering::SeqCst) || self.is_connected()
    }

    /// Registers application handlers, rejecting reserved names and
    /// duplicates.
    pub fn add_handlers(&self, set: HandlerSet) -> anyhow::Result<()> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_set(set)
    }

    /// Connects to the domain: rendezvous socket, handshake, unique socket.
    /// Resolves once the unique socket is open. Fails immediately when the
    /// client is already connecting or connected.
    pub fn connect(&self) -> impl Future<Output = anyhow::Result<()>> {
        let (done, rx) = oneshot::channel();
        let queued = self.post(Command::Connect { done });
        async move {
            queued?;
            rx.await.context("client disposed")?
        }
    }

    /// Sends a command to the server over the unique socket. Resolves once
    /// the frame has been fully written.
    pub fn send(&self, command: &str, data: Value) -> impl Future<Output = anyhow::Result<()>> {
        let frame = Frame::command(command, data);
        let (ack, rx) = oneshot::channel();
        let queued = self.post(Command::Send { frame, ack });
        async move {
            queued?;
            rx.await.context("client disposed")?;
            Ok(())
        }
    }

    /// Relays a command to another named client, fire-and-forget. Resolves
    /// once the envelope has been written to the rendezvous socket.
    pub fn emit(
        &self,
        name: &str,
        command: &str,
        data: Value,
    ) -> impl Future<Output = anyhow::Result<()>> {
        let (ack, rx) = oneshot::channel();
        let queued = Frame::addressed(name, command, data)
            .encode_string()
            .map(|inner| Frame::command("emit", Value::String(inner)))
            .and_then(|frame| self.post(Command::Relay { frame, ack }));
        async move {
            queued?;
            rx.await.context("client disposed")?;
            Ok(())
        }
    }

    /// Broadcasts a command to every other client in the domain.
    pub fn broadcast(
        &self,
        command: &str,
        data: Value,
    ) -> impl Future<Output = anyhow::Result<()>> {
        let (ack, rx) = oneshot::channel();
        let queued = Frame::command(command, data)
            .encode_string()
            .map(|inner| Frame::command("broadcast", Value::String(inner)))
            .and_then(|frame| self.post(Command::Relay { frame, ack }));
        async move {
            queued?;
            rx.await.context("client disposed")?;
            Ok(())
        }
    }

    /// Asks the server for the domain roster:
    /// `{"clients": […], "command_handlers": […]}`. Concurrent calls share
    /// one pending request.
    pub fn discover(&self) -> impl Future<Output = anyhow::Result<Value>> {
        let (sink, rx) = oneshot::channel();
        let queued = self.post(Command::Discover { sink });
        async move {
            queued?;
            rx.await.context("client disposed")
        }
    }

    /// Sends a command to the server and resolves with the handler's reply
    /// value (null when the handler returned none).
    pub fn deliver(
        &self,
        command: &str,
        data: Value,
    ) -> impl Future<Output = anyhow::Result<Value>> {
        let id = fresh_channel_id();
        let frame = Frame::command(command, data).with_delivery(id.as_str());
        let (sink, rx) = oneshot::channel();
        let queued = self.post(Command::Deliver {
            id,
            queue: QueueKind::Unique,
            frame,
            sink,
        });
        async move {
            queued?;
            rx.await.context("client disposed")
        }
    }

    /// Relays a command to another named client and resolves with that
    /// client's handler reply.
    pub fn deliver_to(
        &self,
        name: &str,
        command: &str,
        data: Value,
    ) -> impl Future<Output = anyhow::Result<Value>> {
        let id = fresh_channel_id();
        let (sink, rx) = oneshot::channel();
        let queued = Frame::addressed(name, command, data)
            .with_delivery(id.as_str())
            .encode_string()
            .map(|inner| Frame::command("emit", Value::String(inner)).with_delivery(id.as_str()))
            .and_then(|frame| {
                self.post(Command::Deliver {
                    id,
                    queue: QueueKind::Rendezvous,
                    frame,
                    sink,
                })
            });
        async move {
            queued?;
            rx.await.context("client disposed")
        }
    }

    fn post(&self, command: Command) -> anyhow::Result<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| anyhow!("client disposed"))
    }
}

struct Actor {
    opts: ClientOptions,
    flags: Arc<Flags>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<(u64, Event)>,
    event_rx: mpsc::UnboundedReceiver<(u64, Event)>,
    /// Bumped on every teardown; events from older sockets are ignored.
    generation: u64,
    state: ConnState,
    channel_id: Option<String>,
    bcast_write: Option<OwnedWriteHalf>,
    unique_write: Option<OwnedWriteHalf>,
    unique_queue: SendQueue,
    bcast_queue: SendQueue,
    pending_deliveries: HashMap<String, oneshot::Sender<Value>>,
    pending_discovery: Vec<oneshot::Sender<Value>>,
    connect_waiters: Vec<oneshot::Sender<anyhow::Result<()>>>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // Owner dropped: discard pending sinks so awaiting
                    // callers observe disposal.
                    None => break,
                },
                event = self.event_rx.recv() => {
                    if let Some((gen, event)) = event {
                        if gen == self.generation {
                            self.handle_event(event).await;
                        }
                    }
                }
            }
        }
        debug!(name = %self.opts.name, "client disposed");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { done } => {
                if self.state != ConnState::Idle {
                    let _ = done.send(Err(anyhow!(
                        "connect() while already connecting or connected"
                    )));
                    return;
                }
                self.flags.is_connecting.store(true, Ordering::SeqCst);
                self.connect_waiters.push(done);
                self.start_bcast_connect();
            }
            Command::Send { frame, ack } => {
                self.enqueue(QueueKind::Unique, frame, Some(ack)).await;
            }
            Command::Relay { frame, ack } => {
                self.enqueue(QueueKind::Rendezvous, frame, Some(ack)).await;
            }
            Command::Deliver {
                id,
                queue,
                frame,
                sink,
            } => {
                self.pending_deliveries.insert(id, sink);
                self.enqueue(queue, frame, None).await;
            }
            Command::Discover { sink } => {
                self.pending_discovery.push(sink);
                // Only the first concurrent caller puts a request on the
                // wire; the rest share the pending result.
                if self.pending_discovery.len() == 1 {
                    self.enqueue(
                        QueueKind::Rendezvous,
                        Frame::command("discover", Value::Null),
                        None,
                    )
                    .await;
                }
            }
        }
    }

    async fn enqueue(&mut self, queue: QueueKind, frame: Frame, ack: Option<oneshot::Sender<()>>) {
        let result = match queue {
            QueueKind::Unique => self.unique_queue.push(&frame, ack),
            QueueKind::Rendezvous => self.bcast_queue.push(&frame, ack),
        };
        if let Err(e) = result {
            warn!(error = %e, "dropping unencodable frame");
            return;
        }
        match queue {
            QueueKind::Unique => self.drain_unique().await,
            QueueKind::Rendezvous => self.drain_bcast().await,
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::BcastConnected(stream) => self.on_bcast_connected(stream).await,
            Event::BcastFrame(frame) => self.on_bcast_frame(frame).await,
            Event::UniqueConnected(stream) => self.on_unique_connected(stream).await,
            Event::UniqueFrame(frame) => self.on_unique_frame(frame).await,
            Event::BcastClosed | Event::UniqueClosed | Event::ConnectFailed => {
                self.go_offline();
            }
            Event::ReconnectTick => {
                if self.state == ConnState::Offline {
                    self.start_bcast_connect();
                }
            }
        }
    }

    /// Spawns the rendezvous connector for the current generation.
    fn start_bcast_connect(&mut self) {
        self.state = ConnState::ConnectingBcast;
        let path = self.opts.rendezvous_path();
        let tx = self.event_tx.clone();
        let gen = self.generation;
        tokio::spawn(async move {
            let event = match UnixStream::connect(&path).await {
                Ok(stream) => Event::BcastConnected(stream),
                Err(_) => Event::ConnectFailed,
            };
            let _ = tx.send((gen, event));
        });
    }

    async fn on_bcast_connected(&mut self, stream: UnixStream) {
        let (read, write) = stream.into_split();
        self.bcast_write = Some(write);
        self.spawn_reader(read, false);

        // The handshake bypasses the queues: it must be the first frame on a
        // fresh rendezvous socket.
        let handshake = Frame::command("handshake", json!(self.opts.name));
        let Ok(bytes) = handshake.encode() else {
            self.go_offline();
            return;
        };
        let Some(write) = self.bcast_write.as_mut() else {
            return;
        };
        if write.write_all(&bytes).await.is_err() {
            self.go_offline();
            return;
        }
        self.state = ConnState::AwaitingHandshake;
        debug!(name = %self.opts.name, "handshake sent");
    }

    async fn on_bcast_frame(&mut self, frame: Frame) {
        if frame.is_command("handshake") {
            if self.state == ConnState::AwaitingHandshake
                && frame.id.as_deref() == Some(self.opts.name.as_str())
            {
                let Some(channel_id) = frame.data.as_str().map(str::to_string) else {
                    warn!("handshake reply without channel id");
                    self.go_offline();
                    return;
                };
                debug!(%channel_id, "handshake accepted, opening unique socket");
                self.channel_id = Some(channel_id.clone());
                self.state = ConnState::ConnectingUnique;

                let path = unique_path(&self.opts.domain, &channel_id);
                let tx = self.event_tx.clone();
                let gen = self.generation;
                tokio::spawn(async move {
                    let event = match UnixStream::connect(&path).await {
                        Ok(stream) => Event::UniqueConnected(stream),
                        Err(_) => Event::ConnectFailed,
                    };
                    let _ = tx.send((gen, event));
                });
            }
            return;
        }
        if frame.is_command("error") {
            if self.state == ConnState::AwaitingHandshake {
                warn!(name = %self.opts.name, code = %frame.data, "handshake rejected");
                self.go_offline();
            } else {
                debug!(code = %frame.data, "error frame on rendezvous socket");
            }
            return;
        }
        if frame.is_command("discover") {
            for sink in self.pending_discovery.drain(..) {
                let _ = sink.send(frame.data.clone());
            }
            return;
        }
        debug!(command = ?frame.command, "unexpected rendezvous frame");
    }

    async fn on_unique_connected(&mut self, stream: UnixStream) {
        let (read, write) = stream.into_split();
        self.unique_write = Some(write);
        self.spawn_reader(read, true);

        self.state = ConnState::Connected;
        self.flags.is_connected.store(true, Ordering::SeqCst);
        self.flags.is_connecting.store(false, Ordering::SeqCst);
        info!(name = %self.opts.name, domain = %self.opts.domain, "connected");

        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.drain_bcast().await;
        self.drain_unique().await;
    }

    async fn on_unique_frame(&mut self, frame: Frame) {
        if frame.is_command("delivery") {
            let Some(id) = frame.delivery else {
                debug!("delivery frame without correlation id");
                return;
            };
            if let Some(sink) = self.pending_deliveries.remove(&id) {
                let _ = sink.send(frame.data);
            } else {
                debug!(%id, "delivery reply with no pending sink");
            }
            return;
        }

        let Some(command) = frame.command else {
            debug!("inbound frame without command");
            return;
        };
        let ctx = HandlerContext {
            data: frame.data,
            name: Some(self.opts.name.clone()),
            uuid: self.channel_id.clone(),
        };
        let result = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .dispatch(&command, &ctx);
        if result.is_none() {
            debug!(%command, "no handler registered");
        }

        // The sender asked for a reply: answer over the unique socket so the
        // server can route it back.
        if let Some(delivery) = frame.delivery {
            let reply = Frame::full(
                Some(self.opts.name.clone()),
                Some("delivery".into()),
                result.unwrap_or(Value::Null),
                Some(delivery),
            );
            self.enqueue(QueueKind::Unique, reply, None).await;
        }
    }

    /// Tears down both sockets, keeps the queues and pending correlators,
    /// and arms the reconnect timer.
    fn go_offline(&mut self) {
        self.generation += 1;
        self.state = ConnState::Offline;
        self.channel_id = None;
        self.bcast_write = None;
        self.unique_write = None;
        self.flags.is_connected.store(false, Ordering::SeqCst);
        self.flags.is_connecting.store(true, Ordering::SeqCst);

        let delay = self.opts.reconnect_delay();
        let tx = self.event_tx.clone();
        let gen = self.generation;
        info!(name = %self.opts.name, delay_ms = delay.as_millis() as u64, "offline, will reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send((gen, Event::ReconnectTick));
        });
    }

    /// Spawns a reader task that feeds decoded frames back to the owner task
    /// until the socket closes.
    fn spawn_reader(&self, read: OwnedReadHalf, unique: bool) {
        let tx = self.event_tx.clone();
        let gen = self.generation;
        tokio::spawn(async move {
            let mut read = read;
            let mut decoder = StreamDecoder::new();
            let mut buf = vec![0u8; 8192];
            loop {
                match read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        for frame in decoder.feed(&buf[..n]) {
                            let event = if unique {
                                Event::UniqueFrame(frame)
                            } else {
                                Event::BcastFrame(frame)
                            };
                            if tx.send((gen, event)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            let closed = if unique {
                Event::UniqueClosed
            } else {
                Event::BcastClosed
            };
            let _ = tx.send((gen, closed));
        });
    }

    async fn drain_unique(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }
        let Some(write) = self.unique_write.as_mut() else {
            return;
        };
        if self.unique_queue.drain(write).await.is_err() {
            self.go_offline();
        }
    }

    async fn drain_bcast(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }
        let Some(write) = self.bcast_write.as_mut() else {
            return;
        };
        if self.bcast_queue.drain(write).await.is_err() {
            self.go_offline();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn double_connect_is_rejected() {
        let opts = ClientOptions {
            domain: format!("t-{}", fresh_channel_id()),
            reconnect_ms: 50,
            ..Default::default()
        };
        let client = Client::new(opts);
        // No server: the first connect stays pending in the retry loop.
        let first = client.connect();
        tokio::pin!(first);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), &mut first)
            .await
            .is_err());
        assert!(client.is_started());
        assert!(!client.is_connected());
        // A second connect fails the precondition immediately.
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn disposal_fails_pending_results() {
        let opts = ClientOptions {
            domain: format!("t-{}", fresh_channel_id()),
            reconnect_ms: 50,
            ..Default::default()
        };
        let client = Client::new(opts);
        let pending = client.deliver("ping", Value::Null);
        drop(client);
        assert!(pending.await.is_err());
    }
}
