//! Server implementation.
//!
//! The server owns the domain's rendezvous listener and, per connected
//! client, a transient unique listener plus the accepted unique socket. It
//! routes four rendezvous commands (`handshake`, `discover`, `broadcast`,
//! `emit`), dispatches application commands arriving on unique sockets, and
//! forwards `delivery` replies back to their originators.
//!
//! Concurrency model:
//! - One accept task for the rendezvous listener.
//! - Per socket, one reader task feeding the shared state and one writer task
//!   draining an unbounded channel, so a stalled peer never wedges routing.
//! - All registry/record mutations happen under one mutex; handler dispatch
//!   takes only the registry read lock, so handlers may call back into the
//!   server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{bail, Context};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fabric_shared::codec::{self, StreamDecoder};
use fabric_shared::config::{fresh_channel_id, unique_path, ServerOptions};
use fabric_shared::frame::{codes, Frame};
use fabric_shared::registry::{HandlerContext, HandlerRegistry, HandlerSet};

/// Outbound side of one socket: frames go through an unbounded channel into a
/// dedicated writer task. Sending to a closed channel is the "unwritable
/// socket" case and drops the frame silently.
#[derive(Clone)]
struct FrameSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSink {
    fn spawn(mut write: OwnedWriteHalf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write.write_all(&bytes).await {
                    debug!(error = %e, "socket write failed, closing writer");
                    break;
                }
            }
        });
        Self { tx }
    }

    fn send(&self, frame: &Frame) {
        match frame.encode() {
            Ok(bytes) => {
                let _ = self.tx.send(bytes);
            }
            Err(e) => warn!(error = %e, "dropping unencodable frame"),
        }
    }
}

/// Per-client connection state, keyed by channel id.
struct ClientRecord {
    /// Friendly name; set once the handshake succeeds.
    name: Option<String>,
    rendezvous: FrameSink,
    /// Transient accept task for the unique listener; exists only between
    /// handshake and first accept.
    unique_listener: Option<JoinHandle<()>>,
    unique: Option<FrameSink>,
}

/// Mutable routing state.
#[derive(Default)]
struct State {
    /// Friendly name → channel id. Bijective with the named subset of
    /// `clients`.
    names: HashMap<String, String>,
    /// Channel id → record.
    clients: HashMap<String, ClientRecord>,
    /// Delivery id → originator friendly name.
    deliveries: HashMap<String, String>,
}

struct Shared {
    opts: ServerOptions,
    started: AtomicBool,
    handlers: RwLock<HandlerRegistry>,
    state: Mutex<State>,
}

fn lock_state(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messaging-fabric server for one domain.
pub struct Server {
    shared: Arc<Shared>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                opts,
                started: AtomicBool::new(false),
                handlers: RwLock::new(HandlerRegistry::new()),
                state: Mutex::new(State::default()),
            }),
            accept_task: Mutex::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.shared.opts.domain
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Registers application handlers, rejecting reserved names and
    /// duplicates. Callable before or after `start`.
    pub fn add_handlers(&self, set: HandlerSet) -> anyhow::Result<()> {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_set(set)
    }

    /// Unlinks any stale rendezvous socket file, binds the rendezvous
    /// listener, and begins accepting clients.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            bail!("server already started on domain '{}'", self.domain());
        }

        let path = self.shared.opts.rendezvous_path();
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("unlink stale socket {}", path.display()))?;
        }
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.started.store(false, Ordering::SeqCst);
                return Err(e).with_context(|| format!("bind rendezvous {}", path.display()));
            }
        };

        info!(domain = %self.domain(), path = %path.display(), "server listening");

        let shared = self.shared.clone();
        let handle = tokio::spawn(accept_loop(listener, shared));
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// Writes a frame to the named client's unique socket if present and
    /// writable; otherwise a silent no-op.
    pub fn emit(&self, name: &str, command: &str, data: Value, delivery: Option<String>) {
        let state = lock_state(&self.shared);
        emit_to(&state, name, command, data, delivery);
    }

    /// Writes the frame to every connected client's unique socket, skipping
    /// the one named `initiator`.
    pub fn broadcast(&self, command: &str, data: Value, initiator: Option<&str>) {
        let state = lock_state(&self.shared);
        broadcast_to(&state, command, data, initiator);
    }

    /// Currently connected friendly names, sorted.
    pub fn client_names(&self) -> Vec<String> {
        let state = lock_state(&self.shared);
        let mut names: Vec<String> = state.names.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(handle) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if self.shared.started.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(self.shared.opts.rendezvous_path());
        }
        // Dropping records closes writer channels, which closes the sockets.
        let mut state = lock_state(&self.shared);
        for (uuid, record) in state.clients.drain() {
            if let Some(handle) = record.unique_listener {
                handle.abort();
                let _ = std::fs::remove_file(unique_path(&self.shared.opts.domain, &uuid));
            }
        }
        state.names.clear();
        state.deliveries.clear();
    }
}

async fn accept_loop(listener: UnixListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => register_rendezvous(&shared, stream),
            Err(e) => {
                warn!(error = %e, "rendezvous accept failed");
            }
        }
    }
}

/// Allocates a channel id for a fresh rendezvous connection and wires up its
/// reader and writer tasks.
fn register_rendezvous(shared: &Arc<Shared>, stream: UnixStream) {
    let uuid = fresh_channel_id();
    let (read, write) = stream.into_split();
    let sink = FrameSink::spawn(write);

    lock_state(shared).clients.insert(
        uuid.clone(),
        ClientRecord {
            name: None,
            rendezvous: sink,
            unique_listener: None,
            unique: None,
        },
    );
    debug!(%uuid, "rendezvous connection accepted");

    let shared = shared.clone();
    tokio::spawn(async move {
        let mut read = read;
        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 8192];
        loop {
            match read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    for frame in decoder.feed(&buf[..n]) {
                        handle_rendezvous_frame(&shared, &uuid, frame);
                    }
                }
            }
        }
        remove_client(&shared, &uuid, "rendezvous socket closed");
    });
}

/// Dispatches one frame arriving on a client's rendezvous socket.
fn handle_rendezvous_frame(shared: &Arc<Shared>, uuid: &str, frame: Frame) {
    match frame.command.as_deref() {
        Some("handshake") => handle_handshake(shared, uuid, frame),
        Some("discover") => handle_discover(shared, uuid),
        Some("broadcast") => {
            let Some(inner) = inner_frame(&frame) else {
                warn!(%uuid, "malformed broadcast envelope");
                return;
            };
            let originator = client_name(shared, uuid);
            let state = lock_state(shared);
            broadcast_to(
                &state,
                inner.command.as_deref().unwrap_or_default(),
                inner.data,
                originator.as_deref(),
            );
        }
        Some("emit") => {
            let Some(inner) = inner_frame(&frame) else {
                warn!(%uuid, "malformed emit envelope");
                return;
            };
            let Some(target) = inner.id.clone() else {
                warn!(%uuid, "emit envelope without target name");
                return;
            };
            let originator = client_name(shared, uuid);
            let mut state = lock_state(shared);
            if let (Some(delivery), Some(originator)) = (frame.delivery.clone(), originator) {
                state.deliveries.insert(delivery, originator);
            }
            emit_to(
                &state,
                &target,
                inner.command.as_deref().unwrap_or_default(),
                inner.data,
                inner.delivery,
            );
        }
        other => {
            debug!(%uuid, command = ?other, "unexpected rendezvous command");
        }
    }
}

fn handle_handshake(shared: &Arc<Shared>, uuid: &str, frame: Frame) {
    let requested = match frame.data {
        Value::String(name) if !name.is_empty() => name,
        other => {
            warn!(%uuid, data = ?other, "handshake without a usable name");
            return;
        }
    };

    let mut state = lock_state(shared);
    let Some(record) = state.clients.get(uuid) else {
        return;
    };
    if record.name.is_some() {
        warn!(%uuid, "repeated handshake on one rendezvous connection ignored");
        return;
    }

    if state.names.contains_key(&requested) {
        info!(name = %requested, "handshake rejected, name taken");
        record
            .rendezvous
            .send(&Frame::addressed(requested.as_str(), "error", json!(codes::NAME_TAKEN)));
        return;
    }

    let path = unique_path(&shared.opts.domain, uuid);
    let listener = match UnixListener::bind(&path) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "unique listener bind failed");
            return;
        }
    };

    let accept = tokio::spawn(accept_unique(
        shared.clone(),
        uuid.to_string(),
        listener,
        path,
    ));

    state.names.insert(requested.clone(), uuid.to_string());
    if let Some(record) = state.clients.get_mut(uuid) {
        record.name = Some(requested.clone());
        record.unique_listener = Some(accept);
        record
            .rendezvous
            .send(&Frame::addressed(requested.as_str(), "handshake", json!(uuid)));
    }
    info!(name = %requested, %uuid, "handshake accepted");
}

/// Accepts exactly one connection on the client's unique listener, then
/// closes the listener and removes its socket file.
async fn accept_unique(shared: Arc<Shared>, uuid: String, listener: UnixListener, path: PathBuf) {
    let stream = match listener.accept().await {
        Ok((stream, _addr)) => stream,
        Err(e) => {
            warn!(%uuid, error = %e, "unique accept failed");
            let _ = std::fs::remove_file(&path);
            remove_client(&shared, &uuid, "unique accept failed");
            return;
        }
    };
    drop(listener);
    let _ = std::fs::remove_file(&path);

    let (read, write) = stream.into_split();
    let sink = FrameSink::spawn(write);
    {
        let mut state = lock_state(&shared);
        let Some(record) = state.clients.get_mut(&uuid) else {
            return;
        };
        record.unique = Some(sink);
        record.unique_listener = None;
    }
    debug!(%uuid, "unique socket established");

    let mut read = read;
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for frame in decoder.feed(&buf[..n]) {
                    handle_unique_frame(&shared, &uuid, frame);
                }
            }
        }
    }
    remove_client(&shared, &uuid, "unique socket closed");
}

/// Dispatches one frame arriving on a client's unique socket: delivery
/// replies are forwarded to their originator, everything else goes to the
/// application handlers, with an auto-reply when the sender asked for one.
fn handle_unique_frame(shared: &Arc<Shared>, uuid: &str, frame: Frame) {
    if frame.is_command("delivery") {
        let Some(delivery) = frame.delivery else {
            debug!(%uuid, "delivery frame without correlation id");
            return;
        };
        let mut state = lock_state(shared);
        if let Some(originator) = state.deliveries.remove(&delivery) {
            emit_to(&state, &originator, "delivery", frame.data, Some(delivery));
        } else {
            debug!(%uuid, %delivery, "delivery reply with no pending originator");
        }
        return;
    }

    let Some(command) = frame.command else {
        debug!(%uuid, "inbound frame without command");
        return;
    };

    let name = client_name(shared, uuid);
    let ctx = HandlerContext {
        data: frame.data,
        name: name.clone(),
        uuid: Some(uuid.to_string()),
    };
    let result = shared
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .dispatch(&command, &ctx);
    if result.is_none() {
        debug!(%command, "no handler registered");
    }

    if let Some(delivery) = frame.delivery {
        let reply = result.unwrap_or(Value::Null);
        if let Some(name) = name {
            let state = lock_state(shared);
            emit_to(&state, &name, "delivery", reply, Some(delivery));
        }
    }
}

fn handle_discover(shared: &Arc<Shared>, uuid: &str) {
    let handlers = shared
        .handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .names();
    let state = lock_state(shared);
    let mut clients: Vec<String> = state.names.keys().cloned().collect();
    clients.sort();

    let Some(record) = state.clients.get(uuid) else {
        return;
    };
    let reply = Frame::full(
        record.name.clone(),
        Some("discover".into()),
        json!({ "clients": clients, "command_handlers": handlers }),
        None,
    );
    record.rendezvous.send(&reply);
}

/// Extracts the inner serialized frame carried by a relay envelope.
fn inner_frame(envelope: &Frame) -> Option<Frame> {
    let text = envelope.data.as_str()?;
    let inner = codec::parse_str(text).into_iter().next()?;
    if inner.is_command("error") {
        return None;
    }
    Some(inner)
}

fn client_name(shared: &Shared, uuid: &str) -> Option<String> {
    lock_state(shared)
        .clients
        .get(uuid)
        .and_then(|record| record.name.clone())
}

fn emit_to(state: &State, name: &str, command: &str, data: Value, delivery: Option<String>) {
    let Some(uuid) = state.names.get(name) else {
        debug!(%name, "emit to unknown client dropped");
        return;
    };
    let Some(sink) = state.clients.get(uuid).and_then(|r| r.unique.as_ref()) else {
        debug!(%name, "emit before unique socket established, dropped");
        return;
    };
    sink.send(&Frame::full(
        Some(name.to_string()),
        Some(command.to_string()),
        data,
        delivery,
    ));
}

fn broadcast_to(state: &State, command: &str, data: Value, initiator: Option<&str>) {
    for record in state.clients.values() {
        if record.name.is_none() {
            continue;
        }
        if initiator.is_some() && record.name.as_deref() == initiator {
            continue;
        }
        if let Some(sink) = &record.unique {
            sink.send(&Frame::command(command, data.clone()));
        }
    }
}

/// Drops every trace of a client: name entry, unique listener, both sockets,
/// and its unique socket file if the listener never accepted.
fn remove_client(shared: &Shared, uuid: &str, reason: &str) {
    let mut state = lock_state(shared);
    let Some(record) = state.clients.remove(uuid) else {
        return;
    };
    if let Some(handle) = record.unique_listener {
        handle.abort();
        let _ = std::fs::remove_file(unique_path(&shared.opts.domain, uuid));
    }
    if let Some(name) = &record.name {
        state.names.remove(name);
        info!(name = %name, %uuid, %reason, "client removed");
    } else {
        debug!(%uuid, %reason, "unnamed connection removed");
    }
}
