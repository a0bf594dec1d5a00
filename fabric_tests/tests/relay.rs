//! Client-to-client routing through the server: emit, deliver, broadcast.

use std::time::Duration;

use fabric_client::Client;
use fabric_server::Server;
use fabric_shared::registry::HandlerSet;
use fabric_tests::{client_opts, init_tracing, server_opts, test_domain};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(2);

/// Fire-and-forget relay: the target's handler sees the payload under its
/// own name.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emit_reaches_named_client() -> anyhow::Result<()> {
    init_tracing();
    let domain = test_domain("emit");
    let server = Server::new(server_opts(&domain));
    server.start().await?;

    let c1 = Client::new(client_opts(&domain, "c1"));
    let c2 = Client::new(client_opts(&domain, "c2"));
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(Value, Option<String>)>();
    c2.add_handlers(HandlerSet::new().on("note", move |ctx| {
        let _ = seen_tx.send((ctx.data.clone(), ctx.name.clone()));
        None
    }))?;
    timeout(DEADLINE, c1.connect()).await??;
    timeout(DEADLINE, c2.connect()).await??;

    timeout(DEADLINE, c1.emit("c2", "note", json!({"n": 5}))).await??;

    let (data, name) = timeout(DEADLINE, seen_rx.recv())
        .await?
        .expect("handler invoked");
    assert_eq!(data, json!({"n": 5}));
    assert_eq!(name.as_deref(), Some("c2"));
    Ok(())
}

/// Relay with delivery: the callee's return value travels back through the
/// server to the original requester.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deliver_to_other_client_round_trips() -> anyhow::Result<()> {
    init_tracing();
    let domain = test_domain("relay");
    let server = Server::new(server_opts(&domain));
    server.start().await?;

    let c1 = Client::new(client_opts(&domain, "c1"));
    let c2 = Client::new(client_opts(&domain, "c2"));
    c2.add_handlers(HandlerSet::new().on("echo", |ctx| {
        let text = ctx.data.as_str().unwrap_or_default().to_uppercase();
        Some(json!(text))
    }))?;
    timeout(DEADLINE, c1.connect()).await??;
    timeout(DEADLINE, c2.connect()).await??;

    let result = timeout(DEADLINE, c1.deliver_to("c2", "echo", json!("hi"))).await??;
    assert_eq!(result, json!("HI"));
    Ok(())
}

/// A client-initiated broadcast reaches every other client but never its
/// originator.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_excludes_originator() -> anyhow::Result<()> {
    init_tracing();
    let domain = test_domain("bcast");
    let server = Server::new(server_opts(&domain));
    server.start().await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
    let mut clients = Vec::new();
    for name in ["c1", "c2", "c3"] {
        let client = Client::new(client_opts(&domain, name));
        let tx = seen_tx.clone();
        let tag = name.to_string();
        client.add_handlers(HandlerSet::new().on("chat", move |_ctx| {
            let _ = tx.send(tag.clone());
            None
        }))?;
        timeout(DEADLINE, client.connect()).await??;
        clients.push(client);
    }

    timeout(DEADLINE, clients[0].broadcast("chat", json!("hello"))).await??;

    let mut received = Vec::new();
    for _ in 0..2 {
        received.push(
            timeout(DEADLINE, seen_rx.recv())
                .await?
                .expect("handler invoked"),
        );
    }
    received.sort();
    assert_eq!(received, vec!["c2", "c3"]);
    // The originator stays silent.
    assert!(timeout(Duration::from_millis(300), seen_rx.recv()).await.is_err());
    Ok(())
}

/// Server-initiated emit and broadcast reach the right unique sockets.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_emit_and_broadcast() -> anyhow::Result<()> {
    init_tracing();
    let domain = test_domain("srv");
    let server = Server::new(server_opts(&domain));
    server.start().await?;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(String, Value)>();
    let mut clients = Vec::new();
    for name in ["c1", "c2"] {
        let client = Client::new(client_opts(&domain, name));
        let tx = seen_tx.clone();
        let tag = name.to_string();
        client.add_handlers(HandlerSet::new().on("news", move |ctx| {
            let _ = tx.send((tag.clone(), ctx.data.clone()));
            None
        }))?;
        timeout(DEADLINE, client.connect()).await??;
        clients.push(client);
    }

    server.emit("c1", "news", json!("direct"), None);
    let (tag, data) = timeout(DEADLINE, seen_rx.recv())
        .await?
        .expect("handler invoked");
    assert_eq!((tag.as_str(), data), ("c1", json!("direct")));

    server.broadcast("news", json!("all"), None);
    let mut tags = Vec::new();
    for _ in 0..2 {
        let (tag, data) = timeout(DEADLINE, seen_rx.recv())
            .await?
            .expect("handler invoked");
        assert_eq!(data, json!("all"));
        tags.push(tag);
    }
    tags.sort();
    assert_eq!(tags, vec!["c1", "c2"]);
    Ok(())
}

/// Emit to a name nobody holds is a silent no-op; the fabric stays healthy.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn emit_to_unknown_client_is_dropped() -> anyhow::Result<()> {
    init_tracing();
    let domain = test_domain("ghost");
    let server = Server::new(server_opts(&domain));
    server.start().await?;

    let c1 = Client::new(client_opts(&domain, "c1"));
    timeout(DEADLINE, c1.connect()).await??;

    timeout(DEADLINE, c1.emit("nobody", "note", json!(1))).await??;
    // The fabric still works afterwards.
    let roster = timeout(DEADLINE, c1.discover()).await??;
    assert_eq!(roster["clients"], json!(["c1"]));
    Ok(())
}
