//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p fabric_client -- [--domain default] [--name NAME] [--verbose]
//!
//! Connects to a fabric server, prints the domain roster, then broadcasts
//! each stdin line to the other clients as a `chat` command. Other clients'
//! chat messages are printed as they arrive.

use std::env;
use std::io::BufRead;

use anyhow::Context;
use fabric_client::Client;
use fabric_shared::config::ClientOptions;
use fabric_shared::registry::HandlerSet;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> ClientOptions {
    let mut opts = ClientOptions::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--domain" if i + 1 < args.len() => {
                opts.domain = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                opts.name = args[i + 1].clone();
                i += 2;
            }
            "--verbose" => {
                opts.verbose = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    opts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = parse_args();

    let default_filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let client = Client::new(opts);
    client.add_handlers(HandlerSet::new().on("chat", |ctx| {
        println!("<{}", ctx.data);
        None
    }))?;

    info!(name = %client.name(), "connecting");
    client.connect().await.context("connect")?;

    let roster = client.discover().await.context("discover")?;
    println!("Connected as '{}'. Domain roster: {}", client.name(), roster);

    // Stdin reader thread feeding the broadcast loop.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        loop {
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        if line == "quit" || line == "exit" {
            break;
        }
        client.broadcast("chat", json!(line)).await?;
    }

    Ok(())
}
