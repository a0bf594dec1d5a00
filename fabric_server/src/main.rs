//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p fabric_server -- [--domain default] [--verbose]
//!
//! Starts a fabric server on the given domain with two demo handlers:
//!   ping  - replies "pong" when delivered
//!   sum   - adds `a` and `b` from the payload and replies the total
//!
//! Console commands:
//!   status  - list connected clients
//!   quit    - shut down

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use fabric_server::Server;
use fabric_shared::config::ServerOptions;
use fabric_shared::registry::HandlerSet;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> ServerOptions {
    let mut opts = ServerOptions::default();
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--domain" if i + 1 < args.len() => {
                opts.domain = args[i + 1].clone();
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

    info!(domain = %opts.domain, "starting server");

    let server = Server::new(opts);
    server.add_handlers(
        HandlerSet::new()
            .on("ping", |_ctx| Some(json!("pong")))
            .on("sum", |ctx| {
                let a = ctx.data["a"].as_i64().unwrap_or(0);
                let b = ctx.data["b"].as_i64().unwrap_or(0);
                Some(json!({"r": a + b}))
            }),
    )?;
    server.start().await.context("start server")?;

    println!(
        "Server ready on domain '{}'. Type 'status' for info, 'quit' to exit.",
        server.domain()
    );

    // Stdin reader thread feeding the console channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = console_rx.recv().await {
        match line.as_str() {
            "status" => {
                let names = server.client_names();
                println!("Clients connected: {}", names.len());
                for name in names {
                    println!("  {name}");
                }
            }
            "quit" | "exit" => break,
            other => println!("Unknown command: '{other}'"),
        }
    }

    info!("shutting down");
    Ok(())
}
