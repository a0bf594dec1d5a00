//! Shared helpers for the integration suites.

use fabric_shared::config::{ClientOptions, ServerOptions};

/// Initializes the test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Fresh domain per test so suites never share socket files.
pub fn test_domain(tag: &str) -> String {
    format!("{tag}-{}", uuid::Uuid::new_v4().simple())
}

pub fn server_opts(domain: &str) -> ServerOptions {
    ServerOptions {
        domain: domain.to_string(),
        ..Default::default()
    }
}

/// Client options with a compressed reconnect delay to keep suites fast.
pub fn client_opts(domain: &str, name: &str) -> ClientOptions {
    ClientOptions {
        domain: domain.to_string(),
        name: name.to_string(),
        reconnect_ms: 100,
        ..Default::default()
    }
}
