//! `fabric_server`
//!
//! Server role of the fabric:
//! - Rendezvous listener shared by every client in the domain
//! - Per-client unique listeners and sockets
//! - Name registry with per-domain uniqueness
//! - Relay router (broadcast / emit) and delivery forwarder

pub mod server;

pub use server::Server;
