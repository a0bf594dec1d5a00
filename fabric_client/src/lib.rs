//! `fabric_client`
//!
//! Client role of the fabric:
//! - Dual-socket connect (rendezvous handshake, then unique socket)
//! - Offline buffering with FIFO drain on reconnect
//! - Delivery and discovery correlators
//! - Fixed-delay reconnect loop

pub mod client;

pub use client::Client;
