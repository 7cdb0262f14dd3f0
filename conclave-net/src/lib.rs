//! # conclave-net
//!
//! The connection engines of the Conclave collaboration hub.
//!
//! The server listens on one TCP port, runs a receive thread per client,
//! and fans every client's state out to every other client once per tick.
//! The client opens a single pipe, mirrors every remote participant in a
//! triple buffer, and answers each SERVER_UPDATE with one CLIENT_UPDATE so
//! the two halves interlock at the server's tick rate.

pub mod client;
pub mod server;

pub use client::{Client, ClientConfig, RemoteClient};
pub use server::{Server, ServerConfig};
