//! A networked, in-memory key-value store with a JSON snapshot.
//!
//! Clients connect over TCP and speak a line protocol (`set k v`, `get k`,
//! `delete k`, `exit`). The store is loaded from a snapshot file at startup
//! and written back once, when the server shuts down gracefully.
//!
//! - [`store`] holds the concurrent map and its snapshot load/save.
//! - [`registry`] tracks open connections so shutdown can warn and close
//!   them.
//! - [`command`] parses protocol lines and renders replies.
//! - [`connection`] runs the per-client command loop.
//! - [`server`] owns the listener, the accept loop and the shutdown
//!   sequence.
//! - [`config`], [`cli`] and [`client`] cover configuration, the
//!   command-line interface and a small terminal client.

pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
pub mod store;

pub use config::Config;
pub use server::{Server, ServerState};
pub use store::Store;
