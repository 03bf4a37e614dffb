//! cairnd — the Cairn gossip daemon, as a library.
//!
//! The binary in `main.rs` is a thin wrapper; everything interesting lives
//! here so integration tests can drive a daemon in-process.

pub mod master;
pub mod sender;
pub mod server;
pub mod store;
pub mod stream;
pub mod transaction;
pub mod udp;

pub use server::Server;
