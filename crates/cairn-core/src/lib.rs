//! cairn-core — shared types, wire format, stream client, and configuration.
//! All other Cairn crates depend on this one.

pub mod client;
pub mod config;
pub mod hwaddr;
pub mod wire;

pub use hwaddr::HardwareAddr;
pub use wire::{Data, Packet, TransactionId, Tlv, WireError};
