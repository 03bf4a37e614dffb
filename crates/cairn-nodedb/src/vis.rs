//! Decoder for batman-adv "vis" records (payload type 1, version 1).
//!
//! The payload is binary: two counters, an interface MAC list, and a
//! neighbor entry list. The record's identity MAC is the enclosing data
//! frame's source address.

use serde::{Deserialize, Serialize};

use cairn_core::wire::Data;
use cairn_core::HardwareAddr;

/// Payload type id for vis data on the gossip fabric.
pub const PACKETTYPE: u8 = 1;
/// Payload version for vis data.
pub const PACKETVERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse vis record")]
pub struct VisParseError;

/// One vis record: the node's interfaces and its neighbor table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisV1 {
    pub mac: HardwareAddr,
    pub iface_n: u8,
    pub entries_n: u8,
    pub ifaces: Vec<HardwareAddr>,
    pub entries: Vec<VisEntry>,
}

/// One neighbor entry. `qual == 0` marks a translation-table entry,
/// which carries no link quality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisEntry {
    pub mac: HardwareAddr,
    pub if_index: u8,
    pub qual: u8,
}

impl VisV1 {
    /// Canonical identity of the node: its first interface MAC.
    pub fn canonical(&self) -> HardwareAddr {
        self.ifaces[0]
    }

    /// Parse a vis record out of a data frame.
    pub fn read(data: &Data) -> Result<VisV1, VisParseError> {
        if data.header.kind != PACKETTYPE || data.header.version != PACKETVERSION {
            return Err(VisParseError);
        }
        let payload = &data.payload[..];
        if payload.len() < 8 {
            return Err(VisParseError);
        }
        // first six bytes repeat an interface MAC; the authoritative
        // identity is the frame source
        let iface_n = payload[6];
        let entries_n = payload[7];
        if iface_n < 1 {
            return Err(VisParseError);
        }
        let mut rest = &payload[8..];
        let mut ifaces = Vec::with_capacity(iface_n as usize);
        for _ in 0..iface_n {
            if rest.len() < 6 {
                return Err(VisParseError);
            }
            ifaces.push(HardwareAddr::from_bytes(&rest[..6]).expect("six bytes"));
            rest = &rest[6..];
        }
        let mut entries = Vec::with_capacity(entries_n as usize);
        for _ in 0..entries_n {
            if rest.len() < 8 {
                return Err(VisParseError);
            }
            entries.push(VisEntry {
                mac: HardwareAddr::from_bytes(&rest[..6]).expect("six bytes"),
                if_index: rest[6],
                qual: rest[7],
            });
            rest = &rest[8..];
        }
        Ok(VisV1 {
            mac: data.source,
            iface_n,
            entries_n,
            ifaces,
            entries,
        })
    }
}

/// Build a vis payload from parts. Used by tests and the admin tools.
pub fn encode_payload(
    first_iface: HardwareAddr,
    ifaces: &[HardwareAddr],
    entries: &[VisEntry],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + ifaces.len() * 6 + entries.len() * 8);
    out.extend_from_slice(first_iface.as_bytes());
    out.push(ifaces.len() as u8);
    out.push(entries.len() as u8);
    for i in ifaces {
        out.extend_from_slice(i.as_bytes());
    }
    for e in entries {
        out.extend_from_slice(e.mac.as_bytes());
        out.push(e.if_index);
        out.push(e.qual);
    }
    out
}
