//! Gluon-firmware node metadata: gzip-compressed JSON payloads.
//!
//! Two shapes travel the fabric: NodeInfo (type 158) describes a node,
//! Statistics (type 159) carries its runtime counters. Every field is
//! optional — firmware builds differ in what they report.

use std::io::Read;
use std::net::IpAddr;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use cairn_core::wire::Data;
use cairn_core::HardwareAddr;

/// Payload type id for NodeInfo records.
pub const NODEINFO_PACKETTYPE: u8 = 158;
pub const NODEINFO_PACKETVERSION: u8 = 0;

/// Payload type id for Statistics records.
pub const STATISTICS_PACKETTYPE: u8 = 159;
pub const STATISTICS_PACKETVERSION: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum GluonParseError {
    #[error("wrong packet type or version")]
    WrongType,

    #[error("cannot decompress payload: {0}")]
    Gzip(#[from] std::io::Error),

    #[error("cannot decode payload: {0}")]
    Json(#[from] serde_json::Error),
}

// ── NodeInfo ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<HardwareAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<Software>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<IpAddr>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_interfaces: Option<Vec<HardwareAddr>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub latitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Software {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autoupdater: Option<AutoUpdater>,
    #[serde(rename = "batman-adv", skip_serializing_if = "Option::is_none")]
    pub batman_adv: Option<BatmanAdv>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoUpdater {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatmanAdv {
    #[serde(default)]
    pub compat: i64,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Firmware {
    #[serde(default)]
    pub base: String,
    #[serde(default)]
    pub release: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hardware {
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub contact: String,
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatisticsData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<HardwareAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clients: Option<Clients>,
    #[serde(default)]
    pub rootfs_usage: f64,
    #[serde(default)]
    pub loadavg: f64,
    #[serde(default)]
    pub uptime: f64,
    #[serde(default)]
    pub idletime: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<HardwareAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processes: Option<Processes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic: Option<Traffic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Clients {
    #[serde(default)]
    pub wifi: i64,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub cached: i64,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub buffers: i64,
    #[serde(default)]
    pub free: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Processes {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub running: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Traffic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<TrafficCounter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx: Option<TrafficCounter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mgmt_tx: Option<TrafficCounter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mgmt_rx: Option<TrafficCounter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward: Option<TrafficCounter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficCounter {
    #[serde(default)]
    pub bytes: i64,
    #[serde(default)]
    pub packets: i64,
}

// ── Decoding ──────────────────────────────────────────────────────────────────

fn read_json<T: serde::de::DeserializeOwned>(
    data: &Data,
    packet_type: u8,
    packet_version: u8,
) -> Result<T, GluonParseError> {
    if data.header.kind != packet_type || data.header.version != packet_version {
        return Err(GluonParseError::WrongType);
    }
    let mut unzipped = Vec::new();
    GzDecoder::new(&data.payload[..]).read_to_end(&mut unzipped)?;
    Ok(serde_json::from_slice(&unzipped)?)
}

/// Decode a NodeInfo record out of a data frame.
pub fn read_node_info(data: &Data) -> Result<NodeInfoData, GluonParseError> {
    read_json(data, NODEINFO_PACKETTYPE, NODEINFO_PACKETVERSION)
}

/// Decode a Statistics record out of a data frame.
pub fn read_statistics(data: &Data) -> Result<StatisticsData, GluonParseError> {
    read_json(data, STATISTICS_PACKETTYPE, STATISTICS_PACKETVERSION)
}

/// Gzip a JSON value the way firmware does. Used by tests and the
/// import tooling.
pub fn gzip_json<T: Serialize>(value: &T) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    let json = serde_json::to_vec(value).expect("serializable value");
    enc.write_all(&json).expect("in-memory write");
    enc.finish().expect("in-memory finish")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(kind: u8, version: u8, payload: Vec<u8>) -> Data {
        Data::new(
            HardwareAddr([2, 0, 0, 0, 0, 1]),
            kind,
            version,
            Bytes::from(payload),
        )
    }

    #[test]
    fn node_info_round_trip() {
        let info = NodeInfoData {
            node_id: Some(HardwareAddr([2, 0, 0, 0, 0, 1])),
            hostname: Some("node-one".into()),
            location: Some(Location {
                latitude: 53.08,
                longitude: 8.8,
            }),
            software: Some(Software {
                firmware: Some(Firmware {
                    base: "gluon-v2014.4".into(),
                    release: "0.6.3".into(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let payload = gzip_json(&info);
        let parsed = read_node_info(&frame(
            NODEINFO_PACKETTYPE,
            NODEINFO_PACKETVERSION,
            payload,
        ))
        .unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn statistics_parses_real_world_fields() {
        let stats = StatisticsData {
            node_id: Some(HardwareAddr([2, 0, 0, 0, 0, 2])),
            clients: Some(Clients { wifi: 4, total: 7 }),
            uptime: 3600.5,
            gateway: Some(HardwareAddr([2, 0, 0, 0, 0, 9])),
            memory: Some(Memory {
                total: 32768,
                free: 8192,
                cached: 1024,
                buffers: 512,
            }),
            ..Default::default()
        };
        let payload = gzip_json(&stats);
        let parsed = read_statistics(&frame(
            STATISTICS_PACKETTYPE,
            STATISTICS_PACKETVERSION,
            payload,
        ))
        .unwrap();
        assert_eq!(parsed, stats);
    }

    #[test]
    fn wrong_type_and_garbage_are_rejected() {
        let payload = gzip_json(&NodeInfoData::default());
        assert!(matches!(
            read_node_info(&frame(STATISTICS_PACKETTYPE, 0, payload.clone())),
            Err(GluonParseError::WrongType)
        ));
        assert!(matches!(
            read_node_info(&frame(NODEINFO_PACKETTYPE, 1, payload)),
            Err(GluonParseError::WrongType)
        ));
        // not gzip at all
        assert!(read_node_info(&frame(
            NODEINFO_PACKETTYPE,
            0,
            b"{\"hostname\":\"x\"}".to_vec()
        ))
        .is_err());
    }

    #[test]
    fn permissive_mac_fields_accept_hex_node_ids() {
        let json = serde_json::json!({
            "node_id": "02caffee0001",
            "gateway": "02:ca:ff:ee:00:09"
        });
        let payload = gzip_json(&json);
        let parsed = read_statistics(&frame(
            STATISTICS_PACKETTYPE,
            STATISTICS_PACKETVERSION,
            payload,
        ))
        .unwrap();
        assert_eq!(
            parsed.node_id.unwrap().to_string(),
            "02:ca:ff:ee:00:01"
        );
        assert_eq!(
            parsed.gateway.unwrap().to_string(),
            "02:ca:ff:ee:00:09"
        );
    }
}
