//! Typed bucket items.
//!
//! Each wrapper pairs a decoded payload with its origin address and knows
//! its bucket and key. The stored form is JSON so the raw export
//! endpoints can dump buckets without a schema registry.

use serde::{Deserialize, Serialize};

use cairn_core::HardwareAddr;

use crate::gluon::{NodeInfoData, StatisticsData};
use crate::store::{Bucket, Stamp, StoreError};
use crate::vis::VisV1;

/// Sample value meaning "node was offline at this sampling time".
pub const COUNT_OFFLINE: i64 = -1;
/// Sample value meaning "data was present but unparseable".
pub const COUNT_ERRORNEOUS: i64 = -2;

// ── Mesh data items ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoItem {
    pub source: HardwareAddr,
    pub data: NodeInfoData,
}

impl NodeInfoItem {
    pub const BUCKET: Bucket = Bucket::NodeInfo;

    pub fn key(&self) -> Vec<u8> {
        self.source.as_bytes().to_vec()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializable item")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<NodeInfoItem, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsItem {
    pub source: HardwareAddr,
    pub data: StatisticsData,
}

impl StatisticsItem {
    pub const BUCKET: Bucket = Bucket::Statistics;

    pub fn key(&self) -> Vec<u8> {
        self.source.as_bytes().to_vec()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializable item")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<StatisticsItem, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisDataItem {
    pub vis: VisV1,
}

impl VisDataItem {
    pub const BUCKET: Bucket = Bucket::VisData;

    pub fn key(&self) -> Vec<u8> {
        self.vis.mac.as_bytes().to_vec()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializable item")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<VisDataItem, StoreError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

// ── Count samples ─────────────────────────────────────────────────────────────

/// One `(timestamp, count)` point in a log bucket. The key is the
/// big-endian timestamp so samples sort chronologically; the value is a
/// zigzag varint so the offline/error sentinels keep their sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub timestamp: Stamp,
    pub count: i64,
}

impl Count {
    pub fn key(timestamp: Stamp) -> [u8; 8] {
        timestamp.to_be_bytes()
    }

    pub fn timestamp_from_key(key: &[u8]) -> Option<Stamp> {
        Some(Stamp::from_be_bytes(key.try_into().ok()?))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_varint(self.count)
    }

    pub fn from_entry(key: &[u8], value: &[u8]) -> Option<Count> {
        Some(Count {
            timestamp: Self::timestamp_from_key(key)?,
            count: decode_varint(value)?.0,
        })
    }
}

/// Zigzag LEB128 encoding, sign-preserving.
pub fn encode_varint(value: i64) -> Vec<u8> {
    let mut zig = ((value << 1) ^ (value >> 63)) as u64;
    let mut out = Vec::with_capacity(10);
    loop {
        let byte = (zig & 0x7f) as u8;
        zig >>= 7;
        if zig == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn decode_varint(raw: &[u8]) -> Option<(i64, usize)> {
    let mut zig: u64 = 0;
    for (i, &byte) in raw.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        zig |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            let value = ((zig >> 1) as i64) ^ -((zig & 1) as i64);
            return Some((value, i + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gluon::Clients;

    #[test]
    fn varint_round_trips_including_sentinels() {
        for value in [0, 1, -1, -2, 63, 64, -65, 300, -300, i64::MAX, i64::MIN] {
            let bytes = encode_varint(value);
            let (back, used) = decode_varint(&bytes).unwrap();
            assert_eq!(back, value, "value {value}");
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn varint_rejects_unterminated_input() {
        assert!(decode_varint(&[0x80, 0x80]).is_none());
        assert!(decode_varint(&[]).is_none());
    }

    #[test]
    fn count_keys_sort_chronologically() {
        let early = Count::key(1_000);
        let late = Count::key(2_000);
        assert!(early < late);
        assert_eq!(Count::timestamp_from_key(&early), Some(1_000));
    }

    #[test]
    fn statistics_item_round_trips() {
        let item = StatisticsItem {
            source: HardwareAddr([2, 0, 0, 0, 0, 5]),
            data: StatisticsData {
                clients: Some(Clients { wifi: 3, total: 5 }),
                ..Default::default()
            },
        };
        let back = StatisticsItem::from_bytes(&item.to_bytes()).unwrap();
        assert_eq!(back, item);
        assert_eq!(item.key(), vec![2, 0, 0, 0, 0, 5]);
    }
}
