//! JSON export documents and their byte-buffer caches.

pub mod cache;
pub mod generate;
pub mod graph;
pub mod nodes;
pub mod nodes_old;
pub mod raw;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::store::Stamp;

/// Timestamp wrapper with the `"2006-01-02T15:04:05"`-style JSON form
/// the map frontends expect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct JsonTime(pub Stamp);

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

impl JsonTime {
    pub fn unix_seconds(&self) -> i64 {
        self.0 / 1000
    }
}

impl Serialize for JsonTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let t = chrono::DateTime::from_timestamp_millis(self.0)
            .unwrap_or_default()
            .naive_utc();
        serializer.collect_str(&t.format(TIME_FORMAT))
    }
}

impl<'de> Deserialize<'de> for JsonTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TimeVisitor;

        impl Visitor<'_> for TimeVisitor {
            type Value = JsonTime;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a timestamp string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let t = chrono::NaiveDateTime::parse_from_str(v, TIME_FORMAT)
                    .map_err(E::custom)?;
                Ok(JsonTime(t.and_utc().timestamp_millis()))
            }
        }

        deserializer.deserialize_str(TimeVisitor)
    }
}
