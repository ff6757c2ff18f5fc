//! Core types shared across the relay pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Header naming the producing service.
pub const HEADER_SOURCE: &str = "source";
/// Header carrying the derived message id (same bytes as the key).
pub const HEADER_MESSAGE_ID: &str = "message_id";
/// Header naming the compression applied to the value, absent when uncompressed.
pub const HEADER_CONTENT_ENCODING: &str = "content-encoding";
/// Value of the `source` header on everything this crate publishes.
pub const SOURCE_NAME: &str = "weather-relay";

/// A validated weather observation from the ingestion edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeatherEvent {
    country: String,
    weather: String,
    description: String,
}

impl WeatherEvent {
    pub fn new(
        country: impl Into<String>,
        weather: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            weather: weather.into(),
            description: description.into(),
        }
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn weather(&self) -> &str {
        &self.weather
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Record handed to a bus: owned by the send that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<u8>>,
    /// Millis since epoch.
    pub timestamp: i64,
}

impl PublishRecord {
    pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            headers: BTreeMap::new(),
            timestamp: now_millis(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    /// Bytes counted against a batch's byte limit.
    pub fn encoded_len(&self) -> usize {
        self.key.len()
            + self.value.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Where a consumed record came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordSource {
    Partition { topic: String, partition: i32 },
    Queue(String),
}

/// Record delivered by a consume channel, held until committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub source: RecordSource,
    /// Offset for log buses, delivery tag for queue buses.
    pub position: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub timestamp: i64,
    /// True when the bus reports this record was delivered before.
    pub redelivered: bool,
    /// Group generation (log) or connection session (queue) the record was delivered under.
    pub(crate) generation: u64,
}

impl ConsumedRecord {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    pub fn partition(&self) -> Option<i32> {
        match &self.source {
            RecordSource::Partition { partition, .. } => Some(*partition),
            RecordSource::Queue(_) => None,
        }
    }
}

/// Position assigned to a published record by a log bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPosition {
    pub partition: i32,
    pub offset: i64,
}

/// Outcome of a successful `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Accepted into the current batch; delivery continues in the background.
    Enqueued,
    /// The batch holding the record was written. `position` is set when the bus
    /// reports one (log buses with acks other than `none`).
    Written {
        position: Option<RecordPosition>,
        attempts: u32,
    },
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_len_counts_key_value_and_headers() {
        let record = PublishRecord::new(b"k".to_vec(), b"value".to_vec()).with_header("h", b"vv".to_vec());
        assert_eq!(record.encoded_len(), 1 + 5 + 1 + 2);
        assert_eq!(record.header("h"), Some(&b"vv"[..]));
        assert!(record.timestamp > 0);
    }
}
