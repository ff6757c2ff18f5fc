//! JSON wire payload for weather events.
//!
//! The payload is a JSON object with exactly the string fields `country`,
//! `weather` and `description`. Empty strings are valid; an absent or
//! non-string field is not. Fields this crate does not know are ignored on
//! decode so that producers may add metadata without breaking consumers.

use crate::compression::Compression;
use crate::error::CodecError;
use crate::types::{
    ConsumedRecord, PublishRecord, WeatherEvent, HEADER_CONTENT_ENCODING, HEADER_MESSAGE_ID,
    HEADER_SOURCE, SOURCE_NAME,
};
use chrono::{DateTime, Utc};

/// Stateless encoder/decoder for [`WeatherEvent`] payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventCodec;

impl EventCodec {
    pub fn encode(event: &WeatherEvent) -> Vec<u8> {
        serde_json::json!({
            "country": event.country(),
            "weather": event.weather(),
            "description": event.description(),
        })
        .to_string()
        .into_bytes()
    }

    /// Decode a payload. Never panics; any mismatch is reported as `Malformed`.
    pub fn decode(bytes: &[u8]) -> Result<WeatherEvent, CodecError> {
        serde_json::from_slice::<WeatherEvent>(bytes).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Undo the value compression named by the record's headers, then decode.
    pub fn decode_record(record: &ConsumedRecord) -> Result<WeatherEvent, CodecError> {
        let compression = match record.header(HEADER_CONTENT_ENCODING) {
            None => Compression::None,
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<Compression>().ok())
                .ok_or_else(|| {
                    CodecError::Malformed(format!(
                        "unknown content-encoding {:?}",
                        String::from_utf8_lossy(raw)
                    ))
                })?,
        };
        let plain = compression
            .decompress(&record.value)
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Self::decode(&plain)
    }

    /// Build the record published for `event` at time `at`.
    pub fn record(event: &WeatherEvent, at: DateTime<Utc>) -> PublishRecord {
        let key = message_key(event, at);
        let mut record = PublishRecord::new(key.clone().into_bytes(), Self::encode(event))
            .with_header(HEADER_SOURCE, SOURCE_NAME.as_bytes().to_vec())
            .with_header(HEADER_MESSAGE_ID, key.into_bytes());
        record.timestamp = at.timestamp_millis();
        record
    }
}

/// Partitioning key: `<yyyymmddHHMMSS.mmm>-<country>` in UTC.
pub fn message_key(event: &WeatherEvent, at: DateTime<Utc>) -> String {
    format!("{}-{}", at.format("%Y%m%d%H%M%S%.3f"), event.country())
}
