//! EventCodec payload laws: round trip and total decode.

use weather_relay::error::CodecError;
use weather_relay::{EventCodec, WeatherEvent};

#[test]
fn round_trip_holds_for_awkward_values() {
    let events = [
        WeatherEvent::new("PE", "rain", "light rain"),
        WeatherEvent::new("", "", ""),
        WeatherEvent::new("CL", "nieve", "nevadas débiles \u{2744}"),
        WeatherEvent::new("US", "storm", "quote \" backslash \\ newline \n tab \t"),
        WeatherEvent::new("JP", "\u{0}", "x".repeat(64 * 1024)),
    ];
    for event in events {
        let bytes = EventCodec::encode(&event);
        assert_eq!(EventCodec::decode(&bytes).unwrap(), event);
    }
}

#[test]
fn wire_shape_matches_the_documented_object() {
    let bytes = EventCodec::encode(&WeatherEvent::new("PE", "rain", "light rain"));
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(
        value,
        serde_json::json!({"country": "PE", "weather": "rain", "description": "light rain"})
    );
}

#[test]
fn absent_field_is_malformed_but_empty_is_valid() {
    let missing = br#"{"country":"PE","weather":"rain"}"#;
    assert!(matches!(EventCodec::decode(missing), Err(CodecError::Malformed(_))));

    let empty = br#"{"country":"PE","weather":"rain","description":""}"#;
    assert_eq!(
        EventCodec::decode(empty).unwrap(),
        WeatherEvent::new("PE", "rain", "")
    );
}

#[test]
fn wrong_types_are_malformed() {
    for payload in [
        &br#"{"country":1,"weather":"rain","description":"x"}"#[..],
        br#"{"country":"PE","weather":null,"description":"x"}"#,
        br#"["PE","rain","x"]"#,
        br#""PE""#,
        b"",
    ] {
        assert!(
            matches!(EventCodec::decode(payload), Err(CodecError::Malformed(_))),
            "accepted {:?}",
            String::from_utf8_lossy(payload)
        );
    }
}

#[test]
fn unknown_fields_are_ignored() {
    let extra = br#"{"country":"PE","weather":"rain","description":"x","station":"LIM-01"}"#;
    assert_eq!(
        EventCodec::decode(extra).unwrap(),
        WeatherEvent::new("PE", "rain", "x")
    );
}

#[test]
fn decode_is_total_over_arbitrary_bytes() {
    // xorshift so the corpus is the same on every run
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    let valid = EventCodec::encode(&WeatherEvent::new("PE", "rain", "light rain"));
    for round in 0..2_000 {
        let bytes: Vec<u8> = if round % 2 == 0 {
            let len = (next() % 64) as usize;
            (0..len).map(|_| next() as u8).collect()
        } else {
            // flip one byte of a valid payload
            let mut bytes = valid.clone();
            let at = (next() as usize) % bytes.len();
            bytes[at] = next() as u8;
            bytes
        };
        match EventCodec::decode(&bytes) {
            Ok(event) => assert_eq!(EventCodec::decode(&EventCodec::encode(&event)).unwrap(), event),
            Err(CodecError::Malformed(_)) => {}
        }
    }
}
