//! JSON wire codec for [`Envelope`].
//!
//! Encoding is pure and deterministic for a given envelope. Decoding
//! rejects frames missing `id` or `kind` and tolerates everything else:
//! unknown top-level fields are ignored, unknown payload fields ride along
//! untouched inside `data`.

use crate::error::RoomcastError;
use crate::protocol::envelope::Envelope;

/// Encodes an envelope as JSON text.
///
/// # Errors
///
/// Returns [`RoomcastError::Internal`] if serialization fails, which is
/// unreachable for envelopes built through this crate.
pub fn encode(envelope: &Envelope) -> Result<String, RoomcastError> {
    serde_json::to_string(envelope)
        .map_err(|err| RoomcastError::Internal(format!("envelope serialization: {err}")))
}

/// Decodes an envelope from JSON text.
///
/// # Errors
///
/// Returns [`RoomcastError::Decode`] when the text is not valid JSON, is
/// missing `id` or `kind`, or carries an unknown `kind` string.
pub fn decode(text: &str) -> Result<Envelope, RoomcastError> {
    serde_json::from_str(text).map_err(|err| RoomcastError::Decode(err.to_string()))
}

/// Decodes an envelope from raw bytes (binary frames).
///
/// # Errors
///
/// Same failure modes as [`decode`].
pub fn decode_slice(bytes: &[u8]) -> Result<Envelope, RoomcastError> {
    serde_json::from_slice(bytes).map_err(|err| RoomcastError::Decode(err.to_string()))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::protocol::envelope::{EnvelopeKind, payload};
    use serde_json::json;

    #[test]
    fn round_trip_preserves_every_field() {
        let env = Envelope::request("pool.query", payload(json!({"pool": "btc-usd"})))
            .with_room("pool:btc-usd");
        let Ok(text) = encode(&env) else {
            panic!("encode failed");
        };
        let Ok(back) = decode(&text) else {
            panic!("decode failed");
        };
        assert_eq!(back, env);
    }

    #[test]
    fn round_trip_error_envelope() {
        let env = Envelope::error("AUTH_FAILED", "invalid token", Some("c-9".into()));
        let Ok(text) = encode(&env) else {
            panic!("encode failed");
        };
        let Ok(back) = decode(&text) else {
            panic!("decode failed");
        };
        assert_eq!(back, env);
    }

    #[test]
    fn unknown_payload_fields_survive() {
        let env = Envelope::event(
            "pool.status_changed",
            payload(json!({"known": 1, "future_field": {"nested": [1, 2]}})),
        );
        let Ok(text) = encode(&env) else {
            panic!("encode failed");
        };
        let Ok(back) = decode(&text) else {
            panic!("decode failed");
        };
        assert_eq!(back.data.get("future_field"), Some(&json!({"nested": [1, 2]})));
    }

    #[test]
    fn missing_id_is_rejected() {
        let result = decode(r#"{"kind": "request", "eventName": "x"}"#);
        assert!(matches!(result, Err(RoomcastError::Decode(_))));
    }

    #[test]
    fn missing_kind_is_rejected() {
        let result = decode(r#"{"id": "m-1", "eventName": "x"}"#);
        assert!(matches!(result, Err(RoomcastError::Decode(_))));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = decode(r#"{"id": "m-1", "kind": "teleport"}"#);
        assert!(matches!(result, Err(RoomcastError::Decode(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode("not json at all").is_err());
        assert!(decode_slice(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn minimal_frame_gets_defaults() {
        let Ok(env) = decode(r#"{"id": "m-1", "kind": "ping"}"#) else {
            panic!("decode failed");
        };
        assert_eq!(env.kind, EnvelopeKind::Ping);
        assert!(env.data.is_empty());
        assert!(env.correlation_id.is_none());
        assert!(env.room.is_none());
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        let Ok(env) = decode(r#"{"id": "m-1", "kind": "ack", "futureHeader": true}"#) else {
            panic!("decode failed");
        };
        assert_eq!(env.kind, EnvelopeKind::Ack);
    }

    #[test]
    fn decode_slice_matches_decode() {
        let env = Envelope::subscribe("ops");
        let Ok(text) = encode(&env) else {
            panic!("encode failed");
        };
        let Ok(back) = decode_slice(text.as_bytes()) else {
            panic!("decode_slice failed");
        };
        assert_eq!(back, env);
    }

    #[test]
    fn wire_names_are_camel_case() {
        let env = Envelope::error("RATE_LIMITED", "slow down", Some("c-1".into()));
        let Ok(text) = encode(&env) else {
            panic!("encode failed");
        };
        assert!(text.contains("\"correlationId\""));
        assert!(text.contains("\"errorCode\""));
        assert!(text.contains("\"errorMessage\""));
        assert!(text.contains("\"kind\":\"error\""));
    }
}
