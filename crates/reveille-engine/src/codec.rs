//! Trigger payload codec.
//!
//! A payload is everything the fire-time renderer needs, carried inside the
//! trigger so delivery never has to consult another source. The layout is a
//! single version byte followed by one CBOR map.
//!
//! Decoding runs in a cold process with no fallback source of truth, so it
//! never trusts the input: every failure maps to a [`DecodeError`].

use std::io::Cursor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use reveille_store::{NotificationId, NotificationRequest, Recurrence};

/// Version tag written as the first byte of every payload.
pub const PAYLOAD_VERSION: u8 = 1;

/// Reasons a payload cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No bytes at all.
    #[error("payload is empty")]
    Empty,

    /// The payload ends before the CBOR body does.
    #[error("payload is truncated")]
    Truncated,

    /// Unknown version tag.
    #[error("unsupported payload version: {0}")]
    UnsupportedVersion(u8),

    /// The id does not fit in 32 bits.
    #[error("notification id out of range: {0}")]
    IdOutOfRange(i64),

    /// Structurally invalid body.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// On-wire body. Integers are kept wide so range checks happen here rather
/// than inside the CBOR deserializer.
#[derive(Debug, Serialize, Deserialize)]
struct WirePayload {
    id: i64,
    title: String,
    body: String,
    fire_at_ms: i64,
    recurrence: WireRecurrence,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireRecurrence {
    None,
    DailyAt { hour: u32, minute: u32 },
}

/// Encode a request into a trigger payload.
pub fn encode(request: &NotificationRequest) -> Vec<u8> {
    let wire = WirePayload {
        id: i64::from(request.id.get()),
        title: request.title.clone(),
        body: request.body.clone(),
        fire_at_ms: request.fire_at.timestamp_millis(),
        recurrence: match request.recurrence {
            Recurrence::None => WireRecurrence::None,
            Recurrence::DailyAt { hour, minute } => WireRecurrence::DailyAt { hour, minute },
        },
    };

    let mut out = vec![PAYLOAD_VERSION];
    ciborium::into_writer(&wire, &mut out).expect("CBOR encoding into a Vec cannot fail");
    out
}

/// Decode a trigger payload.
pub fn decode(bytes: &[u8]) -> Result<NotificationRequest, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != PAYLOAD_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    if body.is_empty() {
        return Err(DecodeError::Truncated);
    }

    let mut cursor = Cursor::new(body);
    let wire: WirePayload = ciborium::from_reader(&mut cursor).map_err(|e| match e {
        ciborium::de::Error::Io(_) => DecodeError::Truncated,
        other => DecodeError::Malformed(other.to_string()),
    })?;
    if cursor.position() as usize != body.len() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes",
            body.len() - cursor.position() as usize
        )));
    }

    let id = i32::try_from(wire.id).map_err(|_| DecodeError::IdOutOfRange(wire.id))?;
    let fire_at = DateTime::<Utc>::from_timestamp_millis(wire.fire_at_ms).ok_or_else(|| {
        DecodeError::Malformed(format!("timestamp out of range: {}", wire.fire_at_ms))
    })?;
    let recurrence = match wire.recurrence {
        WireRecurrence::None => Recurrence::None,
        WireRecurrence::DailyAt { hour, minute } => Recurrence::DailyAt { hour, minute },
    };

    let request = NotificationRequest {
        id: NotificationId::new(id),
        title: wire.title,
        body: wire.body,
        fire_at,
        recurrence,
    };
    request
        .validate()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn sample() -> NotificationRequest {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 8, 15, 0).unwrap();
        NotificationRequest::once(NotificationId::new(12), "Pills", "Take the blue one", at)
    }

    fn with_body(wire: &WirePayload) -> Vec<u8> {
        let mut out = vec![PAYLOAD_VERSION];
        ciborium::into_writer(wire, &mut out).unwrap();
        out
    }

    // === Unit Tests ===

    #[test]
    fn test_roundtrip_sample() {
        let req = sample();
        assert_eq!(decode(&encode(&req)).unwrap(), req);
    }

    #[test]
    fn test_encode_is_deterministic() {
        assert_eq!(encode(&sample()), encode(&sample()));
    }

    #[test]
    fn test_first_byte_is_version() {
        assert_eq!(encode(&sample())[0], PAYLOAD_VERSION);
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_version_only_is_truncated() {
        assert_eq!(decode(&[PAYLOAD_VERSION]), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_unknown_version() {
        let mut bytes = encode(&sample());
        bytes[0] = 7;
        assert_eq!(decode(&bytes), Err(DecodeError::UnsupportedVersion(7)));
    }

    #[test]
    fn test_cut_payload_is_truncated() {
        let bytes = encode(&sample());
        let cut = &bytes[..bytes.len() - 4];
        assert_eq!(decode(cut), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&sample());
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_id_out_of_range() {
        let wire = WirePayload {
            id: i64::from(i32::MAX) + 1,
            title: "t".to_string(),
            body: "b".to_string(),
            fire_at_ms: 0,
            recurrence: WireRecurrence::None,
        };
        assert_eq!(
            decode(&with_body(&wire)),
            Err(DecodeError::IdOutOfRange(i64::from(i32::MAX) + 1))
        );
    }

    #[test]
    fn test_invalid_recurrence_rejected() {
        let wire = WirePayload {
            id: 1,
            title: "t".to_string(),
            body: "b".to_string(),
            fire_at_ms: 0,
            recurrence: WireRecurrence::DailyAt {
                hour: 25,
                minute: 0,
            },
        };
        assert!(matches!(
            decode(&with_body(&wire)),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let mut bytes = vec![PAYLOAD_VERSION];
        ciborium::into_writer(&"just a string", &mut bytes).unwrap();
        assert!(matches!(decode(&bytes), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_reserved_ids_roundtrip() {
        let mut req = sample();
        req.id = NotificationId::fallback_slot(90);
        assert_eq!(decode(&encode(&req)).unwrap().id, req.id);
    }

    // === Property-Based Tests ===

    fn request_strategy() -> impl Strategy<Value = NotificationRequest> {
        (
            any::<i32>(),
            ".{0,80}",
            ".{0,400}",
            -8_000_000_000_000i64..8_000_000_000_000i64,
            prop_oneof![Just(0i64), 1i64..1_000_000],
            proptest::option::of((0u32..24, 0u32..60)),
        )
            .prop_map(|(id, title, body, ms, sub_ms_nanos, daily)| NotificationRequest {
                id: NotificationId::new(id),
                title,
                body,
                fire_at: DateTime::<Utc>::from_timestamp_millis(ms).unwrap()
                    + chrono::Duration::nanoseconds(sub_ms_nanos),
                recurrence: match daily {
                    Some((hour, minute)) => Recurrence::DailyAt { hour, minute },
                    None => Recurrence::None,
                },
            })
    }

    proptest! {
        // Valid requests survive the trip unchanged; finer fire times are
        // not valid and come back at millisecond precision
        #[test]
        fn decode_inverts_encode(req in request_strategy()) {
            let decoded = decode(&encode(&req)).unwrap();
            if req.validate().is_ok() {
                prop_assert_eq!(decoded, req);
            } else {
                prop_assert_eq!(decoded, req.with_millisecond_precision());
            }
        }

        // Arbitrary bytes never panic the decoder
        #[test]
        fn decode_is_total(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode(&bytes);
        }

        // Every strict prefix of a valid payload is rejected
        #[test]
        fn prefixes_never_decode(req in request_strategy(), cut in 0usize..64) {
            let bytes = encode(&req);
            let len = cut.min(bytes.len() - 1);
            prop_assert!(decode(&bytes[..len]).is_err());
        }
    }
}
