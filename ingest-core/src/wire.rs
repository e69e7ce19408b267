use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::types::CanonicalEvent;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("buffer too short: expected at least {expected} more bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("field was not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("invalid uuid in wire payload: {0}")]
    InvalidUuid(#[from] uuid::Error),
}

/// Encodes a [CanonicalEvent] into the log sink's length-delimited binary
/// schema: each string field is a 4-byte big-endian length prefix followed by
/// its UTF-8 bytes, in declaration order, except `team_id`, which is a fixed
/// 8-byte big-endian integer with no length prefix. Self-delimiting, so no
/// schema registry is required to decode it.
pub fn encode(event: &CanonicalEvent) -> Bytes {
    let mut buf = BytesMut::new();
    put_str(&mut buf, &event.uuid.to_string());
    put_str(&mut buf, &event.event);
    put_str(&mut buf, &event.properties);
    put_str(&mut buf, &event.timestamp);
    buf.put_i64(event.team_id);
    put_str(&mut buf, &event.distinct_id);
    put_str(&mut buf, &event.elements_chain);
    put_str(&mut buf, &event.created_at);
    buf.freeze()
}

/// Decodes a buffer produced by [encode] back into a [CanonicalEvent].
/// Round-trips losslessly, including microsecond-precision timestamps, since
/// the timestamp fields are carried as opaque pre-formatted strings.
pub fn decode(mut buf: Bytes) -> Result<CanonicalEvent, WireError> {
    let uuid = get_str(&mut buf)?;
    let event = get_str(&mut buf)?;
    let properties = get_str(&mut buf)?;
    let timestamp = get_str(&mut buf)?;
    let team_id = get_i64(&mut buf)?;
    let distinct_id = get_str(&mut buf)?;
    let elements_chain = get_str(&mut buf)?;
    let created_at = get_str(&mut buf)?;

    Ok(CanonicalEvent {
        uuid: uuid.parse()?,
        event,
        properties,
        timestamp,
        team_id,
        distinct_id,
        elements_chain,
        created_at,
    })
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn get_str(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated {
            expected: len,
            found: buf.remaining(),
        });
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated {
            expected: 4,
            found: buf.remaining(),
        });
    }
    Ok(buf.get_u32())
}

fn get_i64(buf: &mut Bytes) -> Result<i64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated {
            expected: 8,
            found: buf.remaining(),
        });
    }
    Ok(buf.get_i64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample() -> CanonicalEvent {
        CanonicalEvent {
            uuid: Uuid::now_v7(),
            event: "pageview".to_string(),
            properties: r#"{"$browser":"Chrome"}"#.to_string(),
            timestamp: "2024-01-01 00:00:00.123456".to_string(),
            team_id: 42,
            distinct_id: "d1".to_string(),
            elements_chain: "div.btn:text=\"click\"".to_string(),
            created_at: "2024-01-01 00:00:00.123456".to_string(),
        }
    }

    #[test]
    fn round_trips_losslessly() {
        let event = sample();
        let encoded = encode(&event);
        let decoded = decode(encoded).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn round_trips_microsecond_precision_timestamp() {
        let mut event = sample();
        event.timestamp = "2024-06-15 23:59:59.999999".to_string();
        let decoded = decode(encode(&event)).unwrap();
        assert_eq!(decoded.timestamp, "2024-06-15 23:59:59.999999");
    }

    #[test]
    fn empty_fields_round_trip() {
        let mut event = sample();
        event.elements_chain = String::new();
        event.properties = String::new();
        let decoded = decode(encode(&event)).unwrap();
        assert_eq!(decoded.elements_chain, "");
        assert_eq!(decoded.properties, "");
    }

    #[test]
    fn truncated_buffer_errors() {
        let encoded = encode(&sample());
        let truncated = encoded.slice(0..encoded.len() - 3);
        assert!(decode(truncated).is_err());
    }
}
