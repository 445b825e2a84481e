// ABOUTME: Length-prefixed JSON frame codec for the worker wire protocol
// ABOUTME: 4-byte big-endian length header followed by exactly that many bytes of JSON

//! Wire codec for the worker protocol.
//!
//! Every frame is a 4-byte big-endian unsigned length `N` followed by `N` bytes
//! of UTF-8 JSON. Requests carry `{id, command, args}`; responses carry
//! `{id, status: "ok" | "error", result | error}`. Responses written by older
//! workers that use a boolean `success` discriminant are accepted as well.
//!
//! Encoding is deterministic (object keys are emitted in sorted order) and
//! total: the only rejected input is a payload larger than the configured
//! maximum. Decoding never panics; truncated or malformed frames yield
//! [`CodecError`].

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of the big-endian length prefix
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Default upper bound for a single frame payload (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Fewer bytes than the header or declared length require
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Payload exceeds the configured limit
    #[error("Payload too large: {size} bytes exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// Payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Payload is not valid JSON or misses required fields
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Underlying stream closed or failed while reading/writing a frame
    #[error("Stream closed: {0}")]
    Closed(String),
}

// === Envelopes ===

/// A request frame payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id echoed back by the worker
    pub id: u64,
    /// Command name, opaque to the pool layer
    pub command: String,
    /// Command arguments, opaque to the pool layer
    #[serde(default)]
    pub args: Value,
}

/// Success/error discriminant of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Command succeeded, payload is the result
    Ok,
    /// Command failed, payload is the error
    Error,
}

/// A decoded response frame
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id of the request this answers
    pub id: u64,
    /// Success or error
    pub status: ResponseStatus,
    /// Result on success, error payload on failure
    pub payload: Value,
}

impl Response {
    /// Build a success response
    #[must_use]
    pub const fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            status: ResponseStatus::Ok,
            payload: result,
        }
    }

    /// Build an error response with a `{message}` payload
    #[must_use]
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ResponseStatus::Error,
            payload: serde_json::json!({ "message": message.into() }),
        }
    }

    /// Split into result or error payload
    pub fn into_result(self) -> Result<Value, Value> {
        match self.status {
            ResponseStatus::Ok => Ok(self.payload),
            ResponseStatus::Error => Err(self.payload),
        }
    }

    /// Human-readable message of an error payload
    #[must_use]
    pub fn error_message(payload: &Value) -> String {
        match payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| payload.to_string(), str::to_string),
            other => other.to_string(),
        }
    }
}

/// On-the-wire shape of a response; tolerant of the legacy `success` flag
#[derive(Debug, Serialize, Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

// === Frame Layer ===

/// Prefix a payload with its big-endian length
pub fn encode_frame(payload: &[u8], max_payload: usize) -> Result<Vec<u8>, CodecError> {
    let size = payload.len();
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    let len = u32::try_from(size).map_err(|_| CodecError::PayloadTooLarge {
        size,
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + size);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split one frame off the front of `buf`
///
/// Returns the payload slice and the total number of bytes consumed.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<(&[u8], usize), CodecError> {
    let header: [u8; LENGTH_PREFIX_BYTES] = buf
        .get(..LENGTH_PREFIX_BYTES)
        .and_then(|h| h.try_into().ok())
        .ok_or(CodecError::Truncated {
            expected: LENGTH_PREFIX_BYTES,
            actual: buf.len(),
        })?;
    let size = u32::from_be_bytes(header) as usize;
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }

    let end = LENGTH_PREFIX_BYTES + size;
    let payload = buf.get(LENGTH_PREFIX_BYTES..end).ok_or(CodecError::Truncated {
        expected: end,
        actual: buf.len(),
    })?;
    Ok((payload, end))
}

// === Envelope Layer ===

/// Encode a request frame
pub fn encode_request(
    id: u64,
    command: &str,
    args: &Value,
    max_payload: usize,
) -> Result<Vec<u8>, CodecError> {
    #[derive(Serialize)]
    struct RequestRef<'a> {
        id: u64,
        command: &'a str,
        args: &'a Value,
    }

    let payload = serde_json::to_vec(&RequestRef { id, command, args })
        .map_err(|e| CodecError::Malformed(e.to_string()))?;
    encode_frame(&payload, max_payload)
}

/// Decode a request frame
pub fn decode_request(frame: &[u8], max_payload: usize) -> Result<Request, CodecError> {
    let (payload, _) = decode_frame(frame, max_payload)?;
    parse_request(payload)
}

/// Parse a request payload (frame header already stripped)
pub fn parse_request(payload: &[u8]) -> Result<Request, CodecError> {
    serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode a response frame
pub fn encode_response(response: &Response, max_payload: usize) -> Result<Vec<u8>, CodecError> {
    let wire = match response.status {
        ResponseStatus::Ok => WireResponse {
            id: response.id,
            status: Some(ResponseStatus::Ok),
            success: None,
            result: Some(response.payload.clone()),
            error: None,
        },
        ResponseStatus::Error => WireResponse {
            id: response.id,
            status: Some(ResponseStatus::Error),
            success: None,
            result: None,
            error: Some(response.payload.clone()),
        },
    };
    let payload = serde_json::to_vec(&wire).map_err(|e| CodecError::Malformed(e.to_string()))?;
    encode_frame(&payload, max_payload)
}

/// Decode a response frame
pub fn decode_response(frame: &[u8], max_payload: usize) -> Result<Response, CodecError> {
    let (payload, _) = decode_frame(frame, max_payload)?;
    parse_response(payload)
}

/// Parse a response payload (frame header already stripped)
pub fn parse_response(payload: &[u8]) -> Result<Response, CodecError> {
    let wire: WireResponse =
        serde_json::from_slice(payload).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let status = match (wire.status, wire.success) {
        (Some(status), _) => status,
        (None, Some(true)) => ResponseStatus::Ok,
        (None, Some(false)) => ResponseStatus::Error,
        (None, None) => {
            return Err(CodecError::Malformed(format!(
                "response {} has neither 'status' nor 'success'",
                wire.id
            )))
        }
    };

    let payload = match status {
        ResponseStatus::Ok => wire.result.unwrap_or(Value::Null),
        ResponseStatus::Error => wire.error.unwrap_or(Value::Null),
    };

    Ok(Response {
        id: wire.id,
        status,
        payload,
    })
}

// === Stream Helpers ===

/// Read one frame payload from an async stream
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| CodecError::Closed(e.to_string()))?;

    let size = u32::from_be_bytes(header) as usize;
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; size];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| CodecError::Closed(e.to_string()))?;
    Ok(payload)
}

/// Write an already-encoded frame to an async stream and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(frame)
        .await
        .map_err(|e| CodecError::Closed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| CodecError::Closed(e.to_string()))
}

/// Blocking variant of [`read_frame`] for synchronous workers
///
/// Returns `Ok(None)` on a clean EOF before any header byte.
pub fn read_frame_blocking<R: Read>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Option<Vec<u8>>, CodecError> {
    let mut header = [0u8; LENGTH_PREFIX_BYTES];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_BYTES {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(CodecError::Truncated {
                    expected: LENGTH_PREFIX_BYTES,
                    actual: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(CodecError::Closed(e.to_string())),
        }
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_payload {
        return Err(CodecError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; size];
    reader
        .read_exact(&mut payload)
        .map_err(|e| CodecError::Closed(e.to_string()))?;
    Ok(Some(payload))
}

/// Blocking variant of [`write_frame`]
pub fn write_frame_blocking<W: Write>(writer: &mut W, frame: &[u8]) -> Result<(), CodecError> {
    writer
        .write_all(frame)
        .and_then(|()| writer.flush())
        .map_err(|e| CodecError::Closed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const MAX: usize = DEFAULT_MAX_PAYLOAD_BYTES;

    // ==================== Frame Tests ====================

    #[test]
    fn test_frame_has_big_endian_prefix() {
        let frame = encode_frame(b"hello", MAX).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_decode_frame_reports_consumed_bytes() {
        let mut buf = encode_frame(b"abc", MAX).unwrap();
        buf.extend_from_slice(&encode_frame(b"de", MAX).unwrap());

        let (first, used) = decode_frame(&buf, MAX).unwrap();
        assert_eq!(first, b"abc");
        assert_eq!(used, 7);

        let (second, _) = decode_frame(&buf[used..], MAX).unwrap();
        assert_eq!(second, b"de");
    }

    #[test]
    fn test_truncated_header_is_error() {
        let err = decode_frame(&[0, 0], MAX).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let frame = encode_request(7, "ping", &json!({}), MAX).unwrap();
        for cut in 0..frame.len() {
            let result = decode_request(&frame[..cut], MAX);
            assert!(
                matches!(result, Err(CodecError::Truncated { .. })),
                "cut at {cut} should be truncated"
            );
        }
    }

    #[test]
    fn test_oversized_payload_fails_fast() {
        let args = json!({ "blob": "x".repeat(64) });
        let err = encode_request(1, "put", &args, 32).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { max: 32, .. }));
    }

    #[test]
    fn test_oversized_declared_length_rejected_on_decode() {
        let mut frame = vec![0x7f, 0xff, 0xff, 0xff];
        frame.extend_from_slice(b"{}");
        let err = decode_frame(&frame, 1024).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { max: 1024, .. }));
    }

    // ==================== Envelope Tests ====================

    #[test]
    fn test_request_round_trip() {
        let args = json!({
            "session_id": "s1",
            "inputs": {"question": "2+2?", "n": [1, 2.5, null, true]},
            "unicode": "naïve ✓"
        });
        let frame = encode_request(42, "execute_program", &args, MAX).unwrap();
        let decoded = decode_request(&frame, MAX).unwrap();

        assert_eq!(
            decoded,
            Request {
                id: 42,
                command: "execute_program".to_string(),
                args,
            }
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let a = json!({"b": 1, "a": 2, "c": {"z": 0, "y": 1}});
        let b = json!({"c": {"y": 1, "z": 0}, "a": 2, "b": 1});
        assert_eq!(
            encode_request(1, "x", &a, MAX).unwrap(),
            encode_request(1, "x", &b, MAX).unwrap()
        );
    }

    #[test]
    fn test_response_round_trip_ok_and_error() {
        let ok = Response::ok(9, json!({"answer": 4}));
        let decoded = decode_response(&encode_response(&ok, MAX).unwrap(), MAX).unwrap();
        assert_eq!(decoded, ok);

        let err = Response::error(10, "Unknown command: nope");
        let decoded = decode_response(&encode_response(&err, MAX).unwrap(), MAX).unwrap();
        assert_eq!(decoded.status, ResponseStatus::Error);
        assert_eq!(Response::error_message(&decoded.payload), "Unknown command: nope");
    }

    #[test]
    fn test_response_wire_shape() {
        let frame = encode_response(&Response::ok(3, json!("pong")), MAX).unwrap();
        let (payload, _) = decode_frame(&frame, MAX).unwrap();
        let value: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(value, json!({"id": 3, "status": "ok", "result": "pong"}));
    }

    #[test]
    fn test_legacy_success_flag_accepted() {
        let payload = br#"{"id": 5, "success": false, "error": "boom", "timestamp": 1.5}"#;
        let response = parse_response(payload).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.payload, json!("boom"));

        let payload = br#"{"id": 6, "success": true, "result": {"status": "ok"}}"#;
        let response = parse_response(payload).unwrap();
        assert_eq!(response.into_result().unwrap(), json!({"status": "ok"}));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            parse_response(b"not json"),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            parse_response(br#"{"id": 1}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            parse_response(br#"{"status": "ok"}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(
            parse_request(br#"{"id": "x", "command": "ping"}"#),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_request_as_response_is_malformed() {
        // A worker that echoes requests back must not pass as a valid response
        let frame = encode_request(1, "ping", &json!({}), MAX).unwrap();
        assert!(matches!(
            decode_response(&frame, MAX),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(Response::error_message(&json!("plain")), "plain");
        assert_eq!(
            Response::error_message(&json!({"message": "nested", "code": 3})),
            "nested"
        );
        assert_eq!(Response::error_message(&json!({"code": 3})), r#"{"code":3}"#);
    }

    // ==================== Stream Tests ====================

    #[tokio::test]
    async fn test_async_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = encode_request(11, "ping", &json!({}), MAX).unwrap();

        write_frame(&mut client, &frame).await.unwrap();
        let payload = read_frame(&mut server, MAX).await.unwrap();
        let request = parse_request(&payload).unwrap();

        assert_eq!(request.id, 11);
        assert_eq!(request.command, "ping");
    }

    #[tokio::test]
    async fn test_async_read_on_closed_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let err = read_frame(&mut server, MAX).await.unwrap_err();
        assert!(matches!(err, CodecError::Closed(_)));
    }

    #[test]
    fn test_blocking_stream_round_trip_and_eof() {
        let mut buf = Vec::new();
        let frame = encode_response(&Response::ok(1, json!(true)), MAX).unwrap();
        write_frame_blocking(&mut buf, &frame).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_frame_blocking(&mut cursor, MAX).unwrap().unwrap();
        assert_eq!(parse_response(&payload).unwrap().payload, json!(true));

        assert!(read_frame_blocking(&mut cursor, MAX).unwrap().is_none());
    }

    #[test]
    fn test_blocking_partial_header() {
        let mut cursor = std::io::Cursor::new(vec![0u8, 0]);
        let err = read_frame_blocking(&mut cursor, MAX).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { actual: 2, .. }));
    }
}
