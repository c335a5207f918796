//! Binary frame codec.
//!
//! A frame is a run of fields, each written as a 3-byte big-endian length
//! followed by that many raw bytes:
//!
//! ```text
//! request  = field(method) field(uri) field(headers-json) field(body)
//! response = u16-be(status) field(headers-json) field(body)
//! ```
//!
//! Headers travel as a JSON object mapping each name to its list of values
//! (`{"Content-Type":["application/json"]}`). A response body must end
//! exactly at the end of the payload; a request may carry trailing bytes,
//! which are ignored.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::errors::FrameError;

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 3;

/// Largest length a single field can declare (24-bit unsigned).
pub const MAX_FIELD_LEN: usize = 0x00FF_FFFF;

/// Width of the response status code in bytes.
const STATUS_LEN: usize = 2;

/// Header names mapped to their values, in the JSON shape used on the wire.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// An HTTP request travelling server → device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFrame {
    /// HTTP method (`GET`, `POST`, ...).
    pub method: String,
    /// Request URI relative to the device, including the query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw request body.
    pub body: Bytes,
}

/// An HTTP response travelling device → server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseFrame {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw response body.
    pub body: Bytes,
}

/// Append one length-prefixed field to `buf`.
pub fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<(), FrameError> {
    let len = field.len();
    if len > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLarge { len });
    }
    buf.reserve(LENGTH_PREFIX + len);
    buf.put_uint(len as u64, LENGTH_PREFIX);
    buf.put_slice(field);
    Ok(())
}

/// Split one length-prefixed field off the front of `buf`.
pub fn take_field(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    if buf.remaining() < LENGTH_PREFIX {
        return Err(FrameError::Truncated {
            needed: LENGTH_PREFIX,
            remaining: buf.remaining(),
        });
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = buf.get_uint(LENGTH_PREFIX) as usize;
    if buf.remaining() < len {
        return Err(FrameError::Truncated {
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

/// Encode a request frame.
pub fn encode_request(frame: &RequestFrame) -> Result<Bytes, FrameError> {
    let headers = serde_json::to_vec(&frame.headers)?;
    let mut buf = BytesMut::with_capacity(
        4 * LENGTH_PREFIX + frame.method.len() + frame.uri.len() + headers.len() + frame.body.len(),
    );
    put_field(&mut buf, frame.method.as_bytes())?;
    put_field(&mut buf, frame.uri.as_bytes())?;
    put_field(&mut buf, &headers)?;
    put_field(&mut buf, &frame.body)?;
    Ok(buf.freeze())
}

/// Decode a request frame. Bytes after the body field are ignored.
pub fn decode_request(mut payload: Bytes) -> Result<RequestFrame, FrameError> {
    let method = utf8_field(take_field(&mut payload)?, "method")?;
    let uri = utf8_field(take_field(&mut payload)?, "uri")?;
    let headers = decode_headers(&take_field(&mut payload)?)?;
    let body = take_field(&mut payload)?;
    Ok(RequestFrame {
        method,
        uri,
        headers,
        body,
    })
}

/// Encode a response frame.
pub fn encode_response(frame: &ResponseFrame) -> Result<Bytes, FrameError> {
    let headers = serde_json::to_vec(&frame.headers)?;
    let mut buf =
        BytesMut::with_capacity(STATUS_LEN + 2 * LENGTH_PREFIX + headers.len() + frame.body.len());
    buf.put_u16(frame.status);
    put_field(&mut buf, &headers)?;
    put_field(&mut buf, &frame.body)?;
    Ok(buf.freeze())
}

/// Decode a response frame. The body must consume the rest of the payload.
pub fn decode_response(mut payload: Bytes) -> Result<ResponseFrame, FrameError> {
    if payload.remaining() < STATUS_LEN {
        return Err(FrameError::Truncated {
            needed: STATUS_LEN,
            remaining: payload.remaining(),
        });
    }
    let status = payload.get_u16();
    let headers = decode_headers(&take_field(&mut payload)?)?;
    let body = take_field(&mut payload)?;
    if payload.has_remaining() {
        return Err(FrameError::TrailingBytes {
            count: payload.remaining(),
        });
    }
    Ok(ResponseFrame {
        status,
        headers,
        body,
    })
}

fn utf8_field(field: Bytes, name: &'static str) -> Result<String, FrameError> {
    String::from_utf8(field.to_vec()).map_err(|_| FrameError::InvalidUtf8 { field: name })
}

// Devices may send an empty field or `null` for "no headers".
fn decode_headers(field: &[u8]) -> Result<HeaderMap, FrameError> {
    if field.is_empty() {
        return Ok(HeaderMap::new());
    }
    let headers: Option<HeaderMap> = serde_json::from_slice(field)?;
    Ok(headers.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.entry((*name).to_owned())
                .or_default()
                .push((*value).to_owned());
        }
        map
    }

    fn sample_request() -> RequestFrame {
        RequestFrame {
            method: "POST".into(),
            uri: "/api/sensors?limit=5".into(),
            headers: headers(&[("Content-Type", "application/json")]),
            body: Bytes::from_static(b"{\"value\":1}"),
        }
    }

    // -- field primitives --

    #[test]
    fn field_prefix_is_big_endian_24_bit() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, &[0xAB; 0x0102]).unwrap();
        assert_eq!(&buf[..3], &[0x00, 0x01, 0x02]);
        assert_eq!(buf.len(), 3 + 0x0102);
    }

    #[test]
    fn empty_field_is_just_a_prefix() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, b"").unwrap();
        assert_eq!(&buf[..], &[0, 0, 0]);
    }

    #[test]
    fn field_over_limit_rejected() {
        let mut buf = BytesMut::new();
        let big = vec![0u8; MAX_FIELD_LEN + 1];
        assert_matches!(
            put_field(&mut buf, &big),
            Err(FrameError::FieldTooLarge { len }) if len == MAX_FIELD_LEN + 1
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn take_field_short_prefix() {
        let mut buf = Bytes::from_static(&[0, 1]);
        assert_matches!(
            take_field(&mut buf),
            Err(FrameError::Truncated { needed: 3, remaining: 2 })
        );
    }

    #[test]
    fn take_field_declared_length_exceeds_buffer() {
        let mut buf = Bytes::from_static(&[0, 0, 5, b'a', b'b']);
        assert_matches!(
            take_field(&mut buf),
            Err(FrameError::Truncated { needed: 5, remaining: 2 })
        );
    }

    // -- request frames --

    #[test]
    fn request_wire_layout() {
        let frame = RequestFrame {
            method: "GET".into(),
            uri: "/s".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let bytes = encode_request(&frame).unwrap();
        let expected: &[u8] = &[
            0, 0, 3, b'G', b'E', b'T', //
            0, 0, 2, b'/', b's', //
            0, 0, 2, b'{', b'}', //
            0, 0, 0,
        ];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn request_roundtrip() {
        let frame = sample_request();
        let decoded = decode_request(encode_request(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn request_all_fields_empty() {
        let frame = RequestFrame::default();
        let decoded = decode_request(encode_request(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn request_trailing_bytes_ignored() {
        let mut buf = BytesMut::from(&encode_request(&sample_request()).unwrap()[..]);
        buf.put_slice(b"extra");
        let decoded = decode_request(buf.freeze()).unwrap();
        assert_eq!(decoded, sample_request());
    }

    #[test]
    fn request_truncated_in_body() {
        let bytes = encode_request(&sample_request()).unwrap();
        let cut = bytes.slice(..bytes.len() - 1);
        assert_matches!(decode_request(cut), Err(FrameError::Truncated { .. }));
    }

    #[test]
    fn request_missing_body_field() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, b"GET").unwrap();
        put_field(&mut buf, b"/").unwrap();
        put_field(&mut buf, b"{}").unwrap();
        assert_matches!(decode_request(buf.freeze()), Err(FrameError::Truncated { .. }));
    }

    #[test]
    fn request_method_must_be_utf8() {
        let mut buf = BytesMut::new();
        put_field(&mut buf, &[0xFF, 0xFE]).unwrap();
        put_field(&mut buf, b"/").unwrap();
        put_field(&mut buf, b"{}").unwrap();
        put_field(&mut buf, b"").unwrap();
        assert_matches!(
            decode_request(buf.freeze()),
            Err(FrameError::InvalidUtf8 { field: "method" })
        );
    }

    // -- response frames --

    #[test]
    fn response_wire_layout() {
        let frame = ResponseFrame {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"ok"),
        };
        let bytes = encode_response(&frame).unwrap();
        let expected: &[u8] = &[0x00, 0xC8, 0, 0, 2, b'{', b'}', 0, 0, 2, b'o', b'k'];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn response_roundtrip_with_multi_value_headers() {
        let frame = ResponseFrame {
            status: 404,
            headers: headers(&[("Set-Cookie", "a=1"), ("Set-Cookie", "b=2"), ("X-Trace", "t")]),
            body: Bytes::from_static(b"not found"),
        };
        let decoded = decode_response(encode_response(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn response_trailing_bytes_rejected() {
        let frame = ResponseFrame {
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"ok\":true}"),
        };
        let mut buf = BytesMut::from(&encode_response(&frame).unwrap()[..]);
        buf.put_u8(0);
        assert_matches!(
            decode_response(buf.freeze()),
            Err(FrameError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn response_shorter_than_status() {
        assert_matches!(
            decode_response(Bytes::from_static(&[0x01])),
            Err(FrameError::Truncated { needed: 2, remaining: 1 })
        );
        assert_matches!(
            decode_response(Bytes::new()),
            Err(FrameError::Truncated { needed: 2, remaining: 0 })
        );
    }

    #[test]
    fn response_status_only() {
        assert_matches!(
            decode_response(Bytes::from_static(&[0x00, 0xC8])),
            Err(FrameError::Truncated { needed: 3, remaining: 0 })
        );
    }

    #[test]
    fn response_body_length_overruns() {
        let bytes: &[u8] = &[0x00, 0xC8, 0, 0, 0, 0, 0, 9, b'x'];
        assert_matches!(
            decode_response(Bytes::from_static(bytes)),
            Err(FrameError::Truncated { needed: 9, remaining: 1 })
        );
    }

    #[test]
    fn null_and_empty_headers_decode_to_empty_map() {
        let null: &[u8] = &[0x00, 0xC8, 0, 0, 4, b'n', b'u', b'l', b'l', 0, 0, 0];
        assert!(decode_response(Bytes::from_static(null)).unwrap().headers.is_empty());

        let empty: &[u8] = &[0x00, 0xC8, 0, 0, 0, 0, 0, 0];
        assert!(decode_response(Bytes::from_static(empty)).unwrap().headers.is_empty());
    }

    #[test]
    fn invalid_header_json_rejected() {
        let bytes: &[u8] = &[0x00, 0xC8, 0, 0, 1, b'[', 0, 0, 0];
        assert_matches!(
            decode_response(Bytes::from_static(bytes)),
            Err(FrameError::Headers(_))
        );
    }

    #[test]
    fn max_length_body_roundtrip() {
        let body = Bytes::from(vec![0x5A; MAX_FIELD_LEN]);
        let frame = ResponseFrame {
            status: 200,
            headers: HeaderMap::new(),
            body,
        };
        let decoded = decode_response(encode_response(&frame).unwrap()).unwrap();
        assert_eq!(decoded.body.len(), MAX_FIELD_LEN);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn one_byte_fields_roundtrip() {
        let frame = RequestFrame {
            method: "X".into(),
            uri: "/".into(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"b"),
        };
        assert_eq!(decode_request(encode_request(&frame).unwrap()).unwrap(), frame);
    }

    #[test]
    fn oversized_body_fails_encode() {
        let frame = RequestFrame {
            body: Bytes::from(vec![0; MAX_FIELD_LEN + 1]),
            ..sample_request()
        };
        assert_matches!(encode_request(&frame), Err(FrameError::FieldTooLarge { .. }));
    }

    fn arb_headers() -> impl Strategy<Value = HeaderMap> {
        prop::collection::btree_map(
            "[A-Za-z][A-Za-z0-9-]{0,15}",
            prop::collection::vec("[ -~]{0,24}", 0..3),
            0..5,
        )
    }

    proptest! {
        #[test]
        fn request_roundtrip_any(
            method in "[A-Z]{0,10}",
            uri in "(/[a-zA-Z0-9._~?=&%-]{0,20}){0,4}",
            headers in arb_headers(),
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = RequestFrame { method, uri, headers, body: Bytes::from(body) };
            let decoded = decode_request(encode_request(&frame).unwrap()).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn response_roundtrip_any(
            status in any::<u16>(),
            headers in arb_headers(),
            body in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let frame = ResponseFrame { status, headers, body: Bytes::from(body) };
            let decoded = decode_response(encode_response(&frame).unwrap()).unwrap();
            prop_assert_eq!(decoded, frame);
        }

        #[test]
        fn truncated_response_never_decodes(
            body in prop::collection::vec(any::<u8>(), 0..64),
            cut in 1usize..8,
        ) {
            let frame = ResponseFrame { status: 200, headers: HeaderMap::new(), body: Bytes::from(body) };
            let bytes = encode_response(&frame).unwrap();
            let cut = cut.min(bytes.len());
            let short = bytes.slice(..bytes.len() - cut);
            prop_assert!(decode_response(short).is_err());
        }
    }
}
