//! # Wire Protocol
//!
//! Purpose: Encode and decode the framed binary message exchanged over every
//! connection, with the header and body serialized independently in one of
//! two interchangeable formats.
//!
//! ## Design Principles
//!
//! 1. **Fixed Prefix**: A 10-byte prefix tells the reader exactly how many
//!    bytes follow, so the receive loop needs no scanning or resync logic.
//! 2. **Single Framing Path**: Typed bodies are serialized first and then go
//!    through the same raw-bytes path, so both produce identical frames.
//! 3. **Zero-Copy Bodies**: Decoded bodies are `Bytes` slices of the frame;
//!    relays can forward them without re-serializing.
//! 4. **Fail Closed**: Any prefix or terminator violation is a framing error.
//!
//! ## Frame Layout
//!
//! ```text
//! +--------+--------+--------------+------------+----------+----------+--------+
//! | STX:1B | fmt:1B | headerLen:4B | bodyLen:4B | header   | body     | ETX:1B |
//! +--------+--------+--------------+------------+----------+----------+--------+
//! | 0x02   | 0 | 1  | u32 BE       | u32 BE     | hdr bytes| body     | 0x03   |
//! +--------+--------+--------------+------------+----------+----------+--------+
//! fmt: 0 = MessagePack (named fields), 1 = JSON
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::FrameLimits;
use crate::error::{ProtocolError, ProtocolResult, RpcError, RpcResult};
use crate::types::{Format, Header};

/// Frame start marker.
pub const STX: u8 = 0x02;
/// Frame end marker.
pub const ETX: u8 = 0x03;
/// Size of the fixed prefix (STX + format + two lengths).
pub const PREFIX_LEN: usize = 10;
/// Bytes of framing around header and body (prefix + ETX).
pub const FRAME_OVERHEAD: usize = PREFIX_LEN + 1;

/// Generic key/value view of a body, used when the target type is unknown.
pub type BodyMap = serde_json::Map<String, serde_json::Value>;

/// Parsed and validated frame prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePrefix {
    pub format: Format,
    pub header_len: u32,
    pub body_len: u32,
}

impl FramePrefix {
    /// Validates the prefix bytes against the marker, format, and ceilings.
    ///
    /// Called by the receive loop before any header or body bytes are read,
    /// so oversize frames are rejected without buffering them.
    pub fn parse(bytes: &[u8; PREFIX_LEN], limits: &FrameLimits) -> ProtocolResult<Self> {
        if bytes[0] != STX {
            return Err(ProtocolError::BadStx(bytes[0]));
        }
        let format = Format::from_u8(bytes[1]).ok_or(ProtocolError::UnknownFormat(bytes[1]))?;
        let header_len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let body_len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);

        if header_len > limits.max_header_len {
            return Err(ProtocolError::HeaderTooLarge {
                len: header_len as usize,
                max: limits.max_header_len as usize,
            });
        }
        if body_len > limits.max_body_len {
            return Err(ProtocolError::BodyTooLarge {
                len: body_len as usize,
                max: limits.max_body_len as usize,
            });
        }

        Ok(FramePrefix {
            format,
            header_len,
            body_len,
        })
    }

    /// Total frame size including prefix and terminator.
    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD + self.header_len as usize + self.body_len as usize
    }
}

/// Serializes a value in the given format.
pub fn encode_value<T: Serialize + ?Sized>(format: Format, value: &T) -> ProtocolResult<Vec<u8>> {
    match format {
        Format::Json => Ok(serde_json::to_vec(value)?),
        Format::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
    }
}

/// Deserializes a value in the given format.
pub fn decode_value<T: DeserializeOwned>(format: Format, bytes: &[u8]) -> ProtocolResult<T> {
    match format {
        Format::Json => Ok(serde_json::from_slice(bytes)?),
        Format::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
    }
}

/// Builds a frame from a header and a typed body.
pub fn encode<T: Serialize + ?Sized>(format: Format, header: &Header, body: &T) -> ProtocolResult<Bytes> {
    let body = encode_value(format, body)?;
    encode_raw(format, header, &body)
}

/// Builds a frame from a header and already-serialized body bytes.
///
/// **Logic**:
/// 1. Serialize the header in `format`.
/// 2. Reject lengths that do not fit the 32-bit length fields.
/// 3. Write prefix, header, body, and terminator into one buffer.
pub fn encode_raw(format: Format, header: &Header, body: &[u8]) -> ProtocolResult<Bytes> {
    let header_bytes = encode_value(format, header)?;
    let header_len = u32::try_from(header_bytes.len()).map_err(|_| ProtocolError::HeaderTooLarge {
        len: header_bytes.len(),
        max: u32::MAX as usize,
    })?;
    let body_len = u32::try_from(body.len()).map_err(|_| ProtocolError::BodyTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + header_bytes.len() + body.len());
    buf.put_u8(STX);
    buf.put_u8(format.as_u8());
    buf.put_u32(header_len);
    buf.put_u32(body_len);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(body);
    buf.put_u8(ETX);
    Ok(buf.freeze())
}

/// Decodes one complete frame.
///
/// The prefix is validated before the total length is checked, so an
/// oversize length field is reported as such even on a short buffer.
pub fn decode(frame: Bytes, limits: &FrameLimits) -> ProtocolResult<Packet> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(ProtocolError::Truncated {
            expected: FRAME_OVERHEAD,
            actual: frame.len(),
        });
    }

    let mut prefix_bytes = [0u8; PREFIX_LEN];
    prefix_bytes.copy_from_slice(&frame[..PREFIX_LEN]);
    let prefix = FramePrefix::parse(&prefix_bytes, limits)?;

    let expected = prefix.frame_len();
    if frame.len() != expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: frame.len(),
        });
    }
    let etx = frame[expected - 1];
    if etx != ETX {
        return Err(ProtocolError::BadEtx(etx));
    }

    let header_end = PREFIX_LEN + prefix.header_len as usize;
    let header: Header = decode_value(prefix.format, &frame[PREFIX_LEN..header_end])?;
    let body = frame.slice(header_end..expected - 1);

    Ok(Packet {
        format: prefix.format,
        header,
        body,
    })
}

/// A decoded frame: format, header, and the still-serialized body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    format: Format,
    header: Header,
    body: Bytes,
}

impl Packet {
    pub fn new(format: Format, header: Header, body: Bytes) -> Self {
        Packet { format, header, body }
    }

    /// Builds a packet by serializing `body` in `format`.
    pub fn with_body<T: Serialize + ?Sized>(format: Format, header: Header, body: &T) -> ProtocolResult<Self> {
        let body = encode_value(format, body)?;
        Ok(Packet::new(format, header, Bytes::from(body)))
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    /// Raw body bytes, for pass-through relaying.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (Format, Header, Bytes) {
        (self.format, self.header, self.body)
    }

    /// Decodes the body into a caller-supplied type.
    pub fn decode_body<T: DeserializeOwned>(&self) -> ProtocolResult<T> {
        decode_value(self.format, &self.body)
    }

    /// Decodes the body into a generic map.
    pub fn body_map(&self) -> ProtocolResult<BodyMap> {
        decode_value(self.format, &self.body)
    }

    /// Re-frames the packet with its raw body.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        encode_raw(self.format, &self.header, &self.body)
    }

    /// Maps a non-zero `ret` to an error, otherwise decodes the body.
    pub fn into_result<T: DeserializeOwned>(self) -> RpcResult<T> {
        if !self.header.is_ok() {
            return Err(RpcError::from_ret(self.header.ret, self.header.msg));
        }
        self.decode_body()
            .map_err(|err| RpcError::internal(format!("decode response body: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::error::{ERROR_METHOD_NOT_FOUND, MAX_SYSTEM_CODE};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        uid: u64,
        name: String,
        tags: Vec<String>,
    }

    fn sample_header() -> Header {
        Header::new("profile", "getProfile")
            .with_route_key("u-42")
            .with_token("tok")
            .with_uid(42)
            .with_request_ip("10.0.0.7")
            .with_trace_id("trace-1")
            .with_seq(7)
    }

    fn sample_body() -> Profile {
        Profile {
            uid: 42,
            name: "ada".to_string(),
            tags: vec!["a".to_string(), "b".to_string()],
        }
    }

    #[test]
    fn roundtrip_both_formats() {
        for format in [Format::Json, Format::MsgPack] {
            let frame = encode(format, &sample_header(), &sample_body()).unwrap();
            let packet = decode(frame, &FrameLimits::default()).unwrap();
            assert_eq!(packet.format(), format);
            assert_eq!(packet.header(), &sample_header());
            assert_eq!(packet.decode_body::<Profile>().unwrap(), sample_body());
        }
    }

    #[test]
    fn prefix_layout_is_big_endian() {
        let frame = encode_raw(Format::Json, &Header::default(), b"{}").unwrap();
        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], 1);
        let header_len = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
        let body_len = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
        assert_eq!(body_len, 2);
        assert_eq!(frame.len(), FRAME_OVERHEAD + header_len + body_len);
        assert_eq!(frame[frame.len() - 1], ETX);
        assert_eq!(&frame[PREFIX_LEN + header_len..frame.len() - 1], b"{}");
    }

    #[test]
    fn typed_and_raw_bodies_frame_identically() {
        for format in [Format::Json, Format::MsgPack] {
            let typed = encode(format, &sample_header(), &sample_body()).unwrap();
            let raw_body = encode_value(format, &sample_body()).unwrap();
            let raw = encode_raw(format, &sample_header(), &raw_body).unwrap();
            assert_eq!(typed, raw);
        }
    }

    #[test]
    fn flipped_markers_are_rejected() {
        let frame = encode(Format::MsgPack, &sample_header(), &sample_body()).unwrap();
        let limits = FrameLimits::default();

        for bad in [0x00u8, 0x03, 0x7f, 0xff] {
            let mut stx = frame.to_vec();
            stx[0] = bad;
            assert!(matches!(decode(Bytes::from(stx), &limits), Err(ProtocolError::BadStx(b)) if b == bad));

            let mut etx = frame.to_vec();
            let last = etx.len() - 1;
            etx[last] = bad;
            assert!(matches!(decode(Bytes::from(etx), &limits), Err(ProtocolError::BadEtx(b)) if b == bad));
        }
    }

    #[test]
    fn oversize_header_rejected_from_prefix_alone() {
        let limits = FrameLimits {
            max_header_len: 64,
            max_body_len: 64,
        };
        let mut prefix = [0u8; PREFIX_LEN];
        prefix[0] = STX;
        prefix[1] = Format::Json.as_u8();
        prefix[2..6].copy_from_slice(&65u32.to_be_bytes());
        let err = FramePrefix::parse(&prefix, &limits).unwrap_err();
        assert!(matches!(err, ProtocolError::HeaderTooLarge { len: 65, max: 64 }));

        // No header or body bytes present at all; the prefix decides.
        let mut short = prefix.to_vec();
        short.push(ETX);
        assert!(matches!(
            decode(Bytes::from(short), &limits),
            Err(ProtocolError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn oversize_body_rejected() {
        let limits = FrameLimits {
            max_header_len: 1024,
            max_body_len: 4,
        };
        let frame = encode_raw(Format::Json, &Header::default(), b"[1,2,3]").unwrap();
        let err = decode(frame, &limits).unwrap_err();
        assert!(matches!(err, ProtocolError::BodyTooLarge { len: 7, max: 4 }));
        assert!(err.is_framing());
    }

    #[test]
    fn unknown_format_and_truncation() {
        let mut frame = encode(Format::Json, &sample_header(), &sample_body()).unwrap().to_vec();
        frame[1] = 9;
        assert!(matches!(
            decode(Bytes::from(frame.clone()), &FrameLimits::default()),
            Err(ProtocolError::UnknownFormat(9))
        ));

        frame[1] = Format::Json.as_u8();
        frame.pop();
        assert!(matches!(
            decode(Bytes::from(frame), &FrameLimits::default()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn garbled_header_is_codec_error() {
        let header_bytes = b"not json";
        let mut buf = BytesMut::new();
        buf.put_u8(STX);
        buf.put_u8(Format::Json.as_u8());
        buf.put_u32(header_bytes.len() as u32);
        buf.put_u32(0);
        buf.extend_from_slice(header_bytes);
        buf.put_u8(ETX);
        let err = decode(buf.freeze(), &FrameLimits::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
        assert!(!err.is_framing());
    }

    #[test]
    fn body_map_for_unknown_targets() {
        for format in [Format::Json, Format::MsgPack] {
            let frame = encode(format, &sample_header(), &sample_body()).unwrap();
            let packet = decode(frame, &FrameLimits::default()).unwrap();
            let map = packet.body_map().unwrap();
            assert_eq!(map["uid"], 42);
            assert_eq!(map["name"], "ada");
            assert_eq!(map["tags"][1], "b");
        }
    }

    #[test]
    fn relay_reencode_preserves_frame() {
        let frame = encode(Format::MsgPack, &sample_header(), &sample_body()).unwrap();
        let packet = decode(frame.clone(), &FrameLimits::default()).unwrap();
        assert_eq!(packet.encode().unwrap(), frame);
    }

    #[test]
    fn into_result_maps_ret_codes() {
        let ok = Packet::with_body(Format::Json, Header::default(), &sample_body()).unwrap();
        assert_eq!(ok.into_result::<Profile>().unwrap(), sample_body());

        let missing = Header::default().with_result(ERROR_METHOD_NOT_FOUND, "method x not found");
        let packet = Packet::new(Format::Json, missing, Bytes::from_static(b"{}"));
        assert!(matches!(packet.into_result::<BodyMap>(), Err(RpcError::System { code: 1004, .. })));

        let logic = Header::default().with_result(MAX_SYSTEM_CODE + 1, "balance too low");
        let packet = Packet::new(Format::Json, logic, Bytes::from_static(b"{}"));
        assert_eq!(
            packet.into_result::<BodyMap>(),
            Err(RpcError::logic(2001, "balance too low"))
        );
    }
}
