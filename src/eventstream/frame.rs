//! `application/vnd.amazon.eventstream` frame codec.
//!
//! ```text
//! [u32 total][u32 headers_len][u32 prelude_crc][headers][payload][u32 message_crc]
//! ```
//!
//! All integers are big-endian and both checksums are CRC-32 (IEEE). The
//! prelude checksum covers the first 8 bytes, the message checksum covers
//! every byte before it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

/// Length of the prelude including its checksum.
pub const PRELUDE_LEN: usize = 12;
/// Length of the trailing message checksum.
pub const MESSAGE_CRC_LEN: usize = 4;
/// Smallest frame the format can express (no headers, no payload).
pub const MIN_FRAME_LEN: usize = PRELUDE_LEN + MESSAGE_CRC_LEN;
/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const HEADER_EVENT_TYPE: &str = ":event-type";
pub const HEADER_MESSAGE_TYPE: &str = ":message-type";
pub const HEADER_CONTENT_TYPE: &str = ":content-type";
pub const HEADER_EXCEPTION_TYPE: &str = ":exception-type";

/// Typed header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    fn type_tag(&self) -> u8 {
        match self {
            HeaderValue::Bool(true) => 0,
            HeaderValue::Bool(false) => 1,
            HeaderValue::Byte(_) => 2,
            HeaderValue::Short(_) => 3,
            HeaderValue::Int(_) => 4,
            HeaderValue::Long(_) => 5,
            HeaderValue::Bytes(_) => 6,
            HeaderValue::String(_) => 7,
            HeaderValue::Timestamp(_) => 8,
            HeaderValue::Uuid(_) => 9,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered header block of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameHeaders(SmallVec<[(String, HeaderValue); 4]>);

impl FrameHeaders {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.0.push((name.into(), value));
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.push(name, value);
        self
    }

    /// First header with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One fully validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub total_len: u32,
    pub headers_len: u32,
    pub headers: FrameHeaders,
    pub payload: Bytes,
    pub message_crc: u32,
}

impl RawFrame {
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.headers.get_str(HEADER_EVENT_TYPE)
    }

    #[must_use]
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get_str(HEADER_MESSAGE_TYPE)
    }

    #[must_use]
    pub fn exception_type(&self) -> Option<&str> {
        self.headers.get_str(HEADER_EXCEPTION_TYPE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("prelude checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    PreludeChecksum { expected: u32, actual: u32 },
    #[error("frame length out of range: total={total}, headers={headers}")]
    LengthOutOfRange { total: u32, headers: u32 },
    #[error("message checksum mismatch: expected {expected:#010x}, computed {actual:#010x}")]
    MessageChecksum { expected: u32, actual: u32 },
    #[error("header block truncated at offset {offset}")]
    HeaderTruncated { offset: usize },
    #[error("unknown header value type {tag} at offset {offset}")]
    UnknownHeaderType { tag: u8, offset: usize },
    #[error("header at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },
    #[error("header `{name}` does not fit the wire format")]
    HeaderTooLong { name: String },
}

impl FrameError {
    /// Whether the prelude (and therefore the declared frame length) can be
    /// trusted after this error.
    #[must_use]
    pub fn prelude_trusted(&self) -> bool {
        !matches!(
            self,
            FrameError::PreludeChecksum { .. } | FrameError::LengthOutOfRange { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// The buffer holds a prefix of a frame; `needed` more bytes are required
    /// before another attempt can succeed.
    Incomplete { needed: usize },
    /// The bytes at the head of the buffer are not a valid frame. `skip` is
    /// the whole declared frame when the prelude was trustworthy, else 1.
    Malformed { error: FrameError, skip: usize },
}

impl DecodeFailure {
    fn malformed(error: FrameError, total: usize) -> Self {
        let skip = if error.prelude_trusted() { total } else { 1 };
        DecodeFailure::Malformed { error, skip }
    }
}

/// Stateless frame decoder with a configurable frame-size ceiling.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len: max_frame_len.max(MIN_FRAME_LEN),
        }
    }

    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Decode one frame from the head of `buf`.
    ///
    /// On success returns the frame and the number of bytes it occupied,
    /// which is always the declared total length.
    ///
    /// # Errors
    ///
    /// [`DecodeFailure::Incomplete`] when `buf` ends inside a frame whose
    /// prelude is valid, [`DecodeFailure::Malformed`] for every integrity
    /// violation.
    pub fn decode(&self, buf: &[u8]) -> Result<(RawFrame, usize), DecodeFailure> {
        let Some((total, headers_len)) = self.check_prelude(buf)? else {
            return Err(DecodeFailure::Incomplete {
                needed: PRELUDE_LEN - buf.len(),
            });
        };
        if buf.len() < total {
            return Err(DecodeFailure::Incomplete {
                needed: total - buf.len(),
            });
        }

        let frame = &buf[..total];
        let crc_offset = total - MESSAGE_CRC_LEN;
        let expected = (&frame[crc_offset..]).get_u32();
        let actual = crc32fast::hash(&frame[..crc_offset]);
        if expected != actual {
            return Err(DecodeFailure::malformed(
                FrameError::MessageChecksum { expected, actual },
                total,
            ));
        }

        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])
            .map_err(|e| DecodeFailure::malformed(e, total))?;

        Ok((
            RawFrame {
                total_len: total as u32,
                headers_len: headers_len as u32,
                headers,
                payload: Bytes::copy_from_slice(&frame[headers_end..crc_offset]),
                message_crc: expected,
            },
            total,
        ))
    }

    /// Whether a plausible frame prelude starts at the head of `buf`.
    #[must_use]
    pub fn is_frame_start(&self, buf: &[u8]) -> bool {
        matches!(self.check_prelude(buf), Ok(Some(_)))
    }

    /// First offset at or after `from` where a valid prelude begins.
    #[must_use]
    pub fn find_frame_start(&self, buf: &[u8], from: usize) -> Option<usize> {
        if buf.len() < PRELUDE_LEN {
            return None;
        }
        (from..=buf.len() - PRELUDE_LEN).find(|&i| self.is_frame_start(&buf[i..]))
    }

    /// `Ok(None)` when fewer than [`PRELUDE_LEN`] bytes are buffered.
    fn check_prelude(&self, buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeFailure> {
        if buf.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let mut prelude = &buf[..PRELUDE_LEN];
        let total = prelude.get_u32();
        let headers = prelude.get_u32();
        let expected = prelude.get_u32();
        let actual = crc32fast::hash(&buf[..8]);
        if expected != actual {
            return Err(DecodeFailure::malformed(
                FrameError::PreludeChecksum { expected, actual },
                0,
            ));
        }

        let total_len = total as usize;
        let headers_len = headers as usize;
        if total_len < MIN_FRAME_LEN
            || total_len > self.max_frame_len
            || headers_len > total_len - MIN_FRAME_LEN
        {
            return Err(DecodeFailure::malformed(
                FrameError::LengthOutOfRange { total, headers },
                0,
            ));
        }
        Ok(Some((total_len, headers_len)))
    }
}

/// Decode with the default frame-size ceiling.
///
/// # Errors
///
/// See [`FrameDecoder::decode`].
pub fn decode_frame(buf: &[u8]) -> Result<(RawFrame, usize), DecodeFailure> {
    FrameDecoder::default().decode(buf)
}

fn parse_headers(block: &[u8]) -> Result<FrameHeaders, FrameError> {
    let mut headers = FrameHeaders::new();
    let mut cur = block;
    while cur.has_remaining() {
        let offset = block.len() - cur.remaining();
        let name_len = usize::from(cur.get_u8());
        need(cur, name_len, offset)?;
        let name = std::str::from_utf8(&cur[..name_len])
            .map_err(|_| FrameError::InvalidUtf8 { offset })?
            .to_string();
        cur.advance(name_len);

        need(cur, 1, offset)?;
        let tag = cur.get_u8();
        let value = match tag {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                need(cur, 1, offset)?;
                HeaderValue::Byte(cur.get_i8())
            }
            3 => {
                need(cur, 2, offset)?;
                HeaderValue::Short(cur.get_i16())
            }
            4 => {
                need(cur, 4, offset)?;
                HeaderValue::Int(cur.get_i32())
            }
            5 => {
                need(cur, 8, offset)?;
                HeaderValue::Long(cur.get_i64())
            }
            6 | 7 => {
                need(cur, 2, offset)?;
                let len = usize::from(cur.get_u16());
                need(cur, len, offset)?;
                let raw = &cur[..len];
                let value = if tag == 6 {
                    HeaderValue::Bytes(Bytes::copy_from_slice(raw))
                } else {
                    let s = std::str::from_utf8(raw)
                        .map_err(|_| FrameError::InvalidUtf8 { offset })?;
                    HeaderValue::String(s.to_string())
                };
                cur.advance(len);
                value
            }
            8 => {
                need(cur, 8, offset)?;
                HeaderValue::Timestamp(cur.get_i64())
            }
            9 => {
                need(cur, 16, offset)?;
                let mut uuid = [0u8; 16];
                cur.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
            tag => return Err(FrameError::UnknownHeaderType { tag, offset }),
        };
        headers.push(name, value);
    }
    Ok(headers)
}

#[inline]
fn need(cur: &[u8], n: usize, offset: usize) -> Result<(), FrameError> {
    if cur.len() < n {
        Err(FrameError::HeaderTruncated { offset })
    } else {
        Ok(())
    }
}

/// Encode one frame.
///
/// # Errors
///
/// [`FrameError::HeaderTooLong`] when a header name exceeds 255 bytes or a
/// string/bytes value exceeds 65535 bytes.
pub fn encode_frame(headers: &FrameHeaders, payload: &[u8]) -> Result<Bytes, FrameError> {
    let mut block = BytesMut::new();
    for (name, value) in headers.iter() {
        let too_long = || FrameError::HeaderTooLong {
            name: name.to_string(),
        };
        let name_len = u8::try_from(name.len()).map_err(|_| too_long())?;
        block.put_u8(name_len);
        block.put_slice(name.as_bytes());
        block.put_u8(value.type_tag());
        match value {
            HeaderValue::Bool(_) => {}
            HeaderValue::Byte(v) => block.put_i8(*v),
            HeaderValue::Short(v) => block.put_i16(*v),
            HeaderValue::Int(v) => block.put_i32(*v),
            HeaderValue::Long(v) | HeaderValue::Timestamp(v) => block.put_i64(*v),
            HeaderValue::Bytes(v) => {
                block.put_u16(u16::try_from(v.len()).map_err(|_| too_long())?);
                block.put_slice(v);
            }
            HeaderValue::String(v) => {
                block.put_u16(u16::try_from(v.len()).map_err(|_| too_long())?);
                block.put_slice(v.as_bytes());
            }
            HeaderValue::Uuid(v) => block.put_slice(v),
        }
    }

    let total = PRELUDE_LEN + block.len() + payload.len() + MESSAGE_CRC_LEN;
    let mut out = BytesMut::with_capacity(total);
    out.put_u32(total as u32);
    out.put_u32(block.len() as u32);
    let prelude_crc = crc32fast::hash(&out[..8]);
    out.put_u32(prelude_crc);
    out.put_slice(&block);
    out.put_slice(payload);
    let message_crc = crc32fast::hash(&out);
    out.put_u32(message_crc);
    Ok(out.freeze())
}

/// Encode a JSON event frame with the standard `:message-type`,
/// `:event-type` and `:content-type` headers.
///
/// # Errors
///
/// See [`encode_frame`].
pub fn encode_event_frame(event_type: &str, payload: &[u8]) -> Result<Bytes, FrameError> {
    let headers = FrameHeaders::new()
        .with(HEADER_EVENT_TYPE, HeaderValue::String(event_type.to_string()))
        .with(HEADER_CONTENT_TYPE, HeaderValue::String("application/json".into()))
        .with(HEADER_MESSAGE_TYPE, HeaderValue::String("event".into()));
    encode_frame(&headers, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a frame around a hand-written header block with valid CRCs.
    fn frame_with_header_block(block: &[u8], payload: &[u8]) -> Vec<u8> {
        let total = PRELUDE_LEN + block.len() + payload.len() + MESSAGE_CRC_LEN;
        let mut out = Vec::with_capacity(total);
        out.put_u32(total as u32);
        out.put_u32(block.len() as u32);
        let crc = crc32fast::hash(&out[..8]);
        out.put_u32(crc);
        out.put_slice(block);
        out.put_slice(payload);
        let crc = crc32fast::hash(&out);
        out.put_u32(crc);
        out
    }

    #[test]
    fn all_header_types_survive_encode_decode() {
        let headers = FrameHeaders::new()
            .with("t", HeaderValue::Bool(true))
            .with("f", HeaderValue::Bool(false))
            .with("byte", HeaderValue::Byte(-3))
            .with("short", HeaderValue::Short(-300))
            .with("int", HeaderValue::Int(70_000))
            .with("long", HeaderValue::Long(-1 << 40))
            .with("bytes", HeaderValue::Bytes(Bytes::from_static(&[0, 1, 255])))
            .with("str", HeaderValue::String("héllo".into()))
            .with("ts", HeaderValue::Timestamp(1_700_000_000_000))
            .with("id", HeaderValue::Uuid([7u8; 16]));
        let payload = br#"{"content":"hi"}"#;

        let wire = encode_frame(&headers, payload).expect("encode");
        let (frame, consumed) = decode_frame(&wire).expect("decode");

        assert_eq!(consumed, wire.len());
        assert_eq!(frame.total_len as usize, wire.len());
        assert_eq!(frame.headers, headers);
        assert_eq!(&frame.payload[..], payload);
    }

    #[test]
    fn short_prelude_is_incomplete() {
        let wire = encode_event_frame("assistantResponseEvent", b"{}").expect("encode");
        assert_eq!(
            decode_frame(&wire[..5]),
            Err(DecodeFailure::Incomplete { needed: 7 })
        );
    }

    #[test]
    fn truncated_body_reports_missing_bytes() {
        let wire = encode_event_frame("assistantResponseEvent", b"{\"content\":\"x\"}")
            .expect("encode");
        let cut = wire.len() - 6;
        assert_eq!(
            decode_frame(&wire[..cut]),
            Err(DecodeFailure::Incomplete { needed: 6 })
        );
    }

    #[test]
    fn decode_consumes_exactly_one_frame() {
        let a = encode_event_frame("a", b"{\"n\":1}").expect("encode");
        let b = encode_event_frame("b", b"{\"n\":2}").expect("encode");
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);

        let (first, used) = decode_frame(&joined).expect("first");
        assert_eq!(used, a.len());
        assert_eq!(first.event_type(), Some("a"));
        let (second, _) = decode_frame(&joined[used..]).expect("second");
        assert_eq!(second.event_type(), Some("b"));
    }

    #[test]
    fn corrupt_prelude_skips_one_byte() {
        let mut wire = encode_event_frame("a", b"{}").expect("encode").to_vec();
        wire[1] ^= 0xff;
        match decode_frame(&wire) {
            Err(DecodeFailure::Malformed { error, skip }) => {
                assert!(matches!(error, FrameError::PreludeChecksum { .. }));
                assert_eq!(skip, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn corrupt_payload_skips_whole_frame() {
        let mut wire = encode_event_frame("a", b"{\"content\":\"x\"}")
            .expect("encode")
            .to_vec();
        let len = wire.len();
        wire[len - 6] ^= 0x01;
        match decode_frame(&wire) {
            Err(DecodeFailure::Malformed { error, skip }) => {
                assert!(matches!(error, FrameError::MessageChecksum { .. }));
                assert_eq!(skip, len);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_header_type_is_malformed() {
        let block = [1u8, b'x', 42];
        let wire = frame_with_header_block(&block, b"{}");
        match decode_frame(&wire) {
            Err(DecodeFailure::Malformed { error, skip }) => {
                assert_eq!(error, FrameError::UnknownHeaderType { tag: 42, offset: 0 });
                assert_eq!(skip, wire.len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_header_value_is_malformed() {
        // string header claiming 10 bytes with only 2 present
        let block = [1u8, b's', 7, 0, 10, b'a', b'b'];
        let wire = frame_with_header_block(&block, b"");
        assert!(matches!(
            decode_frame(&wire),
            Err(DecodeFailure::Malformed {
                error: FrameError::HeaderTruncated { .. },
                ..
            })
        ));
    }

    #[test]
    fn non_utf8_header_name_is_malformed() {
        let block = [1u8, 0xff, 0];
        let wire = frame_with_header_block(&block, b"");
        assert!(matches!(
            decode_frame(&wire),
            Err(DecodeFailure::Malformed {
                error: FrameError::InvalidUtf8 { .. },
                ..
            })
        ));
    }

    #[test]
    fn declared_length_beyond_ceiling_is_malformed() {
        let decoder = FrameDecoder::new(64);
        let wire = encode_event_frame("a", &[b' '; 100]).expect("encode");
        assert!(matches!(
            decoder.decode(&wire),
            Err(DecodeFailure::Malformed {
                error: FrameError::LengthOutOfRange { .. },
                skip: 1
            })
        ));
    }

    #[test]
    fn find_frame_start_skips_leading_junk() {
        let wire = encode_event_frame("a", b"{}").expect("encode");
        let mut buf = b"garbage!".to_vec();
        buf.extend_from_slice(&wire);
        let decoder = FrameDecoder::default();
        assert_eq!(decoder.find_frame_start(&buf, 0), Some(8));
        assert!(!decoder.is_frame_start(&buf));
    }
}
