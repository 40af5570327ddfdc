//! Brace-matching JSON recovery for streams whose binary framing is lost.
//!
//! The scan runs on raw bytes: `{`, `}`, `"` and `\` are ASCII and never
//! occur inside a UTF-8 multi-byte sequence.
//!
//! [`ObjectScanner`] keeps its position and the state of a still-open object
//! between calls, so a buffer that grows chunk by chunk is walked once.
//! Objects nested inside a candidate are only searched after that candidate
//! fails to parse or is given up on at the end of its region. One known
//! degradation follows from that last rule: when a stream is cut inside an
//! outer object, a nested object such as the `{"content":"x"}` of a
//! truncated `{"followupPrompt":{"content":"x"}` is recovered on its own and
//! reads as assistant text.

use std::ops::Range;

use serde_json::Value;

use super::event::{BackendEvent, EventBatch, EventMapper};

/// Bytes that may be walked a second time while looking inside failed
/// candidates before failed candidates are skipped whole.
const MAX_RESCAN_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct OpenObject {
    start: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl OpenObject {
    fn new(start: usize) -> Self {
        Self {
            start,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    /// Walk `bytes`, returning the index just past the closing brace.
    fn advance(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth = self.depth.saturating_sub(1);
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}

/// Incremental candidate scanner over a buffer that only grows at the end
/// (and is trimmed at the front through [`ObjectScanner::rebase`]).
#[derive(Debug, Default, Clone)]
pub struct ObjectScanner {
    pos: usize,
    open: Option<OpenObject>,
    rescanned: usize,
}

impl ObjectScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// First offset the scanner still needs: the start of the open object,
    /// else the scan position.
    #[must_use]
    pub fn keep_from(&self) -> usize {
        self.open.map_or(self.pos, |open| open.start)
    }

    /// Start of the object still open at the scan position.
    #[must_use]
    pub fn open_start(&self) -> Option<usize> {
        self.open.map(|open| open.start)
    }

    /// The caller dropped the first `n` bytes of the buffer.
    pub fn rebase(&mut self, n: usize) {
        self.pos = self.pos.saturating_sub(n);
        if let Some(open) = self.open.as_mut() {
            open.start = open.start.saturating_sub(n);
        }
    }

    /// Next complete object in `buf`. An object still open at the end of
    /// `buf` is kept for the next call.
    pub fn next_object(&mut self, buf: &[u8]) -> Option<(Range<usize>, Value)> {
        self.pos = self.pos.min(buf.len());
        loop {
            let mut open = match self.open.take() {
                Some(open) => open,
                None => {
                    let Some(rel) = memchr::memchr(b'{', &buf[self.pos..]) else {
                        self.pos = buf.len();
                        return None;
                    };
                    self.pos += rel;
                    OpenObject::new(self.pos)
                }
            };
            let Some(rel_end) = open.advance(&buf[self.pos..]) else {
                self.pos = buf.len();
                self.open = Some(open);
                return None;
            };
            let end = self.pos + rel_end;
            let span = open.start..end;
            match serde_json::from_slice::<Value>(&buf[span.clone()]) {
                Ok(value) => {
                    self.pos = end;
                    self.rescanned = 0;
                    return Some((span, value));
                }
                Err(_) => self.look_inside(span.start, end),
            }
        }
    }

    /// Like [`next_object`](Self::next_object), but `buf` is final: an
    /// object still open at its end is given up on and searched for nested
    /// objects instead.
    pub fn next_object_final(&mut self, buf: &[u8]) -> Option<(Range<usize>, Value)> {
        if self.open.is_some_and(|open| open.start >= buf.len()) {
            self.open = None;
        }
        loop {
            if let Some(found) = self.next_object(buf) {
                return Some(found);
            }
            let open = self.open.take()?;
            self.look_inside(open.start, buf.len());
        }
    }

    /// Give up on the object currently open, e.g. because it outgrew the
    /// buffer limit, and continue the search inside it.
    pub fn abandon_open(&mut self) {
        if let Some(open) = self.open.take() {
            let end = self.pos;
            self.look_inside(open.start, end);
        }
    }

    fn look_inside(&mut self, start: usize, end: usize) {
        self.rescanned = self.rescanned.saturating_add(end - start);
        self.pos = if self.rescanned > MAX_RESCAN_BYTES {
            end
        } else {
            start + 1
        };
    }
}

/// Iterator over the JSON objects that can be recovered from a complete
/// buffer.
///
/// Yields `(span, value)` for every balanced `{ … }` candidate that parses.
/// A candidate that fails to parse, or a `{` that is never closed, restarts
/// the search one byte past that `{` so objects nested inside junk are still
/// found.
#[derive(Debug)]
pub struct JsonObjectSpans<'a> {
    buf: &'a [u8],
    scanner: ObjectScanner,
}

impl<'a> JsonObjectSpans<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            scanner: ObjectScanner::new(),
        }
    }
}

impl Iterator for JsonObjectSpans<'_> {
    type Item = (Range<usize>, Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.scanner.next_object_final(self.buf)
    }
}

/// Lazily recover backend events from `buf`.
pub fn scan_for_events(buf: &[u8]) -> ScanEvents<'_> {
    ScanEvents {
        spans: JsonObjectSpans::new(buf),
        mapper: EventMapper::new(),
        pending: EventBatch::new(),
    }
}

/// Iterator returned by [`scan_for_events`].
#[derive(Debug)]
pub struct ScanEvents<'a> {
    spans: JsonObjectSpans<'a>,
    mapper: EventMapper,
    pending: EventBatch,
}

impl Iterator for ScanEvents<'_> {
    type Item = BackendEvent;

    fn next(&mut self) -> Option<BackendEvent> {
        loop {
            if !self.pending.is_empty() {
                return Some(self.pending.remove(0));
            }
            let (_, value) = self.spans.next()?;
            self.pending = self.mapper.map_value(None, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(buf: &[u8]) -> Vec<Range<usize>> {
        JsonObjectSpans::new(buf).map(|(r, _)| r).collect()
    }

    #[test]
    fn one_candidate_per_top_level_object() {
        let buf = br#"xx{"a":{"b":1}}yy{"c":2}"#;
        assert_eq!(spans(buf), vec![2..15, 17..24]);
    }

    #[test]
    fn quoted_and_escaped_braces_do_not_count() {
        let buf = br#"{"content":"a\"}b{"}"#;
        let all: Vec<_> = JsonObjectSpans::new(buf).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, 0..buf.len());
        assert_eq!(all[0].1["content"], "a\"}b{");
    }

    #[test]
    fn junk_prefix_brace_does_not_hide_nested_object() {
        let buf = br#"{garbage {"content":"ok"} more}"#;
        let events: Vec<_> = scan_for_events(buf).collect();
        assert_eq!(
            events,
            vec![BackendEvent::AssistantTextDelta { text: "ok".into() }]
        );
    }

    #[test]
    fn unterminated_object_is_searched_at_end_of_buffer() {
        let buf = br#"{"content":"a"}junk{"x":{"content":"b"}"#;
        assert_eq!(spans(buf), vec![0..15, 24..39]);
    }

    #[test]
    fn binary_noise_between_objects_is_skipped() {
        let mut buf = vec![0u8, 0x7b, 0xff, 0x00];
        buf.extend_from_slice(br#"{"content":"Hi"}"#);
        buf.extend_from_slice(&[0x12, 0x34]);
        buf.extend_from_slice(br#"{"stopReason":"end_turn"}"#);
        let events: Vec<_> = scan_for_events(&buf).collect();
        assert_eq!(
            events,
            vec![
                BackendEvent::AssistantTextDelta { text: "Hi".into() },
                BackendEvent::MessageStop { stop_reason: "end_turn".into() },
            ]
        );
    }

    #[test]
    fn open_object_state_carries_across_growth() {
        let whole = br#"{"followupPrompt":{"content":"x"}}"#;
        let split = whole.len() - 1;
        let mut scanner = ObjectScanner::new();
        assert!(scanner.next_object(&whole[..split]).is_none());
        assert_eq!(scanner.open_start(), Some(0));
        let (span, value) = scanner.next_object(whole).expect("closed object");
        assert_eq!(span, 0..whole.len());
        assert_eq!(value["followupPrompt"]["content"], "x");
        assert!(scanner.next_object(whole).is_none());
    }

    #[test]
    fn rebase_keeps_open_object_position() {
        let mut buf = b"junk{\"content\":".to_vec();
        let mut scanner = ObjectScanner::new();
        assert!(scanner.next_object(&buf).is_none());
        assert_eq!(scanner.keep_from(), 4);
        buf.drain(..4);
        scanner.rebase(4);
        buf.extend_from_slice(b"\"hi\"}");
        let (span, value) = scanner.next_object(&buf).expect("object");
        assert_eq!(span, 0..buf.len());
        assert_eq!(value["content"], "hi");
    }

    #[test]
    fn abandoned_object_is_searched_inside() {
        let buf = br#"{"big":"....{"content":"in"}"#;
        let mut scanner = ObjectScanner::new();
        assert!(scanner.next_object(buf).is_none());
        scanner.abandon_open();
        let (_, value) = scanner.next_object(buf).expect("nested object");
        assert_eq!(value["content"], "in");
    }
}
