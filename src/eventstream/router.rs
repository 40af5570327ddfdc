//! Per-connection frame router: binary decoding with text fallback.

use bytes::{Buf, BytesMut};

use super::event::{BackendEvent, EventMapper};
use super::frame::{DecodeFailure, FrameDecoder, DEFAULT_MAX_FRAME_LEN, PRELUDE_LEN};
use super::scanner::ObjectScanner;

pub const DEFAULT_FALLBACK_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Binary,
    Fallback,
}

impl DecodeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DecodeMode::Binary => "binary",
            DecodeMode::Fallback => "fallback",
        }
    }
}

/// Consecutive unsuccessful binary parse attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter(u32);

impl FailureCounter {
    pub fn record(&mut self) -> u32 {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Counters reported when a stream completes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    pub frames: u64,
    pub malformed: u64,
    pub recovered_objects: u64,
    pub discarded_bytes: u64,
    pub fallback_entries: u64,
}

/// Splits a backend body into events.
///
/// Binary mode decodes frames. Bytes skipped by a run of malformed frames
/// stay buffered until the run ends: a good frame discards them, reaching
/// the failure threshold hands them to the text scan in fallback mode.
#[derive(Debug)]
pub struct FrameRouter {
    buffer: BytesMut,
    decoder: FrameDecoder,
    mapper: EventMapper,
    mode: DecodeMode,
    failures: FailureCounter,
    threshold: u32,
    /// Bytes at the front of `buffer` skipped by the current failure run.
    run_skip: usize,
    scanner: ObjectScanner,
    /// Where the next search for a frame prelude starts in fallback mode.
    resync_from: usize,
    stats: RouterStats,
}

impl Default for FrameRouter {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_THRESHOLD, DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameRouter {
    #[must_use]
    pub fn new(threshold: u32, max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            decoder: FrameDecoder::new(max_frame_len),
            mapper: EventMapper::new(),
            mode: DecodeMode::Binary,
            failures: FailureCounter::default(),
            threshold: threshold.max(1),
            run_skip: 0,
            scanner: ObjectScanner::new(),
            resync_from: 1,
            stats: RouterStats::default(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures.get()
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `chunk` and drain every event that is now decodable.
    pub fn push_into(&mut self, chunk: &[u8], out: &mut Vec<BackendEvent>) {
        self.buffer.extend_from_slice(chunk);
        self.drain_into(out);
    }

    #[must_use]
    pub fn push(&mut self, chunk: &[u8]) -> Vec<BackendEvent> {
        let mut out = Vec::new();
        self.push_into(chunk, &mut out);
        out
    }

    /// Flush at end of input. In fallback mode, or in the middle of a run
    /// of malformed frames, whatever is still buffered is scanned once more;
    /// otherwise trailing bytes are a truncated frame and are dropped.
    pub fn finish_into(&mut self, out: &mut Vec<BackendEvent>) {
        if self.buffer.is_empty() {
            return;
        }
        let scan = match self.mode {
            DecodeMode::Fallback => true,
            DecodeMode::Binary if self.failures.get() > 0 => {
                self.scanner.reset();
                true
            }
            DecodeMode::Binary => false,
        };
        if scan {
            let before = out.len();
            while let Some((_, value)) = self.scanner.next_object_final(&self.buffer) {
                self.stats.recovered_objects += 1;
                self.mapper.map_value_into(None, value, out);
            }
            tracing::debug!(
                recovered = out.len() - before,
                bytes = self.buffer.len(),
                "scanned trailing bytes at end of stream"
            );
        } else {
            tracing::warn!(
                bytes = self.buffer.len(),
                "stream ended inside an event-stream frame"
            );
        }
        self.stats.discarded_bytes += self.buffer.len() as u64;
        self.buffer.clear();
        self.run_skip = 0;
        self.scanner.reset();
    }

    fn drain_into(&mut self, out: &mut Vec<BackendEvent>) {
        loop {
            let offset = match self.mode {
                DecodeMode::Binary => self.run_skip,
                DecodeMode::Fallback => 0,
            };
            match self.decoder.decode(&self.buffer[offset..]) {
                Ok((frame, consumed)) => {
                    if offset > 0 {
                        tracing::debug!(
                            bytes = offset,
                            "dropping bytes skipped before a valid frame"
                        );
                        self.stats.discarded_bytes += offset as u64;
                    }
                    self.buffer.advance(offset + consumed);
                    self.run_skip = 0;
                    self.stats.frames += 1;
                    self.failures.reset();
                    if self.mode == DecodeMode::Fallback {
                        tracing::info!("binary framing recovered");
                        self.mode = DecodeMode::Binary;
                        self.scanner.reset();
                    }
                    self.mapper.map_frame_into(&frame, out);
                }
                Err(DecodeFailure::Incomplete { .. }) => break,
                Err(DecodeFailure::Malformed { error, skip }) => match self.mode {
                    DecodeMode::Binary => {
                        self.stats.malformed += 1;
                        let failures = self.failures.record();
                        if failures >= self.threshold {
                            tracing::warn!(
                                error = %error,
                                failures,
                                mode = DecodeMode::Fallback.as_str(),
                                "repeated malformed frames; switching to text recovery"
                            );
                            // the scan starts where the failure run started
                            self.mode = DecodeMode::Fallback;
                            self.run_skip = 0;
                            self.scanner.reset();
                            self.resync_from = 1;
                            self.stats.fallback_entries += 1;
                            continue;
                        }
                        tracing::warn!(error = %error, failures, skip, "malformed event-stream frame");
                        self.run_skip = (offset + skip).min(self.buffer.len());
                    }
                    DecodeMode::Fallback => {
                        if !self.recover_into(skip, out) {
                            break;
                        }
                    }
                },
            }
        }
    }

    /// Scan the bytes ahead of the next frame boundary for JSON objects and
    /// drop them. Returns whether a boundary was found: the end of the
    /// rejected frame when its prelude was trustworthy (`skip` > 1), else
    /// the next valid prelude.
    ///
    /// Both the prelude search and the object scan resume where the previous
    /// call stopped, so every buffered byte is examined once.
    fn recover_into(&mut self, skip: usize, out: &mut Vec<BackendEvent>) -> bool {
        let len = self.buffer.len();
        let resync = if skip > 1 {
            Some(skip.min(len))
        } else {
            self.decoder
                .find_frame_start(&self.buffer, self.resync_from.max(1))
        };

        let Some(frame_start) = resync else {
            while let Some((_, value)) = self.scanner.next_object(&self.buffer) {
                self.stats.recovered_objects += 1;
                self.mapper.map_value_into(None, value, out);
            }
            if let Some(open_start) = self.scanner.open_start() {
                if len - open_start > self.decoder.max_frame_len() {
                    tracing::warn!(
                        bytes = len - open_start,
                        "unterminated object exceeds the frame limit; searching inside it"
                    );
                    self.scanner.abandon_open();
                    while let Some((_, value)) = self.scanner.next_object(&self.buffer) {
                        self.stats.recovered_objects += 1;
                        self.mapper.map_value_into(None, value, out);
                    }
                }
            }

            // A prelude may be split across chunks; keep enough tail to find
            // it once the rest arrives.
            let tail_floor = len.saturating_sub(PRELUDE_LEN - 1);
            let keep_from = self.scanner.keep_from().min(tail_floor);
            self.buffer.advance(keep_from);
            self.scanner.rebase(keep_from);
            self.resync_from = tail_floor - keep_from;
            self.stats.discarded_bytes += keep_from as u64;
            return false;
        };

        let region = &self.buffer[..frame_start];
        while let Some((_, value)) = self.scanner.next_object_final(region) {
            self.stats.recovered_objects += 1;
            self.mapper.map_value_into(None, value, out);
        }
        self.buffer.advance(frame_start);
        self.scanner.reset();
        self.resync_from = 1;
        self.stats.discarded_bytes += frame_start as u64;
        true
    }
}
