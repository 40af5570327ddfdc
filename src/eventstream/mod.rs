//! Backend event-stream decoding: binary frames, text recovery and the
//! per-connection router that switches between them.

pub mod event;
pub mod frame;
pub mod router;
pub mod scanner;

pub use event::{BackendEvent, EventMapper};
pub use frame::{
    decode_frame, encode_event_frame, encode_frame, DecodeFailure, FrameDecoder, FrameError,
    FrameHeaders, HeaderValue, RawFrame,
};
pub use router::{DecodeMode, FailureCounter, FrameRouter, RouterStats};
pub use scanner::{scan_for_events, JsonObjectSpans, ObjectScanner};
