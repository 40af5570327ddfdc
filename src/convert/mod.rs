//! Shape conversion between the Messages API and the backend.

pub mod aggregate;
pub mod request;
pub mod stream;

pub use aggregate::{aggregate, MessageAggregator};
pub use request::{convert_request, ConvertContext};
pub use stream::{
    estimate_output_tokens, normalize_stop_reason, ClosedToolUse, ConversionPhase,
    ConversionState, StreamConverter, CONNECTION_CLOSED_STOP_REASON,
};
