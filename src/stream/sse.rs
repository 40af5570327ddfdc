//! SSE framing of Messages API stream events.

use bytes::Bytes;

use crate::error::ProxyError;
use crate::protocol::anthropic::AnthropicStreamEvent;

/// Format an Anthropic-style SSE frame (with named event type).
#[must_use]
pub fn anthropic_sse_frame(event_type: &str, json: &str) -> String {
    let mut out = String::with_capacity(18 + event_type.len() + json.len());
    out.push_str("event: ");
    out.push_str(event_type);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

/// Serialize one stream event as an SSE frame.
///
/// # Errors
///
/// Returns [`ProxyError::Internal`] if the event cannot be serialized.
pub fn encode_stream_event(event: &AnthropicStreamEvent) -> Result<String, ProxyError> {
    let json = serde_json::to_string(event)
        .map_err(|e| ProxyError::Internal(format!("failed to serialize stream event: {e}")))?;
    Ok(anthropic_sse_frame(event.event_name(), &json))
}

/// Encode `events` into SSE frames, appending one [`Bytes`] per event.
/// Events that fail to serialize are logged and skipped.
pub fn encode_stream_events_into<I>(events: I, out: &mut Vec<Bytes>)
where
    I: IntoIterator<Item = AnthropicStreamEvent>,
{
    for event in events {
        match encode_stream_event(&event) {
            Ok(frame) => out.push(Bytes::from(frame)),
            Err(e) => tracing::error!(error = %e, event = event.event_name(), "dropping stream event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::anthropic::AnthropicDelta;

    #[test]
    fn frame_has_event_line_and_json_data() {
        let frame = encode_stream_event(&AnthropicStreamEvent::ContentBlockDelta {
            index: 0,
            delta: AnthropicDelta::TextDelta { text: "Hi".into() },
        })
        .expect("encode");
        assert_eq!(
            frame,
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n"
        );
    }

    #[test]
    fn message_stop_frame() {
        let frame = encode_stream_event(&AnthropicStreamEvent::MessageStop {}).expect("encode");
        assert_eq!(frame, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }
}
