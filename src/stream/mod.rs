pub mod sse;

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::convert::{aggregate, StreamConverter};
use crate::eventstream::{BackendEvent, FrameRouter};
use crate::observability::{log_stream_complete, StreamSummary};
use crate::protocol::anthropic::{AnthropicResponse, AnthropicStreamEvent};

pub use sse::{anthropic_sse_frame, encode_stream_event, encode_stream_events_into};

/// One backend body → Messages events conversion: frame router feeding the
/// conversion state machine.
#[derive(Debug)]
pub struct StreamPipeline {
    router: FrameRouter,
    converter: StreamConverter,
    backend_events: Vec<BackendEvent>,
    started_at: Instant,
    completion_logged: bool,
}

impl StreamPipeline {
    #[must_use]
    pub fn new(router: FrameRouter, converter: StreamConverter) -> Self {
        Self {
            router,
            converter,
            backend_events: Vec::with_capacity(8),
            started_at: Instant::now(),
            completion_logged: false,
        }
    }

    #[must_use]
    pub fn router(&self) -> &FrameRouter {
        &self.router
    }

    #[must_use]
    pub fn converter(&self) -> &StreamConverter {
        &self.converter
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.converter.is_closed()
    }

    /// Feed one body chunk.
    pub fn feed_into(&mut self, chunk: &[u8], out: &mut Vec<AnthropicStreamEvent>) {
        self.router.push_into(chunk, &mut self.backend_events);
        self.convert_pending_into(out);
    }

    /// End of the backend body: flush the router and close the message if
    /// the backend never sent a stop event.
    pub fn finish_into(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        self.router.finish_into(&mut self.backend_events);
        self.convert_pending_into(out);
        self.converter.connection_closed_into(out);
        if !self.completion_logged {
            self.completion_logged = true;
            self.log_complete();
        }
    }

    fn convert_pending_into(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        for event in self.backend_events.drain(..) {
            self.converter.handle_into(event, out);
        }
    }

    fn log_complete(&self) {
        let state = self.converter.state();
        log_stream_complete(
            &StreamSummary {
                message_id: self.converter.message_id(),
                model: self.converter.model(),
                stop_reason: state.stop_reason().unwrap_or(""),
                input_tokens: self.converter.input_tokens(),
                output_tokens: state.output_tokens(),
                blocks: state.blocks_emitted(),
                tool_uses: state.closed_tool_uses().len(),
            },
            &self.router.stats(),
            self.started_at,
        );
    }
}

/// Convert a backend body into SSE-framed Messages events.
///
/// The returned stream always ends with `message_delta` + `message_stop`,
/// also when the backend body errors or ends early. Dropping it drops the
/// backend body.
pub fn anthropic_sse_stream<S, E>(
    byte_stream: S,
    pipeline: StreamPipeline,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            pipeline,
            Vec::<AnthropicStreamEvent>::with_capacity(8),
            VecDeque::<Bytes>::with_capacity(8),
            false,
        ),
        |(mut stream, mut pipeline, mut events, mut pending, mut done)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((Ok(frame), (stream, pipeline, events, pending, done)));
                }
                if done {
                    return None;
                }

                match stream.as_mut().next().await {
                    Some(Ok(chunk)) => pipeline.feed_into(&chunk, &mut events),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "backend body failed mid-stream");
                        pipeline.finish_into(&mut events);
                        done = true;
                    }
                    None => {
                        pipeline.finish_into(&mut events);
                        done = true;
                    }
                }
                if pipeline.is_finished() && !done {
                    // message_stop reached; the rest of the body is not needed
                    pipeline.finish_into(&mut events);
                    done = true;
                }

                let mut frames = Vec::with_capacity(events.len());
                encode_stream_events_into(events.drain(..), &mut frames);
                pending.extend(frames);
            }
        },
    )
}

/// Drive a backend body to completion and fold the events into a single
/// response.
pub async fn collect_response<S, E>(byte_stream: S, mut pipeline: StreamPipeline) -> AnthropicResponse
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: std::fmt::Display,
{
    let mut stream = std::pin::pin!(byte_stream);
    let mut events = Vec::with_capacity(16);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => pipeline.feed_into(&chunk, &mut events),
            Err(e) => {
                tracing::warn!(error = %e, "backend body failed before completion");
                break;
            }
        }
        if pipeline.is_finished() {
            break;
        }
    }
    pipeline.finish_into(&mut events);
    aggregate(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventstream::encode_event_frame;

    fn pipeline() -> StreamPipeline {
        StreamPipeline::new(FrameRouter::default(), StreamConverter::new("msg_t", "m", 1))
    }

    #[test]
    fn finish_without_input_emits_full_envelope() {
        let mut p = pipeline();
        let mut out = Vec::new();
        p.finish_into(&mut out);
        let names: Vec<_> = out.iter().map(AnthropicStreamEvent::event_name).collect();
        assert_eq!(names, ["message_start", "message_delta", "message_stop"]);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut p = pipeline();
        let stop = encode_event_frame("messageStopEvent", br#"{"stopReason":"end_turn"}"#)
            .expect("encode");
        let mut out = Vec::new();
        p.feed_into(&stop, &mut out);
        assert!(p.is_finished());
        let before = out.len();
        p.finish_into(&mut out);
        assert_eq!(out.len(), before);
    }
}
