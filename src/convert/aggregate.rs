//! Fold a converted event stream into one non-streaming response.

use serde_json::Value;

use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicResponse, AnthropicStreamEvent,
    AnthropicUsage,
};

#[derive(Debug)]
enum PendingBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        raw_input: String,
    },
}

#[derive(Debug, Default)]
pub struct MessageAggregator {
    id: String,
    model: String,
    usage: AnthropicUsage,
    blocks: Vec<(usize, PendingBlock)>,
    content: Vec<(usize, AnthropicContentBlock)>,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
}

impl MessageAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: AnthropicStreamEvent) {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.usage = message.usage;
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    AnthropicContentBlock::Text { text } => PendingBlock::Text(text),
                    AnthropicContentBlock::ToolUse { id, name, .. } => PendingBlock::ToolUse {
                        id,
                        name,
                        raw_input: String::new(),
                    },
                };
                self.blocks.push((index, block));
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let Some((_, block)) = self.blocks.iter_mut().find(|(i, _)| *i == index) else {
                    return;
                };
                match (block, delta) {
                    (PendingBlock::Text(buf), AnthropicDelta::TextDelta { text }) => {
                        buf.push_str(&text);
                    }
                    (
                        PendingBlock::ToolUse { raw_input, .. },
                        AnthropicDelta::InputJsonDelta { partial_json },
                    ) => raw_input.push_str(&partial_json),
                    _ => {}
                }
            }
            AnthropicStreamEvent::ContentBlockStop { index } => self.close_block(index),
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                self.stop_reason = delta.stop_reason;
                self.stop_sequence = delta.stop_sequence;
                self.usage.output_tokens = usage.output_tokens;
            }
            AnthropicStreamEvent::MessageStop {}
            | AnthropicStreamEvent::Ping {}
            | AnthropicStreamEvent::Error { .. } => {}
        }
    }

    fn close_block(&mut self, index: usize) {
        let Some(pos) = self.blocks.iter().position(|(i, _)| *i == index) else {
            return;
        };
        let (index, block) = self.blocks.remove(pos);
        let block = match block {
            PendingBlock::Text(text) => AnthropicContentBlock::Text { text },
            PendingBlock::ToolUse {
                id,
                name,
                raw_input,
            } => AnthropicContentBlock::ToolUse {
                id,
                name,
                input: tool_input_value(raw_input),
            },
        };
        self.content.push((index, block));
    }

    #[must_use]
    pub fn finish(mut self) -> AnthropicResponse {
        let unclosed: Vec<usize> = self.blocks.iter().map(|(i, _)| *i).collect();
        for index in unclosed {
            self.close_block(index);
        }
        self.content.sort_by_key(|(i, _)| *i);
        AnthropicResponse {
            id: self.id,
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: self.model,
            content: self.content.into_iter().map(|(_, b)| b).collect(),
            stop_reason: self.stop_reason,
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}

/// Parsed JSON when the raw input is valid, else the raw string (empty
/// input stays `""`).
#[must_use]
pub fn tool_input_value(raw: String) -> Value {
    if raw.is_empty() {
        return Value::String(raw);
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw),
    }
}

/// Collect a complete event sequence into a response.
#[must_use]
pub fn aggregate<I>(events: I) -> AnthropicResponse
where
    I: IntoIterator<Item = AnthropicStreamEvent>,
{
    let mut agg = MessageAggregator::new();
    for event in events {
        agg.push(event);
    }
    agg.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::stream::StreamConverter;
    use crate::eventstream::BackendEvent;
    use serde_json::json;

    #[test]
    fn text_and_tool_blocks_are_folded() {
        let mut conv = StreamConverter::new("msg_1", "m", 5);
        let mut out = Vec::new();
        for ev in [
            BackendEvent::AssistantTextDelta { text: "Look".into() },
            BackendEvent::AssistantTextDelta { text: "ing".into() },
            BackendEvent::ToolUseStart { id: "t1".into(), name: "ls".into() },
            BackendEvent::ToolUseInputDelta { id: "t1".into(), fragment: "{\"path\":".into() },
            BackendEvent::ToolUseInputDelta { id: "t1".into(), fragment: "\"/\"}".into() },
            BackendEvent::ToolUseStop { id: "t1".into() },
            BackendEvent::MessageStop { stop_reason: "tool_use".into() },
        ] {
            conv.handle_into(ev, &mut out);
        }
        let resp = aggregate(out);
        assert_eq!(resp.id, "msg_1");
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(resp.usage.input_tokens, 5);
        assert_eq!(
            resp.content,
            vec![
                AnthropicContentBlock::Text { text: "Looking".into() },
                AnthropicContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "ls".into(),
                    input: json!({"path": "/"}),
                },
            ]
        );
    }

    #[test]
    fn empty_tool_input_stays_empty_string() {
        assert_eq!(tool_input_value(String::new()), json!(""));
        assert_eq!(tool_input_value("{\"a\"".into()), json!("{\"a\""));
    }
}
