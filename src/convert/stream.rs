//! Backend events → Messages API stream events.

use rustc_hash::FxHashSet;
use serde_json::json;

use crate::eventstream::BackendEvent;
use crate::protocol::anthropic::{
    AnthropicContentBlock, AnthropicDelta, AnthropicDeltaUsage, AnthropicMessageDeltaBody,
    AnthropicMessageStart, AnthropicStreamEvent, AnthropicUsage,
};

/// Stop reason reported when the backend closes without a stop event.
pub const CONNECTION_CLOSED_STOP_REASON: &str = "connection closed";

/// Coarse position of a conversion in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPhase {
    Idle,
    StreamOpen,
    TextBlockOpen,
    ToolBlockOpen,
    BlockClosed,
    StreamClosed,
}

/// A tool invocation whose block has been closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedToolUse {
    pub id: String,
    pub name: String,
    /// Raw concatenated input fragments; empty when none arrived.
    pub input: String,
    pub input_is_json: bool,
}

#[derive(Debug)]
enum OpenBlock {
    Text {
        index: usize,
    },
    ToolUse {
        index: usize,
        id: String,
        name: String,
        raw_input: String,
    },
}

/// Per-connection conversion state.
#[derive(Debug, Default)]
pub struct ConversionState {
    started: bool,
    closed: bool,
    open_block: Option<OpenBlock>,
    announced_tool_uses: FxHashSet<String>,
    next_index: usize,
    stop_reason: Option<String>,
    closed_tool_uses: Vec<ClosedToolUse>,
    output_chars: usize,
}

impl ConversionState {
    #[must_use]
    pub fn phase(&self) -> ConversionPhase {
        if self.closed {
            return ConversionPhase::StreamClosed;
        }
        if !self.started {
            return ConversionPhase::Idle;
        }
        match self.open_block {
            Some(OpenBlock::Text { .. }) => ConversionPhase::TextBlockOpen,
            Some(OpenBlock::ToolUse { .. }) => ConversionPhase::ToolBlockOpen,
            None if self.next_index > 0 => ConversionPhase::BlockClosed,
            None => ConversionPhase::StreamOpen,
        }
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    #[must_use]
    pub fn closed_tool_uses(&self) -> &[ClosedToolUse] {
        &self.closed_tool_uses
    }

    #[must_use]
    pub fn blocks_emitted(&self) -> usize {
        self.next_index
    }

    #[must_use]
    pub fn output_tokens(&self) -> u64 {
        estimate_output_tokens(self.output_chars)
    }
}

/// Streaming converter for one client response.
#[derive(Debug)]
pub struct StreamConverter {
    message_id: String,
    model: String,
    input_tokens: u64,
    state: ConversionState,
}

impl StreamConverter {
    #[must_use]
    pub fn new(message_id: impl Into<String>, model: impl Into<String>, input_tokens: u64) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            input_tokens,
            state: ConversionState::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    #[must_use]
    pub fn handle(&mut self, event: BackendEvent) -> Vec<AnthropicStreamEvent> {
        let mut out = Vec::with_capacity(3);
        self.handle_into(event, &mut out);
        out
    }

    /// Apply one backend event, appending the resulting stream events.
    pub fn handle_into(&mut self, event: BackendEvent, out: &mut Vec<AnthropicStreamEvent>) {
        if self.state.closed {
            tracing::debug!(?event, "event after message_stop ignored");
            return;
        }
        self.ensure_started(out);

        match event {
            BackendEvent::AssistantTextDelta { text } => {
                if text.is_empty() {
                    return;
                }
                let open_text = match self.state.open_block {
                    Some(OpenBlock::Text { index }) => Some(index),
                    _ => None,
                };
                let index = match open_text {
                    Some(index) => index,
                    None => {
                        self.close_open_block(out);
                        let index = self.open(OpenBlock::Text {
                            index: self.state.next_index,
                        });
                        out.push(AnthropicStreamEvent::ContentBlockStart {
                            index,
                            content_block: AnthropicContentBlock::Text {
                                text: String::new(),
                            },
                        });
                        index
                    }
                };
                self.state.output_chars += text.chars().count();
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index,
                    delta: AnthropicDelta::TextDelta { text },
                });
            }
            BackendEvent::ToolUseStart { id, name } => {
                if self.state.announced_tool_uses.contains(&id) {
                    tracing::debug!(tool_use_id = %id, "duplicate tool use announcement suppressed");
                    return;
                }
                self.close_open_block(out);
                self.state.announced_tool_uses.insert(id.clone());
                let index = self.open(OpenBlock::ToolUse {
                    index: self.state.next_index,
                    id: id.clone(),
                    name: name.clone(),
                    raw_input: String::new(),
                });
                self.state.output_chars += name.len();
                out.push(AnthropicStreamEvent::ContentBlockStart {
                    index,
                    content_block: AnthropicContentBlock::ToolUse {
                        id,
                        name,
                        input: json!({}),
                    },
                });
            }
            BackendEvent::ToolUseInputDelta { id, fragment } => match &mut self.state.open_block {
                Some(OpenBlock::ToolUse {
                    index,
                    id: open_id,
                    raw_input,
                    ..
                }) if *open_id == id => {
                    raw_input.push_str(&fragment);
                    self.state.output_chars += fragment.chars().count();
                    out.push(AnthropicStreamEvent::ContentBlockDelta {
                        index: *index,
                        delta: AnthropicDelta::InputJsonDelta {
                            partial_json: fragment,
                        },
                    });
                }
                _ if self.state.announced_tool_uses.contains(&id) => {
                    tracing::warn!(tool_use_id = %id, "input for a closed tool use dropped");
                }
                _ => {
                    tracing::warn!(tool_use_id = %id, "input for an unknown tool use dropped");
                }
            },
            BackendEvent::ToolUseStop { id } => {
                let is_open = matches!(
                    &self.state.open_block,
                    Some(OpenBlock::ToolUse { id: open_id, .. }) if *open_id == id
                );
                if is_open {
                    self.close_open_block(out);
                } else if self.state.announced_tool_uses.contains(&id) {
                    tracing::debug!(tool_use_id = %id, "stop for an already closed tool use");
                } else {
                    tracing::warn!(tool_use_id = %id, "stop for an unknown tool use dropped");
                }
            }
            BackendEvent::MessageStop { stop_reason } => {
                self.finish_into(&normalize_stop_reason(&stop_reason), out);
            }
            BackendEvent::Unknown { raw } => {
                tracing::debug!(payload = %raw, "unrecognised backend event ignored");
            }
        }
    }

    /// Close the stream with `stop_reason`. No-op once closed.
    pub fn finish_into(&mut self, stop_reason: &str, out: &mut Vec<AnthropicStreamEvent>) {
        if self.state.closed {
            return;
        }
        self.ensure_started(out);
        self.close_open_block(out);
        self.state.stop_reason = Some(stop_reason.to_string());
        self.state.closed = true;
        out.push(AnthropicStreamEvent::MessageDelta {
            delta: AnthropicMessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: AnthropicDeltaUsage {
                output_tokens: self.state.output_tokens(),
            },
        });
        out.push(AnthropicStreamEvent::MessageStop {});
    }

    /// Terminate after the backend connection ended.
    pub fn connection_closed_into(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        if !self.state.closed {
            tracing::debug!("backend closed without a stop event");
        }
        self.finish_into(CONNECTION_CLOSED_STOP_REASON, out);
    }

    fn ensure_started(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        if self.state.started {
            return;
        }
        self.state.started = true;
        out.push(AnthropicStreamEvent::MessageStart {
            message: AnthropicMessageStart {
                id: self.message_id.clone(),
                type_: "message".to_string(),
                role: "assistant".to_string(),
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage {
                    input_tokens: self.input_tokens,
                    output_tokens: 0,
                },
            },
        });
    }

    fn open(&mut self, block: OpenBlock) -> usize {
        let index = self.state.next_index;
        self.state.next_index += 1;
        self.state.open_block = Some(block);
        index
    }

    fn close_open_block(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        let Some(block) = self.state.open_block.take() else {
            return;
        };
        let index = match block {
            OpenBlock::Text { index } => index,
            OpenBlock::ToolUse {
                index,
                id,
                name,
                raw_input,
            } => {
                let input_is_json = !raw_input.is_empty()
                    && serde_json::from_str::<serde::de::IgnoredAny>(&raw_input).is_ok();
                if !raw_input.is_empty() && !input_is_json {
                    tracing::warn!(tool_use_id = %id, "tool input is not valid JSON");
                }
                self.state.closed_tool_uses.push(ClosedToolUse {
                    id,
                    name,
                    input: raw_input,
                    input_is_json,
                });
                index
            }
        };
        out.push(AnthropicStreamEvent::ContentBlockStop { index });
    }
}

/// Map backend stop reasons to Messages API values. Unrecognised values
/// pass through unchanged.
#[must_use]
pub fn normalize_stop_reason(raw: &str) -> String {
    let folded: String = raw
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match folded.as_str() {
        "endturn" | "stop" | "complete" => "end_turn".to_string(),
        "tooluse" | "toolcalls" => "tool_use".to_string(),
        "maxtokens" | "length" => "max_tokens".to_string(),
        "stopsequence" => "stop_sequence".to_string(),
        _ => raw.to_string(),
    }
}

/// Rough token count from a character count: a quarter, at least one when
/// anything was produced.
#[must_use]
pub fn estimate_output_tokens(chars: usize) -> u64 {
    if chars == 0 {
        0
    } else {
        ((chars / 4) as u64).max(1)
    }
}
