//! Backend payload → [`BackendEvent`] mapping.

use serde_json::Value;
use smallvec::SmallVec;

use super::frame::RawFrame;

pub const EVENT_ASSISTANT_RESPONSE: &str = "assistantResponseEvent";
pub const EVENT_TOOL_USE: &str = "toolUseEvent";
pub const EVENT_MESSAGE_STOP: &str = "messageStopEvent";

/// One semantic unit decoded from the backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    AssistantTextDelta { text: String },
    ToolUseStart { id: String, name: String },
    ToolUseInputDelta { id: String, fragment: String },
    ToolUseStop { id: String },
    MessageStop { stop_reason: String },
    Unknown { raw: Value },
}

pub type EventBatch = SmallVec<[BackendEvent; 2]>;

/// Per-connection payload mapper.
///
/// Remembers the tool use most recently announced so that tool payloads
/// which omit `toolUseId` (seen in text-recovered streams) still resolve.
#[derive(Debug, Default)]
pub struct EventMapper {
    current_tool_use: Option<String>,
}

impl EventMapper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a decoded binary frame.
    pub fn map_frame_into(&mut self, frame: &RawFrame, out: &mut Vec<BackendEvent>) {
        if let Some(kind @ ("exception" | "error")) = frame.message_type() {
            let raw = serde_json::from_slice::<Value>(&frame.payload).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&frame.payload).into_owned())
            });
            tracing::warn!(
                message_type = kind,
                exception_type = frame.exception_type().unwrap_or(""),
                payload = %raw,
                "backend sent an exception frame"
            );
            out.push(BackendEvent::Unknown { raw });
            return;
        }

        match serde_json::from_slice::<Value>(&frame.payload) {
            Ok(value) => self.map_value_into(frame.event_type(), value, out),
            Err(e) => {
                tracing::debug!(
                    event_type = frame.event_type().unwrap_or(""),
                    error = %e,
                    "frame payload is not JSON"
                );
                out.push(BackendEvent::Unknown {
                    raw: Value::String(String::from_utf8_lossy(&frame.payload).into_owned()),
                });
            }
        }
    }

    /// Map one payload object. Without an `event_type` the payload shape
    /// decides.
    pub fn map_value_into(
        &mut self,
        event_type: Option<&str>,
        value: Value,
        out: &mut Vec<BackendEvent>,
    ) {
        let kind = match event_type {
            Some(t) => Some(t),
            None => classify_shape(&value),
        };
        match kind {
            Some(EVENT_ASSISTANT_RESPONSE) => match value.get("content").and_then(Value::as_str) {
                Some(text) => out.push(BackendEvent::AssistantTextDelta {
                    text: text.to_string(),
                }),
                None => out.push(BackendEvent::Unknown { raw: value }),
            },
            Some(EVENT_TOOL_USE) => self.map_tool_use_into(value, out),
            Some(EVENT_MESSAGE_STOP) => {
                let stop_reason = value
                    .get("stopReason")
                    .and_then(Value::as_str)
                    .unwrap_or("end_turn")
                    .to_string();
                out.push(BackendEvent::MessageStop { stop_reason });
            }
            _ => out.push(BackendEvent::Unknown { raw: value }),
        }
    }

    #[must_use]
    pub fn map_value(&mut self, event_type: Option<&str>, value: Value) -> EventBatch {
        let mut out = Vec::with_capacity(2);
        self.map_value_into(event_type, value, &mut out);
        out.into_iter().collect()
    }

    fn map_tool_use_into(&mut self, value: Value, out: &mut Vec<BackendEvent>) {
        let id = value
            .get("toolUseId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.current_tool_use.clone());
        let Some(id) = id else {
            tracing::warn!(payload = %value, "tool use payload without a tool use id");
            out.push(BackendEvent::Unknown { raw: value });
            return;
        };

        if let Some(name) = value.get("name").and_then(Value::as_str) {
            out.push(BackendEvent::ToolUseStart {
                id: id.clone(),
                name: name.to_string(),
            });
            self.current_tool_use = Some(id.clone());
        }

        match value.get("input") {
            Some(Value::String(fragment)) if !fragment.is_empty() => {
                out.push(BackendEvent::ToolUseInputDelta {
                    id: id.clone(),
                    fragment: fragment.clone(),
                });
            }
            Some(Value::Null | Value::String(_)) | None => {}
            Some(structured) => out.push(BackendEvent::ToolUseInputDelta {
                id: id.clone(),
                fragment: structured.to_string(),
            }),
        }

        if value.get("stop").and_then(Value::as_bool) == Some(true) {
            out.push(BackendEvent::ToolUseStop { id: id.clone() });
            if self.current_tool_use.as_deref() == Some(id.as_str()) {
                self.current_tool_use = None;
            }
        }
    }
}

/// Event kind implied by the keys of an untagged payload.
fn classify_shape(value: &Value) -> Option<&'static str> {
    let obj = value.as_object()?;
    if obj.contains_key("stopReason") {
        return Some(EVENT_MESSAGE_STOP);
    }
    if obj.contains_key("toolUseId")
        || obj.contains_key("input")
        || obj.get("stop").is_some_and(Value::is_boolean)
    {
        return Some(EVENT_TOOL_USE);
    }
    if obj.get("content").is_some_and(Value::is_string) {
        return Some(EVENT_ASSISTANT_RESPONSE);
    }
    None
}
