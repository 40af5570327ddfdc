//! Messages request → backend `conversationState` payload.

use serde_json::Value;

use crate::error::ProxyError;
use crate::protocol::anthropic::{AnthropicRequest, AnthropicTool};
use crate::protocol::backend::{
    AssistantResponseMessage, BackendRequest, ConversationState, CurrentMessage, HistoryEntry,
    InputSchema, ToolEntry, ToolResult, ToolResultContent, ToolResultStatus, ToolSpecification,
    ToolUseEntry, UserInputMessage, UserInputMessageContext, CHAT_TRIGGER_MANUAL,
    ORIGIN_AI_EDITOR,
};

/// Separator between system prompt and the first user turn.
pub const SYSTEM_SEPARATOR: &str = "\n\n";

/// Per-request values the converter does not derive itself.
#[derive(Debug, Clone)]
pub struct ConvertContext<'a> {
    pub conversation_id: String,
    pub model_id: &'a str,
    pub profile_arn: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    User,
    Assistant,
}

#[derive(Debug)]
struct Turn {
    role: Role,
    text: String,
    tool_uses: Vec<ToolUseEntry>,
    tool_results: Vec<ToolResult>,
}

impl Turn {
    fn merge(&mut self, other: Turn) {
        if !other.text.is_empty() {
            if !self.text.is_empty() {
                self.text.push_str(SYSTEM_SEPARATOR);
            }
            self.text.push_str(&other.text);
        }
        self.tool_uses.extend(other.tool_uses);
        self.tool_results.extend(other.tool_results);
    }
}

/// Build the backend request for `req`.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidRequest`] when the request has no messages
/// or a message has an unsupported role.
pub fn convert_request(
    req: &AnthropicRequest,
    ctx: &ConvertContext<'_>,
) -> Result<BackendRequest, ProxyError> {
    if req.messages.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let mut turns: Vec<Turn> = Vec::with_capacity(req.messages.len());
    for (i, message) in req.messages.iter().enumerate() {
        let role = match message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(ProxyError::InvalidRequest(format!(
                    "messages[{i}].role `{other}` is not supported"
                )))
            }
        };
        let turn = parse_turn(role, &message.content);
        match turns.last_mut() {
            Some(last) if last.role == role => last.merge(turn),
            _ => turns.push(turn),
        }
    }

    let system = req.system.as_ref().map(text_of).unwrap_or_default();
    if !system.is_empty() {
        if let Some(first_user) = turns.iter_mut().find(|t| t.role == Role::User) {
            first_user.text = if first_user.text.is_empty() {
                system
            } else {
                format!("{system}{SYSTEM_SEPARATOR}{}", first_user.text)
            };
        }
    }

    let current = match turns.last() {
        Some(last) if last.role == Role::User => turns.pop(),
        _ => None,
    };

    let history = turns
        .into_iter()
        .map(|turn| match turn.role {
            Role::User => HistoryEntry::UserInputMessage(user_message(
                turn.text,
                ctx.model_id,
                context_of(Vec::new(), turn.tool_results),
            )),
            Role::Assistant => HistoryEntry::AssistantResponseMessage(AssistantResponseMessage {
                content: turn.text,
                tool_uses: turn.tool_uses,
            }),
        })
        .collect();

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(tool_entry)
        .collect();
    let (content, tool_results) = match current {
        Some(turn) => (turn.text, turn.tool_results),
        None => (String::new(), Vec::new()),
    };

    Ok(BackendRequest {
        conversation_state: ConversationState {
            chat_trigger_type: CHAT_TRIGGER_MANUAL.to_string(),
            conversation_id: ctx.conversation_id.clone(),
            current_message: CurrentMessage {
                user_input_message: user_message(
                    content,
                    ctx.model_id,
                    context_of(tools, tool_results),
                ),
            },
            history,
        },
        profile_arn: ctx.profile_arn.map(str::to_string),
    })
}

fn user_message(
    content: String,
    model_id: &str,
    context: Option<UserInputMessageContext>,
) -> UserInputMessage {
    UserInputMessage {
        content,
        model_id: model_id.to_string(),
        origin: ORIGIN_AI_EDITOR.to_string(),
        user_input_message_context: context,
    }
}

fn context_of(tools: Vec<ToolEntry>, tool_results: Vec<ToolResult>) -> Option<UserInputMessageContext> {
    let ctx = UserInputMessageContext {
        tools,
        tool_results,
    };
    (!ctx.is_empty()).then_some(ctx)
}

fn tool_entry(tool: &AnthropicTool) -> ToolEntry {
    let schema = if tool.input_schema.is_null() {
        serde_json::json!({"type": "object", "properties": {}})
    } else {
        tool.input_schema.clone()
    };
    ToolEntry {
        tool_specification: ToolSpecification {
            name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            input_schema: InputSchema { json: schema },
        },
    }
}

fn parse_turn(role: Role, content: &Value) -> Turn {
    let mut turn = Turn {
        role,
        text: String::new(),
        tool_uses: Vec::new(),
        tool_results: Vec::new(),
    };
    let blocks = match content {
        Value::String(s) => {
            turn.text.push_str(s);
            return turn;
        }
        Value::Array(blocks) => blocks,
        _ => return turn,
    };

    let mut texts: Vec<&str> = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("tool_use") if role == Role::Assistant => {
                turn.tool_uses.push(ToolUseEntry {
                    tool_use_id: str_field(block, "id"),
                    name: str_field(block, "name"),
                    input: block
                        .get("input")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                });
            }
            Some("tool_result") => {
                let is_error = block.get("is_error").and_then(Value::as_bool) == Some(true);
                turn.tool_results.push(ToolResult {
                    tool_use_id: str_field(block, "tool_use_id"),
                    content: vec![ToolResultContent {
                        text: block.get("content").map(text_of).unwrap_or_default(),
                    }],
                    status: if is_error {
                        ToolResultStatus::Error
                    } else {
                        ToolResultStatus::Success
                    },
                });
            }
            other => {
                tracing::debug!(block_type = other.unwrap_or(""), "content block not forwarded");
            }
        }
    }
    turn.text = texts.join("\n");
    turn
}

fn str_field(block: &Value, key: &str) -> String {
    block
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Plain text of a string or an array of text blocks.
fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| match b {
                Value::String(s) => Some(s.as_str()),
                _ => b.get("text").and_then(Value::as_str),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> AnthropicRequest {
        serde_json::from_value(value).expect("request")
    }

    fn ctx() -> ConvertContext<'static> {
        ConvertContext {
            conversation_id: "conv-1".to_string(),
            model_id: "backend-model",
            profile_arn: None,
        }
    }

    #[test]
    fn multi_turn_history_alternates() {
        let req = request(json!({
            "model": "m", "max_tokens": 10,
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]
        }));
        let out = convert_request(&req, &ctx()).expect("convert");
        let state = &out.conversation_state;
        assert_eq!(state.history.len(), 2);
        assert!(matches!(state.history[0], HistoryEntry::UserInputMessage(_)));
        assert!(matches!(state.history[1], HistoryEntry::AssistantResponseMessage(_)));
        assert_eq!(state.current_message.user_input_message.content, "three");
    }

    #[test]
    fn consecutive_user_messages_merge() {
        let req = request(json!({
            "model": "m", "max_tokens": 10,
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "user", "content": [{"type": "text", "text": "b"}]}
            ]
        }));
        let out = convert_request(&req, &ctx()).expect("convert");
        assert!(out.conversation_state.history.is_empty());
        assert_eq!(out.conversation_state.current_message.user_input_message.content, "a\n\nb");
    }

    #[test]
    fn empty_messages_rejected() {
        let req = request(json!({"model": "m", "max_tokens": 10, "messages": []}));
        assert!(matches!(
            convert_request(&req, &ctx()),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn unknown_role_rejected() {
        let req = request(json!({
            "model": "m", "max_tokens": 10,
            "messages": [{"role": "system", "content": "x"}]
        }));
        assert!(convert_request(&req, &ctx()).is_err());
    }

    #[test]
    fn trailing_assistant_goes_to_history() {
        let req = request(json!({
            "model": "m", "max_tokens": 10,
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "partial"}
            ]
        }));
        let out = convert_request(&req, &ctx()).expect("convert");
        assert_eq!(out.conversation_state.history.len(), 2);
        assert_eq!(out.conversation_state.current_message.user_input_message.content, "");
    }
}
