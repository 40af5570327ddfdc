use crate::protocol::anthropic::AnthropicRequest;
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate the total input tokens for a Messages request.
///
/// Sums tokens from the system prompt, all text-bearing content blocks,
/// and serialized tool definitions.
#[must_use]
pub fn estimate_request_tokens(request: &AnthropicRequest) -> u64 {
    let mut total: u64 = 0;

    if let Some(ref system) = request.system {
        total += estimate_value_tokens(system);
    }

    for msg in &request.messages {
        total += estimate_value_tokens(&msg.content);
    }

    for tool in request.tools.iter().flatten() {
        if let Ok(serialized) = serde_json::to_string(&tool.input_schema) {
            total += estimate_tokens(&serialized);
        }
        if let Some(ref desc) = tool.description {
            total += estimate_tokens(desc);
        }
        total += estimate_tokens(&tool.name);
    }

    total
}

fn estimate_value_tokens(value: &Value) -> u64 {
    match value {
        Value::String(text) => estimate_tokens(text),
        Value::Array(blocks) => blocks.iter().map(estimate_value_tokens).sum(),
        Value::Object(block) => {
            let mut total = 0;
            for key in ["text", "content"] {
                if let Some(inner) = block.get(key) {
                    total += estimate_value_tokens(inner);
                }
            }
            if let Some(input) = block.get("input") {
                total += estimate_tokens(&input.to_string());
            }
            total
        }
        _ => 0,
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(model: &str, input_tokens: u64, output_tokens: u64, duration: Duration) {
    info!(
        model = model,
        input_tokens,
        output_tokens,
        total_tokens = input_tokens + output_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
