pub mod token_counter;

use crate::eventstream::RouterStats;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let filter = EnvFilter::try_new(tracing_directive(&level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Tracing filter directive for a configured (upper-cased) log level.
#[must_use]
pub fn tracing_directive(level: &str) -> &str {
    match level {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    }
}

/// Per-stream summary emitted when a backend stream has been fully converted.
#[derive(Debug, Clone, Copy)]
pub struct StreamSummary<'a> {
    pub message_id: &'a str,
    pub model: &'a str,
    pub stop_reason: &'a str,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub blocks: usize,
    pub tool_uses: usize,
}

/// Log usage and decoder counters for a completed stream.
pub fn log_stream_complete(
    summary: &StreamSummary<'_>,
    stats: &RouterStats,
    start_time: std::time::Instant,
) {
    token_counter::log_request_usage(
        summary.model,
        summary.input_tokens,
        summary.output_tokens,
        start_time.elapsed(),
    );
    tracing::info!(
        message_id = summary.message_id,
        stop_reason = summary.stop_reason,
        blocks = summary.blocks,
        tool_uses = summary.tool_uses,
        frames = stats.frames,
        malformed_frames = stats.malformed,
        recovered_objects = stats.recovered_objects,
        fallback_entries = stats.fallback_entries,
        discarded_bytes = stats.discarded_bytes,
        "stream completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_level_names_are_mapped() {
        assert_eq!(tracing_directive("WARNING"), "WARN");
        assert_eq!(tracing_directive("CRITICAL"), "ERROR");
        assert_eq!(tracing_directive("DEBUG"), "DEBUG");
    }
}
