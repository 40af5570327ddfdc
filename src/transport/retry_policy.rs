use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

const RETRY_MAX_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);
const RETRY_AFTER_MAX: Duration = Duration::from_secs(30);
const RESET_RETRY_DELAY: Duration = Duration::from_millis(10);
const RESET_NEEDLES: [&str; 6] = [
    "connection reset",
    "connection aborted",
    "broken pipe",
    "unexpected eof",
    "stream closed",
    "http2 error",
];

/// Transport failure as seen before any response status was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportFailure {
    /// The pooled connection died under the request; a fresh one usually works.
    Reset,
    /// Timeout or refused connection.
    Unavailable,
    Fatal,
}

impl TransportFailure {
    pub(crate) fn classify(err: &reqwest::Error) -> Self {
        let message = error_chain_text(err);
        if contains_any(&message, &RESET_NEEDLES) {
            TransportFailure::Reset
        } else if err.is_timeout()
            || err.is_connect()
            || contains_any(&message, &["timed out", "connection refused"])
        {
            TransportFailure::Unavailable
        } else {
            TransportFailure::Fatal
        }
    }
}

/// When to retry a backend call and how long to wait before doing so.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying a response with `status`, or `None` to give up.
    /// `attempt` counts retries already made.
    pub(crate) fn after_status(
        &self,
        status: http::StatusCode,
        headers: &http::HeaderMap,
        attempt: u32,
    ) -> Option<Duration> {
        if attempt >= self.max_attempts || !matches!(status.as_u16(), 429 | 503 | 529) {
            return None;
        }
        Some(retry_after(headers).unwrap_or_else(|| backoff(attempt)))
    }

    /// Delay before retrying after a transport failure, or `None` to give up.
    pub(crate) fn after_transport(
        &self,
        failure: TransportFailure,
        attempt: u32,
    ) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match failure {
            TransportFailure::Reset if attempt == 0 => Some(Duration::ZERO),
            TransportFailure::Reset => Some(RESET_RETRY_DELAY),
            TransportFailure::Unavailable => Some(backoff(attempt)),
            TransportFailure::Fatal => None,
        }
    }
}

/// Exponential backoff from 100ms, capped at 1s, with up to 25% jitter.
fn backoff(attempt: u32) -> Duration {
    let base = RETRY_BACKOFF_BASE
        .saturating_mul(1_u32 << attempt.min(10))
        .min(RETRY_BACKOFF_MAX);
    let jitter_ms = fastrand::u64(0..=base.as_millis() as u64 / 4);
    base + Duration::from_millis(jitter_ms)
}

/// `Retry-After` as delta-seconds or an HTTP date, capped at 30s.
fn retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    let delay = match raw.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let target = httpdate::parse_http_date(raw).ok()?;
            target.duration_since(SystemTime::now()).unwrap_or_default()
        }
    };
    Some(delay.min(RETRY_AFTER_MAX))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_ascii_lowercase()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_retry_after(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn retries_throttling_and_overload_only() {
        let policy = RetryPolicy::default();
        let none = http::HeaderMap::new();
        for code in [429, 503, 529] {
            let status = http::StatusCode::from_u16(code).unwrap();
            assert!(policy.after_status(status, &none, 0).is_some(), "{code}");
        }
        for code in [400, 403, 500, 502] {
            let status = http::StatusCode::from_u16(code).unwrap();
            assert!(policy.after_status(status, &none, 0).is_none(), "{code}");
        }
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::default();
        let none = http::HeaderMap::new();
        let status = http::StatusCode::TOO_MANY_REQUESTS;
        assert!(policy.after_status(status, &none, 1).is_some());
        assert!(policy.after_status(status, &none, 2).is_none());
        assert!(policy.after_transport(TransportFailure::Reset, 2).is_none());
    }

    #[test]
    fn retry_after_seconds_is_honoured_and_capped() {
        let policy = RetryPolicy::default();
        let status = http::StatusCode::SERVICE_UNAVAILABLE;
        assert_eq!(
            policy.after_status(status, &headers_with_retry_after("5"), 0),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            policy.after_status(status, &headers_with_retry_after("600"), 0),
            Some(RETRY_AFTER_MAX)
        );
    }

    #[test]
    fn retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let headers = headers_with_retry_after(&httpdate::fmt_http_date(target));
        let delay = retry_after(&headers).unwrap();
        assert!(delay <= Duration::from_secs(2));
    }

    #[test]
    fn invalid_retry_after_falls_back_to_backoff() {
        assert!(retry_after(&headers_with_retry_after("not-a-delay")).is_none());
        let delay = RetryPolicy::default()
            .after_status(
                http::StatusCode::TOO_MANY_REQUESTS,
                &headers_with_retry_after("soon"),
                0,
            )
            .unwrap();
        assert!(delay >= RETRY_BACKOFF_BASE && delay <= RETRY_BACKOFF_BASE * 5 / 4);
    }

    #[test]
    fn reset_connections_retry_immediately_then_quickly() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.after_transport(TransportFailure::Reset, 0),
            Some(Duration::ZERO)
        );
        assert_eq!(
            policy.after_transport(TransportFailure::Reset, 1),
            Some(RESET_RETRY_DELAY)
        );
        assert!(policy.after_transport(TransportFailure::Fatal, 0).is_none());
    }

    #[test]
    fn backoff_is_capped() {
        assert!(backoff(9) >= RETRY_BACKOFF_MAX);
        assert!(backoff(9) <= RETRY_BACKOFF_MAX * 5 / 4);
    }

    #[test]
    fn error_text_needles() {
        assert!(contains_any(
            "error sending request: connection reset by peer",
            &["connection reset"]
        ));
        assert!(!contains_any("invalid certificate", &["timed out"]));
    }
}
