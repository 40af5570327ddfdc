use std::time::Duration;

use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue};

use crate::config::{BackendConfig, ServerConfig};
use crate::error::ProxyError;

use super::retry_policy::{RetryPolicy, TransportFailure};

const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";
const MAX_ERROR_BODY_BYTES: usize = 2048;

fn build_reqwest_client(
    server: &ServerConfig,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, ProxyError> {
    let pool_idle_timeout = match server.http_pool_idle_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(server.http_pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(server.timeout));

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| ProxyError::Transport(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| ProxyError::Transport(format!("Failed to build HTTP client: {err}")))
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value)
        .map_err(|err| ProxyError::Config(format!("invalid header value: {err}")))
}

/// Client for the code-assistant backend's streaming generation endpoint.
pub struct BackendClient {
    client: reqwest::Client,
    url: url::Url,
    headers: HeaderMap,
    retry: RetryPolicy,
}

impl BackendClient {
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an unusable base URL or token and
    /// [`ProxyError::Transport`] when the HTTP client cannot be built.
    pub fn new(server: &ServerConfig, backend: &BackendConfig) -> Result<Self, ProxyError> {
        let url = url::Url::parse(&backend.generate_url())
            .map_err(|err| ProxyError::Config(format!("invalid backend.base_url: {err}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", backend.access_token.trim()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("qproxy-rs/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(
            "x-amzn-codewhisperer-optout",
            HeaderValue::from_static("true"),
        );

        Ok(Self {
            client: build_reqwest_client(server, backend.proxy.as_deref())?,
            url,
            headers,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// POST `body` and return the response once the backend accepted it.
    /// The caller reads the body as a byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] when the request cannot be sent or
    /// retries are exhausted, and [`ProxyError::Backend`] for a non-success
    /// status.
    pub async fn send(&self, body: bytes::Bytes) -> Result<reqwest::Response, ProxyError> {
        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(http::Method::POST, self.url.clone());
            *request.headers_mut() = self.headers.clone();
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            match self.client.execute(request).await {
                Ok(response) => {
                    let status = response.status();
                    if let Some(delay) =
                        self.retry.after_status(status, response.headers(), attempt)
                    {
                        tracing::debug!(
                            status = status.as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying backend request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(backend_error(response).await);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    let failure = TransportFailure::classify(&err);
                    let Some(delay) = self.retry.after_transport(failure, attempt) else {
                        return Err(ProxyError::Transport(err.to_string()));
                    };
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        failure = ?failure,
                        error = %err,
                        "retrying backend request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

async fn backend_error(response: reqwest::Response) -> ProxyError {
    let status = response.status().as_u16();
    let body = response.bytes().await.unwrap_or_default();
    let message = summarize_error_body(&body);
    tracing::warn!(status, message = %message, "backend rejected request");
    ProxyError::Backend { status, message }
}

/// Backend error message: the JSON `message`/`Message` field when present,
/// else the (truncated) body text.
#[must_use]
pub fn summarize_error_body(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for key in ["message", "Message", "reason"] {
            if let Some(message) = value.get(key).and_then(serde_json::Value::as_str) {
                return message.to_string();
            }
        }
    }
    let end = body.len().min(MAX_ERROR_BODY_BYTES);
    String::from_utf8_lossy(&body[..end]).trim().to_string()
}
