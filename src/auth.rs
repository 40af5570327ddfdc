use crate::config::AppConfig;
use crate::error::ProxyError;
use http::header::{HeaderName, AUTHORIZATION};
use rustc_hash::FxHashSet;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

/// Compact key index used in hot-path authentication.
pub enum AllowedClientKeys {
    Empty,
    Single { raw: Box<str> },
    Multiple(FxHashSet<String>),
}

/// Extract the client API key: `x-api-key` first, then
/// `Authorization: Bearer <key>`.
///
/// # Errors
///
/// Returns `ProxyError::Auth` when neither header carries a key.
pub fn extract_api_key(headers: &http::HeaderMap) -> Result<&str, ProxyError> {
    headers
        .get(X_API_KEY)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ProxyError::Auth("Missing API key".to_string()))
}

/// Authenticate an incoming request by checking the extracted key against
/// pre-indexed `allowed_keys`.
///
/// # Errors
///
/// Returns `ProxyError::Auth` when the API key is missing or invalid.
pub fn authenticate(
    headers: &http::HeaderMap,
    allowed_keys: &AllowedClientKeys,
) -> Result<(), ProxyError> {
    let allowed = match allowed_keys {
        AllowedClientKeys::Single { raw } => extract_api_key(headers)? == raw.as_ref(),
        AllowedClientKeys::Multiple(allowed_set) => {
            allowed_set.contains(extract_api_key(headers)?)
        }
        AllowedClientKeys::Empty => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(ProxyError::Auth("Invalid API key".to_string()))
    }
}

/// Build a hash-set index for allowed client keys.
#[must_use]
pub fn build_allowed_key_set(config: &AppConfig) -> AllowedClientKeys {
    let mut allowed_set: FxHashSet<String> = config
        .client_authentication
        .allowed_keys
        .iter()
        .cloned()
        .collect();

    match allowed_set.len() {
        0 => AllowedClientKeys::Empty,
        1 => match allowed_set.drain().next() {
            Some(single_key) => AllowedClientKeys::Single {
                raw: single_key.into_boxed_str(),
            },
            None => AllowedClientKeys::Empty,
        },
        _ => AllowedClientKeys::Multiple(allowed_set),
    }
}
