mod request_id;

use crate::auth::{authenticate, build_allowed_key_set, AllowedClientKeys};
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::transport::BackendClient;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub backend: BackendClient,
    allowed_client_keys: AllowedClientKeys,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the backend client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, ProxyError> {
        let backend = BackendClient::new(&config.server, &config.backend)?;
        let allowed_client_keys = build_allowed_key_set(&config);
        Ok(Self {
            config,
            backend,
            allowed_client_keys,
            request_ids: RequestIdGenerator::new(),
        })
    }

    pub fn next_request_seq(&self) -> u64 {
        self.request_ids.next_seq()
    }

    #[must_use]
    pub fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        self.request_ids.request_uuid(request_seq)
    }

    /// Authenticate a client request using the prebuilt key index.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Auth` when the API key is missing or invalid.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<(), ProxyError> {
        authenticate(headers, &self.allowed_client_keys)
    }
}
