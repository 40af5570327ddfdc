use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_allowed_keys(config)?;
    validate_backend(config)?;
    validate_log_level(config)?;
    validate_stream(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_allowed_keys(config: &AppConfig) -> Result<(), ConfigError> {
    if config.client_authentication.allowed_keys.is_empty() {
        return Err(validation_err("allowed_keys cannot be empty"));
    }
    for key in &config.client_authentication.allowed_keys {
        if key.trim().is_empty() {
            return Err(validation_err("allowed_keys contains an empty key"));
        }
    }
    Ok(())
}

fn validate_backend(config: &AppConfig) -> Result<(), ConfigError> {
    let backend = &config.backend;
    if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://") {
        return Err(validation_err(
            "backend.base_url must start with http:// or https://",
        ));
    }
    if backend.access_token.trim().is_empty() {
        return Err(validation_err("backend.access_token cannot be empty"));
    }
    if let Some(arn) = backend.profile_arn.as_deref() {
        if arn.trim().is_empty() {
            return Err(validation_err(
                "backend.profile_arn cannot be empty when set",
            ));
        }
    }
    for (client_model, backend_model) in &backend.model_map {
        if client_model.trim().is_empty() || backend_model.trim().is_empty() {
            return Err(validation_err(
                "backend.model_map entries cannot be empty",
            ));
        }
    }
    validate_proxy_url("proxy", backend.proxy.as_deref())
}

fn validate_proxy_url(field_name: &str, proxy: Option<&str>) -> Result<(), ConfigError> {
    let Some(proxy) = proxy.map(str::trim) else {
        return Ok(());
    };
    if proxy.is_empty() {
        return Err(validation_err(format!(
            "backend.{field_name} cannot be empty when set"
        )));
    }
    let parsed = url::Url::parse(proxy).map_err(|err| {
        validation_err(format!("backend.{field_name} is not a valid URL: {err}"))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "backend.{field_name} must use http:// or https://"
        )));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_stream(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if stream.fallback_failure_threshold == 0 {
        return Err(validation_err(
            "stream.fallback_failure_threshold must be at least 1",
        ));
    }
    if stream.max_frame_bytes < crate::eventstream::frame::MIN_FRAME_LEN {
        return Err(validation_err(format!(
            "stream.max_frame_bytes must be at least {}",
            crate::eventstream::frame::MIN_FRAME_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const BASE: &str = r"
backend:
  base_url: https://q.example.test
  access_token: token
client_authentication:
  allowed_keys: [sk-one]
";

    fn parse_with(extra: &str) -> Result<AppConfig, ConfigError> {
        parse_config(&format!("{BASE}{extra}"))
    }

    #[test]
    fn test_minimal_config_is_valid() {
        let config = parse_with("").expect("valid");
        assert_eq!(config.stream.fallback_failure_threshold, 3);
        assert_eq!(config.features.log_level, "INFO");
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = parse_with("stream:\n  fallback_failure_threshold: 0\n").unwrap_err();
        assert!(err.to_string().contains("fallback_failure_threshold"));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        assert!(parse_with("features:\n  log_level: LOUD\n").is_err());
    }

    #[test]
    fn test_bad_proxy_rejected() {
        let yaml = r"
backend:
  base_url: https://q.example.test
  access_token: token
  proxy: ftp://proxy.local
client_authentication:
  allowed_keys: [sk-one]
";
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn test_empty_keys_rejected() {
        let yaml = r"
backend:
  base_url: https://q.example.test
  access_token: token
client_authentication:
  allowed_keys: []
";
        let err = parse_config(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_non_http_base_url_rejected() {
        let yaml = r"
backend:
  base_url: q.example.test
  access_token: token
client_authentication:
  allowed_keys: [sk-one]
";
        assert!(parse_config(yaml).is_err());
    }
}
