#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use eyre::Result;
use http::HeaderName;

use crate::config::models::{
    AuthConfig, CacheConfig, GatewayConfig, HealthCheckConfig, RateLimitConfig, UpstreamConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, collecting every problem found.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.services.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "services".to_string(),
            });
        } else {
            for (name, endpoints) in &config.services {
                if let Err(mut service_errors) = Self::validate_service(name, endpoints) {
                    errors.append(&mut service_errors);
                }
            }
        }

        if let Err(mut auth_errors) = Self::validate_auth(&config.auth) {
            errors.append(&mut auth_errors);
        }

        if let Err(e) = Self::validate_rate_limit(&config.rate_limit) {
            errors.push(e);
        }

        if let Err(mut cache_errors) = Self::validate_cache(&config.cache) {
            errors.append(&mut cache_errors);
        }

        if let Err(mut upstream_errors) = Self::validate_upstream(&config.upstream) {
            errors.append(&mut upstream_errors);
        }

        if let Err(mut health_check_errors) =
            Self::validate_health_check_config(&config.health_check)
        {
            errors.append(&mut health_check_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:5000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate a single service entry
    fn validate_service(name: &str, endpoints: &[String]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let name_ok = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
        if !name_ok {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}"),
                message: "Service names may only contain letters, digits, '_', '-' and '.'"
                    .to_string(),
            });
        }

        if endpoints.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}"),
                message: "Services must have at least one endpoint".to_string(),
            });
        }

        for (i, endpoint) in endpoints.iter().enumerate() {
            if let Err(e) = Self::validate_url(endpoint, &format!("service '{name}' endpoint {}", i + 1)) {
                errors.push(e);
            }
        }

        let mut unique = endpoints.to_vec();
        unique.sort();
        unique.dedup();
        if unique.len() != endpoints.len() {
            errors.push(ValidationError::InvalidField {
                field: format!("services.{name}"),
                message: "Duplicate endpoint URLs".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                if url.query().is_some() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "Endpoint URLs must not carry a query string".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_auth(config: &AuthConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if HeaderName::from_bytes(config.header.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "auth.header".to_string(),
                message: format!("'{}' is not a valid header name", config.header),
            });
        }

        if config.api_keys.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "auth.api_keys".to_string(),
            });
        } else if config.api_keys.iter().any(|k| k.trim().is_empty()) {
            errors.push(ValidationError::InvalidField {
                field: "auth.api_keys".to_string(),
                message: "API keys cannot be blank".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate rate limit configuration
    fn validate_rate_limit(config: &RateLimitConfig) -> ValidationResult<()> {
        if !config.enabled {
            return Ok(());
        }

        if config.max_requests == 0 {
            return Err(ValidationError::InvalidField {
                field: "rate_limit.max_requests".to_string(),
                message: "Rate limit requests must be greater than 0".to_string(),
            });
        }

        if config.window.is_zero() {
            return Err(ValidationError::InvalidField {
                field: "rate_limit.window".to_string(),
                message: "Window must be a positive duration like '60s' or '1m'".to_string(),
            });
        }

        Ok(())
    }

    fn validate_cache(config: &CacheConfig) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.max_entries == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.max_entries".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }

        if config.ttl.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "cache.ttl".to_string(),
                message: "Must be greater than 0 when caching is enabled".to_string(),
            });
        }

        for header in &config.vary_headers {
            if HeaderName::from_bytes(header.as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "cache.vary_headers".to_string(),
                    message: format!("'{header}' is not a valid header name"),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_upstream(config: &UpstreamConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if config.timeout.is_zero() {
            errors.push(ValidationError::InvalidField {
                field: "upstream.timeout".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if HeaderName::from_bytes(config.gateway_header.as_bytes()).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "upstream.gateway_header".to_string(),
                message: format!("'{}' is not a valid header name", config.gateway_header),
            });
        }

        if http::HeaderValue::from_str(&config.gateway_id).is_err() {
            errors.push(ValidationError::InvalidField {
                field: "upstream.gateway_id".to_string(),
                message: "Must be a valid header value".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_health_check_config(
        config: &HealthCheckConfig,
    ) -> Result<(), Vec<ValidationError>> {
        if !config.enabled {
            return Ok(());
        }

        let mut errors = Vec::new();

        if config.interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.timeout_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.timeout_secs".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.unhealthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.unhealthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.healthy_threshold == 0 {
            errors.push(ValidationError::InvalidField {
                field: "health_check.healthy_threshold".to_string(),
                message: "Must be greater than 0 when health checks are enabled".to_string(),
            });
        }

        if config.path.trim().is_empty() {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Cannot be empty when health checks are enabled".to_string(),
            });
        } else if !config.path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: "health_check.path".to_string(),
                message: "Must start with '/' when health checks are enabled".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
