use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Prefix for environment overrides, e.g. `WAYPOINT__RATE_LIMIT__MAX_REQUESTS=50`.
pub const ENV_PREFIX: &str = "WAYPOINT";

/// Load configuration from a file using the config crate
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let mut gateway_config = load_file_with_env(config_path)?;
    apply_legacy_env(&mut gateway_config, |name| std::env::var(name).ok());
    Ok(gateway_config)
}

fn load_file_with_env(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml, // Default to TOML
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("auth.api_keys"),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

/// Honour the legacy `API_KEY` and `PORT` environment variables.
pub fn apply_legacy_env<F>(config: &mut GatewayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = lookup("API_KEY").filter(|k| !k.trim().is_empty()) {
        config.auth.api_keys = vec![key];
    }

    if let Some(port) = lookup("PORT") {
        match port.trim().parse::<u16>() {
            Ok(port) => {
                let host = config
                    .listen_addr
                    .rsplit_once(':')
                    .map_or("0.0.0.0", |(host, _)| host);
                config.listen_addr = format!("{host}:{port}");
            }
            Err(e) => tracing::warn!("Ignoring invalid PORT value '{}': {}", port, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write, time::Duration};

    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::models::LoadBalanceStrategy;

    #[tokio::test]
    async fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:3000"

[auth]
api_keys = ["alpha", "beta"]

[rate_limit]
window = "30s"
max_requests = 10

[cache]
ttl = "1m"
max_entries = 50

[load_balancer]
strategy = "round_robin"

[services]
user_service = ["http://localhost:8001", "http://localhost:8002"]
order_service = ["http://localhost:8021"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_file_with_env(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.auth.api_keys, vec!["alpha", "beta"]);
        assert_eq!(config.rate_limit.window, Duration::from_secs(30));
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.cache.max_entries, 50);
        assert_eq!(config.load_balancer.strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services["user_service"].len(), 2);
    }

    #[tokio::test]
    async fn test_load_json_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "upstream": { "timeout": "5s" },
  "services": {
    "product_service": ["http://localhost:8011"]
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_file_with_env(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.upstream.timeout, Duration::from_secs(5));
        assert!(config.rate_limit.enabled);
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_file_with_env("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_legacy_env_overrides() {
        let mut config = GatewayConfig::default();
        let env: HashMap<&str, &str> = [("API_KEY", "s3cret"), ("PORT", "8088")].into();

        apply_legacy_env(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.auth.api_keys, vec!["s3cret"]);
        assert_eq!(config.listen_addr, "0.0.0.0:8088");
    }

    #[test]
    fn test_legacy_env_ignores_bad_port() {
        let mut config = GatewayConfig::default();
        apply_legacy_env(&mut config, |name| {
            (name == "PORT").then(|| "not-a-port".to_string())
        });
        assert_eq!(config.listen_addr, "0.0.0.0:5000");
    }
}
