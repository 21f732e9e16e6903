use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use waypoint::{
    adapters::{FileConfigProvider, HealthChecker, HttpClientAdapter, HttpHandler},
    config::{DEFAULT_API_KEY, GatewayConfig, GatewayConfigValidator, LogFormat, load_config},
    core::GatewayService,
    metrics,
    ports::{config_provider::ConfigProvider, http_client::HttpClient},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason, ShutdownToken},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "waypoint.toml")]
    config: String,

    /// Override the configured log output format
    #[clap(long, value_enum, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
    /// Start the gateway (default)
    Serve {
        #[clap(short, long, default_value = "waypoint.toml")]
        config: String,
    },
}

const RELOAD_DEBOUNCE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.log_format).await,
        None => serve(&args.config, args.log_format).await,
    }
}

async fn serve(config_path: &str, log_format: Option<LogFormat>) -> Result<()> {
    let config_provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let mut config: GatewayConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    if let Some(format) = log_format {
        config.logging.format = format;
    }

    tracing_setup::init_tracing(&config.logging)?;
    metrics::init_metrics();

    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}: {e}"))?;
    if config.auth.api_keys.iter().any(|key| key == DEFAULT_API_KEY) {
        tracing::warn!(
            "The default API key '{}' is accepted. Set auth.api_keys or API_KEY before exposing the gateway",
            DEFAULT_API_KEY
        );
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Failed to parse listen address '{}'", config.listen_addr))?;

    let config = Arc::new(config);
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let gateway = Arc::new(
        GatewayService::new(config.clone(), http_client.clone())
            .context("Failed to build gateway")?,
    );

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler = graceful_shutdown.clone();
    tokio::spawn(async move { signal_handler.run_signal_handler().await });

    let health_checker = HealthChecker::new(
        gateway.registry().clone(),
        http_client.clone(),
        config.health_check.clone(),
    );
    let health_token = graceful_shutdown.shutdown_token();
    let health_handle = tokio::spawn(async move { health_checker.run(health_token).await });

    match config_provider.watch() {
        Some(notify_rx) => {
            tokio::spawn(watch_config(
                config_provider.clone(),
                gateway.clone(),
                notify_rx,
                graceful_shutdown.shutdown_token(),
            ));
        }
        None => tracing::warn!("Config change notifications unavailable; hot reload disabled"),
    }

    for (name, endpoints) in &config.services {
        tracing::info!("Configured service: {} -> {:?}", name, endpoints);
    }

    let app = HttpHandler::new(gateway.clone()).router();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(
        "Waypoint API Gateway listening on {} (rate limiting: {}, cache: {})",
        addr,
        config.rate_limit.enabled,
        config.cache.enabled
    );

    let mut server_token = graceful_shutdown.shutdown_token();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = server_token.wait_for_shutdown().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    });

    let mut drain_token = graceful_shutdown.shutdown_token();
    let drain_timeout = graceful_shutdown.drain_timeout();
    tokio::select! {
        result = async { server.await } => result.context("Server error")?,
        _ = async {
            drain_token.wait_for_shutdown().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            tracing::warn!("In-flight requests did not finish within {:?}; forcing shutdown", drain_timeout);
            graceful_shutdown.trigger_shutdown(ShutdownReason::Force);
        }
    }

    health_handle.abort();
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Reload the service registry whenever the config file changes. Other settings need
/// a restart.
async fn watch_config(
    provider: Arc<dyn ConfigProvider>,
    gateway: Arc<GatewayService>,
    mut notify_rx: tokio::sync::mpsc::Receiver<()>,
    mut shutdown: ShutdownToken,
) {
    tracing::info!("Config watcher task started");
    loop {
        tokio::select! {
            event = notify_rx.recv() => {
                if event.is_none() {
                    break;
                }
            }
            _ = shutdown.wait_for_shutdown() => break,
        }

        // Editors emit several events per save; let them settle
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        while notify_rx.try_recv().is_ok() {}

        match provider.load_config().await {
            Ok(new_config) => {
                if let Err(e) = GatewayConfigValidator::validate(&new_config) {
                    tracing::error!("Reloaded configuration is invalid, keeping the old one: {}", e);
                    continue;
                }
                if let Err(e) = gateway.registry().reload(&new_config.services) {
                    tracing::error!("Failed to reload service registry: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("Failed to reload configuration: {:#}. Keeping old configuration.", e);
            }
        }
    }
    tracing::info!("Config watcher task is shutting down");
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Services: {}", config.services.len());
            println!(
                "   • Rate Limit: {} ({} per {:?})",
                config.rate_limit.enabled, config.rate_limit.max_requests, config.rate_limit.window
            );
            println!(
                "   • Cache: {} (ttl {:?}, max {} entries)",
                config.cache.enabled, config.cache.ttl, config.cache.max_entries
            );
            println!("   • Health Checks: {}", config.health_check.enabled);
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all endpoint URLs start with http:// or https://");
            println!("   • Verify listen address format (e.g., '0.0.0.0:5000')");
            println!("   • Use humantime durations for window and ttl (e.g., '60s', '5m')");
            std::process::exit(1);
        }
    }
}

const STARTER_CONFIG: &str = r#"# Waypoint API Gateway Configuration

listen_addr = "0.0.0.0:5000"

[auth]
header = "X-API-Key"
api_keys = ["change-me"]

[rate_limit]
enabled = true
window = "60s"
max_requests = 100

[cache]
enabled = true
ttl = "5m"
max_entries = 10000

[upstream]
timeout = "30s"

[load_balancer]
strategy = "random"

[health_check]
enabled = true
interval_secs = 10
timeout_secs = 2
path = "/health"

[logging]
level = "info"
format = "json"

[services]
user_service = ["http://localhost:8001"]
product_service = ["http://localhost:8002"]
order_service = ["http://localhost:8003"]
"#;

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    tokio::fs::write(path, STARTER_CONFIG)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'waypoint serve --config {config_path}' to start the gateway");
    Ok(())
}
