use std::path::PathBuf;

use api_buddy::modules;
use api_buddy::proxy::security;
use api_buddy::CachingProxy;

fn print_usage() {
    eprintln!(
        "usage: api-buddy [--config FILE] [--host HOST] [--port PORT]\n\
         \x20                [--generate-config] [--security-key-only]"
    );
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let mut config_path: Option<PathBuf> = None;
    let mut host_override: Option<String> = None;
    let mut port_override: Option<u16> = None;
    let mut generate_config = false;
    let mut security_key_only = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(
                    args.next().ok_or("--config requires a path")?,
                ));
            }
            "--host" => host_override = Some(args.next().ok_or("--host requires a value")?),
            "--port" | "-p" => {
                port_override = Some(
                    args.next()
                        .ok_or("--port requires a value")?
                        .parse()
                        .map_err(|e| format!("invalid port: {e}"))?,
                );
            }
            "--generate-config" => generate_config = true,
            "--security-key-only" => security_key_only = true,
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    if security_key_only {
        println!("{}", security::generate_secure_key());
        return Ok(());
    }

    let config_path = config_path
        .or_else(|| std::env::var("API_BUDDY_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(modules::config::DEFAULT_CONFIG_FILE));

    if generate_config {
        let config = api_buddy::ProxyConfig::default();
        modules::config::save_config(&config, &config_path).map_err(|e| e.to_string())?;
        println!("wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let mut config =
        modules::config::load_or_init_config(&config_path).map_err(|e| e.to_string())?;

    // Environment overrides, highest precedence.
    if let Some(host) = host_override.or_else(|| std::env::var("API_BUDDY_HOST").ok()) {
        config.server.host = host;
    }
    if let Some(port) = port_override.or_else(|| {
        std::env::var("API_BUDDY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
    }) {
        config.server.port = port;
    }
    if let Ok(db_path) = std::env::var("API_BUDDY_DB_PATH") {
        config.cache.database_path = db_path;
    }

    modules::logger::init_logger(&config.logging);

    let mut proxy = CachingProxy::new(config).map_err(|e| e.to_string())?;

    if let Some(key) = proxy.get_secure_key() {
        // Shown once; clients pass it via X-API-Buddy-Key, a bearer token,
        // ?key=, or a path prefix.
        tracing::info!("proxy secure key: {}", key);
    }

    proxy.start().await.map_err(|e| e.to_string())?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {e}"))?;

    tracing::info!("shutdown requested, stopping server...");
    proxy.stop().await;

    Ok(())
}
