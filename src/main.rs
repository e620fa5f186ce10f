//! Ghost Server
//!
//! Starts the session engine, prints operator events and stops cleanly on
//! Ctrl+C.
//!
//! Usage: `ghost-server [port] [config.json]`

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ghost_server::{start_server, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Operator events are printed below in their own format.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ghost_server::events=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Ghost Server v{}", VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = load_config(&args)?;
    info!(bind = %config.bind_addr(), "starting");

    let handle = start_server(config).context("failed to start server")?;
    let mut events = handle.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{event}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("shutting down");

    tokio::task::spawn_blocking(move || handle.stop()).await?;
    printer.await?;
    Ok(())
}

/// Config file (second argument), then environment, then port (first argument).
fn load_config(args: &[String]) -> anyhow::Result<ServerConfig> {
    let config = match args.get(1) {
        Some(path) => ServerConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => ServerConfig::default(),
    };
    let mut config = config.with_env()?;
    if let Some(port) = args.first() {
        config.port = port
            .parse()
            .with_context(|| format!("invalid port: {port}"))?;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_argument_overrides_default() {
        let config = load_config(&["27015".to_string()]).unwrap();
        assert_eq!(config.port, 27015);
    }

    #[test]
    fn test_bad_port_is_rejected() {
        assert!(load_config(&["not-a-port".to_string()]).is_err());
    }

    #[test]
    fn test_missing_config_file_is_rejected() {
        let args = ["53000".to_string(), "/nonexistent/ghost.json".to_string()];
        assert!(load_config(&args).is_err());
    }
}
