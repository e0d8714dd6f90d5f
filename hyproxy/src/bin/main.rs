use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use hyproxy::config::FromPath;
use hyproxy::utils::tracing::log_subscriber;
use hyproxy::{ProxyConfig, Registry, Result};

#[derive(Parser)]
#[command(
    name = "hyproxy",
    about = "QUIC reverse proxy for the Hytale protocol"
)]
enum Cli {
    /// Run the proxy
    Run {
        #[arg(long, default_value = "hyproxy.json")]
        config: PathBuf,
    },
    /// List registered handler types
    Handlers,
}

#[tokio::main]
async fn main() {
    let _logger = tracing::subscriber::set_default(log_subscriber("info"));
    let cli = Cli::parse();

    let result = match cli {
        Cli::Run { config } => run(config).await,
        Cli::Handlers => run_handlers(),
    };

    if let Err(e) = result {
        error!("A critical error occurred: {e}");
        exit(1);
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = ProxyConfig::from_path(&config_path)?;
    tracing::subscriber::set_global_default(log_subscriber(&config.log_level))?;

    let registry = Registry::with_builtins();
    let proxy = Arc::new(hyproxy::Proxy::from_config(&config, &registry).await?);

    let runner = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move { proxy.run().await })
    };

    shutdown_signal().await;
    info!("shutting down...");
    proxy.shutdown();

    runner
        .await
        .map_err(|e| hyproxy::HyproxyError::system(format!("proxy task failed: {e}")))?
}

fn run_handlers() -> Result<()> {
    let registry = Registry::with_builtins();
    for name in registry.names() {
        println!("{name}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => stream.recv().await,
                Err(_) => std::future::pending::<Option<()>>().await,
            }
        };

        tokio::select! {
            _ = ctrl_c => { info!("Received Ctrl+C, shutting down..."); },
            _ = terminate => { info!("Received SIGTERM, shutting down..."); },
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}
