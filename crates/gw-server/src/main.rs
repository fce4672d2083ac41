//! gw-server: assistant gateway.

use clap::Parser;
use gw_server::config::expand_tilde;
use gw_server::tls::generate_self_signed_cert;
use gw_server::{BindMode, CliOverrides, Collaborators, GatewayServer, ServerConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// gw-server: assistant gateway
#[derive(Parser, Debug)]
#[command(name = "gw-server", version, about = "Assistant gateway server")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.gw/config.toml")]
    config: String,

    /// Listen port (overrides gateway.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind mode (overrides gateway.bind)
    #[arg(long, value_enum)]
    bind: Option<BindMode>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate a self-signed certificate for development and serve TLS
    #[arg(long)]
    generate_cert: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting gw-server");

    let (tls_cert, tls_key) = if cli.generate_cert {
        let dir = expand_tilde(&PathBuf::from("~/.gw"));
        match generate_self_signed_cert(&dir) {
            Ok((cert, key)) => {
                info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
                (
                    Some(cert.display().to_string()),
                    Some(key.display().to_string()),
                )
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = CliOverrides {
        port: cli.port,
        bind: cli.bind,
        tls_cert,
        tls_key,
    };
    let config_path = PathBuf::from(&cli.config);
    let (config, raw) = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = GatewayServer::new(config, raw, Collaborators::default());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_cancel.cancel();
    });

    if let Err(e) = server.run(cancel).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("gw-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
