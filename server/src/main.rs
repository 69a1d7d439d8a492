use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tlsecho_common::{build_server_identity, material::ServerMaterial, ServerSettings};
use tlsecho_server::{HostEcho, Listener, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tlsecho-server")]
#[command(about = "Pinned-TLS echo server")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Certificate chain to present (overrides SSL_CERT)
    #[arg(long)]
    cert: Option<String>,

    /// Private key for the certificate (overrides SSL_KEY)
    #[arg(long)]
    key: Option<String>,

    /// Listen address, `:port` or `host:port` (overrides PORT)
    #[arg(long)]
    listen: Option<String>,

    /// Seconds in-flight calls get after shutdown starts (overrides SHUTDOWN_GRACE_SECS)
    #[arg(long)]
    grace_secs: Option<u64>,

    /// Do not expose the service listing operation
    #[arg(long)]
    no_reflection: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut settings = ServerSettings::from_env().context("Invalid server configuration")?;
    if let Some(cert) = args.cert {
        settings = settings.with_cert_path(cert);
    }
    if let Some(key) = args.key {
        settings = settings.with_key_path(key);
    }
    if let Some(listen) = args.listen.as_deref() {
        settings = settings.with_listen_addr(listen);
    }
    if let Some(secs) = args.grace_secs {
        settings = settings.with_grace_period(Duration::from_secs(secs));
    }

    info!("Loading server certificate from {:?}", settings.cert_path);
    info!("Loading server private key from {:?}", settings.key_path);
    let material = ServerMaterial::load(&settings.cert_path, &settings.key_path)
        .context("Failed to load server TLS material")?;
    let identity = build_server_identity(&material.cert, &material.key)
        .context("Failed to parse certificate")?;
    drop(material);
    let tls_config = identity
        .server_config()
        .context("Failed to build TLS configuration")?;

    let listener = Listener::bind(&settings.listen_addr, tls_config)
        .await
        .context("Failed to listen")?;

    let server = Server::builder(HostEcho::system())
        .reflection(!args.no_reflection)
        .grace_period(settings.grace_period)
        .build();

    info!(
        "Listening to server at {}. press ctrl + c to cancel.",
        listener.local_addr()
    );
    server
        .serve_with_shutdown(listener, shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}
