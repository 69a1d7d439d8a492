use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tlsecho_client::BlockingEchoClient;
use tlsecho_common::ClientSettings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tlsecho-client")]
#[command(about = "Pinned-TLS echo client")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Pinned server certificate (overrides SSL_CERT)
    #[arg(long)]
    cert: Option<String>,

    /// Server endpoint as host:port (overrides SRV_URL)
    #[arg(long)]
    endpoint: Option<String>,

    /// Call timeout in seconds (overrides CALL_TIMEOUT_SECS)
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one echo request (the default)
    Echo {
        /// Text to send
        #[arg(default_value = "hello world")]
        text: String,
    },
    /// List the services the server exposes
    ListServices,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut settings = ClientSettings::from_env().context("Invalid client configuration")?;
    if let Some(cert) = args.cert {
        settings = settings.with_cert_path(cert);
    }
    if let Some(endpoint) = args.endpoint {
        settings = settings.with_endpoint(endpoint);
    }
    if let Some(secs) = args.timeout_secs {
        settings = settings.with_call_timeout(Duration::from_secs(secs));
    }

    info!("Connecting to {}", settings.endpoint);
    let mut client = BlockingEchoClient::connect(&settings).context("Failed to dial")?;

    match args.command.unwrap_or(Commands::Echo {
        text: "hello world".to_string(),
    }) {
        Commands::Echo { text } => {
            let reply = client.echo(&text).context("Error echo")?;
            info!("Got res: {:?}", reply);
            println!("{}", reply.text);
        }
        Commands::ListServices => {
            let services = client
                .list_services()
                .context("Failed to list services")?;
            for service in services.services {
                println!("{}", service.name);
                for method in service.methods {
                    println!(
                        "  {} ({}) -> ({})",
                        method.path, method.input.name, method.output.name
                    );
                }
            }
        }
    }

    client.disconnect();
    Ok(())
}
