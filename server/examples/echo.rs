use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tlsecho_common::{
    build_server_identity, material::ServerMaterial, CallContext, EchoRequest, EchoResponse,
    ServerSettings, Status,
};
use tlsecho_server::{EchoService, Listener, Server};
use tracing::info;

/// Echo service that shouts the text back and counts the calls it served.
#[derive(Default)]
struct ShoutEcho {
    served: AtomicU64,
}

impl EchoService for ShoutEcho {
    async fn echo(&self, ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, Status> {
        if ctx.is_cancelled() {
            return Err(Status::cancelled("too late"));
        }
        let n = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        info!(n, "Shouting {:?}", request.text);
        Ok(EchoResponse {
            text: request.text.to_uppercase(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let settings = ServerSettings::from_env().context("Invalid server configuration")?;
    let material = ServerMaterial::load(&settings.cert_path, &settings.key_path)
        .context("SSL_CERT and SSL_KEY must point at a PEM certificate and key")?;
    let identity = build_server_identity(&material.cert, &material.key)?;
    let listener = Listener::bind(&settings.listen_addr, identity.server_config()?).await?;

    println!("Shout server listening on {}", listener.local_addr());
    println!("Try: cargo run -p tlsecho-client -- echo 'hello world'");

    Server::builder(ShoutEcho::default())
        .reflection(false)
        .grace_period(settings.grace_period)
        .build()
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    println!("Shout server stopped");
    Ok(())
}
