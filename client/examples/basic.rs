use std::time::Duration;

use anyhow::Result;
use tlsecho_client::{ClientSettings, EchoClient, EchoError};
use tlsecho_common::CallContext;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== tlsecho async client example ===");

    let settings = ClientSettings::from_env()?;
    println!("Pinned certificate: {:?}", settings.cert_path);
    println!("Endpoint: {}", settings.endpoint);

    let client = EchoClient::connect(&settings).await?;

    // 1. plain call with a timeout
    let reply = client.echo("hello world", Duration::from_secs(5)).await?;
    println!("\n1. {}", reply.text);

    // 2. a caller-owned context, cancelled from elsewhere
    let (ctx, cancel) = CallContext::with_timeout(Duration::from_secs(5));
    cancel.cancel();
    match client.echo_with_context("never sent back", &ctx).await {
        Err(EchoError::Call(status)) => println!("\n2. cancelled as expected: {status}"),
        other => println!("\n2. unexpected outcome: {other:?}"),
    }

    // 3. what does the server expose?
    println!("\n3. services:");
    match client.list_services(Duration::from_secs(5)).await {
        Ok(list) => {
            for service in list.services {
                println!("  - {}", service.name);
            }
        }
        Err(e) => println!("  reflection unavailable: {e}"),
    }

    client.close().await;
    println!("\n✓ Done");
    Ok(())
}
