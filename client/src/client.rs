use std::{sync::Arc, time::Duration};

use rustls::ClientConfig;
use tlsecho_common::{
    build_client_trust,
    material::ClientMaterial,
    protocol::LIST_SERVICES_METHOD,
    CallContext, ClientSettings, EchoError, EchoRequest, EchoResponse, ServiceList, ECHO_METHOD,
};

use crate::channel::Channel;

/// Loads the pinned certificate named by `settings` and builds the client
/// TLS configuration from it.
pub fn load_client_config(settings: &ClientSettings) -> Result<Arc<ClientConfig>, EchoError> {
    tracing::debug!("Loading pinned certificate from {:?}", settings.cert_path);
    let material = ClientMaterial::load(&settings.cert_path)?;
    build_client_trust(&material.cert)?.client_config()
}

/// Invokes the echo service over one [`Channel`].
pub struct EchoClient {
    channel: Channel,
}

impl EchoClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Loads trust material, then connects within `settings.connect_timeout`.
    pub async fn connect(settings: &ClientSettings) -> Result<Self, EchoError> {
        let config = load_client_config(settings)?;
        Self::connect_with_config(&settings.endpoint, config, settings.connect_timeout).await
    }

    pub async fn connect_with_config(
        endpoint: &str,
        config: Arc<ClientConfig>,
        connect_timeout: Duration,
    ) -> Result<Self, EchoError> {
        let channel = tokio::time::timeout(connect_timeout, Channel::connect(endpoint, config))
            .await
            .map_err(|_| EchoError::Connect {
                endpoint: endpoint.to_string(),
                source:   std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("no connection within {connect_timeout:?}"),
                ),
            })??;
        Ok(Self::new(channel))
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Sends `text` once and waits at most `timeout` for the reply.
    pub async fn echo(&self, text: &str, timeout: Duration) -> Result<EchoResponse, EchoError> {
        let (ctx, _cancel) = CallContext::with_timeout(timeout);
        self.echo_with_context(text, &ctx).await
    }

    /// Like [`EchoClient::echo`], bounded and cancellable by a caller-owned
    /// context.
    pub async fn echo_with_context(
        &self,
        text: &str,
        ctx: &CallContext,
    ) -> Result<EchoResponse, EchoError> {
        let request = EchoRequest::new(text);
        let response: EchoResponse = self.channel.unary(ECHO_METHOD, &request, ctx).await?;
        tracing::debug!("Echo reply: {:?}", response.text);
        Ok(response)
    }

    /// Asks the server which services it exposes.
    pub async fn list_services(&self, timeout: Duration) -> Result<ServiceList, EchoError> {
        let (ctx, _cancel) = CallContext::with_timeout(timeout);
        self.channel
            .unary(LIST_SERVICES_METHOD, &serde_json::json!({}), &ctx)
            .await
    }

    /// Closes the underlying channel gracefully.
    pub async fn close(self) {
        self.channel.close().await;
    }
}
