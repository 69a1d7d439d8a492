use std::time::Duration;

use tlsecho_common::{ClientSettings, EchoError, EchoResponse, ServiceList};
use tokio::runtime::{Builder, Runtime};

use crate::client::EchoClient;

/// Echo client whose calls block the calling thread.
///
/// Owns a single-threaded runtime; connection tasks only make progress
/// while one of its methods is running. Must not be used from inside an
/// async context.
pub struct BlockingEchoClient {
    runtime: Runtime,
    client:  Option<EchoClient>,
    timeout: Duration,
}

impl BlockingEchoClient {
    /// Loads trust material and connects, using `settings.call_timeout` for
    /// every later call.
    pub fn connect(settings: &ClientSettings) -> Result<Self, EchoError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| EchoError::Connect {
                endpoint: settings.endpoint.clone(),
                source,
            })?;
        let client = runtime.block_on(EchoClient::connect(settings))?;

        Ok(Self {
            runtime,
            client: Some(client),
            timeout: settings.call_timeout,
        })
    }

    fn client(&self) -> Result<&EchoClient, EchoError> {
        self.client
            .as_ref()
            .ok_or_else(|| tlsecho_common::Status::unavailable("client is disconnected").into())
    }

    pub fn is_connected(&self) -> bool {
        self.client
            .as_ref()
            .is_some_and(|client| !client.channel().is_closed())
    }

    pub fn echo(&self, text: &str) -> Result<EchoResponse, EchoError> {
        self.echo_with_timeout(text, self.timeout)
    }

    pub fn echo_with_timeout(&self, text: &str, timeout: Duration) -> Result<EchoResponse, EchoError> {
        let client = self.client()?;
        self.runtime.block_on(client.echo(text, timeout))
    }

    pub fn list_services(&self) -> Result<ServiceList, EchoError> {
        let client = self.client()?;
        self.runtime.block_on(client.list_services(self.timeout))
    }

    /// Closes the connection; later calls fail with `Unavailable`.
    pub fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            self.runtime.block_on(client.close());
        }
    }
}

impl Drop for BlockingEchoClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
