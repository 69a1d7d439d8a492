use std::future::Future;

use tlsecho_common::{
    protocol::reply_text, CallContext, EchoError, EchoRequest, EchoResponse, Status,
};

/// Server side of the echo contract.
///
/// One call runs per invocation and calls never share mutable state through
/// the server; an implementation may hold its own synchronized state. The
/// context carries the caller's deadline and cancellation, which
/// long-running implementations should watch.
pub trait EchoService: Send + Sync + 'static {
    fn echo(
        &self,
        ctx: CallContext,
        request: EchoRequest,
    ) -> impl Future<Output = Result<EchoResponse, Status>> + Send;
}

/// Source of the name a server reports in its replies.
pub trait HostIdentity: Send + Sync + 'static {
    fn host_name(&self) -> Result<String, EchoError>;
}

/// Host name as reported by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostIdentity for SystemHost {
    fn host_name(&self) -> Result<String, EchoError> {
        let name = nix::unistd::gethostname()
            .map_err(|e| EchoError::HostResolution(e.to_string()))?;
        let name = name
            .into_string()
            .map_err(|raw| EchoError::HostResolution(format!("host name {raw:?} is not UTF-8")))?;
        if name.is_empty() {
            return Err(EchoError::HostResolution("host name is empty".to_string()));
        }
        Ok(name)
    }
}

/// A host name fixed at construction.
#[derive(Debug, Clone)]
pub struct FixedHost(pub String);

impl HostIdentity for FixedHost {
    fn host_name(&self) -> Result<String, EchoError> {
        Ok(self.0.clone())
    }
}

/// Replies with the request text followed by `" from "` and the host name.
#[derive(Debug, Clone, Default)]
pub struct HostEcho<H = SystemHost> {
    host: H,
}

impl HostEcho<SystemHost> {
    pub fn system() -> Self {
        Self { host: SystemHost }
    }
}

impl<H: HostIdentity> HostEcho<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    /// Synchronous core of the handler, without context checks.
    pub fn handle(&self, request: &EchoRequest) -> Result<EchoResponse, EchoError> {
        let host = self.host.host_name()?;
        Ok(EchoResponse {
            text: reply_text(&request.text, &host),
        })
    }
}

impl<H: HostIdentity> EchoService for HostEcho<H> {
    async fn echo(&self, ctx: CallContext, request: EchoRequest) -> Result<EchoResponse, Status> {
        if ctx.is_cancelled() {
            return Err(Status::cancelled("call was cancelled before it was handled"));
        }
        self.handle(&request).map_err(|e| {
            tracing::warn!("Echo failed: {}", e);
            Status::from(e)
        })
    }
}
