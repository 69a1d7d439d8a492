use serde_json::Value;
use tlsecho_common::{
    protocol::{
        echo_service_descriptor, reflection_service_descriptor, LIST_SERVICES_METHOD,
    },
    CallContext, EchoRequest, ServiceList, Status, ECHO_METHOD,
};

use crate::handler::EchoService;

/// Maps method paths to the echo handler and, when enabled, to the
/// reflection listing.
pub(crate) struct Router<S> {
    service:    S,
    reflection: bool,
}

impl<S: EchoService> Router<S> {
    pub(crate) fn new(service: S, reflection: bool) -> Self {
        Self {
            service,
            reflection,
        }
    }

    pub(crate) fn services(&self) -> ServiceList {
        let mut services = vec![echo_service_descriptor()];
        if self.reflection {
            services.push(reflection_service_descriptor());
        }
        ServiceList { services }
    }

    pub(crate) async fn dispatch(
        &self,
        method: &str,
        payload: Value,
        ctx: CallContext,
    ) -> Result<Value, Status> {
        match method {
            ECHO_METHOD => {
                let request: EchoRequest = serde_json::from_value(payload)
                    .map_err(|e| Status::invalid_argument(format!("malformed EchoRequest: {e}")))?;
                let response = self.service.echo(ctx, request).await?;
                encode(&response)
            }
            LIST_SERVICES_METHOD if self.reflection => encode(&self.services()),
            other => Err(Status::unimplemented(format!("unknown method {other}"))),
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, Status> {
    serde_json::to_value(value).map_err(|e| Status::internal(format!("failed to encode reply: {e}")))
}
