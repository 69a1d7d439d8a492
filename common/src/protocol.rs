use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Status;

/// ALPN identifier negotiated by both sides of the channel.
pub const ALPN_PROTOCOL: &[u8] = b"tlsecho/1";

/// Stable name of the echo service.
pub const ECHO_SERVICE: &str = "echo.EchoService";

/// Full path of the single echo operation.
pub const ECHO_METHOD: &str = "/echo.EchoService/Echo";

/// Stable name of the reflection service.
pub const REFLECTION_SERVICE: &str = "reflection.ServerReflection";

/// Full path of the service listing operation.
pub const LIST_SERVICES_METHOD: &str = "/reflection.ServerReflection/ListServices";

/// Separator between the echoed text and the replying host.
pub const REPLY_SEPARATOR: &str = " from ";

/// Builds the reply text for `text` answered by `host`.
pub fn reply_text(text: &str, host: &str) -> String {
    format!("{text}{REPLY_SEPARATOR}{host}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoRequest {
    #[serde(default)]
    pub text: String,
}

impl EchoRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    #[serde(default)]
    pub text: String,
}

/// Frames exchanged over a secure channel. Every frame after the handshake
/// is one of these, carried by [`crate::codec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client to server: invoke `method` with `payload`.
    Request {
        id:         u64,
        method:     String,
        /// Remaining time budget of the caller, if it has one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        payload:    Value,
    },
    /// Server to client: successful reply to request `id`.
    Response { id: u64, payload: Value },
    /// Server to client: request `id` failed.
    Error { id: u64, status: Status },
    /// Client to server: the caller gave up on request `id`.
    Cancel { id: u64 },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::Error { id, .. }
            | Frame::Cancel { id } => *id,
        }
    }
}

/// Describes one field of a message shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDescriptor {
    pub name:   String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub name:   String,
    pub path:   String,
    pub input:  MessageDescriptor,
    pub output: MessageDescriptor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name:    String,
    pub methods: Vec<MethodDescriptor>,
}

/// Reply of the service listing operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceList {
    pub services: Vec<ServiceDescriptor>,
}

impl ServiceList {
    pub fn find(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|service| service.name == name)
    }
}

fn text_message(name: &str) -> MessageDescriptor {
    MessageDescriptor {
        name:   name.to_string(),
        fields: vec![FieldDescriptor {
            name: "text".to_string(),
            kind: "string".to_string(),
        }],
    }
}

/// Descriptor of the echo service contract.
pub fn echo_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        name:    ECHO_SERVICE.to_string(),
        methods: vec![MethodDescriptor {
            name:   "Echo".to_string(),
            path:   ECHO_METHOD.to_string(),
            input:  text_message("echo.EchoRequest"),
            output: text_message("echo.EchoResponse"),
        }],
    }
}

/// Descriptor of the reflection service itself.
pub fn reflection_service_descriptor() -> ServiceDescriptor {
    ServiceDescriptor {
        name:    REFLECTION_SERVICE.to_string(),
        methods: vec![MethodDescriptor {
            name:   "ListServices".to_string(),
            path:   LIST_SERVICES_METHOD.to_string(),
            input:  MessageDescriptor {
                name:   "reflection.ListServicesRequest".to_string(),
                fields: Vec::new(),
            },
            output: MessageDescriptor {
                name:   "reflection.ServiceList".to_string(),
                fields: vec![FieldDescriptor {
                    name: "services".to_string(),
                    kind: "repeated reflection.ServiceDescriptor".to_string(),
                }],
            },
        }],
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reply_starts_with_request_text() {
        assert_eq!(reply_text("hello world", "host-A"), "hello world from host-A");
        assert!(reply_text("a from b", "c").starts_with("a from b"));
    }

    #[test]
    fn request_decodes_by_field_name() {
        let request: EchoRequest =
            serde_json::from_value(json!({ "extra": 7, "text": "hi" })).unwrap();
        assert_eq!(request, EchoRequest::new("hi"));

        let empty: EchoRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.text, "");
    }

    #[test]
    fn frames_are_tagged_objects() {
        let frame = Frame::Request {
            id:         3,
            method:     ECHO_METHOD.to_string(),
            timeout_ms: None,
            payload:    json!({ "text": "hi" }),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "request",
                "id": 3,
                "method": "/echo.EchoService/Echo",
                "payload": { "text": "hi" }
            })
        );

        let cancel: Frame = serde_json::from_value(json!({ "type": "cancel", "id": 9 })).unwrap();
        assert_eq!(cancel.id(), 9);
    }

    #[test]
    fn echo_descriptor_lists_text_fields() {
        let descriptor = echo_service_descriptor();
        let method = &descriptor.methods[0];
        assert_eq!(method.path, ECHO_METHOD);
        assert_eq!(method.input.fields[0].name, "text");
        assert_eq!(method.output.fields[0].name, "text");
    }
}
