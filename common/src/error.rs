use std::{fmt, io, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while setting up or using a secure echo channel.
///
/// Construction-time variants (`Io`, `TrustConfig`, `Bind`, `Connect`,
/// `Config`) are fatal to the role that hit them. Per-call variants
/// (`DeadlineExceeded`, `Call`, `HostResolution`) only affect the call that
/// produced them.
#[derive(Debug, Error)]
pub enum EchoError {
    /// Certificate or key material could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    /// Material was read but does not form a usable trust store or identity.
    #[error("invalid TLS material: {0}")]
    TrustConfig(String),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr:   String,
        #[source]
        source: io::Error,
    },

    /// TCP connect or TLS handshake to the endpoint did not complete.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source:   io::Error,
    },

    /// No reply arrived within the call timeout.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Transport failure or server-reported failure for one call.
    #[error("call failed: {0}")]
    Call(#[from] Status),

    /// The server could not determine its own host name.
    #[error("cannot resolve local host name: {0}")]
    HostResolution(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EchoError {
    /// True when a connect attempt reached the peer but TLS rejected it
    /// (untrusted certificate, name mismatch, protocol disagreement).
    pub fn is_handshake_failure(&self) -> bool {
        match self {
            EchoError::Connect { source, .. } => {
                source
                    .get_ref()
                    .is_some_and(|inner| inner.is::<rustls::Error>())
                    || source.kind() == io::ErrorKind::InvalidData
            }
            _ => false,
        }
    }

    /// The wire status carried by a `Call` error, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            EchoError::Call(status) => Some(status),
            _ => None,
        }
    }
}

/// Outcome class of a failed call, shared by client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    Unimplemented,
    Internal,
    Unavailable,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Cancelled => "cancelled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// A failed call as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code:    Code,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

impl From<EchoError> for Status {
    fn from(err: EchoError) -> Self {
        match err {
            EchoError::Call(status) => status,
            EchoError::DeadlineExceeded(_) => Status::deadline_exceeded(err.to_string()),
            EchoError::Connect { .. } => Status::unavailable(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}
