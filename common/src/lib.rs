//! tlsecho common library
//!
//! Shared pieces of the pinned-TLS echo client and server:
//!
//! - Error taxonomy and wire status codes
//! - Certificate material loading and trust configuration (pinned client
//!   trust store, server identity)
//! - Wire protocol: frames, echo message shapes, service descriptors
//! - Length-prefixed frame codec
//! - Per-call deadline and cancellation context
//! - Settings resolved from the environment

/// Settings for both roles
pub mod config;

/// Length-prefixed frame codec
pub mod codec;

/// Per-call deadline and cancellation
pub mod context;

/// Error taxonomy
pub mod error;

/// Certificate material loader
pub mod material;

/// Frames, message shapes and service descriptors
pub mod protocol;

/// Trust store and identity construction
pub mod trust;

// Re-export commonly used types for convenience
pub use config::{ClientSettings, ServerSettings};
pub use context::{CallContext, CancelHandle};
pub use error::{Code, EchoError, Status};
pub use protocol::{EchoRequest, EchoResponse, Frame, ServiceList, ECHO_METHOD};
pub use trust::{build_client_trust, build_server_identity, Identity, TrustStore};
