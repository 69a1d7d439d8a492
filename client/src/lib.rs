//! tlsecho client library
//!
//! Connects to a tlsecho server over TLS, trusting only the certificate it
//! was given (pinned trust, no public CA hierarchy), and invokes the echo
//! operation with a per-call timeout.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tlsecho_client::BlockingEchoClient;
//! use tlsecho_common::ClientSettings;
//!
//! # fn main() -> anyhow::Result<()> {
//! let settings = ClientSettings::new("certs/server.pem", "localhost:8080")
//!     .with_call_timeout(Duration::from_secs(60));
//!
//! let client = BlockingEchoClient::connect(&settings)?;
//! let reply = client.echo("hello world")?;
//! println!("{}", reply.text);
//! # Ok(())
//! # }
//! ```

mod blocking;
pub mod channel;
mod client;

pub use blocking::BlockingEchoClient;
pub use channel::Channel;
pub use client::{load_client_config, EchoClient};
// Re-export important types from tlsecho-common for convenience
pub use tlsecho_common::{ClientSettings, EchoError, EchoRequest, EchoResponse, Status};
