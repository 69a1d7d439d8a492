//! tlsecho server library
//!
//! Presents a single certificate/key identity over TLS (no client
//! certificates) and serves the unary echo operation:
//!
//! - [`Listener`] binds a socket and completes TLS handshakes, skipping
//!   connections whose handshake fails
//! - [`Server`] serves connections concurrently, one task per call, with
//!   graceful shutdown through a [`ShutdownHandle`]
//! - [`EchoService`] is the handler contract; [`HostEcho`] answers with the
//!   request text and the local host name
//!
//! # Example
//!
//! ```no_run
//! use tlsecho_common::{build_server_identity, material::ServerMaterial};
//! use tlsecho_server::{HostEcho, Listener, Server};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let material = ServerMaterial::load("certs/server.pem", "certs/server.key.pem")?;
//! let identity = build_server_identity(&material.cert, &material.key)?;
//! let listener = Listener::bind("0.0.0.0:8080", identity.server_config()?).await?;
//!
//! Server::new(HostEcho::system())
//!     .serve_with_shutdown(listener, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod connection;
pub mod handler;
pub mod listener;
mod router;
mod server;

pub use handler::{EchoService, FixedHost, HostEcho, HostIdentity, SystemHost};
pub use listener::{Listener, ServerChannel, HANDSHAKE_TIMEOUT};
pub use server::{Server, ServerBuilder, ShutdownHandle, DEFAULT_GRACE_PERIOD};
