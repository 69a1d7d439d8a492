use std::{future::Future, sync::Arc, time::Duration};

use tlsecho_common::EchoError;
use tokio::{sync::watch, task::JoinSet};

use crate::{
    connection::serve_connection,
    handler::EchoService,
    listener::{handshake, Listener},
    router::Router,
};

/// Default time in-flight calls get to finish after shutdown starts.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Stops a running [`Server`]. Cloneable; any clone can trigger shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Starts shutdown. Takes effect immediately: requests read after this
    /// returns are refused.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Serves an [`EchoService`] on a [`Listener`] until shut down.
pub struct Server<S> {
    router:       Arc<Router<S>>,
    grace_period: Duration,
    shutdown:     ShutdownHandle,
}

impl<S: EchoService> Server<S> {
    /// Creates a server with reflection enabled and the default grace period.
    pub fn new(service: S) -> Self {
        Self::builder(service).build()
    }

    pub fn builder(service: S) -> ServerBuilder<S> {
        ServerBuilder {
            service,
            reflection: true,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serves until `signal` resolves, then shuts down gracefully.
    pub async fn serve_with_shutdown<F>(self, listener: Listener, signal: F) -> Result<(), EchoError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.shutdown_handle();
        let trigger = tokio::spawn(async move {
            signal.await;
            tracing::info!("Shutdown signal received");
            handle.shutdown();
        });
        let result = self.serve(listener).await;
        trigger.abort();
        result
    }

    /// Accepts and serves connections until the shutdown handle fires.
    ///
    /// Shutdown order: stop accepting and release the socket, let in-flight
    /// calls finish for up to the grace period, then abort whatever is left.
    pub async fn serve(self, listener: Listener) -> Result<(), EchoError> {
        let mut shutdown = self.shutdown.tx.subscribe();
        let acceptor = listener.acceptor();
        let mut connections = JoinSet::new();

        tracing::info!(
            "Serving on {}, grace period {:?}",
            listener.local_addr(),
            self.grace_period
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = listener.accept_tcp() => match accepted {
                    Ok((tcp, peer)) => {
                        tracing::info!(%peer, "New connection received");
                        let acceptor = acceptor.clone();
                        let router = Arc::clone(&self.router);
                        let connection_shutdown = self.shutdown.tx.subscribe();
                        connections.spawn(async move {
                            match handshake(&acceptor, tcp, peer).await {
                                Ok(channel) => serve_connection(channel, router, connection_shutdown).await,
                                Err(e) => tracing::warn!(%peer, "TLS handshake failed: {}", e),
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Connection error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Connection task panicked");
                        }
                    }
                }
            }
        }

        let addr = listener.local_addr();
        drop(listener);
        tracing::info!(
            "Stopped accepting on {}, draining {} connection(s)",
            addr,
            connections.len()
        );

        let drained = tokio::time::timeout(self.grace_period, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                "Grace period of {:?} elapsed, aborting {} connection(s)",
                self.grace_period,
                connections.len()
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        tracing::info!("Server stopped");
        Ok(())
    }
}

pub struct ServerBuilder<S> {
    service:      S,
    reflection:   bool,
    grace_period: Duration,
}

impl<S: EchoService> ServerBuilder<S> {
    /// Exposes the service listing operation.
    pub fn reflection(mut self, enabled: bool) -> Self {
        self.reflection = enabled;
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn build(self) -> Server<S> {
        let (tx, _rx) = watch::channel(false);
        Server {
            router:       Arc::new(Router::new(self.service, self.reflection)),
            grace_period: self.grace_period,
            shutdown:     ShutdownHandle { tx: Arc::new(tx) },
        }
    }
}
