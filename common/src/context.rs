use std::{future, time::Duration};

use tokio::{sync::watch, time::Instant};

/// Deadline and cancellation signal scoped to one call.
///
/// The client creates one per invocation; the server rebuilds one per
/// inbound request from the propagated timeout and fires it when the client
/// sends a cancel frame. Handlers poll [`CallContext::is_cancelled`] or await
/// [`CallContext::cancelled`] to stop early.
#[derive(Debug, Clone)]
pub struct CallContext {
    timeout:   Option<Duration>,
    deadline:  Option<Instant>,
    cancelled: watch::Receiver<bool>,
}

/// Fires the cancellation signal of the [`CallContext`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CallContext {
    /// Starts a context whose deadline is `timeout` from now, or no deadline.
    /// A timeout too large to represent as an instant means no deadline.
    pub fn new(timeout: Option<Duration>) -> (Self, CancelHandle) {
        let (tx, cancelled) = watch::channel(false);
        let ctx = Self {
            timeout,
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
            cancelled,
        };
        (ctx, CancelHandle { tx })
    }

    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        Self::new(Some(timeout))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.deadline_elapsed()
    }

    /// Resolves once the call is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        let signal = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // handle dropped without firing
                    future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = signal => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => signal.await,
        }
    }
}
