//! Cooperative shutdown.
//!
//! A cloneable token carries the cancellation signal into every task; the
//! signal listener and any loop hitting a fatal error may trip it. Loops
//! observe it at their ticker via `cancelled()`.

use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

/// Shared cancellation signal.
#[derive(Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trip the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for only errors when the sender is dropped, which cannot
        // happen while `self` holds it.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancel the token on SIGINT or SIGTERM. Registration failures are logged
/// and leave the daemon running without graceful shutdown.
pub fn listen_for_signals(token: &ShutdownToken) {
    let token = token.clone();
    tokio::spawn(async move {
        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut int), Ok(mut term)) => {
                tokio::select! {
                    _ = int.recv() => info!("received SIGINT, shutting down"),
                    _ = term.recv() => info!("received SIGTERM, shutting down"),
                }
                token.cancel();
            }
            (Ok(mut int), Err(e)) => {
                warn!("could not register SIGTERM handler: {e}");
                int.recv().await;
                info!("received SIGINT, shutting down");
                token.cancel();
            }
            (Err(e), Ok(mut term)) => {
                warn!("could not register SIGINT handler: {e}");
                term.recv().await;
                info!("received SIGTERM, shutting down");
                token.cancel();
            }
            (Err(int_err), Err(term_err)) => {
                warn!("no signal handlers registered ({int_err}, {term_err}), graceful shutdown disabled");
            }
        }
    });
}
