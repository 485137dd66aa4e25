//! Signal handling for SIGTERM and SIGINT.
//!
//! A run never stops on its own; a signal cancels the run's token so that the
//! enumerator stops producing, workers stop pulling and retry sleeps wake up.

use std::future::Future;
use std::io;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancels a token when the process is asked to stop.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to the run.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the signal listener. The task ends with the token.
    pub fn listen(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                name = wait_for_signal() => {
                    info!("Received {}, cancelling run...", name);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    let terminate = async {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        match stream.recv().await {
            Some(()) => Ok::<(), io::Error>(()),
            None => Err(io::Error::other("signal stream closed")),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<io::Result<()>>();

    first_signal(signal::ctrl_c(), terminate).await
}

/// Name of the first signal received. A listener that cannot be installed is
/// logged and the other one keeps listening.
async fn first_signal<C, T>(ctrl_c: C, terminate: T) -> &'static str
where
    C: Future<Output = io::Result<()>>,
    T: Future<Output = io::Result<()>>,
{
    tokio::select! {
        name = listener("SIGINT", ctrl_c) => name,
        name = listener("SIGTERM", terminate) => name,
    }
}

async fn listener<F>(name: &'static str, installed: F) -> &'static str
where
    F: Future<Output = io::Result<()>>,
{
    match installed.await {
        Ok(()) => name,
        Err(e) => {
            error!("Cannot listen for {}: {}", name, e);
            std::future::pending().await
        }
    }
}
