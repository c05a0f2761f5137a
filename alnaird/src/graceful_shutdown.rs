/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

use tokio::{
    signal::unix::{signal, Signal, SignalKind},
    sync::watch::{channel, Receiver, Sender},
};
use tracing::info;

/// Stop signal shared by every long running task of the daemon.
#[derive(Debug)]
pub(crate) struct GracefulShutdown {
    shutdown_broadcaster: Sender<()>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (tx, _) = channel(());
        Self { shutdown_broadcaster: tx }
    }

    /// Subscribe to the shutdown broadcast channel
    pub fn subscribe(&self) -> Receiver<()> {
        self.shutdown_broadcaster.subscribe()
    }

    /// Waits for a signal and then...
    /// * Broadcasts a shutdown signal to all subscribers. See [subscribe]
    /// * Waits for all subscribers to drop
    /// ---
    /// Signals:
    /// * [SIGTERM]
    /// * [SIGINT]
    /// ---
    /// Returns after processing the first received signal.
    pub async fn wait(self) -> std::io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = recv(&mut sigterm) => info!("received SIGTERM"),
            _ = recv(&mut sigint) => info!("received SIGINT"),
        }

        self.shutdown();
        self.shutdown_broadcaster.closed().await;
        Ok(())
    }

    /// Broadcasts the stop signal without waiting for a unix signal.
    pub fn shutdown(&self) {
        self.shutdown_broadcaster.send_replace(());
    }
}

async fn recv(stream: &mut Signal) {
    let _ = stream.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_must_reach_every_subscriber() {
        let shutdown = GracefulShutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.subscribe();

        shutdown.shutdown();

        for rx in [&mut first, &mut second] {
            tokio::time::timeout(Duration::from_secs(1), rx.changed())
                .await
                .expect("no shutdown broadcast")
                .expect("sender dropped");
        }
    }
}
