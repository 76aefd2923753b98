//! Change listener: one JSON change event per UDP datagram, handled strictly
//! one at a time.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::ChangeEvent;
use crate::sync::{SyncEngine, SyncOutcome, SyncReport};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_DATAGRAM_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: usize,
    pub malformed: usize,
    pub synced: usize,
    pub ignored: usize,
    pub failed: usize,
}

impl ListenerStats {
    fn record(&mut self, report: &SyncReport) {
        self.received += 1;
        match &report.outcome {
            SyncOutcome::Ignored(_) => self.ignored += 1,
            _ if !report.is_clean() => self.failed += 1,
            _ => self.synced += 1,
        }
    }
}

pub fn parse_datagram(bytes: &[u8]) -> Result<ChangeEvent> {
    serde_json::from_slice(bytes).context("datagram is not a change event")
}

pub struct ChangeListener {
    socket: UdpSocket,
}

impl ChangeListener {
    pub async fn bind(address: &str) -> Result<Self> {
        let socket = UdpSocket::bind(address)
            .await
            .with_context(|| format!("failed to bind change listener on {address}"))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to read listener address")
    }

    /// Feeds events to `engine` until `shutdown` resolves. An event that is
    /// already being handled runs to completion first.
    pub async fn run<F>(self, engine: &SyncEngine, shutdown: F) -> Result<ListenerStats>
    where
        F: Future<Output = ()>,
    {
        let address = self.local_addr()?;
        let (sender, mut receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let socket = self.socket;
        let reader = tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_BYTES];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((length, peer)) => {
                        debug!(peer = %peer, bytes = length, "datagram received");
                        let message = parse_datagram(&buffer[..length]);
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => warn!(error = %error, "failed to receive datagram"),
                }
            }
        });
        info!(address = %address, "listening for change events");

        let mut stats = ListenerStats::default();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                message = receiver.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    match message {
                        Ok(event) => {
                            let report = engine.handle_event(&event).await;
                            stats.record(&report);
                        }
                        Err(error) => {
                            stats.malformed += 1;
                            warn!(error = %format!("{error:#}"), "dropping malformed event");
                        }
                    }
                }
            }
        }
        reader.abort();
        info!(
            received = stats.received,
            synced = stats.synced,
            ignored = stats.ignored,
            failed = stats.failed,
            malformed = stats.malformed,
            "listener stopped"
        );
        Ok(stats)
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed the listener
/// keeps running until killed.
pub async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}
