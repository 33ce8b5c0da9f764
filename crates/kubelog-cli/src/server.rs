//! TCP subscriber server.
//!
//! Every accepted connection becomes one hub subscriber and receives
//! newline-delimited JSON envelopes until either side goes away.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use kubelog_stream::{HubHandle, Subscription};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Serves hub subscriptions over TCP.
pub struct SubscriberServer {
    bind_addr: SocketAddr,
    hub: HubHandle,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl SubscriberServer {
    /// Create a server. `max_subscribers == 0` means unlimited.
    pub fn new(bind_addr: SocketAddr, hub: HubHandle, max_subscribers: usize) -> Self {
        let connection_semaphore =
            (max_subscribers > 0).then(|| Arc::new(Semaphore::new(max_subscribers)));

        Self {
            bind_addr,
            hub,
            connection_semaphore,
        }
    }

    /// Accept subscribers until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Subscriber server listening");

        tokio::select! {
            () = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match Arc::clone(sem).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Subscriber rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        if let Err(e) = socket.set_nodelay(true) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }

        let subscription = self.hub.subscribe().await;
        let hub = self.hub.clone();
        let id = subscription.id();
        tracing::info!(subscriber = %id, peer = %peer_addr, "Subscriber connected");

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = forward(socket, subscription).await {
                tracing::debug!(subscriber = %id, error = %e, "Subscriber connection error");
            }

            hub.unsubscribe(id).await;
            tracing::info!(subscriber = %id, peer = %peer_addr, "Subscriber disconnected");
        });
    }
}

/// Write envelopes to the peer until the subscription ends or the peer
/// closes its side.
async fn forward(socket: TcpStream, mut subscription: Subscription) -> std::io::Result<()> {
    let (mut reader, mut writer) = socket.into_split();
    let mut discard = [0u8; 512];

    loop {
        tokio::select! {
            message = subscription.recv() => match message {
                Some(message) => {
                    writer.write_all(&message).await?;
                    writer.write_all(b"\n").await?;
                }
                None => break,
            },
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => return Ok(()),
                Ok(_) => {}
            },
        }
    }

    writer.shutdown().await
}
