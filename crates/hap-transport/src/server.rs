//! TCP listener spawning one [`Connection`] task per controller.

use std::net::SocketAddr;

use hap_core::error::Result;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::connection::{AccessoryServices, Connection};

pub struct AccessoryServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl AccessoryServer {
    /// Bind `addr` (port 0 picks one) and start accepting.
    pub async fn start(addr: SocketAddr, services: AccessoryServices) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_handle = tokio::spawn(async move {
            Self::accept_loop(listener, services, shutdown_rx).await;
        });
        tracing::info!(%local_addr, "Accessory server listening");

        Ok(Self {
            local_addr,
            shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting. Connections already running finish on their own.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        services: AccessoryServices,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(%peer, error = %e, "Could not set TCP_NODELAY");
                        }
                        let connection = Connection::new(stream, services.clone());
                        tokio::spawn(async move {
                            tracing::info!(%peer, "Controller connected");
                            match connection.run().await {
                                Ok(()) => tracing::info!(%peer, "Controller disconnected"),
                                Err(e) => tracing::warn!(%peer, error = %e, "Connection closed with error"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
